//! Inbound interaction payloads and the response envelopes sent back to the platform.

use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ParseError;

pub const PONG: &str = r#"{"type":1}"#;
pub const DEFERRED_ACK: &str = r#"{"type":5}"#;

pub const UNKNOWN_COMMAND_MESSAGE: &str = "**Error**: Unknown command";
pub const NO_SERVICE_MESSAGE: &str = "**Error**: Failed to get service address";
pub const FORWARD_FAILED_MESSAGE: &str = "**Error**: Failed to forward request";
pub const NOT_READY_MESSAGE: &str = "**Error**: Routing tables are still loading, try again shortly";

const CHANNEL_MESSAGE_WITH_SOURCE: u8 = 4;
const EPHEMERAL: u64 = 1 << 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionKind {
    Ping,
    ApplicationCommand,
    MessageComponent,
    Autocomplete,
    ModalSubmit,
}

impl TryFrom<u8> for InteractionKind {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Ping),
            2 => Ok(Self::ApplicationCommand),
            3 => Ok(Self::MessageComponent),
            4 => Ok(Self::Autocomplete),
            5 => Ok(Self::ModalSubmit),
            other => Err(ParseError::UnknownKind(other)),
        }
    }
}

impl InteractionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::ApplicationCommand => "application_command",
            Self::MessageComponent => "message_component",
            Self::Autocomplete => "autocomplete",
            Self::ModalSubmit => "modal_submit",
        }
    }
}

#[derive(Deserialize)]
struct RawInteraction {
    #[serde(default)]
    id: String,
    #[serde(default)]
    application_id: String,
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    token: String,
    #[serde(default)]
    data: Option<RawData>,
    #[serde(default)]
    guild_id: Option<String>,
    #[serde(default)]
    channel_id: Option<String>,
    #[serde(default)]
    member: Option<RawMember>,
    #[serde(default)]
    user: Option<RawUser>,
}

#[derive(Deserialize)]
struct RawData {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    custom_id: Option<String>,
}

#[derive(Deserialize)]
struct RawMember {
    #[serde(default)]
    user: Option<RawUser>,
}

#[derive(Deserialize)]
struct RawUser {
    id: String,
}

/// A parsed, validated interaction. Only the fields routing and logging need.
#[derive(Debug, Clone, PartialEq)]
pub struct Interaction {
    pub id: String,
    pub application_id: String,
    pub token: String,
    pub kind: InteractionKind,
    /// Set for application commands and autocomplete.
    pub command_name: Option<String>,
    /// Set for message components and modal submits.
    pub custom_id: Option<String>,
    pub guild_id: Option<String>,
    pub channel_id: Option<String>,
    pub user_id: Option<String>,
}

impl Interaction {
    pub fn parse(body: &[u8]) -> Result<Self, ParseError> {
        let raw: RawInteraction = serde_json::from_slice(body)?;
        let kind = InteractionKind::try_from(raw.kind)?;
        let (name, custom_id) = match raw.data {
            Some(data) => (data.name, data.custom_id),
            None => (None, None),
        };
        let name = name.filter(|n| !n.is_empty());
        let custom_id = custom_id.filter(|c| !c.is_empty());

        match kind {
            InteractionKind::ApplicationCommand | InteractionKind::Autocomplete if name.is_none() => {
                return Err(ParseError::MissingField("data.name"))
            }
            InteractionKind::MessageComponent | InteractionKind::ModalSubmit
                if custom_id.is_none() =>
            {
                return Err(ParseError::MissingField("data.custom_id"))
            }
            _ => {}
        }

        let user_id = raw
            .member
            .and_then(|m| m.user)
            .or(raw.user)
            .map(|u| u.id);

        Ok(Self {
            id: raw.id,
            application_id: raw.application_id,
            token: raw.token,
            kind,
            command_name: name,
            custom_id,
            guild_id: raw.guild_id,
            channel_id: raw.channel_id,
            user_id,
        })
    }
}

/// Service owning a component or modal: the custom id up to its first `/`.
pub fn target_service(custom_id: &str) -> &str {
    match custom_id.split_once('/') {
        Some((service, _)) => service,
        None => custom_id,
    }
}

/// Reply visible only to the invoking user, with mentions disabled.
pub fn ephemeral_message(content: &str) -> Value {
    json!({
        "type": CHANNEL_MESSAGE_WITH_SOURCE,
        "data": {
            "content": content,
            "flags": EPHEMERAL,
            "allowed_mentions": { "parse": [] },
        }
    })
}

pub fn upstream_error_message(status: StatusCode) -> String {
    format!(
        "**Error**: Upstream server returned error `{}`: `{}`",
        status.as_u16(),
        status
    )
}
