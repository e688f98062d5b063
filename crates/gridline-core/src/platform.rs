//! Chat-platform REST client: the application command catalog and interaction follow-ups.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Response;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::config::{BotToken, GatewayConfig};
use crate::error::{ConfigError, PlatformError};

/// Slash-command type.
pub const CHAT_INPUT: u8 = 1;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The comparable part of an application command.
///
/// Fields without a typed slot (`dm_permission`, `contexts`, `integration_types`, ...) ride along
/// in `extra`, so they are compared and sent back exactly as declared.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CommandDefinition {
    pub name: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<u8>,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_localizations: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description_localizations: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_member_permissions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nsfw: Option<bool>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl CommandDefinition {
    pub fn from_blob(blob: &Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(blob)
    }

    /// Fill in what the platform assumes when a field is left out.
    pub fn with_defaults(mut self) -> Self {
        self.kind.get_or_insert(CHAT_INPUT);
        self.nsfw.get_or_insert(false);
        self
    }

    /// Whether `remote` already carries everything this declaration asks for.
    ///
    /// Untyped keys the declaration leaves out keep whatever value the platform reports; a key
    /// declared as `null` matches a key the platform omits.
    pub fn is_satisfied_by(&self, remote: &CommandDefinition) -> bool {
        let typed = self.name == remote.name
            && self.kind == remote.kind
            && self.description == remote.description
            && self.name_localizations == remote.name_localizations
            && self.description_localizations == remote.description_localizations
            && self.options == remote.options
            && self.default_member_permissions == remote.default_member_permissions
            && self.nsfw == remote.nsfw;
        typed
            && self
                .extra
                .iter()
                .all(|(key, value)| remote.extra.get(key).unwrap_or(&Value::Null) == value)
    }
}

/// A command as the platform stores it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteCommand {
    pub id: String,
    #[serde(default)]
    pub application_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guild_id: Option<String>,
    #[serde(default)]
    pub version: String,
    #[serde(flatten)]
    pub definition: CommandDefinition,
}

#[async_trait]
pub trait CommandCatalog: Send + Sync {
    async fn list(&self) -> Result<Vec<RemoteCommand>, PlatformError>;

    async fn create(&self, definition: &CommandDefinition) -> Result<RemoteCommand, PlatformError>;

    /// Edit `remote` in place, keeping its id.
    async fn update(
        &self,
        remote: &RemoteCommand,
        definition: &CommandDefinition,
    ) -> Result<RemoteCommand, PlatformError>;

    async fn delete(&self, remote: &RemoteCommand) -> Result<(), PlatformError>;
}

#[async_trait]
pub trait FollowUpSender: Send + Sync {
    /// Post a message tied to a deferred interaction.
    async fn send_followup(
        &self,
        application_id: &str,
        interaction_token: &str,
        content: &str,
    ) -> Result<(), PlatformError>;
}

#[derive(Clone)]
pub struct DiscordClient {
    http: reqwest::Client,
    api_url: String,
    application_id: String,
    guild_id: Option<String>,
    token: BotToken,
}

impl DiscordClient {
    pub fn new(
        api_url: &str,
        application_id: &str,
        guild_id: Option<String>,
        token: BotToken,
    ) -> Result<Self, ConfigError> {
        let http = reqwest::Client::builder()
            .user_agent(format!("gridline ({})", crate::version::string()))
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            application_id: application_id.to_string(),
            guild_id,
            token,
        })
    }

    pub fn from_config(config: &GatewayConfig) -> Result<Self, ConfigError> {
        Self::new(
            &config.discord_api_url,
            &config.application_id,
            config.guild_id.clone(),
            config.bot_token.clone(),
        )
    }

    /// Guild-scoped when a guild is configured, global otherwise.
    pub fn commands_url(&self) -> String {
        match &self.guild_id {
            Some(guild) => format!(
                "{}/applications/{}/guilds/{}/commands",
                self.api_url, self.application_id, guild
            ),
            None => format!("{}/applications/{}/commands", self.api_url, self.application_id),
        }
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request.header(reqwest::header::AUTHORIZATION, self.token.authorization())
    }
}

async fn check(response: Response) -> Result<Response, PlatformError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(PlatformError::Api {
        status: status.as_u16(),
        body,
    })
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, PlatformError> {
    Ok(check(response).await?.json().await?)
}

#[async_trait]
impl CommandCatalog for DiscordClient {
    async fn list(&self) -> Result<Vec<RemoteCommand>, PlatformError> {
        let response = self.authorized(self.http.get(self.commands_url())).send().await?;
        decode(response).await
    }

    async fn create(&self, definition: &CommandDefinition) -> Result<RemoteCommand, PlatformError> {
        debug!(command = %definition.name, "creating remote command");
        let response = self
            .authorized(self.http.post(self.commands_url()))
            .json(definition)
            .send()
            .await?;
        decode(response).await
    }

    async fn update(
        &self,
        remote: &RemoteCommand,
        definition: &CommandDefinition,
    ) -> Result<RemoteCommand, PlatformError> {
        debug!(command = %definition.name, id = %remote.id, "editing remote command");
        let url = format!("{}/{}", self.commands_url(), remote.id);
        let response = self
            .authorized(self.http.patch(url))
            .json(definition)
            .send()
            .await?;
        decode(response).await
    }

    async fn delete(&self, remote: &RemoteCommand) -> Result<(), PlatformError> {
        debug!(command = %remote.definition.name, id = %remote.id, "deleting remote command");
        let url = format!("{}/{}", self.commands_url(), remote.id);
        let response = self.authorized(self.http.delete(url)).send().await?;
        check(response).await.map(|_| ())
    }
}

#[async_trait]
impl FollowUpSender for DiscordClient {
    async fn send_followup(
        &self,
        application_id: &str,
        interaction_token: &str,
        content: &str,
    ) -> Result<(), PlatformError> {
        let url = format!(
            "{}/webhooks/{}/{}",
            self.api_url, application_id, interaction_token
        );
        let body = json!({
            "content": content,
            "allowed_mentions": { "parse": [] },
        });
        let response = self.http.post(url).json(&body).send().await?;
        check(response).await.map(|_| ())
    }
}
