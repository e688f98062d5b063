//! Interaction dispatch: verify, parse, classify, forward.
//!
//! Every request gets exactly one [`Reply`]. Routing and backend failures become ephemeral
//! messages with status 200 so the invoking user sees them; only a bad signature (401) and an
//! unparseable payload (500) surface as HTTP errors. Deferred forwards run as tracked tasks on
//! the [`Lifecycle`] and report failures through a follow-up message.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::StatusCode;
use tracing::field::Empty;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument, Span};

use crate::commands::CommandLookup;
use crate::error::{AuthError, ConfigError, RoutingError, UpstreamError};
use crate::interaction::{
    ephemeral_message, target_service, upstream_error_message, Interaction, InteractionKind,
    DEFERRED_ACK, FORWARD_FAILED_MESSAGE, NOT_READY_MESSAGE, NO_SERVICE_MESSAGE, PONG,
    UNKNOWN_COMMAND_MESSAGE,
};
use crate::lifecycle::Lifecycle;
use crate::platform::FollowUpSender;
use crate::services::AddressResolver;
use crate::version;

pub const SIGNATURE_HEADER: &str = "x-signature-ed25519";
pub const TIMESTAMP_HEADER: &str = "x-signature-timestamp";
pub const JSON: &str = "application/json";

/// Hop-by-hop and framing headers not copied onto the backend request.
const STRIPPED_HEADERS: [header::HeaderName; 4] = [
    header::HOST,
    header::CONTENT_LENGTH,
    header::TRANSFER_ENCODING,
    header::CONNECTION,
];

/// The raw webhook call as the listener received it.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub headers: HeaderMap,
    pub body: Bytes,
    pub peer: Option<SocketAddr>,
}

/// What the listener writes back.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: StatusCode,
    pub content_type: String,
    pub body: Bytes,
}

impl Reply {
    pub fn json(body: impl Into<Bytes>) -> Self {
        Self {
            status: StatusCode::OK,
            content_type: JSON.to_string(),
            body: body.into(),
        }
    }

    pub fn ephemeral(content: &str) -> Self {
        Self::json(ephemeral_message(content).to_string())
    }

    fn error(status: StatusCode, text: &str) -> Self {
        Self {
            status,
            content_type: "text/plain; charset=utf-8".to_string(),
            body: Bytes::from(text.to_string()),
        }
    }
}

/// Where a routed interaction goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub service: String,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Pong,
    ImmediateForward(Target),
    DeferredForward(Target),
}

/// Why an interaction could not be routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteFailure {
    /// An index has not applied its first listing, so absence means nothing yet.
    NotReady(RoutingError),
    UnknownCommand(RoutingError),
    NoAddress { service: String, source: RoutingError },
}

impl RouteFailure {
    pub fn user_message(&self) -> &'static str {
        match self {
            RouteFailure::NotReady(_) => NOT_READY_MESSAGE,
            RouteFailure::UnknownCommand(_) => UNKNOWN_COMMAND_MESSAGE,
            RouteFailure::NoAddress { .. } => NO_SERVICE_MESSAGE,
        }
    }
}

/// Check the detached Ed25519 signature over `timestamp || body`.
pub fn verify_signature(
    key: &VerifyingKey,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), AuthError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .ok_or(AuthError::MissingHeader(SIGNATURE_HEADER))?;
    let timestamp = headers
        .get(TIMESTAMP_HEADER)
        .ok_or(AuthError::MissingHeader(TIMESTAMP_HEADER))?;

    let raw = hex::decode(signature.as_bytes()).map_err(|_| AuthError::MalformedSignature)?;
    let signature = Signature::from_slice(&raw).map_err(|_| AuthError::MalformedSignature)?;

    let mut message = Vec::with_capacity(timestamp.len() + body.len());
    message.extend_from_slice(timestamp.as_bytes());
    message.extend_from_slice(body);
    key.verify(&message, &signature)
        .map_err(|_| AuthError::BadSignature)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Caller address, preferring proxy headers over the socket peer.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(ip) =
        header_str(headers, "x-real-ip").or_else(|| header_str(headers, "cf-connecting-ip"))
    {
        return ip.to_string();
    }
    let forwarded = header_str(headers, "x-forwarded-for")
        .and_then(|list| list.split(',').map(str::trim).find(|s| !s.is_empty()));
    if let Some(first) = forwarded {
        return first.to_string();
    }
    peer.map(|p| p.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// HTTP client used for backend calls.
pub fn forward_client(timeout: Duration) -> Result<reqwest::Client, ConfigError> {
    Ok(reqwest::Client::builder()
        .timeout(timeout)
        .redirect(reqwest::redirect::Policy::none())
        .user_agent(version::server_header())
        .build()?)
}

struct Inner {
    public_key: VerifyingKey,
    commands: Arc<dyn CommandLookup>,
    services: Arc<dyn AddressResolver>,
    followups: Arc<dyn FollowUpSender>,
    http: reqwest::Client,
    lifecycle: Lifecycle,
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(
        public_key: VerifyingKey,
        commands: Arc<dyn CommandLookup>,
        services: Arc<dyn AddressResolver>,
        followups: Arc<dyn FollowUpSender>,
        http: reqwest::Client,
        lifecycle: Lifecycle,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                public_key,
                commands,
                services,
                followups,
                http,
                lifecycle,
            }),
        }
    }

    /// Handle one webhook call end to end.
    #[instrument(name = "interaction", skip_all, fields(id = Empty, kind = Empty))]
    pub async fn handle(&self, request: InboundRequest) -> Reply {
        if let Err(err) = verify_signature(&self.inner.public_key, &request.headers, &request.body) {
            warn!(error = %err, ip = %client_ip(&request.headers, request.peer), "rejected interaction signature");
            return Reply::error(StatusCode::UNAUTHORIZED, "invalid request signature");
        }

        let interaction = match Interaction::parse(&request.body) {
            Ok(interaction) => interaction,
            Err(err) => {
                error!(error = %err, "failed to parse interaction");
                return Reply::error(StatusCode::INTERNAL_SERVER_ERROR, "malformed interaction");
            }
        };
        let span = Span::current();
        span.record("id", interaction.id.as_str());
        span.record("kind", interaction.kind.as_str());

        match self.classify(&interaction) {
            Err(failure) => {
                warn!(
                    command = interaction.command_name.as_deref().unwrap_or_default(),
                    custom_id = interaction.custom_id.as_deref().unwrap_or_default(),
                    failure = ?failure,
                    "could not route interaction"
                );
                Reply::ephemeral(failure.user_message())
            }
            Ok(DispatchOutcome::Pong) => {
                info!(ip = %client_ip(&request.headers, request.peer), "ping");
                Reply::json(PONG)
            }
            Ok(DispatchOutcome::ImmediateForward(target)) => {
                self.forward_sync(&target, &request.headers, request.body).await
            }
            Ok(DispatchOutcome::DeferredForward(target)) => {
                self.spawn_deferred(interaction, target, request.headers, request.body);
                Reply::json(DEFERRED_ACK)
            }
        }
    }

    /// Decide how an interaction is answered. Pings touch neither index.
    pub fn classify(&self, interaction: &Interaction) -> Result<DispatchOutcome, RouteFailure> {
        let (service, defer) = match interaction.kind {
            InteractionKind::Ping => return Ok(DispatchOutcome::Pong),
            InteractionKind::ApplicationCommand | InteractionKind::Autocomplete => {
                let name = interaction.command_name.as_deref().unwrap_or_default();
                let command = self
                    .inner
                    .commands
                    .lookup(name)
                    .map_err(|err| match err {
                        RoutingError::NotSynced => RouteFailure::NotReady(err),
                        other => RouteFailure::UnknownCommand(other),
                    })?;
                let defer = command.defer && interaction.kind != InteractionKind::Autocomplete;
                (command.service_name.clone(), defer)
            }
            InteractionKind::MessageComponent | InteractionKind::ModalSubmit => {
                let custom_id = interaction.custom_id.as_deref().unwrap_or_default();
                (target_service(custom_id).to_string(), false)
            }
        };

        let address = self
            .inner
            .services
            .resolve(&service)
            .map_err(|source| match source {
                RoutingError::NotSynced => RouteFailure::NotReady(source),
                source => RouteFailure::NoAddress {
                    service: service.clone(),
                    source,
                },
            })?;
        let target = Target { service, address };
        Ok(if defer {
            DispatchOutcome::DeferredForward(target)
        } else {
            DispatchOutcome::ImmediateForward(target)
        })
    }

    async fn call_backend(
        &self,
        target: &Target,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<reqwest::Response, UpstreamError> {
        let mut forwarded = headers.clone();
        for name in STRIPPED_HEADERS.iter() {
            forwarded.remove(name);
        }
        let response = self
            .inner
            .http
            .post(format!("http://{}/", target.address))
            .headers(forwarded)
            .body(body)
            .send()
            .await
            .map_err(|source| UpstreamError::Transport {
                addr: target.address.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Status {
                addr: target.address.clone(),
                status,
                body,
            });
        }
        Ok(response)
    }

    async fn forward_sync(&self, target: &Target, headers: &HeaderMap, body: Bytes) -> Reply {
        let response = match self.call_backend(target, headers, body).await {
            Ok(response) => response,
            Err(err) => {
                log_upstream_failure(target, false, &err);
                return Reply::ephemeral(&failure_message(&err));
            }
        };

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v: &HeaderValue| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .unwrap_or(JSON)
            .to_string();
        match response.bytes().await {
            Ok(body) => {
                if version::is_debug() {
                    debug!(content_type = %content_type, body = %String::from_utf8_lossy(&body), "relaying response");
                }
                info!(service = %target.service, addr = %target.address, deferred = false, "handled interaction");
                Reply {
                    status: StatusCode::OK,
                    content_type,
                    body,
                }
            }
            Err(err) => {
                error!(service = %target.service, error = %err, "failed to read backend response");
                Reply::ephemeral(FORWARD_FAILED_MESSAGE)
            }
        }
    }

    fn spawn_deferred(
        &self,
        interaction: Interaction,
        target: Target,
        headers: HeaderMap,
        body: Bytes,
    ) {
        let this = self.clone();
        let span = info_span!("deferred", id = %interaction.id, service = %target.service);
        let task = async move {
            match this.call_backend(&target, &headers, body).await {
                Ok(response) => info!(
                    addr = %target.address,
                    deferred = true,
                    status = response.status().as_u16(),
                    "handled interaction"
                ),
                Err(err) => {
                    log_upstream_failure(&target, true, &err);
                    let sent = this
                        .inner
                        .followups
                        .send_followup(&interaction.application_id, &interaction.token, &failure_message(&err))
                        .await;
                    if let Err(err) = sent {
                        error!(error = %err, "failed to send follow-up message");
                    }
                }
            }
        };
        self.inner.lifecycle.spawn("deferred-forward", task.instrument(span));
    }
}

fn failure_message(err: &UpstreamError) -> String {
    match err {
        UpstreamError::Transport { .. } => FORWARD_FAILED_MESSAGE.to_string(),
        UpstreamError::Status { status, .. } => upstream_error_message(*status),
    }
}

fn log_upstream_failure(target: &Target, deferred: bool, err: &UpstreamError) {
    match err {
        UpstreamError::Transport { source, .. } => error!(
            service = %target.service,
            addr = %target.address,
            deferred,
            error = %source,
            "failed to forward request"
        ),
        UpstreamError::Status { status, body, .. } => error!(
            service = %target.service,
            addr = %target.address,
            deferred,
            status = status.as_u16(),
            response = %body,
            "upstream returned error"
        ),
    }
}
