//! Error taxonomy for the gateway.
//!
//! Per-request and per-record errors are recovered where they happen; only [`FatalError`] and
//! [`ConfigError`] end the process.

use std::time::Duration;

use thiserror::Error;

/// Result alias for cluster API calls.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Startup configuration problems. Always fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(&'static str),

    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("config source: {0}")]
    Source(#[from] config::ConfigError),

    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("http client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Inbound signature verification failures (HTTP 401).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing header {0}")]
    MissingHeader(&'static str),

    #[error("malformed signature")]
    MalformedSignature,

    #[error("signature does not match body")]
    BadSignature,
}

/// Malformed interaction payloads and malformed stored records.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported interaction type {0}")]
    UnknownKind(u8),

    #[error("interaction is missing {0}")]
    MissingField(&'static str),

    #[error("record {identity}: {reason}")]
    Record { identity: String, reason: String },
}

/// Lookup failures in the command index and service resolver.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    #[error("index has not finished its initial listing")]
    NotSynced,

    #[error("nothing matches {0}")]
    NotFound(String),

    #[error("{count} records match the name {name}")]
    Ambiguous { name: String, count: usize },

    #[error("service {0} has no cluster address")]
    NoClusterAddress(String),

    #[error("service {0} declares no ports")]
    NoPort(String),
}

/// Failures calling a backend service.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("forward to {addr} failed: {source}")]
    Transport {
        addr: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("upstream {addr} returned {status}")]
    Status {
        addr: String,
        status: reqwest::StatusCode,
        body: String,
    },
}

/// Cluster API (declarative store and lease) failures.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("api server returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("resource not found")]
    NotFound,

    #[error("resource version conflict")]
    Conflict,

    #[error("watch resume point expired")]
    Expired,

    #[error("malformed watch event: {0}")]
    Malformed(String),

    #[error("decode: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Chat-platform REST API failures.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("platform returned {status}: {body}")]
    Api { status: u16, body: String },
}

/// A single failed step inside a reconcile cycle. Logged; the cycle moves on.
#[derive(Debug, Error)]
pub enum ReconcileItemError {
    #[error("definition for {name} is not a valid command: {source}")]
    Definition {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{count} declarations share the command name {name}")]
    Ambiguous { name: String, count: usize },

    #[error("{op} {name}: {source}")]
    Platform {
        op: &'static str,
        name: String,
        #[source]
        source: PlatformError,
    },
}

/// Conditions that stop the process with a non-zero exit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FatalError {
    #[error("leadership lost")]
    LeadershipLost,

    #[error("http listener stopped: {0}")]
    ListenerDied(String),

    #[error("cleanup timed out after {0:?}")]
    ShutdownTimeout(Duration),
}
