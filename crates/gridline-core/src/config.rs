//! Gateway configuration: defaults, then an optional TOML file, then the process environment.
//!
//! | Env | Default | Description |
//! |-----|---------|-------------|
//! | DISCORD_PUBLIC_KEY | required | Hex Ed25519 key used to verify interaction signatures. |
//! | DISCORD_APPLICATION_ID | required | Application that owns the command catalog. |
//! | DISCORD_BOT_TOKEN | required | Bot token; the `Bot ` prefix is added when missing. |
//! | DISCORD_GUILD_ID | unset | Scope the command catalog to one guild. |
//! | DISCORD_API_URL | https://discord.com/api/v10 | Platform REST base URL. |
//! | DEPLOYMENT_NAME | required | Name of the leader lease. |
//! | HOSTNAME | required | Identity written into the leader lease. |
//! | LISTEN_ADDR | 0.0.0.0:8000 | HTTP bind address. |
//! | KUBE_API_URL | unset | Explicit API server URL; in-cluster discovery otherwise. |
//! | KUBE_NAMESPACE | service-account namespace | Namespace to watch. |
//! | LEASE_DURATION_SECS / RENEW_DEADLINE_SECS / RETRY_PERIOD_SECS | 30 / 10 / 2 | Election cadence. |
//! | RECONCILE_INTERVAL_SECS | 60 | Command catalog sync period. |
//! | SHUTDOWN_TIMEOUT_SECS | 10 | Upper bound on draining background tasks. |
//! | FORWARD_TIMEOUT_SECS | 30 | Backend call timeout. |

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ed25519_dalek::VerifyingKey;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::lease::ElectionConfig;

pub const DEFAULT_DISCORD_API_URL: &str = "https://discord.com/api/v10";
const DEFAULT_CONFIG_PATH: &str = "config/gridline.toml";

/// Settings exactly as they arrive from file and environment, before validation.
#[derive(Debug, Deserialize)]
struct RawConfig {
    discord_public_key: Option<String>,
    discord_application_id: Option<String>,
    discord_bot_token: Option<String>,
    discord_guild_id: Option<String>,
    discord_api_url: String,
    deployment_name: Option<String>,
    hostname: Option<String>,
    listen_addr: String,
    kube_api_url: Option<String>,
    kube_namespace: Option<String>,
    lease_duration_secs: u64,
    renew_deadline_secs: u64,
    retry_period_secs: u64,
    reconcile_interval_secs: u64,
    shutdown_timeout_secs: u64,
    forward_timeout_secs: u64,
}

/// Bot credential. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct BotToken(String);

impl BotToken {
    pub fn new(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.starts_with("Bot ") {
            Self(raw.to_string())
        } else {
            Self(format!("Bot {}", raw))
        }
    }

    /// Value for the `Authorization` header.
    pub fn authorization(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for BotToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BotToken(***)")
    }
}

/// Validated gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub public_key: VerifyingKey,
    pub application_id: String,
    pub bot_token: BotToken,
    pub guild_id: Option<String>,
    pub discord_api_url: String,
    pub deployment_name: String,
    pub hostname: String,
    pub listen_addr: SocketAddr,
    pub kube_api_url: Option<String>,
    pub kube_namespace: Option<String>,
    pub election: ElectionConfig,
    pub reconcile_interval: Duration,
    pub shutdown_timeout: Duration,
    pub forward_timeout: Duration,
}

impl GatewayConfig {
    /// Load from `GRIDLINE_CONFIG` (or `config/gridline.toml` when present) and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("GRIDLINE_CONFIG")
            .map(PathBuf::from)
            .ok()
            .or_else(|| {
                let default = PathBuf::from(DEFAULT_CONFIG_PATH);
                default.exists().then_some(default)
            });
        Self::from_sources(path.as_deref(), None)
    }

    /// Build from an optional file plus either the real environment or a supplied map.
    pub fn from_sources(
        file: Option<&Path>,
        env: Option<HashMap<String, String>>,
    ) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("discord_api_url", DEFAULT_DISCORD_API_URL)?
            .set_default("listen_addr", "0.0.0.0:8000")?
            .set_default("lease_duration_secs", 30_i64)?
            .set_default("renew_deadline_secs", 10_i64)?
            .set_default("retry_period_secs", 2_i64)?
            .set_default("reconcile_interval_secs", 60_i64)?
            .set_default("shutdown_timeout_secs", 10_i64)?
            .set_default("forward_timeout_secs", 30_i64)?;

        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let environment = match env {
            Some(map) => config::Environment::default().source(Some(map)),
            None => config::Environment::default(),
        };

        let raw: RawConfig = builder.add_source(environment).build()?.try_deserialize()?;
        Self::validate(raw)
    }

    fn validate(raw: RawConfig) -> Result<Self, ConfigError> {
        let public_key = parse_public_key(&required(raw.discord_public_key, "DISCORD_PUBLIC_KEY")?)?;
        let application_id = required(raw.discord_application_id, "DISCORD_APPLICATION_ID")?;
        let bot_token = BotToken::new(&required(raw.discord_bot_token, "DISCORD_BOT_TOKEN")?);
        let deployment_name = required(raw.deployment_name, "DEPLOYMENT_NAME")?;
        let hostname = required(raw.hostname, "HOSTNAME")?;

        let listen_addr = raw
            .listen_addr
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::Invalid {
                key: "LISTEN_ADDR",
                reason: e.to_string(),
            })?;

        let election = ElectionConfig {
            lease_duration: Duration::from_secs(raw.lease_duration_secs),
            renew_deadline: Duration::from_secs(raw.renew_deadline_secs),
            retry_period: Duration::from_secs(raw.retry_period_secs),
        };
        if election.renew_deadline >= election.lease_duration {
            return Err(ConfigError::Invalid {
                key: "RENEW_DEADLINE_SECS",
                reason: "must be shorter than LEASE_DURATION_SECS".to_string(),
            });
        }
        if election.retry_period.is_zero() || election.retry_period >= election.renew_deadline {
            return Err(ConfigError::Invalid {
                key: "RETRY_PERIOD_SECS",
                reason: "must be non-zero and shorter than RENEW_DEADLINE_SECS".to_string(),
            });
        }
        if raw.reconcile_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "RECONCILE_INTERVAL_SECS",
                reason: "must be non-zero".to_string(),
            });
        }

        Ok(Self {
            public_key,
            application_id,
            bot_token,
            guild_id: non_empty(raw.discord_guild_id),
            discord_api_url: raw.discord_api_url.trim_end_matches('/').to_string(),
            deployment_name,
            hostname,
            listen_addr,
            kube_api_url: non_empty(raw.kube_api_url),
            kube_namespace: non_empty(raw.kube_namespace),
            election,
            reconcile_interval: Duration::from_secs(raw.reconcile_interval_secs),
            shutdown_timeout: Duration::from_secs(raw.shutdown_timeout_secs),
            forward_timeout: Duration::from_secs(raw.forward_timeout_secs),
        })
    }
}

/// Decode a hex Ed25519 public key.
pub fn parse_public_key(hex_key: &str) -> Result<VerifyingKey, ConfigError> {
    let invalid = |reason: String| ConfigError::Invalid {
        key: "DISCORD_PUBLIC_KEY",
        reason,
    };
    let bytes = hex::decode(hex_key.trim()).map_err(|e| invalid(e.to_string()))?;
    let bytes: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| invalid(format!("expected 32 bytes, got {}", bytes.len())))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| invalid(e.to_string()))
}

fn required(value: Option<String>, key: &'static str) -> Result<String, ConfigError> {
    non_empty(value).ok_or(ConfigError::Missing(key))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
