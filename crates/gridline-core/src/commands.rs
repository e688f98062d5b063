//! Command index: logical command name to backend target.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{ParseError, RoutingError};
use crate::feed::{FeedIndex, Indexed, RawRecord};

/// A declared command, parsed from a `commands.gridline.dev` record.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandDescriptor {
    /// Storage identity of the record this came from.
    pub identity: String,
    pub name: String,
    pub service_name: String,
    pub defer: bool,
    /// Platform command definition, passed through untouched.
    pub definition: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommandSpec {
    #[serde(default)]
    should_send_deferred: bool,
    service_name: String,
    command: Value,
}

/// The only part of a definition the index needs.
#[derive(Deserialize)]
struct CommandName {
    name: String,
}

impl Indexed for CommandDescriptor {
    fn parse(record: &RawRecord) -> Result<Self, ParseError> {
        let invalid = |reason: String| ParseError::Record {
            identity: record.identity.clone(),
            reason,
        };
        let spec = CommandSpec::deserialize(&record.payload["spec"])
            .map_err(|e| invalid(format!("spec: {}", e)))?;
        let view = CommandName::deserialize(&spec.command)
            .map_err(|e| invalid(format!("spec.command: {}", e)))?;
        if view.name.is_empty() {
            return Err(invalid("spec.command.name is empty".to_string()));
        }
        if spec.service_name.is_empty() {
            return Err(invalid("spec.serviceName is empty".to_string()));
        }
        Ok(Self {
            identity: record.identity.clone(),
            name: view.name,
            service_name: spec.service_name,
            defer: spec.should_send_deferred,
            definition: spec.command,
        })
    }

    fn index_key(&self) -> &str {
        &self.name
    }
}

/// Read side of the command index, as the dispatcher sees it.
pub trait CommandLookup: Send + Sync {
    fn lookup(&self, name: &str) -> Result<Arc<CommandDescriptor>, RoutingError>;
}

/// Shared handle to the command index.
#[derive(Clone, Default)]
pub struct CommandIndex {
    inner: Arc<FeedIndex<CommandDescriptor>>,
}

impl CommandIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// The underlying index, for the feed driver.
    pub fn feed(&self) -> Arc<FeedIndex<CommandDescriptor>> {
        Arc::clone(&self.inner)
    }

    pub fn list(&self) -> Vec<Arc<CommandDescriptor>> {
        self.inner.list()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.is_ready()
    }

    pub async fn wait_ready(&self) {
        self.inner.wait_ready().await
    }
}

impl CommandLookup for CommandIndex {
    fn lookup(&self, name: &str) -> Result<Arc<CommandDescriptor>, RoutingError> {
        self.inner.lookup(name)
    }
}
