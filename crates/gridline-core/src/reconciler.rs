//! Keeps the platform's command catalog in line with the command index.
//!
//! Each cycle fetches the remote catalog fresh, plans the smallest set of deletes, edits and
//! creates, and applies them one by one. A failed step is logged and counted; the rest of the
//! batch still runs and the next cycle tries again.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::commands::{CommandDescriptor, CommandIndex};
use crate::error::{PlatformError, ReconcileItemError};
use crate::platform::{CommandCatalog, CommandDefinition, RemoteCommand};

/// One planned step.
#[derive(Debug)]
pub enum Operation {
    Delete(RemoteCommand),
    Update {
        remote: RemoteCommand,
        definition: CommandDefinition,
    },
    Create(CommandDefinition),
    Unchanged(String),
    /// A declaration that cannot be acted on this cycle. Its remote entry, if any, is left alone.
    Invalid(ReconcileItemError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub failed: usize,
}

/// Diff the remote catalog against the declared commands.
///
/// Deletes and edits come in remote order, creates in declaration order.
pub fn plan(remote: &[RemoteCommand], desired: &[Arc<CommandDescriptor>]) -> Vec<Operation> {
    let mut ops = Vec::new();

    let mut by_name: HashMap<&str, Vec<&CommandDescriptor>> = HashMap::new();
    for descriptor in desired {
        by_name.entry(descriptor.name.as_str()).or_default().push(descriptor);
    }

    // Names whose remote entries must not be touched this cycle.
    let mut held: HashSet<&str> = HashSet::new();
    let mut wanted: HashMap<&str, CommandDefinition> = HashMap::new();
    let mut order: Vec<&str> = Vec::new();

    for descriptor in desired {
        let name = descriptor.name.as_str();
        if held.contains(name) || wanted.contains_key(name) {
            continue;
        }
        let count = by_name.get(name).map_or(0, Vec::len);
        if count > 1 {
            held.insert(name);
            ops.push(Operation::Invalid(ReconcileItemError::Ambiguous {
                name: name.to_string(),
                count,
            }));
            continue;
        }
        match CommandDefinition::from_blob(&descriptor.definition) {
            Ok(definition) => {
                wanted.insert(name, definition.with_defaults());
                order.push(name);
            }
            Err(source) => {
                held.insert(name);
                ops.push(Operation::Invalid(ReconcileItemError::Definition {
                    name: name.to_string(),
                    source,
                }));
            }
        }
    }

    for entry in remote {
        let name = entry.definition.name.as_str();
        if held.contains(name) {
            continue;
        }
        match wanted.remove(name) {
            None => ops.push(Operation::Delete(entry.clone())),
            Some(definition) => {
                if definition.is_satisfied_by(&entry.definition.clone().with_defaults()) {
                    ops.push(Operation::Unchanged(name.to_string()));
                } else {
                    ops.push(Operation::Update {
                        remote: entry.clone(),
                        definition,
                    });
                }
            }
        }
    }

    for name in order {
        if let Some(definition) = wanted.remove(name) {
            ops.push(Operation::Create(definition));
        }
    }
    ops
}

pub struct Reconciler {
    catalog: Arc<dyn CommandCatalog>,
    commands: CommandIndex,
    interval: Duration,
}

impl Reconciler {
    pub fn new(catalog: Arc<dyn CommandCatalog>, commands: CommandIndex, interval: Duration) -> Self {
        Self {
            catalog,
            commands,
            interval,
        }
    }

    /// Reconcile now and then every interval until `leading` is cancelled.
    pub async fn run(self, leading: CancellationToken) {
        tokio::select! {
            _ = leading.cancelled() => return,
            _ = self.commands.wait_ready() => {}
        }
        info!(interval = ?self.interval, "reconciler started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = leading.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                biased;
                _ = leading.cancelled() => break,
                result = self.reconcile_once() => match result {
                    Ok(report) => info!(
                        created = report.created,
                        updated = report.updated,
                        deleted = report.deleted,
                        unchanged = report.unchanged,
                        failed = report.failed,
                        "reconciled commands"
                    ),
                    Err(err) => warn!(error = %err, "failed to list remote commands"),
                },
            }
        }
        info!("reconciler stopped");
    }

    /// One full cycle.
    pub async fn reconcile_once(&self) -> Result<ReconcileReport, PlatformError> {
        let remote = self.catalog.list().await?;
        let desired = self.commands.list();
        let mut report = ReconcileReport::default();

        for op in plan(&remote, &desired) {
            match op {
                Operation::Unchanged(name) => {
                    debug!(command = %name, "command up to date");
                    report.unchanged += 1;
                }
                Operation::Invalid(err) => {
                    warn!(error = %err, "skipping command declaration");
                    report.failed += 1;
                }
                Operation::Delete(remote) => match self.catalog.delete(&remote).await {
                    Ok(()) => {
                        info!(command = %remote.definition.name, id = %remote.id, "deleted command");
                        report.deleted += 1;
                    }
                    Err(source) => {
                        report.failed += 1;
                        warn!(error = %step_error("delete", &remote.definition.name, source), "reconcile step failed");
                    }
                },
                Operation::Update { remote, definition } => {
                    match self.catalog.update(&remote, &definition).await {
                        Ok(_) => {
                            info!(command = %definition.name, id = %remote.id, "updated command");
                            report.updated += 1;
                        }
                        Err(source) => {
                            report.failed += 1;
                            warn!(error = %step_error("update", &definition.name, source), "reconcile step failed");
                        }
                    }
                }
                Operation::Create(definition) => match self.catalog.create(&definition).await {
                    Ok(created) => {
                        info!(command = %definition.name, id = %created.id, "created command");
                        report.created += 1;
                    }
                    Err(source) => {
                        report.failed += 1;
                        warn!(error = %step_error("create", &definition.name, source), "reconcile step failed");
                    }
                },
            }
        }
        Ok(report)
    }
}

fn step_error(op: &'static str, name: &str, source: PlatformError) -> ReconcileItemError {
    ReconcileItemError::Platform {
        op,
        name: name.to_string(),
        source,
    }
}
