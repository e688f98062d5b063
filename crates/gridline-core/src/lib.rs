//! Gridline core: routes chat-platform interactions to backend services declared in the cluster.
//!
//! Two watch-fed indices ([`CommandIndex`], [`ServiceResolver`]) are built on the generic
//! [`feed::FeedIndex`]. The [`Dispatcher`] reads both to route each signed interaction, and the
//! [`Reconciler`] keeps the platform's command catalog in line with the command index while the
//! process holds the leader lease ([`LeaderElector`]). [`Lifecycle`] owns shutdown fan-out.

pub mod cluster;
pub mod commands;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod feed;
pub mod interaction;
pub mod lease;
pub mod lifecycle;
pub mod platform;
pub mod reconciler;
pub mod services;
pub mod version;

pub use cluster::{KubeClient, KubeLeaseLock, KubeResource};
pub use commands::{CommandDescriptor, CommandIndex, CommandLookup};
pub use config::GatewayConfig;
pub use dispatcher::{DispatchOutcome, Dispatcher, InboundRequest, Reply, Target};
pub use error::{
    AuthError, ClusterError, ConfigError, FatalError, ParseError, PlatformError,
    ReconcileItemError, RoutingError, UpstreamError,
};
pub use feed::{run_feed, FeedEvent, FeedIndex, Indexed, RawRecord, RecordList, RecordSource, WatchEvent};
pub use interaction::{Interaction, InteractionKind};
pub use lease::{ElectionConfig, LeaderElector, LeaderState, LeaseLock, LeaseRecord};
pub use lifecycle::{Exit, Lifecycle};
pub use platform::{CommandCatalog, CommandDefinition, DiscordClient, FollowUpSender, RemoteCommand};
pub use reconciler::{ReconcileReport, Reconciler};
pub use services::{AddressResolver, ServiceDescriptor, ServicePort, ServiceResolver};
