//! Watch-fed, in-memory index of declarative records.
//!
//! A [`FeedIndex`] keeps two tables: records by storage identity (`namespace/name`) and a
//! secondary index from a key extracted out of each parsed record to the identities that carry
//! it. [`run_feed`] drives an index from a [`RecordSource`]: list, mark ready, watch, and
//! re-list whenever the watch's resume point expires.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ClusterError, ClusterResult, ParseError, RoutingError};

const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// A stored record: its storage identity and the raw object.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub identity: String,
    pub payload: Value,
}

impl RawRecord {
    pub fn new(identity: impl Into<String>, payload: Value) -> Self {
        Self {
            identity: identity.into(),
            payload,
        }
    }

    /// Build from an API object, keyed by `metadata.namespace/metadata.name`.
    pub fn from_object(payload: Value) -> Result<Self, ParseError> {
        let metadata = &payload["metadata"];
        let name = metadata["name"]
            .as_str()
            .ok_or(ParseError::MissingField("metadata.name"))?;
        let identity = match metadata["namespace"].as_str() {
            Some(namespace) => format!("{}/{}", namespace, name),
            None => name.to_string(),
        };
        Ok(Self { identity, payload })
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.payload["metadata"]["resourceVersion"].as_str()
    }
}

/// Change applied to an index.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Added(RawRecord),
    Modified(RawRecord),
    Deleted(String),
}

/// One event off a watch stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Added(RawRecord),
    Modified(RawRecord),
    Deleted(RawRecord),
    /// Progress marker carrying only a new resume point.
    Bookmark(String),
}

impl WatchEvent {
    pub fn resource_version(&self) -> Option<&str> {
        match self {
            WatchEvent::Added(r) | WatchEvent::Modified(r) | WatchEvent::Deleted(r) => {
                r.resource_version()
            }
            WatchEvent::Bookmark(rv) => Some(rv),
        }
    }

    pub fn into_feed_event(self) -> Option<FeedEvent> {
        match self {
            WatchEvent::Added(r) => Some(FeedEvent::Added(r)),
            WatchEvent::Modified(r) => Some(FeedEvent::Modified(r)),
            WatchEvent::Deleted(r) => Some(FeedEvent::Deleted(r.identity)),
            WatchEvent::Bookmark(_) => None,
        }
    }
}

/// A full listing and the resume point to watch from.
#[derive(Debug, Clone, Default)]
pub struct RecordList {
    pub resource_version: String,
    pub items: Vec<RawRecord>,
}

pub type WatchStream = BoxStream<'static, ClusterResult<WatchEvent>>;

/// A listable, watchable collection of records.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Short name for logs.
    fn describe(&self) -> &str;

    async fn list(&self) -> ClusterResult<RecordList>;

    /// Watch from `resource_version`. Fails with [`ClusterError::Expired`] when it is too old.
    async fn watch(&self, resource_version: &str) -> ClusterResult<WatchStream>;
}

/// A type an index can be built from.
pub trait Indexed: Sized + Send + Sync + 'static {
    fn parse(record: &RawRecord) -> Result<Self, ParseError>;

    /// Secondary key this record is looked up by.
    fn index_key(&self) -> &str;
}

struct IndexState<T> {
    by_identity: BTreeMap<String, Arc<T>>,
    by_key: HashMap<String, BTreeSet<String>>,
}

impl<T> Default for IndexState<T> {
    fn default() -> Self {
        Self {
            by_identity: BTreeMap::new(),
            by_key: HashMap::new(),
        }
    }
}

impl<T: Indexed> IndexState<T> {
    fn insert(&mut self, identity: String, item: Arc<T>) {
        let key = item.index_key().to_string();
        if let Some(previous) = self.by_identity.insert(identity.clone(), item) {
            self.unlink(previous.index_key().to_string(), &identity);
        }
        self.by_key.entry(key).or_default().insert(identity);
    }

    fn remove(&mut self, identity: &str) -> bool {
        match self.by_identity.remove(identity) {
            Some(previous) => {
                self.unlink(previous.index_key().to_string(), identity);
                true
            }
            None => false,
        }
    }

    fn unlink(&mut self, key: String, identity: &str) {
        if let Some(ids) = self.by_key.get_mut(&key) {
            ids.remove(identity);
            if ids.is_empty() {
                self.by_key.remove(&key);
            }
        }
    }
}

/// Concurrent record index with a readiness signal.
pub struct FeedIndex<T> {
    state: RwLock<IndexState<T>>,
    ready: watch::Sender<bool>,
}

impl<T: Indexed> Default for FeedIndex<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Indexed> FeedIndex<T> {
    pub fn new() -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            state: RwLock::new(IndexState::default()),
            ready,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, IndexState<T>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, IndexState<T>> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply one change. A record that fails to parse leaves the index untouched.
    pub fn apply(&self, event: FeedEvent) {
        match event {
            FeedEvent::Added(record) | FeedEvent::Modified(record) => match T::parse(&record) {
                Ok(item) => self.write().insert(record.identity, Arc::new(item)),
                Err(err) => {
                    warn!(identity = %record.identity, error = %err, "skipping malformed record")
                }
            },
            FeedEvent::Deleted(identity) => {
                if !self.write().remove(&identity) {
                    debug!(identity = %identity, "delete for unknown record");
                }
            }
        }
    }

    /// Swap in a complete listing and mark the index ready.
    ///
    /// Identities missing from `records` are dropped. A record that fails to parse keeps
    /// whatever version of it was indexed before.
    pub fn replace(&self, records: Vec<RawRecord>) {
        {
            let mut state = self.write();
            let mut next = IndexState::default();
            for record in records {
                match T::parse(&record) {
                    Ok(item) => next.insert(record.identity, Arc::new(item)),
                    Err(err) => {
                        warn!(identity = %record.identity, error = %err, "skipping malformed record");
                        if let Some(previous) = state.by_identity.get(&record.identity) {
                            next.insert(record.identity, Arc::clone(previous));
                        }
                    }
                }
            }
            *state = next;
        }
        self.mark_ready();
    }

    pub fn mark_ready(&self) {
        self.ready.send_replace(true);
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Resolves once the first listing has been applied.
    pub async fn wait_ready(&self) {
        let mut rx = self.ready.subscribe();
        // The sender lives as long as `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|ready| *ready).await;
    }

    pub fn lookup(&self, key: &str) -> Result<Arc<T>, RoutingError> {
        if !self.is_ready() {
            return Err(RoutingError::NotSynced);
        }
        let state = self.read();
        let ids = state
            .by_key
            .get(key)
            .ok_or_else(|| RoutingError::NotFound(key.to_string()))?;
        if ids.len() > 1 {
            return Err(RoutingError::Ambiguous {
                name: key.to_string(),
                count: ids.len(),
            });
        }
        ids.iter()
            .next()
            .and_then(|id| state.by_identity.get(id))
            .cloned()
            .ok_or_else(|| RoutingError::NotFound(key.to_string()))
    }

    /// Every live record, ordered by storage identity.
    pub fn list(&self) -> Vec<Arc<T>> {
        self.read().by_identity.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().by_identity.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Backoff {
    next: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self {
            next: BACKOFF_START,
        }
    }

    fn reset(&mut self) {
        self.next = BACKOFF_START;
    }

    /// Sleep for the current delay. Returns `false` if shutdown fired first.
    async fn wait(&mut self, shutdown: &CancellationToken) -> bool {
        let delay = self.next;
        self.next = (self.next * 2).min(BACKOFF_MAX);
        tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

async fn cancellable<F: Future>(shutdown: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        _ = shutdown.cancelled() => None,
        out = fut => Some(out),
    }
}

enum WatchEnd {
    Closed,
    Expired,
    Failed(ClusterError),
}

/// Keep `index` in sync with `source` until `shutdown` fires.
pub async fn run_feed<T: Indexed>(
    source: Arc<dyn RecordSource>,
    index: Arc<FeedIndex<T>>,
    shutdown: CancellationToken,
) {
    let name = source.describe().to_string();
    let mut backoff = Backoff::new();
    let mut resume: Option<String> = None;

    loop {
        let from = match resume.take() {
            Some(rv) => rv,
            None => match cancellable(&shutdown, source.list()).await {
                None => break,
                Some(Ok(listing)) => {
                    info!(source = %name, records = listing.items.len(), "listed records");
                    index.replace(listing.items);
                    backoff.reset();
                    listing.resource_version
                }
                Some(Err(err)) => {
                    warn!(source = %name, error = %err, "list failed");
                    if !backoff.wait(&shutdown).await {
                        break;
                    }
                    continue;
                }
            },
        };

        let mut stream = match cancellable(&shutdown, source.watch(&from)).await {
            None => break,
            Some(Ok(stream)) => stream,
            Some(Err(ClusterError::Expired)) => {
                info!(source = %name, "resume point expired, relisting");
                continue;
            }
            Some(Err(err)) => {
                warn!(source = %name, error = %err, "watch failed");
                resume = Some(from);
                if !backoff.wait(&shutdown).await {
                    break;
                }
                continue;
            }
        };

        let mut last = from;
        let end = loop {
            let next = match cancellable(&shutdown, stream.next()).await {
                None => {
                    debug!(source = %name, "feed stopped");
                    return;
                }
                Some(next) => next,
            };
            match next {
                None => break WatchEnd::Closed,
                Some(Ok(event)) => {
                    if let Some(rv) = event.resource_version() {
                        last = rv.to_string();
                    }
                    if let Some(change) = event.into_feed_event() {
                        index.apply(change);
                    }
                    backoff.reset();
                }
                Some(Err(ClusterError::Expired)) => break WatchEnd::Expired,
                Some(Err(err)) => break WatchEnd::Failed(err),
            }
        };

        match end {
            WatchEnd::Closed => {
                debug!(source = %name, resource_version = %last, "watch closed, resuming");
                resume = Some(last);
            }
            WatchEnd::Expired => {
                info!(source = %name, "resume point expired, relisting");
            }
            WatchEnd::Failed(err) => {
                warn!(source = %name, error = %err, "watch stream failed");
                resume = Some(last);
                if !backoff.wait(&shutdown).await {
                    break;
                }
            }
        }
    }
    debug!(source = %name, "feed stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    #[derive(Debug)]
    struct Named {
        name: String,
        version: u64,
    }

    impl Indexed for Named {
        fn parse(record: &RawRecord) -> Result<Self, ParseError> {
            let name = record.payload["name"]
                .as_str()
                .ok_or_else(|| ParseError::Record {
                    identity: record.identity.clone(),
                    reason: "no name".into(),
                })?;
            Ok(Named {
                name: name.to_string(),
                version: record.payload["version"].as_u64().unwrap_or(0),
            })
        }

        fn index_key(&self) -> &str {
            &self.name
        }
    }

    fn record(identity: &str, name: &str) -> RawRecord {
        RawRecord::new(identity, json!({ "name": name }))
    }

    fn ready_index() -> FeedIndex<Named> {
        let index = FeedIndex::new();
        index.mark_ready();
        index
    }

    #[test]
    fn add_add_delete_leaves_one_record() {
        let index = ready_index();
        index.apply(FeedEvent::Added(record("ns/a", "alpha")));
        index.apply(FeedEvent::Added(record("ns/b", "beta")));
        index.apply(FeedEvent::Deleted("ns/a".into()));

        assert_eq!(index.len(), 1);
        assert_eq!(index.lookup("beta").unwrap().name, "beta");
        assert_eq!(
            index.lookup("alpha").unwrap_err(),
            RoutingError::NotFound("alpha".into())
        );
    }

    #[test]
    fn two_records_with_one_name_are_ambiguous() {
        let index = ready_index();
        index.apply(FeedEvent::Added(record("ns/a", "ping")));
        index.apply(FeedEvent::Added(record("ns/b", "ping")));

        assert_eq!(
            index.lookup("ping").unwrap_err(),
            RoutingError::Ambiguous {
                name: "ping".into(),
                count: 2
            }
        );

        index.apply(FeedEvent::Deleted("ns/b".into()));
        assert!(index.lookup("ping").is_ok());
    }

    #[test]
    fn lookups_before_listing_are_not_synced() {
        let index: FeedIndex<Named> = FeedIndex::new();
        index.apply(FeedEvent::Added(record("ns/a", "alpha")));
        assert_eq!(index.lookup("alpha").unwrap_err(), RoutingError::NotSynced);

        index.replace(vec![record("ns/a", "alpha")]);
        assert!(index.is_ready());
        assert!(index.lookup("alpha").is_ok());
    }

    #[test]
    fn malformed_update_keeps_previous_version() {
        let index = ready_index();
        index.apply(FeedEvent::Added(RawRecord::new(
            "ns/a",
            json!({ "name": "alpha", "version": 1 }),
        )));
        index.apply(FeedEvent::Modified(RawRecord::new("ns/a", json!({ "broken": true }))));

        let item = index.lookup("alpha").unwrap();
        assert_eq!(item.version, 1);
    }

    #[test]
    fn renamed_record_moves_in_secondary_index() {
        let index = ready_index();
        index.apply(FeedEvent::Added(record("ns/a", "old")));
        index.apply(FeedEvent::Modified(record("ns/a", "new")));

        assert!(matches!(index.lookup("old"), Err(RoutingError::NotFound(_))));
        assert_eq!(index.lookup("new").unwrap().name, "new");
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn replace_drops_absent_and_keeps_malformed_previous() {
        let index = ready_index();
        index.apply(FeedEvent::Added(RawRecord::new(
            "ns/a",
            json!({ "name": "alpha", "version": 3 }),
        )));
        index.apply(FeedEvent::Added(record("ns/b", "beta")));

        index.replace(vec![
            RawRecord::new("ns/a", json!({ "garbage": 1 })),
            record("ns/c", "gamma"),
        ]);

        let names: Vec<_> = index.list().iter().map(|n| n.name.clone()).collect();
        assert_eq!(names, vec!["alpha", "gamma"]);
        assert_eq!(index.lookup("alpha").unwrap().version, 3);
    }

    #[test]
    fn identity_comes_from_object_metadata() {
        let raw = RawRecord::from_object(json!({
            "metadata": { "name": "ping", "namespace": "bots", "resourceVersion": "17" }
        }))
        .unwrap();
        assert_eq!(raw.identity, "bots/ping");
        assert_eq!(raw.resource_version(), Some("17"));

        assert!(RawRecord::from_object(json!({ "metadata": {} })).is_err());
    }

    struct ChannelSource {
        listing: Vec<RawRecord>,
        events: Mutex<Option<mpsc::UnboundedReceiver<ClusterResult<WatchEvent>>>>,
    }

    #[async_trait]
    impl RecordSource for ChannelSource {
        fn describe(&self) -> &str {
            "test"
        }

        async fn list(&self) -> ClusterResult<RecordList> {
            Ok(RecordList {
                resource_version: "1".into(),
                items: self.listing.clone(),
            })
        }

        async fn watch(&self, _resource_version: &str) -> ClusterResult<WatchStream> {
            match self.events.lock().unwrap().take() {
                Some(rx) => Ok(UnboundedReceiverStream::new(rx).boxed()),
                None => Ok(futures_util::stream::pending().boxed()),
            }
        }
    }

    #[tokio::test]
    async fn feed_lists_then_applies_watch_events() {
        let (tx, rx) = mpsc::unbounded_channel();
        let source = Arc::new(ChannelSource {
            listing: vec![record("ns/a", "alpha")],
            events: Mutex::new(Some(rx)),
        });
        let index = Arc::new(FeedIndex::<Named>::new());
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_feed(source, Arc::clone(&index), shutdown.clone()));

        index.wait_ready().await;
        assert!(index.lookup("alpha").is_ok());

        tx.send(Ok(WatchEvent::Added(record("ns/b", "beta")))).unwrap();
        tx.send(Ok(WatchEvent::Deleted(record("ns/a", "alpha")))).unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while index.lookup("beta").is_err() || index.lookup("alpha").is_ok() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("watch events applied");

        shutdown.cancel();
        task.await.unwrap();
    }
}
