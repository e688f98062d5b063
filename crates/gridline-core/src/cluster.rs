//! Minimal Kubernetes REST client: list/watch for the two indices and the leader lease.

use std::path::Path;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use futures_util::{Stream, StreamExt};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::GatewayConfig;
use crate::error::{ClusterError, ClusterResult, ConfigError};
use crate::feed::{RawRecord, RecordList, RecordSource, WatchEvent, WatchStream};
use crate::lease::{LeaseLock, LeaseRecord};
use crate::services::join_host_port;

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Server-side watch timeout; the feed resumes when the stream ends.
const WATCH_TIMEOUT_SECS: u64 = 300;

pub const COMMAND_GROUP: &str = "gridline.dev";
pub const COMMAND_VERSION: &str = "v1";
pub const COMMAND_PLURAL: &str = "commands";

#[derive(Clone)]
pub struct KubeClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    namespace: String,
}

impl KubeClient {
    /// Use the pod's service account.
    pub fn in_cluster(namespace: Option<String>) -> Result<Self, ConfigError> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| ConfigError::Missing("KUBERNETES_SERVICE_HOST"))?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".into());
        let port: u16 = port.parse().map_err(|_| ConfigError::Invalid {
            key: "KUBERNETES_SERVICE_PORT",
            reason: format!("not a port: {}", port),
        })?;

        let dir = Path::new(SERVICE_ACCOUNT_DIR);
        let token = read_to_string(&dir.join("token"))?.trim().to_string();
        let ca = std::fs::read(dir.join("ca.crt")).map_err(|source| ConfigError::Io {
            path: dir.join("ca.crt").display().to_string(),
            source,
        })?;
        let namespace = match namespace {
            Some(ns) => ns,
            None => match read_to_string(&dir.join("namespace")) {
                Ok(ns) => ns.trim().to_string(),
                Err(err) => {
                    warn!(error = %err, "no service-account namespace, using default");
                    "default".to_string()
                }
            },
        };

        let http = reqwest::Client::builder()
            .add_root_certificate(reqwest::Certificate::from_pem(&ca)?)
            .build()?;

        Ok(Self {
            http,
            base_url: format!("https://{}", join_host_port(&host, port)),
            token: Some(token),
            namespace,
        })
    }

    /// Talk to an explicit API server URL without credentials (e.g. `kubectl proxy`).
    pub fn with_base_url(base_url: &str, namespace: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            http: reqwest::Client::builder().build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
            namespace: namespace.to_string(),
        })
    }

    pub fn from_config(config: &GatewayConfig) -> Result<Self, ConfigError> {
        match &config.kube_api_url {
            Some(url) => Self::with_base_url(
                url,
                config.kube_namespace.as_deref().unwrap_or("default"),
            ),
            None => Self::in_cluster(config.kube_namespace.clone()),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn commands(&self) -> KubeResource {
        KubeResource {
            client: self.clone(),
            path: format!(
                "/apis/{}/{}/namespaces/{}/{}",
                COMMAND_GROUP, COMMAND_VERSION, self.namespace, COMMAND_PLURAL
            ),
            label: "commands".to_string(),
        }
    }

    pub fn services(&self) -> KubeResource {
        KubeResource {
            client: self.clone(),
            path: format!("/api/v1/namespaces/{}/services", self.namespace),
            label: "services".to_string(),
        }
    }

    pub fn lease_lock(&self, name: &str, identity: &str) -> KubeLeaseLock {
        KubeLeaseLock {
            client: self.clone(),
            name: name.to_string(),
            identity: identity.to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> ClusterResult<T> {
        let response = self.authorize(request).timeout(REQUEST_TIMEOUT).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, body))
    }
}

fn read_to_string(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })
}

fn status_error(status: StatusCode, body: String) -> ClusterError {
    match status {
        StatusCode::NOT_FOUND => ClusterError::NotFound,
        StatusCode::CONFLICT => ClusterError::Conflict,
        StatusCode::GONE => ClusterError::Expired,
        _ => ClusterError::Api {
            status: status.as_u16(),
            body,
        },
    }
}

/// One namespaced collection, listable and watchable.
#[derive(Clone)]
pub struct KubeResource {
    client: KubeClient,
    path: String,
    label: String,
}

#[derive(Deserialize)]
struct ListResponse {
    metadata: ListMeta,
    #[serde(default)]
    items: Vec<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListMeta {
    #[serde(default)]
    resource_version: String,
}

#[async_trait]
impl RecordSource for KubeResource {
    fn describe(&self) -> &str {
        &self.label
    }

    async fn list(&self) -> ClusterResult<RecordList> {
        let response: ListResponse = self
            .client
            .send_json(self.client.http.get(self.client.url(&self.path)))
            .await?;
        let items = response
            .items
            .into_iter()
            .filter_map(|item| match RawRecord::from_object(item) {
                Ok(record) => Some(record),
                Err(err) => {
                    warn!(source = %self.label, error = %err, "dropping unnamed object");
                    None
                }
            })
            .collect();
        Ok(RecordList {
            resource_version: response.metadata.resource_version,
            items,
        })
    }

    async fn watch(&self, resource_version: &str) -> ClusterResult<WatchStream> {
        let timeout = WATCH_TIMEOUT_SECS.to_string();
        let request = self.client.http.get(self.client.url(&self.path)).query(&[
            ("watch", "true"),
            ("resourceVersion", resource_version),
            ("allowWatchBookmarks", "true"),
            ("timeoutSeconds", timeout.as_str()),
        ]);
        let response = self.client.authorize(request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, body));
        }
        debug!(source = %self.label, resource_version, "watch opened");
        Ok(decode_watch_lines(response.bytes_stream()))
    }
}

#[derive(Deserialize)]
struct RawWatchEvent {
    #[serde(rename = "type")]
    kind: String,
    object: Value,
}

fn parse_watch_line(line: &[u8]) -> ClusterResult<WatchEvent> {
    let event: RawWatchEvent = serde_json::from_slice(line)?;
    let record = |object: Value| {
        RawRecord::from_object(object).map_err(|e| ClusterError::Malformed(e.to_string()))
    };
    match event.kind.as_str() {
        "ADDED" => Ok(WatchEvent::Added(record(event.object)?)),
        "MODIFIED" => Ok(WatchEvent::Modified(record(event.object)?)),
        "DELETED" => Ok(WatchEvent::Deleted(record(event.object)?)),
        "BOOKMARK" => event.object["metadata"]["resourceVersion"]
            .as_str()
            .map(|rv| WatchEvent::Bookmark(rv.to_string()))
            .ok_or_else(|| ClusterError::Malformed("bookmark without resourceVersion".into())),
        "ERROR" => {
            let code = event.object["code"].as_u64().unwrap_or(0);
            if code == 410 {
                Err(ClusterError::Expired)
            } else {
                Err(ClusterError::Api {
                    status: u16::try_from(code).unwrap_or(0),
                    body: event.object["message"].as_str().unwrap_or_default().to_string(),
                })
            }
        }
        other => Err(ClusterError::Malformed(format!("unknown event type {}", other))),
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let start = line.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(line.len());
    let end = line.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |i| i + 1);
    &line[start..end]
}

struct LineState<S> {
    inner: Pin<Box<S>>,
    buffer: Vec<u8>,
    done: bool,
}

/// Split a chunked body into newline-delimited watch events.
pub fn decode_watch_lines<S, E>(body: S) -> WatchStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<ClusterError> + Send + 'static,
{
    let state = LineState {
        inner: Box::pin(body),
        buffer: Vec::new(),
        done: false,
    };
    futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(pos) = state.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = state.buffer.drain(..=pos).collect();
                let line = trim_line(&line);
                if line.is_empty() {
                    continue;
                }
                let event = parse_watch_line(line);
                return Some((event, state));
            }
            if state.done {
                let rest = std::mem::take(&mut state.buffer);
                let rest = trim_line(&rest);
                if rest.is_empty() {
                    return None;
                }
                return Some((parse_watch_line(rest), state));
            }
            match state.inner.next().await {
                Some(Ok(chunk)) => state.buffer.extend_from_slice(&chunk),
                Some(Err(err)) => {
                    state.done = true;
                    state.buffer.clear();
                    return Some((Err(err.into()), state));
                }
                None => state.done = true,
            }
        }
    })
    .boxed()
}

/// `coordination.k8s.io/v1` Lease.
pub struct KubeLeaseLock {
    client: KubeClient,
    name: String,
    identity: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeaseObject {
    api_version: String,
    kind: String,
    metadata: LeaseMeta,
    #[serde(default)]
    spec: LeaseSpec,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeaseMeta {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    resource_version: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeaseSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    holder_identity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    lease_duration_seconds: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    acquire_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    renew_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    lease_transitions: Option<i32>,
}

fn micro_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_micro_time(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc))
}

impl LeaseObject {
    fn from_record(name: &str, namespace: &str, record: &LeaseRecord) -> Self {
        Self {
            api_version: "coordination.k8s.io/v1".to_string(),
            kind: "Lease".to_string(),
            metadata: LeaseMeta {
                name: name.to_string(),
                namespace: Some(namespace.to_string()),
                resource_version: record.resource_version.clone(),
            },
            spec: LeaseSpec {
                holder_identity: record.holder_identity.clone(),
                lease_duration_seconds: Some(record.lease_duration_seconds),
                acquire_time: record.acquire_time.as_ref().map(micro_time),
                renew_time: record.renew_time.as_ref().map(micro_time),
                lease_transitions: Some(record.lease_transitions),
            },
        }
    }

    fn into_record(self) -> LeaseRecord {
        LeaseRecord {
            holder_identity: self.spec.holder_identity,
            lease_duration_seconds: self.spec.lease_duration_seconds.unwrap_or(0),
            acquire_time: parse_micro_time(self.spec.acquire_time.as_deref()),
            renew_time: parse_micro_time(self.spec.renew_time.as_deref()),
            lease_transitions: self.spec.lease_transitions.unwrap_or(0),
            resource_version: self.metadata.resource_version,
        }
    }
}

impl KubeLeaseLock {
    fn collection_path(&self) -> String {
        format!(
            "/apis/coordination.k8s.io/v1/namespaces/{}/leases",
            self.client.namespace
        )
    }

    fn item_path(&self) -> String {
        format!("{}/{}", self.collection_path(), self.name)
    }
}

#[async_trait]
impl LeaseLock for KubeLeaseLock {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn get(&self) -> ClusterResult<Option<LeaseRecord>> {
        let request = self.client.http.get(self.client.url(&self.item_path()));
        match self.client.send_json::<LeaseObject>(request).await {
            Ok(object) => Ok(Some(object.into_record())),
            Err(ClusterError::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn create(&self, record: &LeaseRecord) -> ClusterResult<LeaseRecord> {
        let body = LeaseObject::from_record(&self.name, &self.client.namespace, record);
        let request = self
            .client
            .http
            .post(self.client.url(&self.collection_path()))
            .json(&body);
        let created: LeaseObject = self.client.send_json(request).await?;
        Ok(created.into_record())
    }

    async fn update(&self, record: &LeaseRecord) -> ClusterResult<LeaseRecord> {
        let body = LeaseObject::from_record(&self.name, &self.client.namespace, record);
        let request = self
            .client
            .http
            .put(self.client.url(&self.item_path()))
            .json(&body);
        let updated: LeaseObject = self.client.send_json(request).await?;
        Ok(updated.into_record())
    }
}
