//! Webhook behaviour end to end: signed requests through the router, real command and service
//! indices, in-process backends on loopback, and a recording follow-up sender.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use ed25519_dalek::{Signer, SigningKey};
use gridline_core::interaction::{FORWARD_FAILED_MESSAGE, NOT_READY_MESSAGE};
use gridline_core::{
    CommandIndex, Dispatcher, FollowUpSender, Lifecycle, PlatformError, RawRecord,
    ServiceResolver,
};
use gridline_gateway::gateway_router;
use serde_json::{json, Value};
use tower::ServiceExt;

#[derive(Default)]
struct RecordingFollowUps {
    sent: Mutex<Vec<(String, String, String)>>,
}

#[async_trait]
impl FollowUpSender for RecordingFollowUps {
    async fn send_followup(
        &self,
        application_id: &str,
        interaction_token: &str,
        content: &str,
    ) -> Result<(), PlatformError> {
        self.sent.lock().unwrap().push((
            application_id.to_string(),
            interaction_token.to_string(),
            content.to_string(),
        ));
        Ok(())
    }
}

struct Harness {
    router: Router,
    followups: Arc<RecordingFollowUps>,
    echo_hits: Arc<AtomicUsize>,
    broken_hits: Arc<AtomicUsize>,
}

fn signing_key() -> SigningKey {
    SigningKey::from_bytes(&[7u8; 32])
}

/// Backend that answers every POST with the body it received.
async fn spawn_echo(hits: Arc<AtomicUsize>) -> SocketAddr {
    let app = Router::new().route(
        "/",
        post(move |headers: HeaderMap, body: Bytes| {
            let hits = Arc::clone(&hits);
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                assert!(headers.contains_key("x-signature-ed25519"));
                (
                    [(header::CONTENT_TYPE, "application/json; charset=utf-8")],
                    body,
                )
                    .into_response()
            }
        }),
    );
    serve(app).await
}

/// Backend that always fails.
async fn spawn_broken(hits: Arc<AtomicUsize>) -> SocketAddr {
    let app = Router::new().route(
        "/",
        post(move || {
            let hits = Arc::clone(&hits);
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                (StatusCode::INTERNAL_SERVER_ERROR, "kaput").into_response()
            }
        }),
    );
    serve(app).await
}

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// A loopback port with nothing listening on it.
async fn closed_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn command(name: &str, service: &str, deferred: bool) -> RawRecord {
    RawRecord::new(
        format!("bots/{}-cmd", name),
        json!({
            "metadata": { "name": format!("{}-cmd", name), "namespace": "bots" },
            "spec": {
                "shouldSendDeferred": deferred,
                "serviceName": service,
                "command": { "name": name, "description": "test" }
            }
        }),
    )
}

fn service(name: &str, port: u16) -> RawRecord {
    RawRecord::new(
        format!("bots/{}", name),
        json!({
            "metadata": { "name": name, "namespace": "bots" },
            "spec": { "clusterIP": "127.0.0.1", "ports": [{ "name": "http", "port": port }] }
        }),
    )
}

async fn harness() -> Harness {
    let echo_hits = Arc::new(AtomicUsize::new(0));
    let broken_hits = Arc::new(AtomicUsize::new(0));
    let echo = spawn_echo(Arc::clone(&echo_hits)).await;
    let broken = spawn_broken(Arc::clone(&broken_hits)).await;

    let commands = CommandIndex::new();
    commands.feed().replace(vec![
        command("echo", "echo", false),
        command("slow-echo", "echo", true),
        command("explode", "broken", false),
        command("slow-explode", "broken", true),
        command("orphan", "nowhere", false),
        command("offline", "offline", false),
        command("slow-offline", "offline", true),
    ]);
    let services = ServiceResolver::new();
    services.feed().replace(vec![
        service("echo", echo.port()),
        service("broken", broken.port()),
        service("offline", closed_port().await),
    ]);

    let followups = Arc::new(RecordingFollowUps::default());
    let dispatcher = Dispatcher::new(
        signing_key().verifying_key(),
        Arc::new(commands),
        Arc::new(services),
        followups.clone(),
        reqwest::Client::new(),
        Lifecycle::new(),
    );

    Harness {
        router: gateway_router(dispatcher),
        followups,
        echo_hits,
        broken_hits,
    }
}

fn signed_request(body: &str) -> Request<Body> {
    let timestamp = "1714564800";
    let mut message = timestamp.as_bytes().to_vec();
    message.extend_from_slice(body.as_bytes());
    let signature = hex::encode(signing_key().sign(&message).to_bytes());
    Request::builder()
        .method("POST")
        .uri("/")
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-signature-ed25519", signature)
        .header("x-signature-timestamp", timestamp)
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, headers, body)
}

fn as_json(body: &Bytes) -> Value {
    serde_json::from_slice(body).unwrap()
}

fn command_body(kind: u8, name: &str) -> String {
    json!({
        "id": "5001",
        "application_id": "1100",
        "type": kind,
        "token": "interaction-token",
        "data": { "name": name }
    })
    .to_string()
}

async fn eventually(check: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn ping_is_answered_with_pong() {
    let h = harness().await;
    let (status, headers, body) = send(&h.router, signed_request(r#"{"id":"1","type":1}"#)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(as_json(&body), json!({ "type": 1 }));
    let server = headers.get(header::SERVER).unwrap().to_str().unwrap();
    assert!(server.starts_with("gridline/v"));
}

#[tokio::test]
async fn bad_signature_is_unauthorized() {
    let h = harness().await;
    let mut request = signed_request(r#"{"type":1}"#);
    request
        .headers_mut()
        .insert("x-signature-timestamp", "1".parse().unwrap());

    let (status, _, _) = send(&h.router, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn immediate_command_relays_backend_body() {
    let h = harness().await;
    let request_body = command_body(2, "echo");
    let (status, headers, body) = send(&h.router, signed_request(&request_body)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        headers.get(header::CONTENT_TYPE).unwrap(),
        "application/json; charset=utf-8"
    );
    assert_eq!(body, Bytes::from(request_body));
    assert_eq!(h.echo_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn deferred_command_acks_then_calls_backend() {
    let h = harness().await;
    let (status, _, body) = send(&h.router, signed_request(&command_body(2, "slow-echo"))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(as_json(&body), json!({ "type": 5 }));
    let hits = Arc::clone(&h.echo_hits);
    eventually(move || hits.load(Ordering::SeqCst) == 1).await;
    assert!(h.followups.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn autocomplete_is_never_deferred() {
    let h = harness().await;
    let request_body = command_body(4, "slow-echo");
    let (_, _, body) = send(&h.router, signed_request(&request_body)).await;

    assert_ne!(as_json(&body), json!({ "type": 5 }));
    assert_eq!(body, Bytes::from(request_body));
}

#[tokio::test]
async fn backend_error_becomes_ephemeral_message() {
    let h = harness().await;
    let (status, _, body) = send(&h.router, signed_request(&command_body(2, "explode"))).await;

    assert_eq!(status, StatusCode::OK);
    let reply = as_json(&body);
    assert_eq!(reply["type"], 4);
    assert_eq!(reply["data"]["flags"], 64);
    let content = reply["data"]["content"].as_str().unwrap();
    assert!(content.contains("500"), "{}", content);
    assert_eq!(h.broken_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn deferred_backend_error_is_sent_as_follow_up() {
    let h = harness().await;
    let (status, _, body) =
        send(&h.router, signed_request(&command_body(2, "slow-explode"))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(as_json(&body), json!({ "type": 5 }));

    let followups = Arc::clone(&h.followups);
    eventually(move || !followups.sent.lock().unwrap().is_empty()).await;
    let sent = h.followups.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    let (application_id, token, content) = &sent[0];
    assert_eq!(application_id, "1100");
    assert_eq!(token, "interaction-token");
    assert!(content.contains("`500`"), "{}", content);
}

#[tokio::test]
async fn deferred_transport_failure_is_sent_as_follow_up() {
    let h = harness().await;
    let (status, _, body) =
        send(&h.router, signed_request(&command_body(2, "slow-offline"))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(as_json(&body), json!({ "type": 5 }));

    let followups = Arc::clone(&h.followups);
    eventually(move || !followups.sent.lock().unwrap().is_empty()).await;
    let sent = h.followups.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1, "interaction-token");
    assert_eq!(sent[0].2, FORWARD_FAILED_MESSAGE);
}

#[tokio::test]
async fn unsynced_indices_answer_not_ready_instead_of_unknown() {
    let dispatcher = Dispatcher::new(
        signing_key().verifying_key(),
        Arc::new(CommandIndex::new()),
        Arc::new(ServiceResolver::new()),
        Arc::new(RecordingFollowUps::default()),
        reqwest::Client::new(),
        Lifecycle::new(),
    );
    let router = gateway_router(dispatcher);

    let (status, _, body) = send(&router, signed_request(&command_body(2, "echo"))).await;
    assert_eq!(status, StatusCode::OK);
    let reply = as_json(&body);
    assert_eq!(reply["type"], 4);
    assert_eq!(reply["data"]["flags"], 64);
    assert_eq!(reply["data"]["content"], NOT_READY_MESSAGE);

    // Pings never wait on the indices.
    let (_, _, body) = send(&router, signed_request(r#"{"id":"1","type":1}"#)).await;
    assert_eq!(as_json(&body), json!({ "type": 1 }));
}

#[tokio::test]
async fn routing_failures_are_explained_to_the_user() {
    let h = harness().await;

    let (_, _, body) = send(&h.router, signed_request(&command_body(2, "no-such-command"))).await;
    assert_eq!(as_json(&body)["data"]["content"], "**Error**: Unknown command");

    let (_, _, body) = send(&h.router, signed_request(&command_body(2, "orphan"))).await;
    assert_eq!(
        as_json(&body)["data"]["content"],
        "**Error**: Failed to get service address"
    );

    let (_, _, body) = send(&h.router, signed_request(&command_body(2, "offline"))).await;
    assert_eq!(
        as_json(&body)["data"]["content"],
        "**Error**: Failed to forward request"
    );
}

#[tokio::test]
async fn component_routes_by_custom_id() {
    let h = harness().await;
    let request_body = json!({
        "id": "5002",
        "application_id": "1100",
        "type": 3,
        "token": "t",
        "data": { "custom_id": "echo/button/1", "component_type": 2 }
    })
    .to_string();

    let (status, _, body) = send(&h.router, signed_request(&request_body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Bytes::from(request_body));
    assert_eq!(h.echo_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn malformed_signed_payload_is_a_server_error() {
    let h = harness().await;
    let (status, _, _) = send(&h.router, signed_request(r#"{"type":2,"data":{}}"#)).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn health_reports_version() {
    let h = harness().await;
    let request = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
    let (status, headers, body) = send(&h.router, request).await;

    assert_eq!(status, StatusCode::OK);
    assert!(headers
        .get(header::CONTENT_TYPE)
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/plain"));
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert_eq!(text, format!("ok\nrunning {}", gridline_core::version::string()));
}

#[tokio::test]
async fn non_post_interaction_is_method_not_allowed() {
    let h = harness().await;
    let request = Request::builder().uri("/").body(Body::empty()).unwrap();
    let (status, headers, _) = send(&h.router, request).await;

    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    let allow = headers.get(header::ALLOW).unwrap().to_str().unwrap();
    assert!(allow.contains("POST"));
}
