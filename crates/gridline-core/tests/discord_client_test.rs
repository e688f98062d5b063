//! The platform client against an in-process fake of the REST API.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::routing::{any, post};
use axum::{Json, Router};
use gridline_core::config::BotToken;
use gridline_core::{
    CommandCatalog, CommandDefinition, DiscordClient, FollowUpSender, PlatformError,
    RemoteCommand,
};
use serde_json::{json, Value};

#[derive(Clone, Default)]
struct Recorded {
    calls: Arc<Mutex<Vec<(Method, String, Option<String>, Value)>>>,
}

async fn catalog_endpoint(
    State(recorded): State<Recorded>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> axum::response::Response {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let payload: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    recorded
        .calls
        .lock()
        .unwrap()
        .push((method.clone(), uri.path().to_string(), auth, payload.clone()));

    match method {
        Method::GET => Json(json!([{
            "id": "900",
            "application_id": "1100",
            "guild_id": "42",
            "version": "901",
            "type": 1,
            "name": "roll",
            "description": "Roll dice",
            "nsfw": false
        }]))
        .into_response(),
        Method::DELETE if uri.path().ends_with("/404") => {
            (StatusCode::NOT_FOUND, r#"{"message":"Unknown application command"}"#).into_response()
        }
        Method::DELETE => StatusCode::NO_CONTENT.into_response(),
        _ => {
            let mut created = payload;
            created["id"] = json!("901");
            created["application_id"] = json!("1100");
            created["version"] = json!("902");
            Json(created).into_response()
        }
    }
}

async fn webhook_endpoint(
    State(recorded): State<Recorded>,
    Path((app, token)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> StatusCode {
    recorded.calls.lock().unwrap().push((
        Method::POST,
        format!("/webhooks/{}/{}", app, token),
        None,
        body,
    ));
    StatusCode::OK
}

async fn fake_platform() -> (SocketAddr, Recorded) {
    let recorded = Recorded::default();
    let app = Router::new()
        .route("/applications/:app/guilds/:guild/commands", any(catalog_endpoint))
        .route("/applications/:app/guilds/:guild/commands/:id", any(catalog_endpoint))
        .route("/webhooks/:app/:token", post(webhook_endpoint))
        .with_state(recorded.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, recorded)
}

fn client(addr: SocketAddr) -> DiscordClient {
    DiscordClient::new(
        &format!("http://{}", addr),
        "1100",
        Some("42".into()),
        BotToken::new("s3cret"),
    )
    .unwrap()
}

#[tokio::test]
async fn catalog_round_trip_uses_guild_scope_and_bot_auth() {
    let (addr, recorded) = fake_platform().await;
    let client = client(addr);

    let remote = client.list().await.unwrap();
    assert_eq!(remote.len(), 1);
    assert_eq!(remote[0].id, "900");
    assert_eq!(remote[0].definition.name, "roll");

    let definition = CommandDefinition {
        name: "roll".into(),
        description: "Roll more dice".into(),
        ..CommandDefinition::default()
    }
    .with_defaults();
    let updated = client.update(&remote[0], &definition).await.unwrap();
    assert_eq!(updated.definition.description, "Roll more dice");

    let created = client
        .create(&CommandDefinition {
            name: "flip".into(),
            description: "Flip a coin".into(),
            ..CommandDefinition::default()
        })
        .await
        .unwrap();
    assert_eq!(created.id, "901");

    client.delete(&remote[0]).await.unwrap();

    let calls = recorded.calls.lock().unwrap().clone();
    let summary: Vec<_> = calls
        .iter()
        .map(|(method, path, _, _)| format!("{} {}", method, path))
        .collect();
    assert_eq!(
        summary,
        vec![
            "GET /applications/1100/guilds/42/commands",
            "PATCH /applications/1100/guilds/42/commands/900",
            "POST /applications/1100/guilds/42/commands",
            "DELETE /applications/1100/guilds/42/commands/900",
        ]
    );
    assert!(calls
        .iter()
        .all(|(_, _, auth, _)| auth.as_deref() == Some("Bot s3cret")));
    assert_eq!(calls[1].3["type"], 1);
    assert_eq!(calls[1].3["nsfw"], false);
}

#[tokio::test]
async fn platform_errors_carry_status() {
    let (addr, _) = fake_platform().await;
    let client = client(addr);
    let missing = RemoteCommand {
        id: "404".into(),
        application_id: "1100".into(),
        guild_id: Some("42".into()),
        version: "1".into(),
        definition: CommandDefinition::default(),
    };

    let err = client.delete(&missing).await.unwrap_err();
    assert!(matches!(err, PlatformError::Api { status: 404, .. }));
}

#[tokio::test]
async fn follow_up_posts_to_interaction_webhook_without_mentions() {
    let (addr, recorded) = fake_platform().await;
    client(addr)
        .send_followup("1100", "tok-123", "**Error**: Failed to forward request")
        .await
        .unwrap();

    let calls = recorded.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
    let (_, path, _, body) = &calls[0];
    assert_eq!(path, "/webhooks/1100/tok-123");
    assert_eq!(body["content"], "**Error**: Failed to forward request");
    assert_eq!(body["allowed_mentions"]["parse"], json!([]));
}
