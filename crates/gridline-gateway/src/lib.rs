//! HTTP surface of the gateway: the interaction webhook and the health check.

use std::any::Any;
use std::net::SocketAddr;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use gridline_core::dispatcher::JSON;
use gridline_core::{version, Dispatcher, InboundRequest, Reply};
use tower_http::catch_panic::CatchPanicLayer;

/// `POST /` for interactions, `GET /healthz`, a `Server` header on every response.
pub fn gateway_router(dispatcher: Dispatcher) -> Router {
    Router::new()
        .route("/", post(interaction))
        .route("/healthz", get(health))
        .with_state(dispatcher)
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(middleware::from_fn(server_header))
}

async fn interaction(
    State(dispatcher): State<Dispatcher>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let reply = dispatcher
        .handle(InboundRequest {
            headers,
            body,
            peer: connect.map(|ConnectInfo(addr)| addr),
        })
        .await;
    into_response(reply)
}

fn into_response(reply: Reply) -> Response {
    let content_type = HeaderValue::from_str(&reply.content_type)
        .unwrap_or_else(|_| HeaderValue::from_static(JSON));
    (reply.status, [(header::CONTENT_TYPE, content_type)], reply.body).into_response()
}

async fn health() -> String {
    format!("ok\nrunning {}", version::string())
}

async fn server_header(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&version::server_header()) {
        response.headers_mut().insert(header::SERVER, value);
    }
    response
}

fn handle_panic(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    tracing::error!(panic = %detail, "request handler panicked");
    (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
}
