use crate::net::{Hello, HttpNetwork, LogPull, LogPush, PubsubMessage};
use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use peersdb_core::{
    CommandClient, ContentRef, FsContentStore, NodeContext, PeersError, Request, Transport,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub struct ServerState {
    pub ctx: Arc<NodeContext>,
    pub network: Arc<HttpNetwork>,
    pub local_content: Arc<FsContentStore>,
    pub client: CommandClient,
}

#[derive(Debug, Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

impl ApiResponse<()> {
    fn failed(error: impl ToString) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CommandBody {
    method: String,
    #[serde(default)]
    args: Vec<String>,
}

/// Peer routes are always served; the command route only with `http` enabled.
pub fn router(state: Arc<ServerState>, command_api: bool) -> Router {
    let mut app = Router::new()
        .route("/health", get(health_handler))
        .route("/p2p/hello", post(hello_handler))
        .route("/p2p/pubsub", post(pubsub_handler))
        .route("/p2p/logs/push", post(logs_push_handler))
        .route("/p2p/logs/entries", post(logs_entries_handler))
        .route("/p2p/content/:hash", get(content_handler));

    if command_api {
        app = app.route("/peersdb/command", post(command_handler));
    }

    app.layer(TraceLayer::new_for_http()).with_state(state)
}

fn error_status(error: &PeersError) -> StatusCode {
    match error {
        PeersError::InvalidRequest(_) | PeersError::HashMismatch { .. } => StatusCode::BAD_REQUEST,
        PeersError::NoDatastore => StatusCode::CONFLICT,
        PeersError::StoreNotFound(_) | PeersError::ContentNotFound(_) => StatusCode::NOT_FOUND,
        PeersError::WriteDenied { .. } => StatusCode::FORBIDDEN,
        PeersError::Transport(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: PeersError) -> Response {
    (error_status(&error), axum::Json(ApiResponse::failed(error))).into_response()
}

async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let connected = state
        .network
        .connected_peers()
        .await
        .map(|peers| peers.len())
        .unwrap_or(0);
    let store = state
        .ctx
        .contributions
        .get()
        .map(|log| log.address().to_string());

    let response = serde_json::json!({
        "peer_id": state.ctx.peer_id.to_string(),
        "contributions_store": store,
        "connected_peers": connected,
    });

    (StatusCode::OK, axum::Json(response))
}

async fn command_handler(
    State(state): State<Arc<ServerState>>,
    axum::Json(body): axum::Json<CommandBody>,
) -> Response {
    let request = match Request::parse(&body.method, body.args) {
        Ok(request) => request,
        Err(error) => return error_response(error),
    };

    match state.client.call(request).await {
        Ok(data) => (StatusCode::OK, axum::Json(ApiResponse::ok(data))).into_response(),
        Err(error) => error_response(error),
    }
}

async fn hello_handler(
    State(state): State<Arc<ServerState>>,
    axum::Json(hello): axum::Json<Hello>,
) -> Response {
    match state.network.accept_hello(hello) {
        Ok(reply) => (StatusCode::OK, axum::Json(reply)).into_response(),
        Err(error) => error_response(error),
    }
}

async fn pubsub_handler(
    State(state): State<Arc<ServerState>>,
    axum::Json(message): axum::Json<PubsubMessage>,
) -> StatusCode {
    let topic = message.topic.clone();
    let delivered = state.network.deliver(message);
    tracing::debug!(topic = %topic, "Delivered message to {} subscriber(s)", delivered);
    StatusCode::NO_CONTENT
}

async fn logs_push_handler(
    State(state): State<Arc<ServerState>>,
    axum::Json(push): axum::Json<LogPush>,
) -> Response {
    let from = push.from.clone();
    match state.network.accept_push(push) {
        Ok(admitted) => {
            tracing::debug!(peer = %from, "Admitted {} pushed entries", admitted);
            StatusCode::NO_CONTENT.into_response()
        }
        Err(error) => error_response(error),
    }
}

async fn logs_entries_handler(
    State(state): State<Arc<ServerState>>,
    axum::Json(pull): axum::Json<LogPull>,
) -> Response {
    match state.network.local_entries(&pull.address) {
        Ok(Some(entries)) => (StatusCode::OK, axum::Json(entries)).into_response(),
        Ok(None) => error_response(PeersError::StoreNotFound(pull.address.to_string())),
        Err(error) => error_response(error),
    }
}

async fn content_handler(
    State(state): State<Arc<ServerState>>,
    Path(hash): Path<String>,
) -> Response {
    let content_ref = match ContentRef::parse(&hash) {
        Ok(content_ref) => content_ref,
        Err(error) => return error_response(error),
    };

    match state.local_content.get_local(&content_ref).await {
        Ok(Some(data)) => (StatusCode::OK, data).into_response(),
        Ok(None) => error_response(PeersError::ContentNotFound(content_ref.to_string())),
        Err(error) => error_response(error),
    }
}
