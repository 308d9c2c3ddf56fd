//! Router and REST handlers.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::agent::{ChatAgent, EchoAgent, HttpAgent};
use crate::config::ResolvedConfig;
use crate::models::{Graph, Visibility};
use crate::storage::{Storage, generate_id, validate_id};
use crate::sync::SyncHub;
use crate::{Error, Result};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<SyncHub>,
}

/// Error wrapper that renders as `{"error": "..."}` with a matching status.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidId(_) | Error::InvalidInput(_) | Error::Json(_) => StatusCode::BAD_REQUEST,
            Error::LockConflict { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::warn!(error = %self.0, "request failed");
        }
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult = std::result::Result<Json<serde_json::Value>, ApiError>;

/// Build the full router around a hub.
pub fn build_router(hub: Arc<SyncHub>) -> Router {
    let state = AppState { hub };
    Router::new()
        .route("/health", get(health))
        .route("/api/graphs", get(list_graphs).post(create_graph))
        .route("/api/graphs/:id", get(get_graph).delete(delete_graph))
        .route("/api/graphs/:id/presence", get(get_presence))
        .route("/api/graphs/:id/layout", post(request_layout))
        .route(
            "/api/graphs/:id/chat/:message_id/complete",
            post(complete_chat),
        )
        .route("/ws", get(super::websocket::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve on an already-bound listener until `shutdown` resolves.
pub async fn serve(
    listener: tokio::net::TcpListener,
    hub: Arc<SyncHub>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = build_router(hub);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Open storage, build the hub, and serve until Ctrl+C.
pub async fn start_server(config: &ResolvedConfig) -> Result<()> {
    let storage = Storage::open(&config.database.value)?;
    tracing::info!(database = %config.database.value.display(), "storage opened");

    let agent: Arc<dyn ChatAgent> = match &config.agent_url {
        Some(url) => {
            tracing::info!(url = %url.value, "using HTTP agent");
            Arc::new(HttpAgent::new(&url.value, config.agent_timeout.value)?)
        }
        None => {
            tracing::info!("no agent url configured; using echo agent");
            Arc::new(EchoAgent)
        }
    };

    let hub = SyncHub::new(storage.into_shared(), agent, config.hub_settings());

    let host_addr: std::net::IpAddr = config.host.value.parse().map_err(|e| {
        Error::Config(format!("Invalid host address '{}': {}", config.host.value, e))
    })?;
    let addr = SocketAddr::from((host_addr, config.port.value));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, layout = config.layout_enabled.value, "cograph listening");

    serve(listener, hub, shutdown_signal()).await?;
    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "rooms": state.hub.active_rooms().await.len(),
    }))
}

async fn list_graphs(State(state): State<AppState>) -> ApiResult {
    let graphs = state.hub.store().lock().await.list_graphs()?;
    Ok(Json(serde_json::json!({ "graphs": graphs })))
}

/// Request body for creating a graph
#[derive(Deserialize)]
struct CreateGraphRequest {
    title: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    creator: Option<String>,
    #[serde(default)]
    visibility: Visibility,
}

async fn create_graph(
    State(state): State<AppState>,
    Json(request): Json<CreateGraphRequest>,
) -> std::result::Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    if request.title.trim().is_empty() {
        return Err(Error::InvalidInput("title must not be empty".to_string()).into());
    }
    let creator = request.creator.unwrap_or_else(|| "anonymous".to_string());
    let seed = format!("{}:{}:{}", request.title, creator, chrono::Utc::now().to_rfc3339());
    let mut graph = Graph::new(generate_id("g", &seed), request.title, creator);
    graph.description = request.description;
    graph.visibility = request.visibility;

    state.hub.store().lock().await.create_graph(&graph)?;
    tracing::info!(graph_id = %graph.id, "graph created");
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "graph": graph }))))
}

async fn get_graph(State(state): State<AppState>, AxumPath(id): AxumPath<String>) -> ApiResult {
    validate_id(&id)?;
    let snapshot = state.hub.store().lock().await.read_graph(&id)?;
    Ok(Json(serde_json::json!(snapshot)))
}

async fn delete_graph(State(state): State<AppState>, AxumPath(id): AxumPath<String>) -> ApiResult {
    validate_id(&id)?;
    state.hub.store().lock().await.delete_graph(&id)?;
    tracing::info!(graph_id = %id, "graph deleted");
    Ok(Json(serde_json::json!({ "deleted": id })))
}

async fn get_presence(State(state): State<AppState>, AxumPath(id): AxumPath<String>) -> ApiResult {
    validate_id(&id)?;
    let roster = state.hub.presence(&id).await;
    let locks = state.hub.locks(&id).await;
    Ok(Json(serde_json::json!({ "roster": roster, "locks": locks })))
}

async fn request_layout(State(state): State<AppState>, AxumPath(id): AxumPath<String>) -> ApiResult {
    validate_id(&id)?;
    let scheduled = state.hub.request_layout(&id).await.map_err(Error::from)?;
    Ok(Json(serde_json::json!({ "scheduled": scheduled })))
}

/// Body posted by an agent that answered asynchronously
#[derive(Deserialize)]
struct CompleteChatRequest {
    #[serde(default)]
    reply: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

async fn complete_chat(
    State(state): State<AppState>,
    AxumPath((id, message_id)): AxumPath<(String, String)>,
    Json(request): Json<CompleteChatRequest>,
) -> ApiResult {
    let outcome = match (request.reply, request.error) {
        (Some(reply), _) => Ok(reply),
        (None, Some(error)) => Err(error),
        (None, None) => {
            return Err(Error::InvalidInput("either reply or error is required".to_string()).into());
        }
    };
    if !state.hub.complete_chat(&id, &message_id, outcome).await {
        return Err(Error::NotFound(format!(
            "No chat message {} in flight for graph {}",
            message_id, id
        ))
        .into());
    }
    Ok(Json(serde_json::json!({ "completed": message_id })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let status = |e: Error| ApiError(e).into_response().status();
        assert_eq!(status(Error::NotFound("g".to_string())), StatusCode::NOT_FOUND);
        assert_eq!(status(Error::InvalidId("x y".to_string())), StatusCode::BAD_REQUEST);
        assert_eq!(status(Error::InvalidInput("bad".to_string())), StatusCode::BAD_REQUEST);
        assert_eq!(
            status(Error::LockConflict {
                node_id: "n1".to_string(),
                holder: "s".to_string()
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status(Error::Other("boom".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
