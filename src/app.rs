use std::{future::Future, sync::Arc};

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tower_http::cors::CorsLayer;

use crate::client::{ChannelConfig, ReconnectingChannel};
use crate::config::Config;
use crate::dashboard::{Dashboard, HttpSessionSource, ViewFilter};
use crate::error::StoreError;
use crate::frame::{now_iso, Frame, FrameKind};
use crate::hub::Hub;
use crate::store::{MemorySessionStore, PgSessionStore, SessionStore};
use crate::types::{AppState, AppendMessageBody, SessionListQuery, UpsertSessionBody};

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let status = match err {
            StoreError::Invalid(_) => StatusCode::BAD_REQUEST,
            StoreError::Database(_) | StoreError::Migration(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, error = %self.message, "request failed");
        }
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/session", get(list_sessions).post(upsert_session))
        .route(
            "/api/session/{session_id}/messages",
            get(list_messages).post(append_session_message),
        )
        .route("/api/message", post(append_message))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": now_iso() }))
}

async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.unwrap_or(state.history_limit);
    let sessions = state.store.list_sessions_with_recent_messages(limit).await?;
    Ok(Json(sessions))
}

async fn upsert_session(
    State(state): State<Arc<AppState>>,
    Json(body): Json<UpsertSessionBody>,
) -> Result<Response, ApiError> {
    let Some(upsert) = body.into_upsert() else {
        return Err(ApiError::bad_request("Missing id"));
    };
    state.store.upsert_session(&upsert).await?;

    let stored = state.store.get_session(&upsert.id).await?;
    let session_id = upsert.id;
    tracing::info!(session_id = %session_id, "session upserted");
    Ok(match stored {
        Some(session) => Json(session).into_response(),
        None => Json(json!({ "id": session_id })).into_response(),
    })
}

async fn list_messages(
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let messages = state.store.list_messages_by_session(&session_id).await?;
    Ok(Json(messages))
}

async fn append_message(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AppendMessageBody>,
) -> Result<Response, ApiError> {
    store_and_publish(&state, body, None).await
}

async fn append_session_message(
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<AppendMessageBody>,
) -> Result<Response, ApiError> {
    store_and_publish(&state, body, Some(session_id)).await
}

/// Persist first, then tell every dashboard. A message that fails to store is
/// never broadcast.
async fn store_and_publish(
    state: &Arc<AppState>,
    body: AppendMessageBody,
    path_session_id: Option<String>,
) -> Result<Response, ApiError> {
    let Some(message) = body.into_new_message(path_session_id) else {
        return Err(ApiError::bad_request("Missing sessionId"));
    };
    let stored = state.store.append_message(&message).await?;

    let data = serde_json::to_value(&stored).unwrap_or_default();
    let delivered = state
        .hub
        .broadcast(Frame::with_data(FrameKind::Message, data))
        .await;
    tracing::info!(
        session_id = %stored.session_id,
        message_id = %stored.id,
        delivered,
        "message appended"
    );
    Ok((StatusCode::CREATED, Json(stored)).into_response())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let hub = Arc::clone(&state.hub);
    ws.on_upgrade(move |socket| hub.serve_socket(socket))
}

/// Serve until `shutdown` resolves, then drop every hub channel.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let hub = Arc::clone(&state.hub);
    let heartbeat = hub.spawn_heartbeat();

    let result = axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move {
            shutdown.await;
            hub.close_all().await;
        })
        .await;

    heartbeat.abort();
    result
}

/// `serve` subcommand: hub and HTTP API on `config.port`.
pub async fn run(config: &Config, in_memory: bool) -> anyhow::Result<()> {
    let store: Arc<dyn SessionStore> = if in_memory {
        tracing::warn!("using the in-memory store; nothing survives a restart");
        Arc::new(MemorySessionStore::new())
    } else {
        let store = PgSessionStore::connect(&config.database_url, config.max_connections).await?;
        store.migrate().await?;
        tracing::info!("database ready");
        Arc::new(store)
    };

    let state = Arc::new(AppState {
        store,
        hub: Arc::new(Hub::new(config.heartbeat_interval)),
        history_limit: config.history_limit,
    });

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "chat relay listening");

    serve(listener, state, shutdown_signal()).await?;
    tracing::info!("chat relay stopped");
    Ok(())
}

/// `watch` subcommand: a headless dashboard that logs every reconcile.
pub async fn watch_sessions(config: &Config, filter: ViewFilter) -> anyhow::Result<()> {
    let dashboard = Arc::new(
        Dashboard::new(Arc::new(HttpSessionSource::new(&config.api_url))).with_filter(filter),
    );

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let channel = ReconnectingChannel::new(ChannelConfig::new(config.hub_url.as_str()), move |frame| {
        let _ = events_tx.send(frame);
    });
    channel.connect();

    let (stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(Arc::clone(&dashboard).run(events_rx, config.poll_interval, stop_rx));
    tracing::info!(hub = %config.hub_url, api = %config.api_url, "watching sessions");

    shutdown_signal().await;
    channel.close();
    stop_tx.send_replace(true);
    task.await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "failed to install Ctrl-C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => tracing::warn!(error = %err, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
