//! HTTP and WebSocket front of the server
//!
//! Owns the pending-session table, the durable store and the signal source.
//! Save, discard, metadata, list and load run as independent requests next
//! to any number of streaming connections.

use crate::config::{OrphanPolicy, ServerConfig};
use crate::session_table::{PendingInfo, SessionTable};
use crate::store::SessionStore;
use crate::streaming::{StreamContext, StreamingSession};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use emg_core::{EmgError, EmgResult, SessionId, SessionMetadata, SessionSummary, SignalMatrix};
use emg_processing::{FilterPipeline, FilterStats, SafeFilter};
use emg_source::SignalSource;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Shared server state, cheap to clone into handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub table: Arc<SessionTable>,
    pub store: Arc<SessionStore>,
    pub source: Arc<dyn SignalSource>,
    pub filter: Arc<SafeFilter<FilterPipeline>>,
    pub cancel: CancellationToken,
}

impl AppState {
    pub fn new(config: ServerConfig, source: Arc<dyn SignalSource>) -> EmgResult<Self> {
        let store = SessionStore::open(&config.data_dir)?;
        let filter = SafeFilter::new(FilterPipeline::new(config.filter.clone()));
        Ok(Self {
            config: Arc::new(config),
            table: Arc::new(SessionTable::new()),
            store: Arc::new(store),
            source,
            filter: Arc::new(filter),
            cancel: CancellationToken::new(),
        })
    }

    fn stream_context(&self) -> StreamContext {
        StreamContext {
            table: self.table.clone(),
            source: self.source.clone(),
            filter: self.filter.clone(),
            chunk_size: self.config.chunk_size,
            interval: self.config.send_interval(),
        }
    }

    /// Move a pending session to the store.
    ///
    /// `NotFound` if the id is unknown or another save is in progress. On a
    /// storage failure the session stays pending with its data intact.
    pub async fn save_session(&self, id: &SessionId) -> EmgResult<()> {
        let taken = Arc::new(self.table.begin_finalize(id)?);

        let store = self.store.clone();
        let write_id = id.clone();
        let write = taken.clone();
        let result = tokio::task::spawn_blocking(move || {
            store.save_session(&write_id, &write.raw, &write.env, write.metadata.as_ref())
        })
        .await
        .unwrap_or_else(|e| Err(EmgError::storage(format!("save task failed: {}", e))));

        match result {
            Ok(()) => {
                if let Some(late) = self.table.complete_finalize(id) {
                    self.write_late_metadata(id, late).await;
                }
                info!(session_id = %id, rows = taken.raw.rows(), "Session saved");
                Ok(())
            }
            Err(e) => {
                error!(session_id = %id, error = %e, "Saving session failed, keeping it pending");
                self.table.abort_finalize(id, Arc::unwrap_or_clone(taken));
                Err(e)
            }
        }
    }

    /// Metadata posted while the arrays were being written
    async fn write_late_metadata(&self, id: &SessionId, metadata: SessionMetadata) {
        let store = self.store.clone();
        let write_id = id.clone();
        let result = tokio::task::spawn_blocking(move || store.save_metadata(&write_id, &metadata))
            .await
            .unwrap_or_else(|e| Err(EmgError::storage(format!("metadata task failed: {}", e))));

        if let Err(e) = result {
            warn!(session_id = %id, error = %e, "Session saved but its latest metadata was not");
        }
    }

    /// Drop a pending session; true if something was removed
    pub fn discard_session(&self, id: &SessionId) -> bool {
        let removed = self.table.discard(id);
        if removed {
            info!(session_id = %id, "Session discarded");
        }
        removed
    }

    /// Dispose of abandoned sessions idle past the grace period
    pub async fn sweep_orphans(&self) -> usize {
        let mut collected = 0;
        for id in self.table.orphans(self.config.orphan_grace()) {
            match self.config.orphan_policy {
                OrphanPolicy::Discard => {
                    if self.discard_session(&id) {
                        collected += 1;
                    }
                }
                OrphanPolicy::Save => match self.save_session(&id).await {
                    Ok(()) => collected += 1,
                    Err(EmgError::NotFound { .. }) => {}
                    Err(e) => warn!(session_id = %id, error = %e, "Could not auto-save orphaned session"),
                },
            }
        }

        if collected > 0 {
            info!(collected, policy = ?self.config.orphan_policy, "Swept orphaned sessions");
        }
        collected
    }

    /// Periodic orphan sweep until shutdown
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let state = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(state.config.sweep_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = state.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        state.sweep_orphans().await;
                    }
                }
            }
            debug!("Orphan sweeper stopped");
        })
    }

    /// End every stream and hand the source back
    pub fn shutdown(&self) {
        self.cancel.cancel();

        if let Err(e) = self.source.stop() {
            warn!(error = %e, "Stopping the signal source failed");
        }
        if let Err(e) = self.source.release() {
            warn!(error = %e, "Releasing the signal source failed");
        }

        let pending = self.table.len();
        if pending > 0 {
            warn!(pending, "Shutting down with unsaved sessions, they are lost");
        }
        info!("Server shut down");
    }
}

/// Error body `{ok: false, error}` with a status matching the failure
#[derive(Debug)]
pub struct ApiError(EmgError);

impl From<EmgError> for ApiError {
    fn from(err: EmgError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EmgError::NotFound { .. } => StatusCode::NOT_FOUND,
            EmgError::InvalidSessionId { .. }
            | EmgError::ShapeMismatch { .. }
            | EmgError::InvalidConfig { .. } => StatusCode::BAD_REQUEST,
            EmgError::SourceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "ok": false, "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Serialize)]
pub struct OkResponse {
    pub ok: bool,
}

const OK: OkResponse = OkResponse { ok: true };

#[derive(Debug, Deserialize)]
pub struct SessionRequest {
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
pub struct MetadataRequest {
    pub session_id: String,
    pub label: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LoadParams {
    pub decimation: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct SessionList {
    pub sessions: Vec<SessionSummary>,
}

#[derive(Debug, Serialize)]
pub struct PendingList {
    pub sessions: Vec<PendingInfo>,
}

#[derive(Debug, Serialize)]
pub struct LoadedSession {
    pub session_id: SessionId,
    pub raw: SignalMatrix,
    pub env: SignalMatrix,
}

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub pending_sessions: usize,
    pub sample_rate: f64,
    pub channels: usize,
    pub filter: FilterStats,
}

pub fn router(state: AppState) -> Router {
    let mut app = Router::new()
        .route("/ws", get(stream_handler))
        .route("/health", get(health))
        .route("/api/save", post(save))
        .route("/api/discard", post(discard))
        .route("/api/metadata", post(metadata))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/{session_id}", get(load_session))
        .route("/api/pending", get(list_pending));

    if let Some(dir) = &state.config.static_dir {
        app = app.fallback_service(ServeDir::new(dir));
    }

    app.layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    )
    .layer(TraceLayer::new_for_http())
    .with_state(state)
}

async fn stream_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let store = state.store.clone();
    let session = StreamingSession::open(state.stream_context(), |id| store.exists(id));
    let (mut sender, mut receiver) = socket.split();

    // Inbound frames carry nothing; only watch for the client going away
    let (closed_tx, closed_rx) = tokio::sync::oneshot::channel::<()>();
    let watcher = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
        let _ = closed_tx.send(());
    });

    let closed = async {
        let _ = closed_rx.await;
    };
    session.run(&mut sender, closed, state.cancel.child_token()).await;
    watcher.abort();
}

async fn health(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        status: "ok",
        pending_sessions: state.table.len(),
        sample_rate: state.source.sample_rate(),
        channels: state.source.channel_count(),
        filter: state.filter.stats(),
    })
}

async fn save(State(state): State<AppState>, Json(req): Json<SessionRequest>) -> ApiResult<OkResponse> {
    let id = SessionId::parse(&req.session_id)?;
    state.save_session(&id).await?;
    Ok(Json(OK))
}

async fn discard(State(state): State<AppState>, Json(req): Json<SessionRequest>) -> Json<OkResponse> {
    // ids that fail validation can never have been issued, so there is nothing to drop
    if let Ok(id) = SessionId::parse(&req.session_id) {
        state.discard_session(&id);
    }
    Json(OK)
}

async fn metadata(
    State(state): State<AppState>,
    Json(req): Json<MetadataRequest>,
) -> ApiResult<OkResponse> {
    let id = SessionId::parse(&req.session_id)?;

    if state
        .table
        .update_metadata(&id, req.label.clone(), req.notes.clone())
    {
        debug!(session_id = %id, "Metadata held for unsaved session");
        return Ok(Json(OK));
    }

    let store = state.store.clone();
    tokio::task::spawn_blocking(move || store.update_metadata(&id, req.label, req.notes))
        .await
        .map_err(|e| EmgError::storage(format!("metadata task failed: {}", e)))??;
    Ok(Json(OK))
}

async fn list_sessions(State(state): State<AppState>) -> ApiResult<SessionList> {
    let store = state.store.clone();
    let sessions = tokio::task::spawn_blocking(move || store.list())
        .await
        .map_err(|e| EmgError::storage(format!("list task failed: {}", e)))??;
    Ok(Json(SessionList { sessions }))
}

async fn load_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(params): Query<LoadParams>,
) -> ApiResult<LoadedSession> {
    let id = SessionId::parse(&session_id)?;
    let decimation = params.decimation.unwrap_or(1);

    let store = state.store.clone();
    let load_id = id.clone();
    let stored = tokio::task::spawn_blocking(move || store.load(&load_id, decimation))
        .await
        .map_err(|e| EmgError::storage(format!("load task failed: {}", e)))??;

    Ok(Json(LoadedSession {
        session_id: id,
        raw: stored.raw,
        env: stored.env,
    }))
}

async fn list_pending(State(state): State<AppState>) -> Json<PendingList> {
    Json(PendingList {
        sessions: state.table.pending(),
    })
}
