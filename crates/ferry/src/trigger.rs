//! HTTP trigger surface.
//!
//! `POST /sync/{table}` runs one invocation of the table's orchestrator and
//! answers with its outcome. `?wait=false` starts the run in the background
//! and answers `202 Accepted` right away, which is how the health monitor
//! triggers fallback syncs. Either way the run is a spawned task: a client
//! that disconnects does not cancel it.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use ferry_core::PipelineContext;

use crate::error::{ErrorKind, PipelineError};
use crate::orchestrator::{OutcomeStatus, SyncOrchestrator, SyncOutcome, SyncRequest};

/// Orchestrators reachable over HTTP, by table key.
#[derive(Clone)]
pub struct TriggerState {
    tables: Arc<IndexMap<String, SyncOrchestrator>>,
    context: Option<PipelineContext>,
}

impl TriggerState {
    pub fn new(tables: impl IntoIterator<Item = SyncOrchestrator>) -> Self {
        Self {
            tables: Arc::new(
                tables
                    .into_iter()
                    .map(|o| (o.key().id().to_string(), o))
                    .collect(),
            ),
            context: None,
        }
    }

    /// Share the process-wide concurrency cap with scheduled runs.
    #[must_use]
    pub fn with_context(mut self, context: PipelineContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    async fn run(&self, orchestrator: &SyncOrchestrator, request: SyncRequest) -> SyncOutcome {
        let _slot = match &self.context {
            Some(context) => context.acquire_slot().await,
            None => None,
        };
        orchestrator.run(request).await
    }

    /// Run on a spawned task, so the run outlives a dropped request.
    fn spawn_run(
        &self,
        orchestrator: SyncOrchestrator,
        request: SyncRequest,
    ) -> tokio::task::JoinHandle<SyncOutcome> {
        let state = self.clone();
        tokio::spawn(async move { state.run(&orchestrator, request).await })
    }
}

#[derive(Debug, Deserialize)]
struct SyncParams {
    #[serde(default = "default_wait")]
    wait: bool,
}

fn default_wait() -> bool {
    true
}

#[derive(Debug, Serialize)]
struct Reply {
    status: &'static str,
    message: String,
}

fn reply(code: StatusCode, status: &'static str, message: String) -> Response {
    (code, Json(Reply { status, message })).into_response()
}

pub fn router(state: TriggerState) -> Router {
    Router::new()
        .route("/sync/{table}", post(sync_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn sync_handler(
    State(state): State<TriggerState>,
    Path(table): Path<String>,
    Query(params): Query<SyncParams>,
    body: Bytes,
) -> Response {
    let Some(orchestrator) = state.tables.get(&table).cloned() else {
        return reply(
            StatusCode::NOT_FOUND,
            "error",
            format!("unknown table '{table}'"),
        );
    };

    let request: SyncRequest = if body.iter().all(u8::is_ascii_whitespace) {
        SyncRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(e) => {
                warn!(target = %table, error = %e, "Rejected malformed sync request");
                return reply(
                    StatusCode::BAD_REQUEST,
                    "error",
                    format!("malformed request: {e}"),
                );
            }
        }
    };

    if !params.wait {
        info!(
            target = %table,
            source = request.source.as_deref().unwrap_or("api"),
            "Sync accepted for background run"
        );
        drop(state.spawn_run(orchestrator, request));
        return reply(StatusCode::ACCEPTED, "accepted", format!("sync of '{table}' started"));
    }

    let outcome = match state.spawn_run(orchestrator, request).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(target = %table, error = %e, "Sync task did not finish");
            return reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                "error",
                format!("sync task failed: {e}"),
            );
        }
    };
    let code = match (outcome.status, outcome.error_kind) {
        (OutcomeStatus::Error, Some(ErrorKind::InvalidRequest)) => StatusCode::BAD_REQUEST,
        (OutcomeStatus::Error, _) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::OK,
    };
    (code, Json(outcome)).into_response()
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    tables: usize,
}

async fn health_handler(State(state): State<TriggerState>) -> Json<Health> {
    Json(Health {
        status: "ok",
        tables: state.table_count(),
    })
}

/// Serve the trigger routes on `address` until `shutdown` is cancelled.
pub async fn serve(
    address: &str,
    state: TriggerState,
    shutdown: CancellationToken,
) -> Result<(), PipelineError> {
    let listener = TcpListener::bind(address)
        .await
        .map_err(|source| PipelineError::TriggerBind {
            address: address.to_string(),
            source,
        })?;
    serve_on(listener, state, shutdown).await
}

/// Serve on an already bound listener.
pub async fn serve_on(
    listener: TcpListener,
    state: TriggerState,
    shutdown: CancellationToken,
) -> Result<(), PipelineError> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, tables = state.table_count(), "Trigger server started");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|source| PipelineError::TriggerServe { source })
}
