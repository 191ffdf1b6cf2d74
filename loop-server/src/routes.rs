//! HTTP route handlers for the run API.

use std::path::PathBuf;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use contract_loop::core::report::RunResult;
use contract_loop::core::state::RunRequest;
use contract_loop::error::LoopError;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::state::{AppState, RunRecord};

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/runs", get(list_runs).post(create_run))
        .route("/runs/wait", post(run_and_wait))
        .route("/runs/{trace_id}", get(get_run))
}

/// Body of `POST /api/runs` and `POST /api/runs/wait`.
#[derive(Debug, Deserialize)]
pub struct RunBody {
    pub contract: PathBuf,
    pub task: String,
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl RunBody {
    fn into_request(self, max_attempts_default: u32) -> RunRequest {
        let request = RunRequest::new(
            self.contract,
            self.task,
            self.max_attempts.unwrap_or(max_attempts_default),
        );
        match self.input {
            Some(input) => request.with_input(input),
            None => request,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Accepted {
    pub trace_id: String,
    pub work_dir: PathBuf,
}

/// JSON error body `{error}` with a status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        let status = match err.downcast_ref::<LoopError>() {
            Some(LoopError::InvalidRequest(_)) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: format!("{err:#}"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({"error": self.message}))).into_response()
    }
}

async fn health() -> &'static str {
    "ok"
}

/// POST /api/runs - start a run in the background.
async fn create_run(
    State(state): State<AppState>,
    Json(body): Json<RunBody>,
) -> Result<(StatusCode, Json<Accepted>), ApiError> {
    let scheduler = &state.scheduler;
    let request = body.into_request(scheduler.max_attempts_default());
    let (record, _handle) = scheduler.submit(request).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(Accepted {
            trace_id: record.trace_id,
            work_dir: record.work_dir,
        }),
    ))
}

/// POST /api/runs/wait - run synchronously and return the terminal result.
async fn run_and_wait(
    State(state): State<AppState>,
    Json(body): Json<RunBody>,
) -> Result<Json<RunResult>, ApiError> {
    let scheduler = &state.scheduler;
    let request = body.into_request(scheduler.max_attempts_default());
    let result = scheduler.run_to_completion(request).await?;
    Ok(Json(result))
}

/// GET /api/runs - all runs known to this server.
async fn list_runs(State(state): State<AppState>) -> Json<Vec<RunRecord>> {
    Json(state.scheduler.registry().list().await)
}

/// GET /api/runs/{trace_id}
async fn get_run(
    State(state): State<AppState>,
    Path(trace_id): Path<String>,
) -> Result<Json<RunRecord>, StatusCode> {
    state
        .scheduler
        .registry()
        .get(&trace_id)
        .await
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}
