//! HTTP gateway.
//!
//! `POST /execute` turns a request into a queue submission and waits for the
//! job's result; `GET /health` reports liveness.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::backend::ContainerRuntime;
use crate::deadline::cancel_pair;
use crate::error::SubmitError;
use crate::queue::{JobQueue, JobResult};
use crate::runner::{ExecutionResult, SUPPORTED_LANGUAGE};

/// Body of `POST /execute`.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteRequest {
    pub code: String,
    #[serde(default = "default_language")]
    pub language: String,
}

fn default_language() -> String {
    SUPPORTED_LANGUAGE.to_string()
}

/// Response status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecuteStatus {
    Success,
    Error,
}

/// Body returned by `POST /execute`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub output: ExecutionResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub status: ExecuteStatus,
}

impl From<JobResult> for ExecuteResponse {
    fn from(job: JobResult) -> Self {
        let error = match (&job.error, job.result.exit_code) {
            (Some(err), _) => Some(err.to_string()),
            (None, 0) => None,
            (None, code) => Some(format!("Execution failed with exit code {code}")),
        };
        Self {
            status: if error.is_some() {
                ExecuteStatus::Error
            } else {
                ExecuteStatus::Success
            },
            output: job.result,
            error,
        }
    }
}

/// Body returned by `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub message: String,
}

/// Plain error body for requests that never reached the queue.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

/// Build the router over a started queue.
pub fn router<R: ContainerRuntime>(queue: Arc<JobQueue<R>>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/execute", post(execute::<R>))
        .with_state(queue)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        message: "Sandbox executor is healthy".to_string(),
    })
}

async fn execute<R: ContainerRuntime>(
    State(queue): State<Arc<JobQueue<R>>>,
    payload: Result<Json<ExecuteRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(request) => request,
        Err(rejection) => {
            debug!(error = %rejection, "Rejecting malformed request");
            return error_response(StatusCode::BAD_REQUEST, "Invalid request");
        }
    };

    // Dropped with this handler when the client disconnects, cancelling the job.
    let (_cancel, signal) = cancel_pair();

    let receiver = match queue.submit(signal, request.code, request.language) {
        Ok(receiver) => receiver,
        Err(err @ SubmitError::QueueFull { .. }) => {
            info!(error = %err, "Admission rejected");
            return error_response(StatusCode::SERVICE_UNAVAILABLE, err.to_string());
        }
        Err(err @ SubmitError::Closed) => {
            error!(error = %err, "Submission failed");
            return error_response(StatusCode::SERVICE_UNAVAILABLE, err.to_string());
        }
    };

    match receiver.await {
        Ok(job) => Json(ExecuteResponse::from(job)).into_response(),
        Err(_) => {
            error!("Worker dropped the result channel");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Execution result lost")
        }
    }
}
