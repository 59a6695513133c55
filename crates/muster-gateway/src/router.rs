use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use muster_core::{ActionProposal, AgentSpec, MusterError, TaskSpec};
use muster_runtime::{CancelOutcome, Engine};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// A domain error carried out of a handler and mapped to an HTTP status.
#[derive(Debug)]
pub struct ApiError(pub MusterError);

impl From<MusterError> for ApiError {
    fn from(err: MusterError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            MusterError::DuplicateAgent(_)
            | MusterError::DuplicateTask(_)
            | MusterError::OverRelease { .. }
            | MusterError::ProposalConflict { .. } => StatusCode::CONFLICT,
            MusterError::UnknownAgent(_)
            | MusterError::UnknownTask(_)
            | MusterError::UnknownResource(_) => StatusCode::NOT_FOUND,
            MusterError::InvalidAmount { .. }
            | MusterError::CapabilityMismatch(_)
            | MusterError::InvalidTransition { .. }
            | MusterError::Config(_) => StatusCode::BAD_REQUEST,
            MusterError::ResourceTimeout(_) => StatusCode::REQUEST_TIMEOUT,
            MusterError::QueueFull(_) => StatusCode::TOO_MANY_REQUESTS,
            MusterError::DeadlineExceeded(_)
            | MusterError::AgentUnavailable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            MusterError::Json(_) | MusterError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({
            "error": self.0.to_string(),
            "retryable": self.0.is_retryable(),
        }));
        (status, body).into_response()
    }
}

/// Body returned by the creation endpoints.
#[derive(Debug, Serialize)]
pub struct CreatedResponse {
    /// Identifier of the created record.
    pub id: String,
}

/// Body of `POST /tasks/{id}/complete`.
#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    /// Result reported by the executing agent.
    #[serde(default)]
    pub result: serde_json::Value,
}

/// Body of `POST /tasks/{id}/fail`.
#[derive(Debug, Deserialize)]
pub struct FailRequest {
    /// Why the task failed.
    pub reason: String,
}

/// Body of `POST /resources/{id}/request`.
#[derive(Debug, Deserialize)]
pub struct ResourceRequest {
    /// Who the units are held by.
    pub holder: String,
    /// Units requested.
    pub amount: u64,
    /// Grant-ordering priority; higher wins.
    #[serde(default)]
    pub priority: u8,
    /// How long the request may wait for capacity, in milliseconds.
    #[serde(default = "default_resource_wait_ms")]
    pub wait_ms: u64,
}

fn default_resource_wait_ms() -> u64 {
    5_000
}

/// Body of `POST /resources/{id}/release`.
#[derive(Debug, Deserialize)]
pub struct ResourceRelease {
    /// Who is releasing.
    pub holder: String,
    /// Units released.
    pub amount: u64,
}

/// `POST /tasks`
pub async fn submit_task(
    State(engine): State<Arc<Engine>>,
    Json(spec): Json<TaskSpec>,
) -> Result<(StatusCode, Json<CreatedResponse>), ApiError> {
    let id = engine.submit_task(spec).await?;
    info!(task_id = %id, "Task accepted");
    Ok((StatusCode::CREATED, Json(CreatedResponse { id })))
}

/// `GET /tasks/{id}`
pub async fn task_status(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> Result<Json<muster_core::Task>, ApiError> {
    Ok(Json(engine.task_status(&id).await?))
}

/// `DELETE /tasks/{id}`
pub async fn cancel_task(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let outcome = engine.cancel_task(&id).await?;
    let body = match outcome {
        CancelOutcome::Cancelled { .. } => serde_json::json!({"outcome": "cancelled"}),
        CancelOutcome::Advisory { agent_id } => {
            serde_json::json!({"outcome": "advisory", "agent_id": agent_id})
        }
        CancelOutcome::AlreadyTerminal => serde_json::json!({"outcome": "already_terminal"}),
    };
    Ok(Json(body))
}

/// `POST /tasks/{id}/start`
pub async fn start_task(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    engine.report_started(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /tasks/{id}/complete`
pub async fn complete_task(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
    Json(req): Json<CompleteRequest>,
) -> Result<StatusCode, ApiError> {
    engine.report_completed(&id, req.result).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /tasks/{id}/fail`
pub async fn fail_task(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
    Json(req): Json<FailRequest>,
) -> Result<StatusCode, ApiError> {
    engine.report_failed(&id, &req.reason).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /agents`
pub async fn register_agent(
    State(engine): State<Arc<Engine>>,
    Json(spec): Json<AgentSpec>,
) -> Result<(StatusCode, Json<CreatedResponse>), ApiError> {
    let id = engine.register_agent(spec).await?;
    info!(agent_id = %id, "Agent registered");
    Ok((StatusCode::CREATED, Json(CreatedResponse { id })))
}

/// `DELETE /agents/{id}`
pub async fn deregister_agent(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    engine.deregister_agent(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /agents/{id}/heartbeat`
pub async fn heartbeat(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    engine.heartbeat(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /proposals`
pub async fn submit_proposal(
    State(engine): State<Arc<Engine>>,
    Json(proposal): Json<ActionProposal>,
) -> Result<StatusCode, ApiError> {
    engine.submit_proposal(proposal).await?;
    Ok(StatusCode::ACCEPTED)
}

/// `POST /resources/{id}/request`
pub async fn request_resource(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
    Json(req): Json<ResourceRequest>,
) -> Result<StatusCode, ApiError> {
    engine
        .request_resource(
            &req.holder,
            &id,
            req.amount,
            req.priority,
            Duration::from_millis(req.wait_ms),
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /resources/{id}/release`
pub async fn release_resource(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
    Json(req): Json<ResourceRelease>,
) -> Result<StatusCode, ApiError> {
    engine.release_resource(&req.holder, &id, req.amount).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /metrics`
pub async fn metrics(
    State(engine): State<Arc<Engine>>,
) -> Json<Vec<muster_core::MetricSample>> {
    Json(engine.monitor().snapshot().await)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (
                MusterError::DuplicateTask("t".into()),
                StatusCode::CONFLICT,
            ),
            (
                MusterError::UnknownAgent("a".into()),
                StatusCode::NOT_FOUND,
            ),
            (
                MusterError::QueueFull("a".into()),
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                MusterError::ResourceTimeout("gpu".into()),
                StatusCode::REQUEST_TIMEOUT,
            ),
            (
                MusterError::DeadlineExceeded("t".into()),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                MusterError::InvalidTransition {
                    task: "t".into(),
                    from: "completed",
                    to: "running",
                },
                StatusCode::BAD_REQUEST,
            ),
        ];
        for (err, expected) in cases {
            let response = ApiError(err).into_response();
            assert_eq!(response.status(), expected);
        }
    }
}
