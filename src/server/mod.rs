//! HTTP control plane: job submission and inspection, pipeline context and
//! history. Every route requires bearer auth plus workspace membership,
//! checked through the narrow [`MembershipVerifier`] seam (the identity
//! backend itself lives outside this crate).

use async_trait::async_trait;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::OrchestratorError;
use crate::pipeline::PipelineStateMachine;
use crate::queue::{JobFilter, JobQueue, JobStatus, JobType, NewJob};
use crate::scrub::scrub;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    Unauthorized,
    Forbidden,
}

/// Checks a bearer token and workspace membership.
#[async_trait]
pub trait MembershipVerifier: Send + Sync {
    async fn verify(&self, bearer_token: &str, workspace_id: &str) -> Result<(), AuthError>;
}

/// Single-token verifier: every member of the deployment shares the
/// control-plane token. With no token configured, any bearer is accepted
/// (local development).
pub struct StaticTokenVerifier {
    token: Option<String>,
}

impl StaticTokenVerifier {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }
}

#[async_trait]
impl MembershipVerifier for StaticTokenVerifier {
    async fn verify(&self, bearer_token: &str, _workspace_id: &str) -> Result<(), AuthError> {
        match &self.token {
            Some(expected) if bearer_token == expected => Ok(()),
            Some(_) => Err(AuthError::Forbidden),
            None => Ok(()),
        }
    }
}

pub struct ApiContext {
    pub queue: Arc<JobQueue>,
    pub pipeline: Arc<PipelineStateMachine>,
    pub verifier: Arc<dyn MembershipVerifier>,
}

/// API-shaped errors. One mapping for the whole taxonomy.
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: scrub(&message.into()),
        }
    }

    fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "missing or invalid bearer token")
    }

    fn forbidden() -> Self {
        Self::new(StatusCode::FORBIDDEN, "not a member of this workspace")
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        let status = match &e {
            OrchestratorError::Validation(_) => StatusCode::BAD_REQUEST,
            OrchestratorError::Authorization(_) => StatusCode::FORBIDDEN,
            OrchestratorError::Conflict(_) => StatusCode::CONFLICT,
            OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

fn bearer_token(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.to_string())
        .ok_or_else(ApiError::unauthorized)
}

async fn authorize(
    ctx: &ApiContext,
    headers: &HeaderMap,
    workspace_id: &str,
) -> Result<(), ApiError> {
    let token = bearer_token(headers)?;
    ctx.verifier
        .verify(&token, workspace_id)
        .await
        .map_err(|e| match e {
            AuthError::Unauthorized => ApiError::unauthorized(),
            AuthError::Forbidden => ApiError::forbidden(),
        })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateJobRequest {
    job_type: String,
    #[serde(default)]
    data: serde_json::Value,
    #[serde(default)]
    priority: Option<i64>,
    #[serde(default)]
    project_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreatedJobResponse {
    id: String,
    status: JobStatus,
    job_type: JobType,
    created_at: chrono::DateTime<chrono::Utc>,
}

async fn create_job(
    State(ctx): State<Arc<ApiContext>>,
    Path(workspace_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<CreateJobRequest>,
) -> Result<Response, ApiError> {
    authorize(&ctx, &headers, &workspace_id).await?;

    let job_type: JobType = request
        .job_type
        .parse()
        .map_err(|e: String| ApiError::new(StatusCode::BAD_REQUEST, e))?;
    let priority = match request.priority {
        None => None,
        Some(p) if (1..=100).contains(&p) => Some(p as u8),
        Some(p) => {
            return Err(ApiError::new(
                StatusCode::BAD_REQUEST,
                format!("priority {p} outside [1, 100]"),
            ))
        }
    };
    let project_id = request
        .project_id
        .clone()
        .or_else(|| {
            request
                .data
                .get("projectId")
                .and_then(|p| p.as_str())
                .map(|p| p.to_string())
        })
        .ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "projectId is required"))?;

    let job = ctx
        .queue
        .enqueue(NewJob {
            workspace_id: workspace_id.clone(),
            project_id,
            job_type,
            payload: request.data,
            priority,
            max_attempts: None,
        })
        .await?;

    info!(job_id = %job.id, workspace_id = %workspace_id, "Job created via control plane");
    let body = CreatedJobResponse {
        id: job.id,
        status: job.status,
        job_type: job.job_type,
        created_at: job.created_at,
    };
    Ok((StatusCode::CREATED, Json(body)).into_response())
}

async fn get_job(
    State(ctx): State<Arc<ApiContext>>,
    Path((workspace_id, job_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    authorize(&ctx, &headers, &workspace_id).await?;
    let job = ctx
        .queue
        .get_job(&job_id, &workspace_id)
        .await?
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("job {job_id}")))?;
    Ok(Json(job).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListJobsParams {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    job_type: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    offset: Option<i64>,
}

async fn list_jobs(
    State(ctx): State<Arc<ApiContext>>,
    Path(workspace_id): Path<String>,
    Query(params): Query<ListJobsParams>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    authorize(&ctx, &headers, &workspace_id).await?;

    let status = match &params.status {
        None => None,
        Some(raw) => Some(
            serde_json::from_value::<JobStatus>(serde_json::Value::String(raw.clone()))
                .map_err(|_| {
                    ApiError::new(StatusCode::BAD_REQUEST, format!("unknown status '{raw}'"))
                })?,
        ),
    };
    let job_type = match &params.job_type {
        None => None,
        Some(raw) => Some(raw.parse::<JobType>().map_err(|e: String| {
            ApiError::new(StatusCode::BAD_REQUEST, e)
        })?),
    };
    let limit = params.limit.unwrap_or(20);
    if !(1..=100).contains(&limit) {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            format!("limit {limit} outside [1, 100]"),
        ));
    }
    let offset = params.offset.unwrap_or(0);
    if offset < 0 {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "offset must be >= 0"));
    }

    let (jobs, total) = ctx
        .queue
        .list_jobs(&JobFilter {
            workspace_id: Some(workspace_id),
            status,
            job_type,
            limit: limit as usize,
            offset: offset as usize,
        })
        .await?;
    Ok(Json(serde_json::json!({
        "jobs": jobs,
        "total": total,
        "limit": limit,
        "offset": offset,
    }))
    .into_response())
}

async fn cancel_job(
    State(ctx): State<Arc<ApiContext>>,
    Path((workspace_id, job_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    authorize(&ctx, &headers, &workspace_id).await?;
    let job = ctx.queue.cancel_job(&job_id, &workspace_id).await?;
    Ok(Json(job).into_response())
}

async fn queue_stats(
    State(ctx): State<Arc<ApiContext>>,
    Path(workspace_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    authorize(&ctx, &headers, &workspace_id).await?;
    let stats = ctx.queue.get_stats().await?;
    Ok(Json(stats).into_response())
}

async fn pipeline_context(
    State(ctx): State<Arc<ApiContext>>,
    Path((workspace_id, project_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    authorize(&ctx, &headers, &workspace_id).await?;
    let context = ctx
        .pipeline
        .get(&project_id)
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .filter(|c| c.workspace_id == workspace_id)
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::NOT_FOUND,
                format!("no pipeline context for project {project_id}"),
            )
        })?;
    Ok(Json(context).into_response())
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    offset: Option<i64>,
}

async fn pipeline_history(
    State(ctx): State<Arc<ApiContext>>,
    Path((workspace_id, project_id)): Path<(String, String)>,
    Query(params): Query<HistoryParams>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    authorize(&ctx, &headers, &workspace_id).await?;
    let limit = params.limit.unwrap_or(20).clamp(1, 100) as usize;
    let offset = params.offset.unwrap_or(0).max(0) as usize;
    let history = ctx
        .pipeline
        .history(&project_id, limit, offset)
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(history).into_response())
}

/// Build the control-plane router.
pub fn router(ctx: Arc<ApiContext>) -> Router {
    Router::new()
        .route(
            "/workspaces/{workspace_id}/agent-queue/jobs",
            post(create_job).get(list_jobs),
        )
        .route(
            "/workspaces/{workspace_id}/agent-queue/jobs/{job_id}",
            get(get_job).delete(cancel_job),
        )
        .route(
            "/workspaces/{workspace_id}/agent-queue/stats",
            get(queue_stats),
        )
        .route(
            "/workspaces/{workspace_id}/orchestrator/{project_id}",
            get(pipeline_context),
        )
        .route(
            "/workspaces/{workspace_id}/orchestrator/{project_id}/history",
            get(pipeline_history),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

/// Serve the control plane until the shutdown signal resolves.
pub async fn serve(
    ctx: Arc<ApiContext>,
    addr: &str,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "Control plane listening");
    axum::serve(listener, router(ctx))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
