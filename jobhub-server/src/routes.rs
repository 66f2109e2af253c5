//! The `/jobs` HTTP surface.
//!
//! Callers are authenticated upstream and identified by trusted headers: `x-user-id`, and
//! optionally `x-tenant-id` and `x-role` (`member`, `tenant_admin` or `admin`).
use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        FromRequestParts, Path, Query, State,
    },
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use jobhub::{
    job::{query::Page, Job, JobId, JobStatus},
    producer::{EnqueueError, EnqueueRequest, Producer},
    status::{ListFilter, Requester, Role, StatusApi, StatusError},
    JobHub,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const TENANT_ID_HEADER: &str = "x-tenant-id";
pub const ROLE_HEADER: &str = "x-role";

#[derive(Clone)]
pub struct AppState {
    producer: Producer,
    status: StatusApi,
}

impl AppState {
    pub fn new(hub: &JobHub) -> Self {
        Self {
            producer: hub.producer(),
            status: hub.status(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/jobs", post(enqueue).get(list_jobs))
        .route("/jobs/stats", get(stats))
        .route("/jobs/:id", get(get_job).delete(cancel))
        .route("/jobs/:id/result", get(job_result))
        .with_state(state)
}

/// The requester identified by the trusted identity headers.
pub struct Caller(pub Requester);

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|value| value.to_str().ok())
        };

        let user_id = header(USER_ID_HEADER)
            .and_then(|value| value.parse::<i64>().ok())
            .ok_or_else(|| {
                json_error(
                    StatusCode::UNAUTHORIZED,
                    "unauthenticated",
                    "missing or malformed x-user-id header",
                )
            })?;
        let mut requester = Requester::member(user_id);
        if let Some(tenant_id) = header(TENANT_ID_HEADER) {
            let tenant_id = tenant_id.parse::<i64>().map_err(|_| {
                json_error(
                    StatusCode::BAD_REQUEST,
                    "invalid_header",
                    "x-tenant-id must be an integer",
                )
            })?;
            requester = requester.with_tenant(tenant_id);
        }
        if let Some(role) = header(ROLE_HEADER) {
            requester = requester.with_role(parse_role(role)?);
        }
        Ok(Self(requester))
    }
}

fn parse_role(role: &str) -> Result<Role, Response> {
    match role {
        "member" => Ok(Role::Member),
        "tenant_admin" => Ok(Role::TenantAdmin),
        "admin" => Ok(Role::Admin),
        _ => Err(json_error(
            StatusCode::BAD_REQUEST,
            "invalid_header",
            "x-role must be one of: member, tenant_admin, admin",
        )),
    }
}

#[derive(Debug, Deserialize)]
pub struct EnqueueBody {
    pub task_type: String,
    pub owner_user_id: i64,
    pub owner_tenant_id: Option<i64>,
    #[serde(default)]
    pub input_payload: Value,
}

async fn enqueue(
    State(state): State<AppState>,
    body: Result<Json<EnqueueBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return json_error(rejection.status(), "invalid_body", rejection.body_text())
        }
    };
    let mut owner = jobhub::job::Owner::user(body.owner_user_id);
    owner.tenant_id = body.owner_tenant_id;
    let request = EnqueueRequest {
        task_type: body.task_type,
        owner,
        input: body.input_payload,
    };

    match state.producer.enqueue(request).await {
        Ok(job_id) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "job_id": job_id,
                "status": JobStatus::Queued,
            })),
        )
            .into_response(),
        Err(err) => enqueue_error(err),
    }
}

/// A job record as returned over HTTP.
#[derive(Debug, Serialize)]
pub struct JobView {
    pub job_id: JobId,
    pub task_type: String,
    pub status: JobStatus,
    pub progress: u8,
    pub current_step: Option<String>,
    pub owner_user_id: i64,
    pub owner_tenant_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        // retried jobs keep the previous attempt's error until they finish
        let error = match job.status {
            JobStatus::Failed => job.error_message,
            _ => None,
        };
        Self {
            job_id: job.id,
            task_type: job.task_type,
            status: job.status,
            progress: job.progress,
            current_step: job.current_step,
            owner_user_id: job.owner.user_id,
            owner_tenant_id: job.owner.tenant_id,
            result: job.result,
            error,
            retry_count: job.retry_count,
            max_retries: job.max_retries,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            expires_at: job.expires_at,
        }
    }
}

fn parse_job_id(id: &str) -> Result<JobId, Response> {
    id.parse().map_err(|_| {
        json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("no job with id {id}"),
        )
    })
}

async fn get_job(
    State(state): State<AppState>,
    Caller(requester): Caller,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match state.status.get(id, &requester).await {
        Ok(job) => Json(JobView::from(job)).into_response(),
        Err(err) => status_error(err),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub status: Option<JobStatus>,
    pub task_type: Option<String>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

async fn list_jobs(
    State(state): State<AppState>,
    Caller(requester): Caller,
    params: Result<Query<ListParams>, QueryRejection>,
) -> Response {
    let Query(params) = match params {
        Ok(params) => params,
        Err(rejection) => {
            return json_error(rejection.status(), "invalid_query", rejection.body_text())
        }
    };
    let filter = ListFilter {
        status: params.status,
        task_type: params.task_type,
    };
    let page = Page::new(params.page, params.page_size);

    match state.status.list(&requester, filter, page).await {
        Ok(page) => Json(json!({
            "jobs": page.jobs.into_iter().map(JobView::from).collect::<Vec<_>>(),
            "total": page.total,
            "page": page.page,
            "page_size": page.page_size,
        }))
        .into_response(),
        Err(err) => status_error(err),
    }
}

async fn job_result(
    State(state): State<AppState>,
    Caller(requester): Caller,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match state.status.result(id, &requester).await {
        Ok((_, result)) => Json(result).into_response(),
        Err(err) => status_error(err),
    }
}

async fn stats(State(state): State<AppState>, Caller(requester): Caller) -> Response {
    match state.status.stats(&requester).await {
        Ok(stats) => Json(json!({
            "total": stats.total,
            "queued": stats.queued,
            "processing": stats.processing,
            "completed": stats.completed,
            "failed": stats.failed,
            "jobs_last_24h": stats.recent,
            "avg_processing_time": stats.avg_processing_secs,
        }))
        .into_response(),
        Err(err) => status_error(err),
    }
}

async fn cancel(
    State(state): State<AppState>,
    Caller(requester): Caller,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match state.status.cancel(id, &requester).await {
        Ok(job) => {
            tracing::info!(job_id = %id, user_id = requester.user_id, "Job cancelled");
            Json(JobView::from(job)).into_response()
        }
        Err(err) => status_error(err),
    }
}

pub fn enqueue_error(err: EnqueueError) -> Response {
    match err {
        EnqueueError::UnknownTaskType(task_type) => json_error(
            StatusCode::BAD_REQUEST,
            "unknown_task_type",
            format!("unknown task type: {task_type}"),
        ),
        EnqueueError::InvalidInput(message) => {
            json_error(StatusCode::BAD_REQUEST, "invalid_input", message)
        }
        err @ EnqueueError::EnqueueFailed { .. } => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "enqueue_failed", err.to_string())
        }
        err => {
            tracing::error!(?err, "Failed to enqueue job: {err}");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "failed to enqueue job",
            )
        }
    }
}

pub fn status_error(err: StatusError) -> Response {
    match err {
        StatusError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", err.to_string()),
        StatusError::Forbidden(_) => json_error(StatusCode::FORBIDDEN, "forbidden", err.to_string()),
        StatusError::NotReady(_) => json_error(StatusCode::CONFLICT, "not_ready", err.to_string()),
        StatusError::AlreadyTerminal(_) => {
            json_error(StatusCode::CONFLICT, "already_terminal", err.to_string())
        }
        StatusError::Store(ref store) => {
            tracing::error!(?store, "Failed to read job records: {store}");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "failed to read job records",
            )
        }
    }
}

pub fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
