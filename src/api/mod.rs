//! Intake API: job submission and inspection, and the receiving end of
//! the agent message protocol.
//!
//! Every mutation is idempotent on its natural key: re-submitting a body
//! yields a new independent job, re-POSTing an envelope with a known
//! message id changes nothing.

#[cfg(test)]
mod tests;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{collections::HashMap, str::FromStr, sync::Arc};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use validator::Validate;

use crate::{
    auth::{auth_middleware, create_auth_state},
    config::{ApiConfig, Config},
    graph::TaskGraph,
    models::{ActionType, Job, JobStatus, PlanMode, Task},
    orchestrator::Orchestrator,
    planner::Planner,
    protocol::{Envelope, MessageType},
    rate_limit::{rate_limit_middleware, RateLimitState},
    registry::AgentRegistry,
    ConductorError, Result,
};

const SERVICE_NAME: &str = "conductor-core";
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

const ROUTE_JOBS: &str = "/jobs";
const ROUTE_JOB_BY_ID: &str = "/jobs/{job_id}";
const ROUTE_JOB_RETRY: &str = "/jobs/{job_id}/retry";
const ROUTE_MESSAGES: &str = "/messages";
const ROUTE_HEALTH: &str = "/health";

#[derive(Clone)]
pub struct ApiServer {
    config: ApiConfig,
    orchestrator: Orchestrator,
    planner: Arc<Planner>,
    registry: Arc<AgentRegistry>,
    rate_limits: RateLimitState,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn api_error(status: StatusCode, kind: &str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorBody {
            error: kind.to_string(),
            message: message.into(),
            details: None,
        }),
    )
}

/// Map internal errors onto the API status contract without leaking
/// internal detail for server-side faults.
fn map_error(e: ConductorError) -> ApiError {
    let kind = e.kind();
    match kind {
        "validation" => api_error(StatusCode::BAD_REQUEST, kind, e.to_string()),
        "not_found" => api_error(StatusCode::NOT_FOUND, kind, e.to_string()),
        "conflict" => api_error(StatusCode::CONFLICT, kind, e.to_string()),
        "rate_limited" => api_error(StatusCode::TOO_MANY_REQUESTS, kind, e.to_string()),
        "storage" | "queue_full" => {
            warn!("Service unavailable: {}", e);
            api_error(
                StatusCode::SERVICE_UNAVAILABLE,
                kind,
                "Service temporarily unavailable",
            )
        }
        "unauthorized" => api_error(StatusCode::UNAUTHORIZED, kind, "Unauthorized"),
        _ => {
            warn!("Internal error surfaced to API: {}", e);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "internal", "Internal server error")
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct TaskRequest {
    pub action: ActionType,
    #[validate(length(min = 1, max = 500))]
    pub target: String,
    pub text: Option<String>,
    #[serde(default)]
    pub payload: HashMap<String, Value>,
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateJobRequest {
    #[validate(length(min = 1, max = 200))]
    pub intent: String,
    pub description: Option<String>,
    /// Explicit task graph keyed by client-chosen task ids; omitted when
    /// the planner should decompose the intent.
    pub tasks: Option<HashMap<String, TaskRequest>>,
    #[serde(default)]
    pub params: HashMap<String, Value>,
    #[validate(range(max = 10))]
    pub max_retries: Option<u32>,
    pub mode: Option<PlanMode>,
    pub deadline_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct TaskView {
    pub action: ActionType,
    pub target: String,
    pub status: crate::models::TaskStatus,
    pub depends_on: Vec<String>,
    pub attempt_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub id: String,
    pub intent: String,
    pub status: JobStatus,
    pub mode: PlanMode,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub task_count: usize,
    pub tasks: HashMap<String, TaskView>,
    pub result: HashMap<String, Value>,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        let tasks = job
            .tasks
            .iter()
            .map(|(id, task)| {
                (
                    id.clone(),
                    TaskView {
                        action: task.action,
                        target: task.target.clone(),
                        status: task.status,
                        depends_on: task.depends_on.clone(),
                        attempt_count: task.attempt_count,
                        error: task.error.clone(),
                        result: task.result.clone(),
                    },
                )
            })
            .collect();
        Self {
            id: job.id,
            intent: job.intent,
            status: job.status,
            mode: job.mode,
            created_at: job.created_at.to_rfc3339(),
            started_at: job.started_at.map(|t| t.to_rfc3339()),
            completed_at: job.completed_at.map(|t| t.to_rfc3339()),
            error: job.error,
            retry_count: job.retry_count,
            max_retries: job.max_retries,
            task_count: job.tasks.len(),
            tasks,
            result: job.result,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<JobResponse>,
    pub total: usize,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct MessageAck {
    pub status: String,
    pub message_id: String,
}

impl ApiServer {
    pub fn new(
        config: Config,
        orchestrator: Orchestrator,
        planner: Arc<Planner>,
        registry: Arc<AgentRegistry>,
    ) -> Self {
        Self {
            config: config.api,
            orchestrator,
            planner,
            registry,
            rate_limits: RateLimitState::new(),
        }
    }

    pub async fn run(&self) -> Result<()> {
        let app = self.build_router();
        let listener =
            tokio::net::TcpListener::bind(format!("{}:{}", self.config.host, self.config.port))
                .await
                .map_err(|e| ConductorError::Internal(e.into()))?;

        info!(
            "Intake API listening on {}:{}",
            self.config.host, self.config.port
        );

        axum::serve(listener, app)
            .await
            .map_err(|e| ConductorError::Internal(e.into()))?;
        Ok(())
    }

    pub fn build_router(&self) -> Router {
        let auth_state = create_auth_state(self.config.clone());

        let cors_layer = CorsLayer::new()
            .allow_origin(
                self.config
                    .allowed_origins
                    .iter()
                    .filter_map(|origin| origin.parse().ok())
                    .collect::<Vec<_>>(),
            )
            .allow_methods([
                axum::http::Method::GET,
                axum::http::Method::POST,
                axum::http::Method::DELETE,
            ])
            .allow_headers([
                axum::http::header::CONTENT_TYPE,
                axum::http::header::AUTHORIZATION,
                axum::http::HeaderName::from_static("x-api-key"),
            ]);

        Router::new()
            .route(ROUTE_JOBS, post(create_job).get(list_jobs))
            .route(ROUTE_JOB_BY_ID, get(get_job).delete(cancel_job))
            .route(ROUTE_JOB_RETRY, post(retry_job))
            .route(ROUTE_MESSAGES, post(receive_message))
            .route(ROUTE_HEALTH, get(health))
            .layer(
                ServiceBuilder::new()
                    .layer(middleware::from_fn_with_state(
                        self.rate_limits.clone(),
                        rate_limit_middleware,
                    ))
                    .layer(middleware::from_fn_with_state(auth_state, auth_middleware))
                    .layer(TraceLayer::new_for_http())
                    .layer(cors_layer),
            )
            .with_state(self.clone())
    }

    /// Build a task graph from a client-supplied task map, keeping the
    /// client's ids. Tasks are inserted in dependency passes; a pass that
    /// makes no progress means a missing or circular dependency.
    fn graph_from_request(&self, tasks: HashMap<String, TaskRequest>) -> Result<TaskGraph> {
        let defaults = self.orchestrator.config();
        let mut graph = TaskGraph::new();
        let mut remaining: Vec<(String, TaskRequest)> = {
            let mut entries: Vec<_> = tasks.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            entries
        };

        while !remaining.is_empty() {
            let mut progressed = false;
            let mut deferred = Vec::new();
            for (id, request) in remaining {
                let deps_known = request.depends_on.iter().all(|dep| graph.get(dep).is_some());
                if !deps_known {
                    deferred.push((id, request));
                    continue;
                }
                let mut task = Task::new(&id, request.action, request.target)
                    .with_depends_on(request.depends_on)
                    .with_timeout(
                        request
                            .timeout_secs
                            .unwrap_or(defaults.default_timeout_secs),
                    );
                task.text = request.text;
                task.payload = request.payload;
                task.max_attempts = request.max_attempts.unwrap_or(defaults.task_max_attempts);
                graph.add(task)?;
                progressed = true;
            }
            if !progressed && !deferred.is_empty() {
                let ids: Vec<String> = deferred.iter().map(|(id, _)| id.clone()).collect();
                return Err(ConductorError::Validation(format!(
                    "Circular or missing dependency involving tasks: {}",
                    ids.join(", ")
                )));
            }
            remaining = deferred;
        }

        graph.validate()?;
        Ok(graph)
    }
}

async fn create_job(
    State(api): State<ApiServer>,
    Json(request): Json<CreateJobRequest>,
) -> std::result::Result<(StatusCode, Json<JobResponse>), ApiError> {
    request.validate().map_err(|e| {
        api_error(
            StatusCode::BAD_REQUEST,
            "validation",
            format!("Invalid job submission: {e}"),
        )
    })?;

    let defaults = api.orchestrator.config();
    let max_retries = request.max_retries.unwrap_or(defaults.job_max_retries);
    let deadline_secs = request.deadline_secs.or(defaults.job_deadline_secs);

    let (graph, planned_mode) = match request.tasks {
        // An explicitly empty task map is legal; the job completes at once.
        Some(tasks) => {
            let graph = api.graph_from_request(tasks).map_err(map_error)?;
            (graph, PlanMode::Orchestrated)
        }
        None => {
            let plan = api
                .planner
                .plan(&request.intent, request.description.as_deref(), &request.params)
                .await
                .map_err(map_error)?;
            (plan.graph, plan.mode)
        }
    };

    let mode = request.mode.unwrap_or(planned_mode);
    let job = Orchestrator::job_from_plan(
        &request.intent,
        graph,
        mode,
        request.params,
        max_retries,
        deadline_secs,
    );

    let job_id = api.orchestrator.submit_job(job).await.map_err(map_error)?;
    let job = api
        .orchestrator
        .store()
        .get_job(&job_id)
        .await
        .map_err(map_error)?
        .ok_or_else(|| {
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal",
                "Job vanished after submit",
            )
        })?;

    Ok((StatusCode::CREATED, Json(job.into())))
}

async fn list_jobs(
    State(api): State<ApiServer>,
    Query(query): Query<ListQuery>,
) -> std::result::Result<Json<JobListResponse>, ApiError> {
    let status = match &query.status {
        Some(raw) => Some(JobStatus::from_str(raw).map_err(|e| {
            api_error(StatusCode::BAD_REQUEST, "validation", e)
        })?),
        None => None,
    };
    let limit = query.limit.unwrap_or(100).min(1000);
    let offset = query.offset.unwrap_or(0);

    let (jobs, total) = api
        .orchestrator
        .store()
        .list_jobs(status, limit, offset)
        .await
        .map_err(map_error)?;

    Ok(Json(JobListResponse {
        jobs: jobs.into_iter().map(Into::into).collect(),
        total,
    }))
}

async fn get_job(
    State(api): State<ApiServer>,
    Path(job_id): Path<String>,
) -> std::result::Result<Json<JobResponse>, ApiError> {
    let job = api
        .orchestrator
        .store()
        .get_job(&job_id)
        .await
        .map_err(map_error)?
        .ok_or_else(|| {
            api_error(
                StatusCode::NOT_FOUND,
                "not_found",
                format!("Job {job_id} not found"),
            )
        })?;
    Ok(Json(job.into()))
}

async fn cancel_job(
    State(api): State<ApiServer>,
    Path(job_id): Path<String>,
) -> std::result::Result<StatusCode, ApiError> {
    api.orchestrator.cancel_job(&job_id).await.map_err(map_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn retry_job(
    State(api): State<ApiServer>,
    Path(job_id): Path<String>,
) -> std::result::Result<Json<JobResponse>, ApiError> {
    let job = api.orchestrator.retry_job(&job_id).await.map_err(map_error)?;
    Ok(Json(job.into()))
}

/// Receiving end of the agent protocol: replies to outstanding requests
/// and discovery offers.
async fn receive_message(
    State(api): State<ApiServer>,
    Json(raw): Json<Value>,
) -> std::result::Result<(StatusCode, Json<MessageAck>), ApiError> {
    let envelope = Envelope::from_value(raw).map_err(|e| {
        warn!("Rejected malformed envelope: {}", e);
        api_error(StatusCode::UNPROCESSABLE_ENTITY, "validation", e.to_string())
    })?;

    match envelope.message_type {
        MessageType::Offer => {
            api.registry.ingest_offer(&envelope).await.map_err(map_error)?;
        }
        _ => {
            api.orchestrator.handle_reply(&envelope).await.map_err(map_error)?;
        }
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(MessageAck {
            status: "received".to_string(),
            message_id: envelope.id,
        }),
    ))
}

async fn health(
    State(api): State<ApiServer>,
) -> std::result::Result<Json<Value>, (StatusCode, Json<Value>)> {
    let queue_depth = api.orchestrator.queue().len().await;
    let agents = api.registry.count().await;
    let counters = api.orchestrator.telemetry().snapshot();

    match api.orchestrator.store().health().await {
        Ok(()) => Ok(Json(json!({
            "status": "ok",
            "service": SERVICE_NAME,
            "version": SERVICE_VERSION,
            "components": {
                "store": "ok",
                "queue_depth": queue_depth,
                "agents": agents,
            },
            "counters": counters,
        }))),
        Err(e) => {
            warn!("Health check failed: {}", e);
            Err((
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "degraded",
                    "service": SERVICE_NAME,
                    "version": SERVICE_VERSION,
                    "components": {
                        "store": "unavailable",
                        "queue_depth": queue_depth,
                        "agents": agents,
                    }
                })),
            ))
        }
    }
}
