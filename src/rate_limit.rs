use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use serde_json::json;
use std::{num::NonZeroU32, sync::Arc};
use tracing::warn;

/// Overall request budget per minute for the intake surface.
pub const REQUESTS_PER_MINUTE: u32 = 600;
/// Tighter budget for job submissions.
pub const SUBMIT_REQUESTS_PER_MINUTE: u32 = 60;

#[derive(Clone)]
pub struct RateLimitState {
    general: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    submit: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl RateLimitState {
    pub fn new() -> Self {
        Self::with_quotas(REQUESTS_PER_MINUTE, SUBMIT_REQUESTS_PER_MINUTE)
    }

    pub fn with_quotas(general_per_minute: u32, submit_per_minute: u32) -> Self {
        let general = Quota::per_minute(NonZeroU32::new(general_per_minute.max(1)).expect("non-zero"));
        let submit = Quota::per_minute(NonZeroU32::new(submit_per_minute.max(1)).expect("non-zero"));
        Self {
            general: Arc::new(RateLimiter::direct(general)),
            submit: Arc::new(RateLimiter::direct(submit)),
        }
    }
}

impl Default for RateLimitState {
    fn default() -> Self {
        Self::new()
    }
}

fn too_many_requests() -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({"error": "rate_limited", "message": "Too many requests"})),
    )
        .into_response()
}

pub async fn rate_limit_middleware(
    State(state): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Result<Response, Response> {
    if state.general.check().is_err() {
        warn!("General rate limit exceeded for {}", request.uri().path());
        return Err(too_many_requests());
    }

    let is_submit = request.uri().path() == "/jobs" && request.method() == "POST";
    if is_submit && state.submit.check().is_err() {
        warn!("Submission rate limit exceeded");
        return Err(too_many_requests());
    }

    Ok(next.run(request).await)
}
