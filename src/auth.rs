use crate::config::ApiConfig;
use axum::{
    extract::{Request, State},
    http::{HeaderMap, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::warn;

#[derive(Clone)]
pub struct AuthState {
    pub config: ApiConfig,
}

pub fn create_auth_state(config: ApiConfig) -> Arc<AuthState> {
    Arc::new(AuthState { config })
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "unauthorized", "message": "Missing or invalid API key"})),
    )
        .into_response()
}

/// API-key middleware for the intake surface.
///
/// Accepts `x-api-key: <key>` or `Authorization: Bearer <key>`. Key
/// comparison is constant-time. When no key is configured the intake runs
/// open (deployments behind a trusted gateway); `Config::load` already
/// warns about that.
pub async fn auth_middleware(
    State(auth_state): State<Arc<AuthState>>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, Response> {
    let Some(expected_key) = &auth_state.config.api_key else {
        return Ok(next.run(request).await);
    };

    // CORS preflights carry no credentials.
    if request.method() == Method::OPTIONS {
        return Ok(next.run(request).await);
    }

    let path = request.uri().path().to_string();

    let provided = if let Some(value) = headers.get("x-api-key") {
        value.to_str().ok()
    } else if let Some(value) = headers.get("authorization") {
        value.to_str().ok().and_then(|v| v.strip_prefix("Bearer "))
    } else {
        None
    };

    let Some(provided) = provided else {
        warn!("Missing API key in request to {}", path);
        return Err(unauthorized());
    };

    if provided.as_bytes().ct_eq(expected_key.as_bytes()).into() {
        Ok(next.run(request).await)
    } else {
        warn!("Invalid API key in request to {}", path);
        Err(unauthorized())
    }
}
