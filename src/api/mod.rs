//! Decision sidecar API.
//!
//! Lets services that do not sit behind the middleware ask for a decision
//! over HTTP.

use crate::error::Result;
use crate::metrics::{metrics_handler, MetricsService};
use crate::rate_limit::service::RateLimiter;
use crate::rate_limit::types::{CheckMetadata, Decision, RateLimitKey};
use axum::{
    extract::{FromRef, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Shared state of the API router
#[derive(Clone)]
pub struct AppState {
    pub limiter: Arc<RateLimiter>,
    pub metrics: MetricsService,
}

impl FromRef<AppState> for MetricsService {
    fn from_ref(state: &AppState) -> Self {
        state.metrics.clone()
    }
}

/// Body of `POST /v1/check`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRequest {
    pub key: RateLimitKey,
    pub policy: String,
    #[serde(default)]
    pub metadata: CheckMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthResponse {
    pub status: String,
    /// Active state store ("redis" or "memory")
    pub store: String,
    pub policies: Vec<String>,
    pub audit_pending: usize,
    pub audit_dropped: u64,
}

/// Evaluate one check
pub async fn check_handler(
    State(state): State<AppState>,
    Json(request): Json<CheckRequest>,
) -> Result<Json<Decision>> {
    let decision = state
        .limiter
        .check(&request.key, &request.policy, &request.metadata)
        .await?;
    Ok(Json(decision))
}

pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let limiter = &state.limiter;
    Json(HealthResponse {
        status: "ok".to_string(),
        store: limiter.store().name().to_string(),
        policies: limiter
            .registry()
            .names()
            .into_iter()
            .map(str::to_string)
            .collect(),
        audit_pending: limiter.audit().pending(),
        audit_dropped: limiter.audit().dropped(),
    })
}

/// Build the sidecar router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/check", post(check_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::registry::PolicyRegistry;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn app() -> Router {
        build_router(AppState {
            limiter: Arc::new(RateLimiter::local_only(PolicyRegistry::with_defaults())),
            metrics: MetricsService::detached(),
        })
    }

    fn check_request(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/v1/check")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_check_allowed() {
        let response = app()
            .oneshot(check_request(
                r#"{"key":{"scope":"child","identifier":"42"},"policy":"child_interaction"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let decision: Decision = serde_json::from_slice(&body).unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.limit, 30);
        assert_eq!(decision.remaining, 29);
    }

    #[tokio::test]
    async fn test_check_unknown_policy() {
        let response = app()
            .oneshot(check_request(
                r#"{"key":{"scope":"ip","identifier":"10.0.0.1"},"policy":"nope"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_check_invalid_key() {
        let response = app()
            .oneshot(check_request(
                r#"{"key":{"scope":"user","identifier":""},"policy":"default"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_health_reports_store() {
        let response = app()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let health: HealthResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.status, "ok");
        assert_eq!(health.store, "memory");
        assert_eq!(health.policies.len(), 5);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let response = app()
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/plain; version=0.0.4"
        );
    }
}
