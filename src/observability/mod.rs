use axum::{
    body::Body,
    extract::Request,
    http::HeaderValue,
    middleware::Next,
    response::Response,
};
use tracing::{info, Span};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use crate::error::{LimiterError, Result};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

const DEFAULT_FILTER: &str = "safelimit=debug,tower_http=debug";

/// Initialize tracing, compact or JSON formatted.
///
/// `RUST_LOG` overrides the default filter.
pub fn init_tracing(json: bool) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into());

    let registry = tracing_subscriber::registry().with(env_filter);

    let result = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false).compact())
            .try_init()
    };

    result.map_err(|e| LimiterError::Internal(format!("Failed to initialize tracing: {}", e)))?;

    info!(json, "Tracing initialized");
    Ok(())
}

/// Middleware to add request ID to requests
pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    Span::current().record("request_id", &request_id);

    // Downstream handlers and the rate limiter read it from extensions
    req.extensions_mut().insert(RequestId(request_id.clone()));

    let mut response = next.run(req).await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    response
}

/// Request ID extension type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(pub String);

/// Extract request ID from request extensions
pub fn get_request_id(req: &Request<Body>) -> Option<String> {
    req.extensions().get::<RequestId>().map(|id| id.0.clone())
}
