use super::service::RateLimiter;
use super::types::{CheckMetadata, Decision, KeyScope, RateLimitKey};
use crate::observability::RequestId;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

pub const LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RESET_HEADER: &str = "x-ratelimit-reset";
pub const RETRY_AFTER_HEADER: &str = "retry-after";
pub const CHILD_SAFETY_HEADER: &str = "x-child-safety";
pub const CHILD_SAFETY_VALUE: &str = "rate-limit-enforced";
pub const API_KEY_HEADER: &str = "x-api-key";
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Message shown to end users on every denial
pub const GENERIC_LIMIT_MESSAGE: &str = "Too many requests, please try again later";

/// Maps a path prefix to the policy and key scope applied to it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteRule {
    /// Path prefix (e.g. "/api/children")
    pub prefix: String,
    /// Policy name
    pub policy: String,
    /// What the key is derived from
    #[serde(default = "default_scope")]
    pub scope: KeyScope,
}

fn default_scope() -> KeyScope {
    KeyScope::Ip
}

impl RouteRule {
    pub fn new(prefix: impl Into<String>, policy: impl Into<String>, scope: KeyScope) -> Self {
        Self {
            prefix: prefix.into(),
            policy: policy.into(),
            scope,
        }
    }
}

/// Identity resolved by the authentication layer, read from request extensions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestIdentity {
    pub user_id: Option<String>,
    pub child_id: Option<String>,
}

/// Rate limiting middleware state
#[derive(Clone)]
pub struct RateLimitMiddleware {
    /// The rate limiter
    limiter: Arc<RateLimiter>,
    /// Route rules, longest prefix first
    rules: Arc<Vec<RouteRule>>,
}

impl RateLimitMiddleware {
    /// Create a new rate limiting middleware
    pub fn new(limiter: Arc<RateLimiter>, mut rules: Vec<RouteRule>) -> Self {
        rules.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Self {
            limiter,
            rules: Arc::new(rules),
        }
    }

    /// Rule with the longest prefix matching `path`
    pub fn match_rule(&self, path: &str) -> Option<&RouteRule> {
        self.rules.iter().find(|rule| path.starts_with(&rule.prefix))
    }

    /// Resolve the rule, key and audit metadata for a request.
    ///
    /// Returns `None` when no rule matches the path.
    pub fn prepare(&self, request: &Request) -> Option<PreparedCheck> {
        let path = request.uri().path();
        let rule = self.match_rule(path)?;

        let client_ip = client_ip(request);
        let identity = request
            .extensions()
            .get::<RequestIdentity>()
            .cloned()
            .unwrap_or_default();
        let api_key = request
            .headers()
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok());

        let key = create_rate_limit_key(rule, &client_ip, &identity, api_key);

        let mut metadata = CheckMetadata {
            user_id: identity.user_id,
            child_id: identity.child_id,
            ip_address: Some(client_ip),
            request_id: request.extensions().get::<RequestId>().map(|id| id.0.clone()),
            ..Default::default()
        };
        metadata.extra.insert("path".to_string(), path.to_string());

        Some(PreparedCheck {
            policy: rule.policy.clone(),
            key,
            metadata,
        })
    }

    /// Run a prepared check, turning denials and errors into responses
    pub async fn apply(&self, check: &PreparedCheck) -> Result<Decision, Response> {
        let decision = match self
            .limiter
            .check(&check.key, &check.policy, &check.metadata)
            .await
        {
            Ok(decision) => decision,
            Err(e) => {
                warn!(policy = %check.policy, error = %e, "Rate limit check failed");
                return Err(e.into_response());
            }
        };

        if !decision.allowed {
            warn!(
                policy = %check.policy,
                scope = check.key.scope.as_str(),
                child_safety = decision.child_safety_triggered,
                "Rate limit exceeded"
            );
            return Err(create_rate_limit_response(&decision));
        }

        debug!(
            policy = %check.policy,
            remaining = decision.remaining,
            "Rate limit check passed"
        );
        Ok(decision)
    }
}

/// Everything needed to check one request, detached from the request body
#[derive(Debug, Clone)]
pub struct PreparedCheck {
    pub policy: String,
    pub key: RateLimitKey,
    pub metadata: CheckMetadata,
}

/// Build the key for `rule`, falling back to the client IP when the
/// identity it needs is missing
fn create_rate_limit_key(
    rule: &RouteRule,
    client_ip: &str,
    identity: &RequestIdentity,
    api_key: Option<&str>,
) -> RateLimitKey {
    let scoped = match rule.scope {
        KeyScope::Child => identity.child_id.as_deref(),
        KeyScope::User => identity.user_id.as_deref(),
        KeyScope::ApiKey => api_key,
        KeyScope::Route => Some(rule.prefix.as_str()),
        KeyScope::Ip => None,
    };

    match scoped {
        Some(id) => RateLimitKey::new(rule.scope, id),
        None => RateLimitKey::ip(client_ip),
    }
}

fn client_ip(request: &Request) -> String {
    if let Some(ConnectInfo(addr)) = request.extensions().get::<ConnectInfo<SocketAddr>>() {
        return addr.ip().to_string();
    }

    request
        .headers()
        .get(FORWARDED_FOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: impl ToString) {
    if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

fn reset_epoch_secs(decision: &Decision) -> u64 {
    decision.reset_at.max(0.0).ceil() as u64
}

/// Create a 429 Too Many Requests response with rate limit headers
pub fn create_rate_limit_response(decision: &Decision) -> Response {
    let mut headers = HeaderMap::new();

    insert_header(&mut headers, LIMIT_HEADER, decision.limit);
    insert_header(&mut headers, REMAINING_HEADER, decision.remaining);
    insert_header(&mut headers, RESET_HEADER, reset_epoch_secs(decision));

    if let Some(retry) = decision.retry_after_secs {
        insert_header(&mut headers, RETRY_AFTER_HEADER, retry);
    }

    // Abusers get no timing hints in the body
    let body = if decision.child_safety_triggered {
        insert_header(&mut headers, CHILD_SAFETY_HEADER, CHILD_SAFETY_VALUE);
        serde_json::json!({
            "error": GENERIC_LIMIT_MESSAGE,
            "status": 429,
        })
    } else {
        serde_json::json!({
            "error": GENERIC_LIMIT_MESSAGE,
            "status": 429,
            "retry_after": decision.retry_after_secs,
        })
    };

    (StatusCode::TOO_MANY_REQUESTS, headers, axum::Json(body)).into_response()
}

/// Add rate limit headers to successful responses
pub fn add_rate_limit_headers(mut response: Response, decision: &Decision) -> Response {
    let headers = response.headers_mut();

    insert_header(headers, LIMIT_HEADER, decision.limit);
    insert_header(headers, REMAINING_HEADER, decision.remaining);
    insert_header(headers, RESET_HEADER, reset_epoch_secs(decision));

    response
}

/// Axum middleware function for rate limiting.
///
/// Install with `axum::middleware::from_fn_with_state(state, rate_limit_middleware)`.
pub async fn rate_limit_middleware(
    State(limiter): State<RateLimitMiddleware>,
    request: Request,
    next: Next,
) -> Response {
    // No rule for this path, allow the request
    let Some(check) = limiter.prepare(&request) else {
        return next.run(request).await;
    };

    match limiter.apply(&check).await {
        Ok(decision) => add_rate_limit_headers(next.run(request).await, &decision),
        Err(response) => response,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::registry::PolicyRegistry;
    use crate::rate_limit::types::BlockedReason;

    fn middleware() -> RateLimitMiddleware {
        let limiter = Arc::new(RateLimiter::local_only(PolicyRegistry::with_defaults()));
        RateLimitMiddleware::new(
            limiter,
            vec![
                RouteRule::new("/api", "default", KeyScope::Ip),
                RouteRule::new("/api/children", "child_interaction", KeyScope::Child),
            ],
        )
    }

    #[test]
    fn test_longest_prefix_wins() {
        let mw = middleware();
        assert_eq!(
            mw.match_rule("/api/children/42/messages").unwrap().policy,
            "child_interaction"
        );
        assert_eq!(mw.match_rule("/api/users").unwrap().policy, "default");
        assert!(mw.match_rule("/health").is_none());
    }

    #[test]
    fn test_prepare_collects_identity_and_metadata() {
        let mw = middleware();

        let mut request = axum::http::Request::builder()
            .uri("/api/children/42/messages")
            .header(FORWARDED_FOR_HEADER, "203.0.113.9, 10.0.0.1")
            .body(axum::body::Body::empty())
            .unwrap();
        request.extensions_mut().insert(RequestIdentity {
            user_id: Some("parent-1".to_string()),
            child_id: Some("42".to_string()),
        });
        request
            .extensions_mut()
            .insert(RequestId("req-1".to_string()));

        let check = mw.prepare(&request).unwrap();
        assert_eq!(check.policy, "child_interaction");
        assert_eq!(check.key.canonical(), "child:42");
        assert_eq!(check.metadata.ip_address.as_deref(), Some("203.0.113.9"));
        assert_eq!(check.metadata.request_id.as_deref(), Some("req-1"));
        assert_eq!(
            check.metadata.extra.get("path").map(String::as_str),
            Some("/api/children/42/messages")
        );

        let unmatched = axum::http::Request::builder()
            .uri("/health")
            .body(axum::body::Body::empty())
            .unwrap();
        assert!(mw.prepare(&unmatched).is_none());
    }

    #[test]
    fn test_create_rate_limit_key() {
        let child_rule = RouteRule::new("/api/children", "child_interaction", KeyScope::Child);
        let identity = RequestIdentity {
            user_id: Some("parent-1".to_string()),
            child_id: Some("42".to_string()),
        };

        let key = create_rate_limit_key(&child_rule, "10.0.0.1", &identity, None);
        assert_eq!(key.canonical(), "child:42");

        // Missing identity falls back to the client IP
        let key = create_rate_limit_key(&child_rule, "10.0.0.1", &RequestIdentity::default(), None);
        assert_eq!(key.canonical(), "ip:10.0.0.1");

        let user_rule = RouteRule::new("/api/profile", "default", KeyScope::User);
        let key = create_rate_limit_key(&user_rule, "10.0.0.1", &identity, None);
        assert_eq!(key.canonical(), "user:parent-1");

        let api_rule = RouteRule::new("/api/partner", "api_general", KeyScope::ApiKey);
        let key = create_rate_limit_key(&api_rule, "10.0.0.1", &identity, Some("k-123"));
        assert_eq!(key.canonical(), "apikey:k-123");

        let route_rule = RouteRule::new("/api/search", "default", KeyScope::Route);
        let key = create_rate_limit_key(&route_rule, "10.0.0.1", &identity, None);
        assert_eq!(key.canonical(), "route:/api/search");
    }

    #[test]
    fn test_rate_limit_response() {
        let decision = Decision::denied(100, 1_700_000_030.0, 30.0);
        let response = create_rate_limit_response(&decision);

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let headers = response.headers();
        assert_eq!(headers.get(LIMIT_HEADER).unwrap(), "100");
        assert_eq!(headers.get(REMAINING_HEADER).unwrap(), "0");
        assert_eq!(headers.get(RESET_HEADER).unwrap(), "1700000030");
        assert_eq!(headers.get(RETRY_AFTER_HEADER).unwrap(), "30");
        assert!(headers.get(CHILD_SAFETY_HEADER).is_none());
    }

    #[test]
    fn test_child_safety_response() {
        let mut decision = Decision::denied(2, 1_000.0, 600.0);
        decision.child_safety_triggered = true;
        decision.blocked_reason = BlockedReason::ChildSafetyEscalation;

        let response = create_rate_limit_response(&decision);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(CHILD_SAFETY_HEADER).unwrap(),
            CHILD_SAFETY_VALUE
        );
    }

    #[test]
    fn test_add_rate_limit_headers() {
        let decision = Decision::allowed(10, 7, 120.4);
        let response = add_rate_limit_headers(StatusCode::OK.into_response(), &decision);

        assert_eq!(response.headers().get(LIMIT_HEADER).unwrap(), "10");
        assert_eq!(response.headers().get(REMAINING_HEADER).unwrap(), "7");
        assert_eq!(response.headers().get(RESET_HEADER).unwrap(), "121");
    }
}
