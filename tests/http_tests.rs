use axum::{
    body::{to_bytes, Body},
    extract::Request as AxumRequest,
    middleware::{self, Next},
    response::Response,
    routing::get,
    Router,
};
use http::{Request, StatusCode};
use safelimit::{
    observability::{request_id_middleware, REQUEST_ID_HEADER},
    rate_limit::{
        middleware::{GENERIC_LIMIT_MESSAGE, RETRY_AFTER_HEADER},
        rate_limit_middleware, KeyScope, PolicyConfig, PolicyRegistry, RateLimitMiddleware,
        RateLimiter, RequestIdentity, RouteRule,
    },
};
use std::sync::Arc;
use tower::ServiceExt;

const CHILD_HEADER: &str = "x-test-child-id";

/// Stand-in for the host's auth layer
async fn identity_from_header(mut req: AxumRequest, next: Next) -> Response {
    let child_id = req
        .headers()
        .get(CHILD_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    req.extensions_mut().insert(RequestIdentity {
        user_id: None,
        child_id,
    });
    next.run(req).await
}

fn app() -> Router {
    let registry = PolicyRegistry::new(vec![
        PolicyConfig::sliding_window("child_interaction", 2, 60)
            .with_block_duration(600)
            .child_safe(),
        PolicyConfig::fixed_window("public", 1, 60),
    ])
    .unwrap();
    let limiter = Arc::new(RateLimiter::local_only(registry));

    let state = RateLimitMiddleware::new(
        limiter,
        vec![
            RouteRule::new("/api/children", "child_interaction", KeyScope::Child),
            RouteRule::new("/api/public", "public", KeyScope::Ip),
            RouteRule::new("/api/misconfigured", "missing", KeyScope::Ip),
        ],
    );

    Router::new()
        .route("/api/children/:id/messages", get(|| async { "ok" }))
        .route("/api/public", get(|| async { "ok" }))
        .route("/api/misconfigured", get(|| async { "ok" }))
        .route("/health", get(|| async { "OK" }))
        .layer(middleware::from_fn_with_state(state, rate_limit_middleware))
        .layer(middleware::from_fn(identity_from_header))
        .layer(middleware::from_fn(request_id_middleware))
}

fn child_request(child: &str) -> Request<Body> {
    Request::builder()
        .uri(format!("/api/children/{}/messages", child))
        .header(CHILD_HEADER, child)
        .body(Body::empty())
        .unwrap()
}

fn public_request(ip: &str) -> Request<Body> {
    Request::builder()
        .uri("/api/public")
        .header("x-forwarded-for", ip)
        .body(Body::empty())
        .unwrap()
}

async fn json_body(response: Response) -> serde_json::Value {
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_allowed_request_has_rate_limit_headers() {
    let response = app().oneshot(child_request("42")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers.get("x-ratelimit-limit").unwrap(), "2");
    assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "1");
    assert!(headers.get("x-ratelimit-reset").is_some());
    assert!(headers.get(REQUEST_ID_HEADER).is_some());
}

#[tokio::test]
async fn test_child_safety_denial() {
    let app = app();

    for _ in 0..2 {
        let response = app.clone().oneshot(child_request("42")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app.clone().oneshot(child_request("42")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    let headers = response.headers();
    assert_eq!(headers.get("x-child-safety").unwrap(), "rate-limit-enforced");
    assert_eq!(headers.get(RETRY_AFTER_HEADER).unwrap(), "600");
    assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "0");

    // The body carries no timing information
    let body = json_body(response).await;
    assert_eq!(body["error"], GENERIC_LIMIT_MESSAGE);
    assert!(body.get("retry_after").is_none());

    // Another child is unaffected
    let response = app.oneshot(child_request("43")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_plain_denial_by_ip() {
    let app = app();

    let response = app.clone().oneshot(public_request("10.0.0.1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.clone().oneshot(public_request("10.0.0.1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().get("x-child-safety").is_none());
    assert!(response.headers().get(RETRY_AFTER_HEADER).is_some());

    let body = json_body(response).await;
    assert_eq!(body["error"], GENERIC_LIMIT_MESSAGE);
    assert!(body["retry_after"].as_u64().unwrap() >= 1);

    // A different client has its own budget
    let response = app.oneshot(public_request("10.0.0.2")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_unmatched_path_passes_through() {
    let response = app()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("x-ratelimit-limit").is_none());
}

#[tokio::test]
async fn test_unknown_policy_is_server_error() {
    let response = app()
        .oneshot(
            Request::builder()
                .uri("/api/misconfigured")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}
