pub mod api;
pub mod audit;
pub mod config;
pub mod error;
pub mod metrics;
pub mod observability;
pub mod rate_limit;

use crate::api::{build_router, AppState};
use crate::audit::{AuditDispatcher, AuditSink, TracingAuditSink};
use crate::config::EngineConfig;
use crate::error::{LimiterError, Result};
use crate::metrics::MetricsService;
use crate::observability::request_id_middleware;
use crate::rate_limit::cleanup::CleanupScheduler;
use crate::rate_limit::middleware::{rate_limit_middleware, RateLimitMiddleware};
use crate::rate_limit::service::RateLimiter;
use crate::rate_limit::store::{FallbackStateStore, RedisStateStore, StateStore};
use axum::{middleware, Router};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// A running limiter with its background tasks
pub struct Engine {
    limiter: Arc<RateLimiter>,
    middleware: RateLimitMiddleware,
    audit_worker: Option<JoinHandle<()>>,
    cleanup: Option<JoinHandle<()>>,
}

impl Engine {
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Middleware state for the configured route rules
    pub fn middleware(&self) -> RateLimitMiddleware {
        self.middleware.clone()
    }

    /// Sidecar router with request ids, tracing and the route rules applied
    pub fn router(&self, metrics: MetricsService, timeout: Duration) -> Router {
        build_router(AppState {
            limiter: self.limiter.clone(),
            metrics,
        })
        .layer(middleware::from_fn_with_state(
            self.middleware(),
            rate_limit_middleware,
        ))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(TimeoutLayer::new(timeout))
        .layer(TraceLayer::new_for_http())
    }

    /// Flush pending audit events and stop background tasks
    pub async fn shutdown(mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup.abort();
        }

        self.limiter.audit().close();
        if let Some(worker) = self.audit_worker.take() {
            if let Err(e) = worker.await {
                warn!(error = %e, "Audit worker terminated abnormally");
            }
        }

        info!("Engine stopped");
    }
}

/// Connect the state store described by `config`
async fn build_store(config: &EngineConfig) -> Arc<FallbackStateStore> {
    let Some(redis) = &config.redis else {
        return Arc::new(FallbackStateStore::local_only());
    };

    match RedisStateStore::connect(&redis.url, &redis.prefix, redis.op_timeout()).await {
        Ok(primary) => {
            let primary: Arc<dyn StateStore> = Arc::new(primary);
            Arc::new(FallbackStateStore::with_primary(primary, redis.probe_interval()).await)
        }
        Err(e) => {
            warn!(
                url = %redis.url,
                error = %e,
                "Could not connect to Redis, using local state only"
            );
            Arc::new(FallbackStateStore::local_only())
        }
    }
}

/// Build the limiter and start its background tasks.
///
/// Must be called inside a tokio runtime.
pub async fn build_engine(config: &EngineConfig) -> Result<Engine> {
    config.validate()?;

    let registry = Arc::new(config.registry()?);
    let store: Arc<dyn StateStore> = build_store(config).await;
    let audit = AuditDispatcher::new(config.audit.queue_capacity);

    let audit_worker = if config.audit.enabled {
        let sink: Arc<dyn AuditSink> = Arc::new(TracingAuditSink);
        Some(audit.spawn_worker(sink))
    } else {
        // Nothing drains the queue; the limiter still never blocks on it
        audit.close();
        None
    };

    let limiter = Arc::new(
        RateLimiter::new(registry, store.clone(), audit)
            .with_escalation_settings(config.escalation),
    );

    let cleanup = config.cleanup.enabled.then(|| {
        CleanupScheduler::new(
            store,
            limiter.clock().clone(),
            Duration::from_secs(config.cleanup.interval_secs),
        )
        .start()
    });

    let middleware = RateLimitMiddleware::new(limiter.clone(), config.routes.clone());

    info!(
        policies = limiter.registry().len(),
        routes = config.routes.len(),
        store = limiter.store().name(),
        "Rate limit engine ready"
    );

    Ok(Engine {
        limiter,
        middleware,
        audit_worker,
        cleanup,
    })
}

/// Initialize the decision server
pub async fn init_server(config: EngineConfig) -> Result<()> {
    info!("Starting safelimit");
    info!(
        "Server listening on {}:{}",
        config.server.host, config.server.port
    );

    let engine = build_engine(&config).await?;
    let metrics = MetricsService::new()?;
    let app = engine.router(metrics, Duration::from_secs(config.server.timeout_secs));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(LimiterError::Io)?;

    info!("safelimit ready to accept connections");

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|e| LimiterError::Internal(format!("Server error: {}", e)));

    engine.shutdown().await;
    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
