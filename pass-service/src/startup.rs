//! Application startup and lifecycle management.

use crate::config::PassConfig;
use crate::lifecycle::{Orchestrator, PassScheduler, SystemClock};
use crate::services::metrics::describe_metrics;
use crate::services::{Database, SempClient};
use axum::{extract::State, http::StatusCode, middleware, response::IntoResponse, routing::get, Json, Router};
use serde_json::json;
use service_core::error::AppError;
use service_core::middleware::{metrics_middleware, request_id_middleware};
use service_core::observability::{init_metrics, render_metrics};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// State for health check endpoints.
#[derive(Clone)]
struct HealthState {
    db: Arc<Database>,
}

/// Health check endpoint for Docker/K8s liveness probes.
async fn health_check(State(state): State<HealthState>) -> impl IntoResponse {
    match state.db.health_check().await {
        Ok(_) => {
            tracing::debug!("Health check passed");
            (
                StatusCode::OK,
                Json(json!({
                    "status": "ok",
                    "service": "pass-service",
                    "version": env!("CARGO_PKG_VERSION")
                })),
            )
        }
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed - database unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "pass-service",
                    "error": e.to_string()
                })),
            )
        }
    }
}

/// Readiness check endpoint for K8s readiness probes.
async fn readiness_check(State(state): State<HealthState>) -> impl IntoResponse {
    match state.db.health_check().await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Metrics endpoint for Prometheus scraping.
async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        render_metrics(),
    )
}

/// Application container for managing server and scheduler lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    db: Arc<Database>,
    orchestrator: Arc<Orchestrator>,
    scheduler: Option<Arc<PassScheduler>>,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: PassConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(config: PassConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(config: PassConfig, run_migrations: bool) -> Result<Self, AppError> {
        init_metrics();
        describe_metrics();

        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        if run_migrations {
            db.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                e
            })?;
        }

        let db = Arc::new(db);

        let semp = SempClient::new(config.broker.request_timeout()).map_err(|e| {
            AppError::InternalError(anyhow::anyhow!("Failed to build broker client: {}", e))
        })?;

        let orchestrator = Arc::new(Orchestrator::new(
            db.clone(),
            db.clone(),
            db.clone(),
            semp,
            Arc::new(SystemClock),
        ));

        let scheduler = if config.scheduler.enabled {
            Some(Arc::new(PassScheduler::new(
                orchestrator.clone(),
                config.scheduler.period(),
            )))
        } else {
            tracing::info!("Pass scheduler disabled by configuration");
            None
        };

        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(http_port = port, "Pass service listener bound");

        Ok(Self {
            port,
            listener,
            db,
            orchestrator,
            scheduler,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Operator entry point for pass actions.
    pub fn orchestrator(&self) -> Arc<Orchestrator> {
        self.orchestrator.clone()
    }

    /// Serve health/metrics and run the scheduler until `shutdown` resolves,
    /// then stop the scheduler and wait for in-flight pass tasks.
    pub async fn run_until_stopped<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let router = Router::new()
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .layer(middleware::from_fn(metrics_middleware))
            .layer(middleware::from_fn(request_id_middleware))
            .with_state(HealthState {
                db: self.db.clone(),
            });

        if let Some(scheduler) = &self.scheduler {
            scheduler.start();
        }

        tracing::info!(
            service = "pass-service",
            version = env!("CARGO_PKG_VERSION"),
            http_port = self.port,
            scheduler_enabled = self.scheduler.is_some(),
            "Service ready to accept connections"
        );

        let served = axum::serve(self.listener, router)
            .with_graceful_shutdown(shutdown)
            .await;

        if let Some(scheduler) = &self.scheduler {
            scheduler.stop().await;
        }

        served.map_err(|e| {
            tracing::error!(error = %e, "HTTP server error");
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}
