//! Application startup and lifecycle management.
//!
//! The quota core is consumed as a library. This binary wires the store and
//! catalog, runs the optional idle-record sweep and serves the operator
//! endpoints (health, readiness, metrics).

use crate::config::{StoreBackend, UsageConfig};
use crate::services::{
    get_metrics, Clock, InMemoryUsageStore, MongoUsageStore, QuotaEnforcer, RefundPolicy,
    ResetSweeper, SystemClock, TierCatalog, UsageStore,
};
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde_json::json;
use service_core::error::AppError;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// State for health check endpoints.
#[derive(Clone)]
pub struct HealthState {
    pub store: Arc<dyn UsageStore>,
}

/// Health check endpoint for Docker/K8s liveness probes.
async fn health_check(State(state): State<HealthState>) -> impl IntoResponse {
    match state.store.health_check().await {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "service": "usage-service",
                "version": env!("CARGO_PKG_VERSION")
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unhealthy",
                "service": "usage-service",
                "error": e.to_string()
            })),
        ),
    }
}

/// Readiness check endpoint for K8s readiness probes.
async fn readiness_check(State(state): State<HealthState>) -> Result<StatusCode, AppError> {
    state
        .store
        .health_check()
        .await
        .map_err(|e| AppError::ServiceUnavailable(e.to_string()))?;
    Ok(StatusCode::OK)
}

async fn metrics_endpoint() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}

/// Operator router: `/health`, `/ready` and `/metrics`.
pub fn operator_router(store: Arc<dyn UsageStore>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_endpoint))
        .layer(TraceLayer::new_for_http())
        .with_state(HealthState { store })
}

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    http_listener: TcpListener,
    store: Arc<dyn UsageStore>,
    enforcer: QuotaEnforcer,
    sweeper: Option<ResetSweeper>,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: UsageConfig) -> Result<Self, AppError> {
        let store: Arc<dyn UsageStore> = match config.store {
            StoreBackend::Mongo => {
                let db = MongoUsageStore::connect(&config.mongodb.uri, &config.mongodb.database)
                    .await
                    .map_err(|e| {
                        tracing::error!("Failed to connect to MongoDB: {}", e);
                        e
                    })?;
                db.initialize_indexes().await.map_err(|e| {
                    tracing::error!("Failed to initialize database indexes: {}", e);
                    e
                })?;
                Arc::new(db)
            }
            StoreBackend::Memory => {
                tracing::warn!("Using in-memory usage store, counters will not survive restarts");
                Arc::new(InMemoryUsageStore::new())
            }
        };

        let catalog = match &config.tier_catalog_path {
            Some(path) => TierCatalog::from_file(path).map_err(|e| {
                tracing::error!(path = %path, "Failed to load tier catalog: {}", e);
                AppError::ConfigError(anyhow::Error::new(e))
            })?,
            None => TierCatalog::default(),
        };

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let refund_policy = RefundPolicy {
            max_elapsed: std::time::Duration::from_millis(config.refund_max_elapsed_ms),
            ..RefundPolicy::default()
        };
        let enforcer = QuotaEnforcer::new(store.clone(), catalog)
            .with_clock(clock.clone())
            .with_refund_policy(refund_policy);

        let sweeper = if config.sweep.enabled {
            Some(ResetSweeper::new(
                store.clone(),
                clock,
                std::time::Duration::from_secs(config.sweep.interval_secs.max(1)),
                chrono::Duration::days(config.sweep.idle_retention_days),
            ))
        } else {
            tracing::info!("Idle usage record sweep disabled");
            None
        };

        // Bind HTTP listener (port 0 = random port for testing)
        let http_addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let http_listener = TcpListener::bind(http_addr).await.map_err(|e| {
            tracing::error!("Failed to bind HTTP listener to {}: {}", http_addr, e);
            AppError::from(e)
        })?;
        let http_port = http_listener.local_addr()?.port();

        tracing::info!("Usage service: HTTP on port {}", http_port);

        Ok(Self {
            http_port,
            http_listener,
            store,
            enforcer,
            sweeper,
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    /// The quota enforcer wired to this application's store and catalog.
    pub fn enforcer(&self) -> &QuotaEnforcer {
        &self.enforcer
    }

    /// Run the application until `shutdown` resolves.
    pub async fn run_until_stopped<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let sweep = self.sweeper.map(|sweeper| {
            let token = sweeper.shutdown_token();
            (token, sweeper.start())
        });

        let router = operator_router(self.store);
        let result = axum::serve(self.http_listener, router)
            .with_graceful_shutdown(shutdown)
            .await;

        if let Some((token, handle)) = sweep {
            token.cancel();
            if let Err(e) = handle.await {
                tracing::warn!("Sweeper task ended abnormally: {}", e);
            }
        }

        result.map_err(|e| {
            tracing::error!("HTTP server error: {}", e);
            e
        })
    }
}
