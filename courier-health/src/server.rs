//! Health check HTTP server

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use courier_common::Signal;
use courier_metrics::Metrics;
use tokio::net::TcpListener;
use tower_http::timeout::TimeoutLayer;

use crate::{HealthChecker, HealthConfig, HealthError};

#[derive(Debug, Clone)]
struct HealthState {
    checker: Arc<HealthChecker>,
    metrics: Option<Metrics>,
}

/// Assembles the routes served by a [`HealthServer`]
#[derive(Debug)]
pub struct HealthServerBuilder {
    config: HealthConfig,
    checker: Arc<HealthChecker>,
    metrics: Option<Metrics>,
    extra: Router,
}

impl HealthServerBuilder {
    /// Serve `/metrics` from this registry
    #[must_use]
    pub fn metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Host another router (submission or admin API) on the same listener
    #[must_use]
    pub fn merge(mut self, router: Router) -> Self {
        self.extra = self.extra.merge(router);
        self
    }

    /// The complete router, without binding a listener
    pub fn into_router(self) -> Router {
        let checks = Router::new()
            .route("/health/live", get(liveness_handler))
            .route("/health/ready", get(readiness_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(HealthState {
                checker: self.checker,
                metrics: self.metrics,
            })
            // health checks must answer quickly or not at all
            .layer(TimeoutLayer::new(Duration::from_millis(
                self.config.check_timeout_ms,
            )));

        checks.merge(self.extra)
    }

    /// Bind the configured address
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the specified address fails.
    pub async fn bind(self) -> Result<HealthServer, HealthError> {
        let address = self.config.listen_address.clone();
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|source| HealthError::BindError {
                address: address.clone(),
                source,
            })?;

        tracing::info!(address = %address, "Health check server bound successfully");

        Ok(HealthServer {
            listener,
            router: self.into_router(),
        })
    }
}

/// HTTP server for the health checks, the metrics scrape and any merged API routers
pub struct HealthServer {
    listener: TcpListener,
    router: Router,
}

impl HealthServer {
    pub fn builder(config: HealthConfig, checker: Arc<HealthChecker>) -> HealthServerBuilder {
        HealthServerBuilder {
            config,
            checker,
            metrics: None,
            extra: Router::new(),
        }
    }

    /// The address actually bound, useful when the configured port is 0
    ///
    /// # Errors
    ///
    /// Returns an error if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr, HealthError> {
        self.listener
            .local_addr()
            .map_err(|e| HealthError::ServerError(e.to_string()))
    }

    /// Run the server until a shutdown signal is received
    ///
    /// # Errors
    ///
    /// Returns an error if the server encounters a runtime error.
    pub async fn serve(
        self,
        mut shutdown: tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), HealthError> {
        tracing::info!("Health check server starting");

        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("Health check server received shutdown signal");
            })
            .await
            .map_err(|e| HealthError::ServerError(e.to_string()))?;

        tracing::info!("Health check server stopped");
        Ok(())
    }
}

/// Liveness handler
///
/// Returns 200 OK if the application is alive (can respond to requests).
async fn liveness_handler(State(state): State<HealthState>) -> Response {
    if state.checker.is_alive() {
        (StatusCode::OK, "OK").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable").into_response()
    }
}

/// Readiness handler
///
/// Returns 200 OK if the relay can take traffic, otherwise 503 with the
/// detailed status as JSON.
async fn readiness_handler(State(state): State<HealthState>) -> Response {
    let status = state.checker.get_status();
    if status.ready {
        (StatusCode::OK, "OK").into_response()
    } else {
        tracing::warn!(
            delivery_ready = status.delivery_ready,
            providers_available = status.providers_available,
            queue_size = status.queue_size,
            queue_capacity = status.queue_capacity,
            "Readiness check failed"
        );
        (StatusCode::SERVICE_UNAVAILABLE, Json(status)).into_response()
    }
}

async fn metrics_handler(State(state): State<HealthState>) -> Response {
    let Some(metrics) = state.metrics else {
        return (StatusCode::NOT_FOUND, "Metrics disabled").into_response();
    };

    match metrics.encode() {
        Ok(body) => ([(header::CONTENT_TYPE, Metrics::content_type())], body).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}
