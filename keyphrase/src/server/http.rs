//! HTTP server wiring.

use std::net::SocketAddr;

use axum::Router;
use axum::routing::{delete, get, post, put};
use tokio::signal;

use super::config::ServerConfig;
use super::handlers::{
    AppState, handle_bootstrap_batch, handle_deregister_connection, handle_fanout_batch,
    handle_get_total, handle_healthy, handle_metrics, handle_put_occurrences, handle_ready,
    handle_register_connection, handle_site_snapshot, handle_totals_batch,
};
use super::middleware::{MetricsLayer, TracingLayer};
use crate::error::{Error, Result};
use crate::service::KeyphraseService;

/// HTTP front end of a [`KeyphraseService`].
pub struct KeyphraseServer {
    service: KeyphraseService,
    config: ServerConfig,
}

impl KeyphraseServer {
    pub fn new(service: KeyphraseService, config: ServerConfig) -> Self {
        Self { service, config }
    }

    /// Builds the router over the service's storage and engines.
    pub fn router(service: &KeyphraseService) -> Router {
        let state = AppState {
            storage: service.storage().clone(),
            totals: service.totals().clone(),
            fanout: service.fanout().clone(),
            bootstrap: service.bootstrap().clone(),
            metrics: service.metrics().clone(),
        };

        Router::new()
            .route("/api/v1/totals/batch", post(handle_totals_batch))
            .route("/api/v1/fanout/batch", post(handle_fanout_batch))
            .route("/api/v1/bootstrap/batch", post(handle_bootstrap_batch))
            .route("/api/v1/occurrences", put(handle_put_occurrences))
            .route("/api/v1/connections", post(handle_register_connection))
            .route(
                "/api/v1/connections/{id}",
                delete(handle_deregister_connection),
            )
            .route("/api/v1/totals/{keyphrase}", get(handle_get_total))
            .route("/api/v1/sites/{site}", get(handle_site_snapshot))
            .route("/metrics", get(handle_metrics))
            .route("/-/healthy", get(handle_healthy))
            .route("/-/ready", get(handle_ready))
            .layer(TracingLayer::new())
            .layer(MetricsLayer::new(service.metrics().clone()))
            .with_state(state)
    }

    /// Serves until SIGINT or SIGTERM, then drains the pipeline.
    pub async fn run(self) -> Result<()> {
        let app = Self::router(&self.service);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        tracing::info!("Starting keyphrase server on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Internal(format!("failed to bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| Error::Internal(format!("server error: {}", e)))?;

        tracing::info!("Draining pipeline before shutdown...");
        self.service.close().await?;

        tracing::info!("Server shut down gracefully");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, starting graceful shutdown"),
        _ = terminate => tracing::info!("Received SIGTERM, starting graceful shutdown"),
    }
}
