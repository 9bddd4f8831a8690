use crate::handlers::{health_check, metrics, sliding_window_counter, token_bucket, AppState, SharedState};
use crate::middleware::logging_middleware;
use crate::throttler::Throttler;
use axum::routing::get;
use axum::{middleware, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Builds the HTTP router over shared state.
pub fn create_app(state: SharedState) -> Router {
    Router::new()
        .route("/token-bucket", get(token_bucket))
        .route("/sliding-window-counter", get(sliding_window_counter))
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn(logging_middleware)),
        )
}

pub struct Server {
    app: Router,
    bind_addr: SocketAddr,
    throttler: Arc<Throttler>,
}

impl Server {
    pub fn new(throttler: Arc<Throttler>, bind_addr: SocketAddr) -> Self {
        let state = Arc::new(AppState::new(throttler.clone()));
        Self {
            app: create_app(state),
            bind_addr,
            throttler,
        }
    }

    /// Serves until Ctrl+C or SIGTERM, then closes the store.
    pub async fn run(self) -> std::io::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;

        info!(bind_addr = %self.bind_addr, "Quota gate listening");
        info!("Health check available at /health");

        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        if let Err(err) = self.throttler.shutdown().await {
            error!(error = %err, "Failed to close store connection");
        }
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
