//! HTTP surface of the runner.

pub mod api;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::RunnerConfig;
use crate::runner::orchestrator::Orchestrator;
use api::{AppState, SharedState};

/// Build the full application router.
pub fn build_router(state: SharedState) -> Router {
    api::api_router(state.clone())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the runner service and serve until Ctrl+C or SIGTERM.
pub async fn start_server(config: RunnerConfig) -> Result<()> {
    if config.api_key.is_none() {
        tracing::warn!("RUNNER_API_KEY is not set; the API is unauthenticated");
    }

    let orchestrator =
        Orchestrator::from_config(&config).context("Failed to initialize the orchestrator")?;
    let state = Arc::new(AppState {
        orchestrator: Arc::new(orchestrator),
        api_key: config.api_key.clone(),
    });
    let app = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(
        %local_addr,
        model = %config.llm.model,
        max_attempts = config.max_attempts,
        "Patch runner listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutting down...");
}
