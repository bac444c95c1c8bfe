//! HTTP status and control surface.

use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::context::AppContext;

pub mod error;
pub mod routes_controls;
pub mod routes_dead_letters;
pub mod routes_inventory;
pub mod routes_status;

/// Build the Axum router with all routes.
pub fn create_router(ctx: AppContext) -> Router {
    Router::new()
        .route("/health", get(routes_status::health))
        .nest("/api", api_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

fn api_routes() -> Router<AppContext> {
    Router::new()
        .route("/status", get(routes_status::status))
        .route("/inventory", get(routes_inventory::list_inventory))
        .route("/dead-letters", get(routes_dead_letters::list_dead_letters))
        .route(
            "/dead-letters/{id}/retry",
            post(routes_dead_letters::retry_dead_letter),
        )
        .route(
            "/adapters/{adapter}/{action}",
            post(routes_controls::set_adapter),
        )
        .route("/scan", post(routes_controls::trigger_scan))
        .route(
            "/notifications/flush",
            post(routes_controls::flush_notifications),
        )
        .route("/config/reload", post(routes_controls::reload_config))
}

/// Serve the router until `cancel` fires.
pub async fn start_server(ctx: AppContext, cancel: CancellationToken) -> Result<()> {
    let server = ctx.config.current().server.clone();
    let addr: SocketAddr = format!("{}:{}", server.host, server.port)
        .parse()
        .context("Invalid server address")?;

    let app = create_router(ctx);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!("Status server listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => {}
            Err(e) => {
                tracing::error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
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

    tracing::info!("Shutdown signal received");
}
