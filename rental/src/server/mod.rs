//! HTTP server for each service.

pub mod health;
pub mod routes;

use std::net::SocketAddr;
use tokio::sync::broadcast;

pub use routes::{analytics_router, payment_router, reservation_router};

/// Serve `router` on `addr` until the shutdown signal, then let in-flight requests
/// finish.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound.
pub async fn serve(
    router: axum::Router,
    addr: SocketAddr,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "HTTP server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    tracing::info!("HTTP server stopped");
    Ok(())
}
