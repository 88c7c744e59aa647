//! HTTP server implementation.

use std::net::SocketAddr;

use axum::routing::{any, get};
use axum::Router;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::middleware::{rate_limit, RateLimitState};
use crate::error::Result;

/// HTTP server exposing an admission endpoint.
///
/// `/check` answers `200 OK` for admitted requests and is meant to sit in
/// front of (or be called by) the protected service. `/health` is never rate
/// limited.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Rate limiting state shared by every request
    state: RateLimitState,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, state: RateLimitState) -> Self {
        Self { addr, state }
    }

    /// Build the router.
    pub fn router(state: RateLimitState) -> Router {
        Router::new()
            .route("/check", any(|| async { "OK" }))
            .route_layer(axum::middleware::from_fn_with_state(state, rate_limit))
            .route("/health", get(|| async { "OK" }))
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            e
        })?;

        info!(addr = %self.addr, "Starting HTTP server with graceful shutdown");

        axum::serve(listener, Self::router(self.state))
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                e.into()
            })
    }
}
