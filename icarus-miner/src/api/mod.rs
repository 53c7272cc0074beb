//! HTTP API server.
//!
//! Read-only device status plus the runtime option interface, built on Axum.
//! Handlers talk to device threads only through their [`ThreadHandle`]s.

pub mod v1;

use std::{collections::HashMap, io, net::SocketAddr, sync::Arc};

use axum::Router;
use tokio::{net::TcpListener, sync::RwLock};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::thread::ThreadHandle;
use crate::tracing::prelude::*;

/// Default listen address for the API.
pub const DEFAULT_LISTEN: &str = "127.0.0.1:7785";

/// Shared application state for API endpoints.
#[derive(Clone, Default)]
pub struct AppState {
    /// Device threads by name
    pub devices: Arc<RwLock<HashMap<String, ThreadHandle>>>,
}

impl AppState {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_device(&self, handle: ThreadHandle) {
        debug!(device = %handle.name(), "Registering device with API.");
        self.devices
            .write()
            .await
            .insert(handle.name().to_string(), handle);
    }

    pub async fn device(&self, name: &str) -> Option<ThreadHandle> {
        self.devices.read().await.get(name).cloned()
    }
}

/// Full application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", v1::routes(state))
        .layer(TraceLayer::new_for_http())
}

/// Serve the API until `running` is cancelled.
pub async fn serve(listen: SocketAddr, state: AppState, running: CancellationToken) -> io::Result<()> {
    let listener = TcpListener::bind(listen).await?;
    info!(%listen, "API listening.");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { running.cancelled().await })
        .await
}
