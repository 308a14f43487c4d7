use pingora::services::background::BackgroundService;
use std::net::SocketAddr;
use tokio::sync::watch::Receiver;

use crate::{api, state::AppState};

/// Serves the internal API on loopback next to the proxy.
pub struct ApiBackgroundService {
    pub state: AppState,
    pub address: SocketAddr,
}

#[async_trait::async_trait]
impl BackgroundService for ApiBackgroundService {
    async fn start(&self, mut shutdown: Receiver<bool>) {
        let listener = match tokio::net::TcpListener::bind(self.address).await {
            Ok(listener) => listener,
            Err(err) => {
                tracing::error!("Unable to bind the internal API to {}: {err}", self.address);
                return;
            }
        };
        tracing::info!("Internal API listening on {}", self.address);
        let app = api::router(self.state.clone());
        let shutdown = async move {
            // Either a shutdown signal or the server going away.
            let _ = shutdown.changed().await;
        };
        if let Err(err) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            tracing::error!("{err:?}");
        }
    }
}
