//! API server
//!
//! Binds the facade and observer stream on one port, with graceful shutdown.

use super::{
    handlers::AppState,
    middleware::{create_cors_layer, request_id_middleware},
    routes::create_router,
};
use crate::config::ApiConfig;
use crate::errors::{ConfigurationError, CrashResult};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::sync::watch;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;

/// Main API server
pub struct ApiServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(config: ApiConfig, state: Arc<AppState>) -> Self {
        Self { config, state }
    }

    /// Serve until the shutdown signal fires
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> CrashResult<()> {
        let app = create_router(self.state)
            .layer(axum::middleware::from_fn(request_id_middleware))
            .layer(create_cors_layer(&self.config.allowed_origins))
            .layer(TimeoutLayer::new(Duration::from_secs(
                self.config.request_timeout_secs,
            )))
            .layer(TraceLayer::new_for_http());

        let ip = self
            .config
            .listen_address
            .parse::<std::net::IpAddr>()
            .map_err(|e| ConfigurationError::InvalidValue {
                field: "api.listen_address".to_string(),
                value: self.config.listen_address.clone(),
                reason: e.to_string(),
            })?;
        let addr = SocketAddr::from((ip, self.config.port));

        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("API server listening on http://{}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await?;

        info!("API server stopped");
        Ok(())
    }
}
