use crate::{
    config::{Config, UploadConfig},
    detection_client::DetectionClient,
    routes::api_routes,
};
use axum::{extract::DefaultBodyLimit, Router};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

#[derive(Clone)]
pub struct SharedState {
    pub detection_client: Arc<DetectionClient>,
    pub upload: UploadConfig,
}

pub fn build_router(state: SharedState) -> Router {
    let body_limit = state.upload.max_bytes + MULTIPART_OVERHEAD_BYTES;

    Router::new()
        .merge(api_routes())
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new(detection_client: DetectionClient, config: &Config) -> anyhow::Result<Self> {
        let addr = config.server.get_address();

        let state = SharedState {
            detection_client: Arc::new(detection_client),
            upload: config.upload.clone(),
        };

        let router = build_router(state);
        let listener = TcpListener::bind(addr).await?;

        Ok(Self { router, listener })
    }

    pub async fn run<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        tracing::info!("Starting app on {}", self.listener.local_addr()?);

        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}
