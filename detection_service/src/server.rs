use crate::{
    annotate::Annotator,
    bootstrap,
    config::{Config, UploadConfig},
    detection::DetectionService,
    model_service::ModelService,
    nutrition::NutritionClient,
    ort_service::OrtModelService,
    routes::api_routes,
    state::ClassLabels,
    telemetry::Metrics,
};
use axum::{extract::DefaultBodyLimit, Router};
use axum_otel_metrics::HttpMetricsLayerBuilder;
use std::sync::Arc;
use tokio::{net::TcpListener, signal};
use tower_http::trace::TraceLayer;

// Room for multipart boundaries and part headers on top of the file itself.
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

pub struct SharedState<M: ModelService> {
    pub detection_service: Arc<DetectionService<M>>,
    pub metrics: Arc<Metrics>,
    pub upload: UploadConfig,
}

impl<M: ModelService> Clone for SharedState<M> {
    fn clone(&self) -> Self {
        Self {
            detection_service: self.detection_service.clone(),
            metrics: self.metrics.clone(),
            upload: self.upload.clone(),
        }
    }
}

pub fn build_router<M: ModelService>(state: SharedState<M>) -> Router {
    let body_limit = state.upload.max_bytes + MULTIPART_OVERHEAD_BYTES;

    Router::new()
        .merge(api_routes::<M>())
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new<M: ModelService>(
        detection_service: DetectionService<M>,
        config: &Config,
    ) -> anyhow::Result<Self> {
        let addr = config.server.get_address();

        let metrics = Arc::new(Metrics::new()?);
        metrics.install_global();
        let metrics_layer = HttpMetricsLayerBuilder::new().build();

        let state = SharedState {
            detection_service: Arc::new(detection_service),
            metrics,
            upload: config.upload.clone(),
        };

        let router = build_router(state).layer(metrics_layer);
        let listener = TcpListener::bind(&addr).await?;

        Ok(Self { router, listener })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        tracing::info!("Detection service listening on {}", self.listener.local_addr()?);

        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async {
                shutdown_signal().await;
                tracing::info!("Shutdown signal received, starting graceful shutdown");
            })
            .await?;

        Ok(())
    }
}

pub async fn start_server(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    bootstrap::ensure_model(&config.model).await?;

    let labels = ClassLabels::new(&config.labels)?;
    let model_service = OrtModelService::new(&config.model, labels)?;
    let annotator = Annotator::new(&config.annotation)?;

    let mut detection_service = DetectionService::new(model_service, annotator);
    if config.nutrition.enabled {
        tracing::info!(
            "Nutrition lookup enabled against {}",
            config.nutrition.search_url
        );
        detection_service =
            detection_service.with_nutrition(NutritionClient::new(&config.nutrition)?);
    }

    let server = HttpServer::new(detection_service, &config).await?;
    server.run().await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
