mod health;
mod metrics;
mod upload;

use crate::{model_service::ModelService, server::SharedState};
use axum::{
    routing::{get, post},
    Router,
};

pub use health::healthcheck;

pub fn api_routes<M: ModelService>() -> Router<SharedState<M>> {
    Router::new()
        .route("/upload/", post(upload::upload_image::<M>))
        .route("/upload", post(upload::upload_image::<M>))
        .route("/health", get(healthcheck))
        .route("/metrics", get(metrics::metrics_handler::<M>))
}
