mod detect;
mod health;
mod index;

use crate::server::SharedState;
use axum::{
    routing::{get, post},
    Router,
};

pub use health::healthcheck;

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        .route("/", get(index::index))
        .route("/detect", post(detect::detect))
        .route("/health", get(healthcheck))
}
