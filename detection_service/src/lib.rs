mod routes;
mod server;

pub mod annotate;
pub mod bootstrap;
pub mod config;
pub mod detection;
pub mod image_codec;
pub mod model_service;
pub mod nutrition;
pub mod ort_service;
pub mod state;
pub mod telemetry;

pub use server::{build_router, start_server, HttpServer, SharedState};
