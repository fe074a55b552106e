mod routes;
mod server;

pub mod app;
pub mod config;
pub mod detection_client;
pub mod render;

pub use app::start_app;
pub use server::{build_router, HttpServer, SharedState};
