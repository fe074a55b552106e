use crate::detection::Detection;
use async_trait::async_trait;
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to load model: {0}")]
    Load(String),
    #[error("Failed to build input tensor: {0}")]
    Input(String),
    #[error("Inference failed: {0}")]
    Inference(String),
    #[error("Unexpected model output: {0}")]
    Output(String),
}

/// Black-box detector: RGB bitmap in, detections in original pixel space out.
///
/// Implementations are shared across concurrent requests and must serialize
/// access to any runtime state that is not safe for concurrent inference.
#[async_trait]
pub trait ModelService: Send + Sync + 'static {
    async fn predict(&self, image: &RgbImage) -> Result<Vec<Detection>, ModelError>;
}
