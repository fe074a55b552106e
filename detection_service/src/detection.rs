use crate::{
    annotate::Annotator,
    image_codec::{self, ImageCodecError},
    model_service::{ModelError, ModelService},
    nutrition::{NutritionClient, NutritionRecord},
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, time::Instant};
use thiserror::Error;

pub const NO_DETECTION_MESSAGE: &str = "No food detected";

/// One detected object, in pixel coordinates of the uploaded image.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub class_id: usize,
    pub label: String,
    pub confidence: f32,
    /// `[x1, y1, x2, y2]`, top-left origin.
    pub bbox: [f32; 4],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoxRecord {
    #[serde(rename = "class")]
    pub class_name: String,
    #[serde(rename = "box")]
    pub bbox: [f32; 4],
}

impl From<&Detection> for BoxRecord {
    fn from(detection: &Detection) -> Self {
        Self {
            class_name: detection.label.clone(),
            bbox: detection.bbox,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadResponse {
    pub image: String,
    pub foods_detected: Vec<String>,
    pub boxes: Vec<BoxRecord>,
    pub nutrition_info: BTreeMap<String, NutritionRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoDetectionResponse {
    pub error: String,
}

impl Default for NoDetectionResponse {
    fn default() -> Self {
        Self {
            error: NO_DETECTION_MESSAGE.to_string(),
        }
    }
}

#[derive(Debug)]
pub enum UploadOutcome {
    Detected(UploadResponse),
    /// Nothing found. Reported to the client as a result, not an error.
    NoDetection,
}

#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("Invalid image: {0}")]
    Decode(#[source] ImageCodecError),
    #[error("Model error: {0}")]
    Model(#[from] ModelError),
    #[error("Failed to encode annotated image: {0}")]
    Encode(#[source] ImageCodecError),
}

/// Distinct class names in order of first appearance.
pub fn distinct_labels(detections: &[Detection]) -> Vec<String> {
    let mut labels: Vec<String> = Vec::new();
    for detection in detections {
        if !labels.contains(&detection.label) {
            labels.push(detection.label.clone());
        }
    }
    labels
}

/// Upload pipeline: decode, detect, annotate, encode.
///
/// Holds no per-request state; one instance is shared by every handler.
pub struct DetectionService<M: ModelService> {
    model_service: M,
    annotator: Annotator,
    nutrition: Option<NutritionClient>,
}

impl<M: ModelService> DetectionService<M> {
    pub fn new(model_service: M, annotator: Annotator) -> Self {
        Self {
            model_service,
            annotator,
            nutrition: None,
        }
    }

    pub fn with_nutrition(mut self, nutrition: NutritionClient) -> Self {
        self.nutrition = Some(nutrition);
        self
    }

    pub async fn process(&self, image_data: &[u8]) -> Result<UploadOutcome, DetectionError> {
        let mut image = image_codec::decode_image(image_data).map_err(DetectionError::Decode)?;
        tracing::debug!(
            "Decoded upload of {} bytes into {}x{} image",
            image_data.len(),
            image.width(),
            image.height()
        );

        let started = Instant::now();
        let detections = self.model_service.predict(&image).await?;
        tracing::debug!(
            "Inference returned {} detections in {} ms",
            detections.len(),
            started.elapsed().as_millis()
        );

        if detections.is_empty() {
            return Ok(UploadOutcome::NoDetection);
        }

        for (i, detection) in detections.iter().enumerate() {
            tracing::debug!(
                "Detection {}: class={}, confidence={:.3}, bbox=({:.1}, {:.1}, {:.1}, {:.1})",
                i,
                detection.label,
                detection.confidence,
                detection.bbox[0],
                detection.bbox[1],
                detection.bbox[2],
                detection.bbox[3]
            );
        }

        self.annotator.annotate(&mut image, &detections);
        let encoded = image_codec::encode_png_base64(&image).map_err(DetectionError::Encode)?;

        let foods_detected = distinct_labels(&detections);
        let nutrition_info = match &self.nutrition {
            Some(client) => client.lookup_many(&foods_detected).await,
            None => BTreeMap::new(),
        };

        Ok(UploadOutcome::Detected(UploadResponse {
            image: encoded,
            foods_detected,
            boxes: detections.iter().map(BoxRecord::from).collect(),
            nutrition_info,
        }))
    }
}
