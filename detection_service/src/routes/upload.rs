use crate::{
    detection::{DetectionError, NoDetectionResponse, UploadOutcome},
    model_service::ModelService,
    server::SharedState,
};
use axum::{
    body::Bytes,
    extract::{multipart::MultipartError, Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::time::Instant;
use thiserror::Error;
use tracing::instrument;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Malformed multipart body: {message}")]
    Multipart { status: StatusCode, message: String },
    #[error("No image file in request, expected form field `{0}`")]
    MissingFile(String),
    #[error("Unsupported content type `{0}`, expected an image")]
    UnsupportedMediaType(String),
    #[error("Upload of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },
    #[error(transparent)]
    Detection(#[from] DetectionError),
}

impl From<MultipartError> for UploadError {
    fn from(err: MultipartError) -> Self {
        UploadError::Multipart {
            status: err.status(),
            message: err.body_text(),
        }
    }
}

impl UploadError {
    pub fn status(&self) -> StatusCode {
        match self {
            UploadError::Multipart { status, .. } => *status,
            UploadError::MissingFile(_) => StatusCode::BAD_REQUEST,
            UploadError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            UploadError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            UploadError::Detection(DetectionError::Decode(_)) => StatusCode::BAD_REQUEST,
            UploadError::Detection(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn outcome(&self) -> &'static str {
        if self.status().is_server_error() {
            "failed"
        } else {
            "rejected"
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error = if status.is_server_error() {
            tracing::error!("Upload failed: {}", self);
            "Internal error while processing the image".to_string()
        } else {
            tracing::warn!("Upload rejected: {}", self);
            self.to_string()
        };
        (status, Json(ErrorBody { error })).into_response()
    }
}

fn is_accepted_content_type(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    essence.starts_with("image/") || essence == "application/octet-stream"
}

/// Pulls the image out of the form: the first field named `field_name` or
/// carrying a file name.
async fn read_image_field(
    multipart: &mut Multipart,
    field_name: &str,
    max_bytes: usize,
) -> Result<Bytes, UploadError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(field_name) && field.file_name().is_none() {
            continue;
        }

        if let Some(content_type) = field.content_type() {
            if !is_accepted_content_type(content_type) {
                return Err(UploadError::UnsupportedMediaType(content_type.to_string()));
            }
        }

        let data = field.bytes().await?;
        if data.len() > max_bytes {
            return Err(UploadError::TooLarge {
                size: data.len(),
                max: max_bytes,
            });
        }
        return Ok(data);
    }

    Err(UploadError::MissingFile(field_name.to_string()))
}

#[instrument(skip(state, multipart))]
pub async fn upload_image<M: ModelService>(
    State(state): State<SharedState<M>>,
    mut multipart: Multipart,
) -> Result<Response, UploadError> {
    let started = Instant::now();

    let result = async {
        let image_data =
            read_image_field(&mut multipart, &state.upload.field_name, state.upload.max_bytes)
                .await?;
        Ok::<_, UploadError>(state.detection_service.process(&image_data).await?)
    }
    .await;

    state
        .metrics
        .record_processing_duration(started.elapsed().as_millis() as u64);

    match result {
        Ok(UploadOutcome::Detected(response)) => {
            state.metrics.record_upload("detected");
            let classes: Vec<String> = response
                .boxes
                .iter()
                .map(|record| record.class_name.clone())
                .collect();
            state.metrics.record_detections(&classes);
            tracing::info!(
                "Detected {} objects ({})",
                response.boxes.len(),
                response.foods_detected.join(", ")
            );
            Ok(Json(response).into_response())
        }
        Ok(UploadOutcome::NoDetection) => {
            state.metrics.record_upload("no_detection");
            tracing::info!("No objects detected");
            Ok(Json(NoDetectionResponse::default()).into_response())
        }
        Err(e) => {
            state.metrics.record_upload(e.outcome());
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        annotate::Annotator,
        config::UploadConfig,
        detection::{
            tests::{detection, png_bytes, MockModelService},
            DetectionService,
        },
        server::{build_router, SharedState},
        telemetry::Metrics,
    };
    use axum::{
        body::{to_bytes, Body},
        http::{header, Request, StatusCode},
    };
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    const BOUNDARY: &str = "food-detection-test-boundary";

    fn router(detections: Vec<crate::detection::Detection>, max_bytes: usize) -> axum::Router {
        let detection_service = DetectionService::new(
            MockModelService { detections },
            Annotator::new(&Default::default()).unwrap(),
        );
        build_router(SharedState {
            detection_service: Arc::new(detection_service),
            metrics: Arc::new(Metrics::new().unwrap()),
            upload: UploadConfig {
                max_bytes,
                ..Default::default()
            },
        })
    }

    fn multipart_request(
        field: &str,
        filename: Option<&str>,
        content_type: &str,
        data: &[u8],
    ) -> Request<Body> {
        let disposition = match filename {
            Some(filename) => format!("form-data; name=\"{}\"; filename=\"{}\"", field, filename),
            None => format!("form-data; name=\"{}\"", field),
        };
        let mut body = format!(
            "--{}\r\nContent-Disposition: {}\r\nContent-Type: {}\r\n\r\n",
            BOUNDARY, disposition, content_type
        )
        .into_bytes();
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());

        Request::builder()
            .method("POST")
            .uri("/upload/")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn send(router: axum::Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_upload_returns_annotated_payload() {
        let detections = vec![
            detection("apple", [5., 5., 40., 40.]),
            detection("apple", [50., 10., 90., 60.]),
        ];
        let request = multipart_request("file", Some("meal.png"), "image/png", &png_bytes(120, 80));

        let (status, body) = send(router(detections, 1 << 20), request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["foods_detected"], json!(["apple"]));
        assert_eq!(body["boxes"].as_array().unwrap().len(), 2);
        assert_eq!(body["boxes"][1], json!({"class": "apple", "box": [50.0, 10.0, 90.0, 60.0]}));
        assert_eq!(body["nutrition_info"], json!({}));
        assert!(body["image"].as_str().unwrap().len() > 100);
    }

    #[tokio::test]
    async fn test_upload_without_detections() {
        let request = multipart_request("file", Some("empty.png"), "image/png", &png_bytes(32, 32));

        let (status, body) = send(router(vec![], 1 << 20), request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"error": "No food detected"}));
    }

    #[tokio::test]
    async fn test_non_image_bytes_are_client_error() {
        let request = multipart_request(
            "file",
            Some("notes.png"),
            "image/png",
            b"these bytes are not an image",
        );

        let (status, body) = send(router(vec![detection("apple", [0., 0., 1., 1.])], 1 << 20), request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().starts_with("Invalid image"));
    }

    #[tokio::test]
    async fn test_rejects_non_image_content_type() {
        let request = multipart_request("file", Some("notes.txt"), "text/plain", b"hello");

        let (status, _) = send(router(vec![], 1 << 20), request).await;

        assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn test_missing_file_field() {
        let request = multipart_request("comment", None, "text/plain", b"hello");

        let (status, body) = send(router(vec![], 1 << 20), request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("`file`"));
    }

    #[tokio::test]
    async fn test_rejects_oversized_upload() {
        let request = multipart_request("file", Some("big.png"), "image/png", &vec![0u8; 5000]);

        let (status, _) = send(router(vec![], 1024), request).await;

        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_healthcheck() {
        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();

        let (status, body) = send(router(vec![], 1024), request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "Available");
    }

    #[test]
    fn test_accepted_content_types() {
        assert!(super::is_accepted_content_type("image/jpeg"));
        assert!(super::is_accepted_content_type("IMAGE/PNG; charset=binary"));
        assert!(super::is_accepted_content_type("application/octet-stream"));
        assert!(!super::is_accepted_content_type("text/html"));
    }
}
