use crate::config::DetectionServiceConfig;
use axum::body::Bytes;
use reqwest::{multipart, Client};
use serde::Deserialize;
use std::{collections::BTreeMap, time::Duration};
use thiserror::Error;
use tracing::instrument;

#[derive(Error, Debug)]
pub enum DetectionClientError {
    #[error("Failed to build HTTP client: {0}")]
    Client(String),
    #[error("Detection service request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Detection service sent an unreadable reply: {0}")]
    InvalidReply(#[from] serde_json::Error),
}

/// The image as the user uploaded it.
#[derive(Debug, Clone)]
pub struct UploadedImage {
    pub file_name: String,
    pub content_type: String,
    pub data: Bytes,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BoxReply {
    #[serde(rename = "class")]
    pub class_name: String,
    #[serde(rename = "box")]
    pub bbox: [f32; 4],
}

/// Body of a successful upload. A no-detection reply only carries `error`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DetectionReply {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub foods_detected: Vec<String>,
    #[serde(default)]
    pub boxes: Vec<BoxReply>,
    #[serde(default)]
    pub nutrition_info: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub enum DetectionResult {
    Success(DetectionReply),
    /// Non-success status, passed through to the user verbatim.
    Failed { status: u16, body: String },
}

#[derive(Clone)]
pub struct DetectionClient {
    client: Client,
    upload_url: String,
}

impl DetectionClient {
    pub fn new(config: &DetectionServiceConfig) -> Result<Self, DetectionClientError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| DetectionClientError::Client(e.to_string()))?;

        Ok(Self {
            client,
            upload_url: config.upload_url.clone(),
        })
    }

    #[instrument(skip(self, image), fields(file_name = %image.file_name, size = image.data.len()))]
    pub async fn detect(
        &self,
        image: &UploadedImage,
    ) -> Result<DetectionResult, DetectionClientError> {
        let part = multipart::Part::bytes(image.data.to_vec())
            .file_name(image.file_name.clone())
            .mime_str(&image.content_type)?;
        let form = multipart::Form::new().part("file", part);

        let response = self
            .client
            .post(&self.upload_url)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            tracing::warn!("Detection service returned {}", status);
            return Ok(DetectionResult::Failed {
                status: status.as_u16(),
                body,
            });
        }

        let reply: DetectionReply = serde_json::from_str(&body)?;
        tracing::debug!("Detection service found {:?}", reply.foods_detected);
        Ok(DetectionResult::Success(reply))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::{extract::Multipart, http::StatusCode, routing::post, Json, Router};
    use serde_json::{json, Value};
    use tokio::net::TcpListener;

    pub(crate) async fn serve(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}/upload/", addr)
    }

    /// Stands in for the detection service: echoes the uploaded field name
    /// and size back as the detected food.
    pub(crate) async fn fake_upload(mut multipart: Multipart) -> Json<Value> {
        let field = multipart.next_field().await.unwrap().unwrap();
        let name = field.name().unwrap_or_default().to_string();
        let size = field.bytes().await.unwrap().len();
        Json(json!({
            "image": "aW1n",
            "foods_detected": [format!("{}:{}", name, size)],
            "boxes": [{"class": format!("{}:{}", name, size), "box": [1.0, 2.0, 3.0, 4.0]}],
            "nutrition_info": {}
        }))
    }

    pub(crate) fn client(upload_url: String) -> DetectionClient {
        DetectionClient::new(&DetectionServiceConfig {
            upload_url,
            timeout_ms: 5000,
        })
        .unwrap()
    }

    pub(crate) fn uploaded(data: &'static [u8]) -> UploadedImage {
        UploadedImage {
            file_name: "lunch.jpg".into(),
            content_type: "image/jpeg".into(),
            data: Bytes::from_static(data),
        }
    }

    #[tokio::test]
    async fn test_detect_forwards_file_field() {
        let url = serve(Router::new().route("/upload/", post(fake_upload))).await;

        let result = client(url).detect(&uploaded(b"12345")).await.unwrap();

        let DetectionResult::Success(reply) = result else {
            panic!("expected success");
        };
        assert_eq!(reply.foods_detected, vec!["file:5"]);
        assert_eq!(reply.boxes[0].bbox, [1.0, 2.0, 3.0, 4.0]);
        assert_eq!(reply.image.as_deref(), Some("aW1n"));
    }

    #[tokio::test]
    async fn test_detect_reads_no_detection_reply() {
        let router = Router::new().route(
            "/upload/",
            post(|| async { Json(json!({"error": "No food detected"})) }),
        );
        let url = serve(router).await;

        let result = client(url).detect(&uploaded(b"x")).await.unwrap();

        let DetectionResult::Success(reply) = result else {
            panic!("expected success");
        };
        assert!(reply.image.is_none());
        assert!(reply.foods_detected.is_empty());
        assert_eq!(reply.error.as_deref(), Some("No food detected"));
    }

    #[tokio::test]
    async fn test_detect_passes_through_failures() {
        let router = Router::new().route(
            "/upload/",
            post(|| async { (StatusCode::BAD_REQUEST, "{\"error\":\"Invalid image\"}") }),
        );
        let url = serve(router).await;

        let result = client(url).detect(&uploaded(b"x")).await.unwrap();

        match result {
            DetectionResult::Failed { status, body } => {
                assert_eq!(status, 400);
                assert!(body.contains("Invalid image"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_detect_unreachable_service() {
        let result = client("http://127.0.0.1:9/upload/".into())
            .detect(&uploaded(b"x"))
            .await;
        assert!(matches!(result, Err(DetectionClientError::Transport(_))));
    }
}
