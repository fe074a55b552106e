use crate::{
    detection_client::{DetectionClientError, UploadedImage},
    render::{render_failure, render_result},
    server::SharedState,
};
use axum::{
    extract::{multipart::MultipartError, Multipart, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
};
use thiserror::Error;
use tracing::instrument;

const FILE_FIELD: &str = "file";

#[derive(Error, Debug)]
pub enum UiError {
    #[error("Could not read the upload form: {message}")]
    Multipart { status: StatusCode, message: String },
    #[error("Please choose an image to upload.")]
    MissingFile,
    #[error("Only JPG and PNG images are supported, got `{0}`.")]
    UnsupportedImage(String),
    #[error("The image is {size} bytes, the limit is {max} bytes.")]
    TooLarge { size: usize, max: usize },
    #[error("Could not reach the detection service: {0}")]
    DetectionService(#[from] DetectionClientError),
}

impl From<MultipartError> for UiError {
    fn from(err: MultipartError) -> Self {
        UiError::Multipart {
            status: err.status(),
            message: err.body_text(),
        }
    }
}

impl UiError {
    pub fn status(&self) -> StatusCode {
        match self {
            UiError::Multipart { status, .. } => *status,
            UiError::MissingFile => StatusCode::BAD_REQUEST,
            UiError::UnsupportedImage(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            UiError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            UiError::DetectionService(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for UiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Detection request failed: {}", self);
        } else {
            tracing::warn!("Upload rejected: {}", self);
        }
        (status, Html(render_failure(&self.to_string()))).into_response()
    }
}

/// Resolves the image type from the part header, falling back to the file
/// extension when the browser sent a generic type.
fn image_content_type(declared: Option<&str>, file_name: &str) -> Option<&'static str> {
    let declared = declared
        .and_then(|value| value.split(';').next())
        .map(|value| value.trim().to_ascii_lowercase());

    match declared.as_deref() {
        Some("image/jpeg") | Some("image/jpg") => return Some("image/jpeg"),
        Some("image/png") => return Some("image/png"),
        Some("application/octet-stream") | Some("") | None => {}
        Some(_) => return None,
    }

    let extension = file_name.rsplit_once('.')?.1.to_ascii_lowercase();
    match extension.as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        _ => None,
    }
}

async fn read_upload(multipart: &mut Multipart, max_bytes: usize) -> Result<UploadedImage, UiError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }

        let file_name = field.file_name().unwrap_or_default().to_string();
        let declared = field.content_type().map(str::to_string);
        let data = field.bytes().await?;
        if data.is_empty() && file_name.is_empty() {
            return Err(UiError::MissingFile);
        }

        let content_type = image_content_type(declared.as_deref(), &file_name).ok_or_else(|| {
            UiError::UnsupportedImage(declared.clone().unwrap_or_else(|| file_name.clone()))
        })?;

        if data.len() > max_bytes {
            return Err(UiError::TooLarge {
                size: data.len(),
                max: max_bytes,
            });
        }

        return Ok(UploadedImage {
            file_name,
            content_type: content_type.to_string(),
            data,
        });
    }

    Err(UiError::MissingFile)
}

#[instrument(skip(state, multipart))]
pub async fn detect(
    State(state): State<SharedState>,
    mut multipart: Multipart,
) -> Result<Html<String>, UiError> {
    let upload = read_upload(&mut multipart, state.upload.max_bytes).await?;
    tracing::info!("Forwarding {} ({} bytes)", upload.file_name, upload.data.len());

    let result = state.detection_client.detect(&upload).await?;

    Ok(Html(render_result(&upload, &result)))
}
