use crate::config::{ModelConfig, Validatable};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt};

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("Model file {0:?} is missing and no download url is configured")]
    MissingModel(PathBuf),
    #[error("Model download failed: {0}")]
    Download(#[from] reqwest::Error),
    #[error("Model download from {url} returned status {status}")]
    Status { url: String, status: u16 },
    #[error("Failed to write model file: {0}")]
    Io(#[from] std::io::Error),
}

/// Makes sure the configured model file exists, downloading it on first run.
pub async fn ensure_model(config: &ModelConfig) -> Result<PathBuf, BootstrapError> {
    let path = config.get_path();
    if path.exists() {
        return Ok(path);
    }

    let Some(url) = config.download_url.as_deref() else {
        return Err(BootstrapError::MissingModel(path));
    };

    tracing::info!("Model file {:?} not found, downloading from {}", path, url);
    let written = download_to(url, &path).await?;
    tracing::info!("Downloaded {} bytes to {:?}", written, path);

    Ok(path)
}

/// Streams `url` into `<path>.part` and renames it into place once complete,
/// so an interrupted download never leaves a truncated model behind.
pub async fn download_to(url: &str, path: &Path) -> Result<u64, BootstrapError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let response = reqwest::get(url).await?;
    let status = response.status();
    if !status.is_success() {
        return Err(BootstrapError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }

    let mut partial = path.as_os_str().to_owned();
    partial.push(".part");
    let partial = PathBuf::from(partial);

    let result = async {
        let mut file = fs::File::create(&partial).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        Ok::<_, BootstrapError>(written)
    }
    .await;

    match result {
        Ok(written) => {
            fs::rename(&partial, path).await?;
            Ok(written)
        }
        Err(e) => {
            let _ = fs::remove_file(&partial).await;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::get, Router};
    use tokio::net::TcpListener;

    async fn serve(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn model_config(dir: &Path, download_url: Option<String>) -> ModelConfig {
        ModelConfig {
            onnx_file: "weights.onnx".into(),
            model_dir: dir.join("models"),
            download_url,
            num_instances: 1,
            min_probability: 0.25,
            iou_threshold: 0.7,
            input_size: 640,
        }
    }

    #[tokio::test]
    async fn test_missing_model_without_url() {
        let dir = tempfile::tempdir().unwrap();
        let result = ensure_model(&model_config(dir.path(), None)).await;
        assert!(matches!(result, Err(BootstrapError::MissingModel(_))));
    }

    #[tokio::test]
    async fn test_downloads_missing_model_once() {
        let dir = tempfile::tempdir().unwrap();
        let base = serve(Router::new().route("/weights.onnx", get(|| async { vec![7u8; 4096] }))).await;
        let config = model_config(dir.path(), Some(format!("{}/weights.onnx", base)));

        let path = ensure_model(&config).await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), vec![7u8; 4096]);
        assert!(!dir.path().join("models/weights.onnx.part").exists());

        // Present on disk: no second request is made.
        let offline = model_config(dir.path(), Some("http://127.0.0.1:9/unreachable".into()));
        assert_eq!(ensure_model(&offline).await.unwrap(), path);
    }

    #[tokio::test]
    async fn test_failed_download_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let base = serve(Router::new().route(
            "/weights.onnx",
            get(|| async { (StatusCode::NOT_FOUND, "gone") }),
        ))
        .await;
        let config = model_config(dir.path(), Some(format!("{}/weights.onnx", base)));

        let result = ensure_model(&config).await;

        assert!(matches!(result, Err(BootstrapError::Status { status: 404, .. })));
        assert!(!config.get_path().exists());
    }
}
