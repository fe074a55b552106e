use crate::config::Config;
use crate::detection_client::DetectionClient;
use crate::server::HttpServer;

use std::error::Error;
use tokio::signal;

pub async fn start_app(config: Config) -> Result<(), Box<dyn Error>> {
    let detection_client = match DetectionClient::new(&config.detection_service) {
        Ok(client) => client,
        Err(e) => {
            tracing::error!("Failed to initialize detection client: {:?}", e);
            return Err(Box::new(e));
        }
    };
    tracing::info!(
        "Forwarding uploads to {}",
        config.detection_service.upload_url
    );

    let server = HttpServer::new(detection_client, &config).await?;
    server
        .run(async {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received, starting graceful shutdown.");
        })
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
