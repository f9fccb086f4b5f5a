use crate::{
    config::Config, dispatcher::JobDispatcher, ort_service::OrtModelService,
    reporter::HttpResultReporter, server::HttpServer, telemetry::Metrics,
};
use std::{error::Error, sync::Arc};
use tokio::{signal, sync::broadcast};

pub async fn start_app(config: Config) -> Result<(), Box<dyn Error>> {
    tokio::fs::create_dir_all(&config.models.dir).await?;

    let metrics = Arc::new(Metrics::new()?);

    let reporter = match HttpResultReporter::new(&config.results_service) {
        Ok(reporter) => reporter,
        Err(e) => {
            tracing::error!("Failed to initialize results reporter: {:?}", e);
            return Err(Box::new(e));
        }
    };
    tracing::info!("Reporting job results to {}", reporter.endpoint());

    let model_service = OrtModelService::new(&config.inference);
    let dispatcher = JobDispatcher::new(model_service, reporter, metrics.clone());

    let server = HttpServer::new(dispatcher.clone(), metrics, &config).await?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let server_handle = server.run(shutdown_tx.subscribe()).await?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");

    let _ = shutdown_tx.send(());
    let _ = server_handle.await;

    let running = dispatcher.in_flight();
    if running > 0 {
        tracing::info!("Waiting for {} running jobs to report", running);
    }
    dispatcher.drain().await;
    tracing::info!("All jobs reported, exiting.");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
