use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use worker::{CommandTools, HttpCoordinator, Pipeline, PipelineSettings, WorkerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("worker=debug,reqwest=info")),
        )
        .init();

    let config = WorkerConfig::parse();
    let name = config.worker_name();
    info!(
        "worker {} usando coordinador en {}",
        name, config.coordinator_url
    );

    let api = Arc::new(HttpCoordinator::new(config.coordinator_url.clone(), name));
    let tools = Arc::new(CommandTools::new(
        config.upscaler_tool(),
        config.detector_tool(),
        config.applier_tool(),
    ));
    let pipeline = Arc::new(Pipeline::new(api, tools, PipelineSettings::from(&config)));

    let shutdown = pipeline.shutdown_token();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("ctrl-c recibido, apagando");
        shutdown.cancel();
    });

    pipeline.run().await
}
