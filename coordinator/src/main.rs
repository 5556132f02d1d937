use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use coordinator::handlers::build_router;
use coordinator::store::MemoryStore;
use coordinator::{start, Collaborators, CoordinatorConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("coordinator=debug,tower_http=info")),
        )
        .init();

    let config = CoordinatorConfig::parse();

    let store = MemoryStore::open(config.snapshot_path())
        .await
        .with_context(|| format!("abriendo {}", config.snapshot_path().display()))?;
    let handle = start(&config, Arc::new(store), Collaborators::local(&config)).await?;

    // router HTTP
    let app = build_router(handle.state.clone());

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("no se pudo escuchar en {}", config.listen))?;
    info!("coordinador escuchando en {}", listener.local_addr()?);

    let shutdown = handle.shutdown_token();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("ctrl-c recibido, apagando");
            shutdown.cancel();
        })
        .await?;

    handle.shutdown_and_join().await;
    Ok(())
}
