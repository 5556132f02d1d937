//! Arranque y apagado de todos los loops del coordinador.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::{CommandUpscaler, ExternalTool, TaskKind, Upscaler};

use crate::collaborators::{ExistingOutput, FileSystem, LocalFileSystem, OutputVerifier};
use crate::config::CoordinatorConfig;
use crate::events::{EventBus, TaskEvent};
use crate::failover::run_sweep_loop;
use crate::lease::LeaseTable;
use crate::manager::{LeaseManager, LeaseSettings};
use crate::processor::LocalProcessor;
use crate::queue::TaskQueue;
use crate::runtime::{CommandHandler, HandlerRegistry, LogHandler, Runtime, UpscaleHandler};
use crate::state::AppState;
use crate::store::TaskStore;

/// Colaboradores externos. `local` usa el disco y el upscaler configurado.
pub struct Collaborators {
    pub upscaler: Arc<dyn Upscaler>,
    pub fs: Arc<dyn FileSystem>,
    pub verifier: Arc<dyn OutputVerifier>,
}

impl Collaborators {
    pub fn local(config: &CoordinatorConfig) -> Self {
        Self {
            upscaler: Arc::new(CommandUpscaler::new(config.upscaler_tool())),
            fs: Arc::new(LocalFileSystem),
            verifier: Arc::new(ExistingOutput),
        }
    }
}

impl From<&CoordinatorConfig> for LeaseSettings {
    fn from(c: &CoordinatorConfig) -> Self {
        LeaseSettings {
            request_timeout: c.request_timeout(),
            stale_after: c.lease_stale(),
            heartbeat_grace: c.heartbeat_grace(),
        }
    }
}

pub fn build_registry(config: &CoordinatorConfig, collab: &Collaborators) -> HandlerRegistry {
    let mut reg = HandlerRegistry::new();
    let upscale = Arc::new(UpscaleHandler::new(
        collab.upscaler.clone(),
        collab.verifier.clone(),
        collab.fs.clone(),
    ));
    reg.register(TaskKind::Upscale, upscale.clone());
    reg.register(TaskKind::RepairUpscale, upscale);
    reg.register(TaskKind::Log, Arc::new(LogHandler));

    for (kind, program) in &config.handlers {
        info!("handler externo para {}: {}", kind, program);
        reg.register(*kind, Arc::new(CommandHandler::new(ExternalTool::new(program))));
    }
    reg
}

pub struct ServiceHandle {
    pub state: AppState,
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl ServiceHandle {
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Cancela todo y espera a que cada loop termine.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for h in self.handles {
            if let Err(e) = h.await {
                warn!("un loop del coordinador terminó con error: {}", e);
            }
        }
        info!("coordinador detenido");
    }
}

/// Reconstruye el estado desde el store y lanza drains, procesadores,
/// dispatcher remoto y sweep.
pub async fn start(
    config: &CoordinatorConfig,
    store: Arc<dyn TaskStore>,
    collab: Collaborators,
) -> Result<ServiceHandle> {
    let shutdown = CancellationToken::new();
    let events = EventBus::default();
    let queue = Arc::new(TaskQueue::new(store, events.clone(), config.keep_completed));
    let manager = Arc::new(LeaseManager::new(
        queue.clone(),
        Arc::new(LeaseTable::new()),
        collab.fs.clone(),
        collab.verifier.clone(),
        LeaseSettings::from(config),
        shutdown.clone(),
    ));

    manager
        .adopt_stranded()
        .await
        .context("adoptando tareas en Processing")?;
    queue
        .replay_pending_or_failed()
        .await
        .context("replay de tareas pendientes")?;

    let uploads_dir = config.uploads_dir();
    collab
        .fs
        .create_dir_all(&uploads_dir)
        .await
        .with_context(|| format!("creando {}", uploads_dir.display()))?;

    let runtime = Arc::new(Runtime::new(Arc::new(build_registry(config, &collab))));
    let drains = queue.spawn_drain_loops(&shutdown);
    let reroutes = queue
        .take_reroute_receiver()
        .context("el canal de reroute ya tiene lector")?;

    let processor = Arc::new(LocalProcessor::new(
        queue.clone(),
        manager.clone(),
        runtime,
        config.ui_debounce(),
        shutdown.clone(),
    ));

    let mut handles = drains.handles;
    handles.push(tokio::spawn(
        processor.clone().run_standard(drains.standard),
    ));
    let local_upscale = (!config.remote_only).then(|| drains.upscale.clone());
    handles.push(tokio::spawn(
        processor.run_upscale(local_upscale, reroutes),
    ));
    handles.push(tokio::spawn(
        manager
            .clone()
            .run_dispatch(drains.upscale, shutdown.clone()),
    ));
    handles.push(tokio::spawn(run_sweep_loop(
        manager.clone(),
        config.sweep_interval(),
        shutdown.clone(),
    )));
    handles.push(tokio::spawn(log_events(events, shutdown.clone())));

    info!(
        "coordinador listo (sólo remoto: {}, timeout de pedido: {:?})",
        config.remote_only,
        config.request_timeout()
    );

    Ok(ServiceHandle {
        state: AppState {
            queue,
            manager,
            fs: collab.fs,
            uploads_dir,
        },
        shutdown,
        handles,
    })
}

async fn log_events(events: EventBus, shutdown: CancellationToken) {
    let mut rx = events.subscribe();
    loop {
        let ev = tokio::select! {
            _ = shutdown.cancelled() => break,
            ev = rx.recv() => ev,
        };
        match ev {
            Ok(TaskEvent::Enqueued(t)) => debug!("evento: encolada {}", t.id),
            Ok(TaskEvent::StatusChanged { task, progress }) => match progress {
                Some(p) => debug!(
                    "evento: {} {:?} {}/{} {}",
                    task.id,
                    task.status,
                    p.current.unwrap_or(0),
                    p.total.unwrap_or(0),
                    p.status_message
                ),
                None => debug!("evento: {} -> {:?}", task.id, task.status),
            },
            Ok(TaskEvent::Removed(t)) => debug!("evento: eliminada {}", t.id),
            Err(RecvError::Lagged(n)) => debug!("log de eventos atrasado, {} perdidos", n),
            Err(RecvError::Closed) => break,
        }
    }
}
