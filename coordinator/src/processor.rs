//! Consumidores locales de los carriles.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::{CancelReason, TaskError, TaskId, TaskStatus};

use crate::events::spawn_progress_forwarder;
use crate::lane::Handoff;
use crate::manager::LeaseManager;
use crate::queue::TaskQueue;
use crate::runtime::Runtime;

pub struct LocalProcessor {
    queue: Arc<TaskQueue>,
    manager: Arc<LeaseManager>,
    runtime: Arc<Runtime>,
    debounce: Duration,
    shutdown: CancellationToken,
}

impl LocalProcessor {
    pub fn new(
        queue: Arc<TaskQueue>,
        manager: Arc<LeaseManager>,
        runtime: Arc<Runtime>,
        debounce: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            queue,
            manager,
            runtime,
            debounce,
            shutdown,
        }
    }

    /// Loop del carril standard.
    pub async fn run_standard(self: Arc<Self>, handoff: Handoff) {
        info!("procesador local del carril {} iniciado", handoff.lane());
        loop {
            let id = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                id = handoff.recv() => match id {
                    Some(id) => id,
                    None => break,
                },
            };
            self.process_one(id).await;
        }
        info!("procesador local del carril {} detenido", handoff.lane());
    }

    /// Loop del carril upscale. Los reroutes tienen prioridad; sin `handoff`
    /// (modo sólo remoto) únicamente se atienden reroutes. Lo que llega del
    /// carril sin handler local pero ejecutable en un worker se deja para
    /// el dispatcher remoto.
    pub async fn run_upscale(
        self: Arc<Self>,
        handoff: Option<Handoff>,
        mut reroutes: mpsc::UnboundedReceiver<TaskId>,
    ) {
        info!(
            "procesador local upscale iniciado{}",
            if handoff.is_none() { " (sólo reroutes)" } else { "" }
        );
        loop {
            let next = match &handoff {
                Some(h) => tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => break,
                    id = reroutes.recv() => id.map(|id| (id, false)),
                    id = h.recv() => id.map(|id| (id, true)),
                },
                None => tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    id = reroutes.recv() => id.map(|id| (id, false)),
                },
            };
            match next {
                Some((id, true)) if self.left_for_workers(id).await => {}
                Some((id, _)) => self.process_one(id).await,
                None => break,
            }
        }
        info!("procesador local upscale detenido");
    }

    async fn left_for_workers(&self, id: TaskId) -> bool {
        let kind = match self.queue.get(id).await {
            Ok(Some(r)) => r.kind(),
            _ => return false,
        };
        if !kind.runs_remotely() || self.runtime.registry().get(kind).is_some() {
            return false;
        }
        debug!("tarea {} ({}) sin handler local, queda para los workers", id, kind);
        self.queue.hand_to_workers(id);
        true
    }

    /// Ejecuta una tarea de punta a punta y persiste su estado final.
    pub async fn process_one(&self, id: TaskId) {
        let record = match self.queue.get(id).await {
            Ok(Some(r)) if r.status == TaskStatus::Pending => r,
            Ok(Some(r)) => {
                debug!("tarea {} en {:?}, se saltea", id, r.status);
                return;
            }
            Ok(None) => return,
            Err(e) => {
                warn!("no se pudo leer la tarea {}: {}", id, e);
                return;
            }
        };

        let cancel = self.shutdown.child_token();
        let lease = self.manager.bind_local(id, cancel.clone());
        let record = match self.queue.transition(id, TaskStatus::Processing, None).await {
            Ok(Some(r)) => r,
            Ok(None) => {
                self.manager.release(id, lease.id);
                return;
            }
            Err(e) => {
                warn!("no se pudo marcar Processing la tarea {}: {}", id, e);
                self.manager.release(id, lease.id);
                return;
            }
        };
        info!("procesando tarea {} ({}) localmente", id, record.kind());

        let stop = CancellationToken::new();
        let forwarder = spawn_progress_forwarder(
            self.queue.events().clone(),
            record.clone(),
            lease.progress.subscribe(),
            self.debounce,
            stop.clone(),
        );

        let result = self.runtime.execute(&record, &lease.progress, &cancel).await;

        stop.cancel();
        let _ = forwarder.await;
        self.manager.release(id, lease.id);

        let (status, error) = match result {
            Ok(()) => (TaskStatus::Completed, None),
            Err(TaskError::Cancelled(CancelReason::Shutdown)) => (TaskStatus::Pending, None),
            Err(_) if self.shutdown.is_cancelled() => (TaskStatus::Pending, None),
            Err(TaskError::Cancelled(_)) => (TaskStatus::Canceled, None),
            Err(_) if cancel.is_cancelled() => (TaskStatus::Canceled, None),
            Err(e) => (TaskStatus::Failed, Some(e.to_string())),
        };

        match status {
            TaskStatus::Completed => info!("tarea {} completada", id),
            TaskStatus::Pending => info!("tarea {} interrumpida por apagado, queda Pending", id),
            TaskStatus::Canceled => info!("tarea {} cancelada", id),
            _ => warn!(
                "tarea {} falló: {}",
                id,
                error.as_deref().unwrap_or_default()
            ),
        }

        if let Err(e) = self.queue.transition(id, status, error).await {
            warn!("no se pudo persistir el estado final de la tarea {}: {}", id, e);
        }
    }
}
