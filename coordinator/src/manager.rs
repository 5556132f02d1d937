//! Reparto de tareas del carril upscale a workers remotos, con leases,
//! heartbeats y recuperación de leases muertas.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::protocol::{
    DetectionResultRequest, KeepAliveRequest, KeepAliveResponse, LeaseInfo, RequestTaskRequest,
};
use common::{
    LeaseId, TaskAssignment, TaskError, TaskId, TaskPayload, TaskRecord, TaskStatus,
};

use crate::collaborators::{FileSystem, OutputVerifier};
use crate::events::TaskEvent;
use crate::lane::Handoff;
use crate::lease::{Lease, LeaseOwner, LeaseTable, Touch};
use crate::queue::TaskQueue;

#[derive(Debug, Clone, Copy)]
pub struct LeaseSettings {
    pub request_timeout: Duration,
    pub stale_after: Duration,
    pub heartbeat_grace: Duration,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            stale_after: Duration::from_secs(60),
            heartbeat_grace: Duration::from_secs(5),
        }
    }
}

struct PendingRequest {
    worker: String,
    prefetch: bool,
    reply: oneshot::Sender<TaskAssignment>,
}

enum Bind {
    Sent,
    RequesterGone,
    /// La tarea no se pudo entregar; el pedido sigue esperando.
    Skipped(PendingRequest),
}

pub struct LeaseManager {
    queue: Arc<TaskQueue>,
    leases: Arc<LeaseTable>,
    fs: Arc<dyn FileSystem>,
    verifier: Arc<dyn OutputVerifier>,
    settings: LeaseSettings,
    requests_tx: mpsc::Sender<PendingRequest>,
    requests_rx: Mutex<Option<mpsc::Receiver<PendingRequest>>>,
    shutdown: CancellationToken,
}

impl LeaseManager {
    pub fn new(
        queue: Arc<TaskQueue>,
        leases: Arc<LeaseTable>,
        fs: Arc<dyn FileSystem>,
        verifier: Arc<dyn OutputVerifier>,
        settings: LeaseSettings,
        shutdown: CancellationToken,
    ) -> Self {
        let (requests_tx, requests_rx) = mpsc::channel(64);
        Self {
            queue,
            leases,
            fs,
            verifier,
            settings,
            requests_tx,
            requests_rx: Mutex::new(Some(requests_rx)),
            shutdown,
        }
    }

    pub fn leases(&self) -> &Arc<LeaseTable> {
        &self.leases
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn settings(&self) -> LeaseSettings {
        self.settings
    }

    /// Espera hasta `request_timeout` a que haya una tarea para este worker.
    /// Sin trabajo devuelve `NotFound`; apagándose, `Unavailable`.
    pub async fn request_task(&self, req: RequestTaskRequest) -> Result<TaskAssignment, TaskError> {
        if self.shutdown.is_cancelled() {
            return Err(TaskError::Unavailable("coordinador apagándose".into()));
        }

        let (reply, rx) = oneshot::channel();
        let pending = PendingRequest {
            worker: req.worker.unwrap_or_else(|| "remote".to_string()),
            prefetch: req.prefetch,
            reply,
        };
        self.requests_tx
            .send(pending)
            .await
            .map_err(|_| TaskError::Unavailable("dispatcher detenido".into()))?;

        match tokio::time::timeout(self.settings.request_timeout, rx).await {
            Ok(Ok(assignment)) => Ok(assignment),
            Ok(Err(_)) if self.shutdown.is_cancelled() => {
                Err(TaskError::Unavailable("coordinador apagándose".into()))
            }
            Ok(Err(_)) | Err(_) => Err(TaskError::NotFound),
        }
    }

    /// Loop de despacho: atiende pedidos de a uno, en orden de llegada,
    /// leyendo el canal de entrega del carril upscale sólo mientras hay
    /// alguien esperando. Las tareas que el procesador local dejó para los
    /// workers van primero.
    pub async fn run_dispatch(self: Arc<Self>, handoff: Handoff, shutdown: CancellationToken) {
        let Some(mut requests) = self
            .requests_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            warn!("run_dispatch ya estaba corriendo");
            return;
        };
        let mut handed = self.queue.take_remote_receiver();
        info!("dispatcher remoto iniciado");

        'requests: loop {
            let mut req = tokio::select! {
                _ = shutdown.cancelled() => break,
                req = requests.recv() => match req {
                    Some(req) => req,
                    None => break,
                },
            };

            loop {
                let id = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break 'requests,
                    _ = req.reply.closed() => {
                        debug!("worker {} dejó de esperar", req.worker);
                        continue 'requests;
                    }
                    Some(id) = recv_handed(&mut handed) => id,
                    id = handoff.recv() => match id {
                        Some(id) => id,
                        None => break 'requests,
                    },
                };

                let Some(record) = self.vet(id).await else {
                    continue;
                };

                match self.bind(record, req).await {
                    Bind::Sent | Bind::RequesterGone => continue 'requests,
                    Bind::Skipped(back) => req = back,
                }
            }
        }
        info!("dispatcher remoto detenido");
    }

    /// Re-lee la tarea y decide si se puede entregar a un worker.
    async fn vet(&self, id: TaskId) -> Option<TaskRecord> {
        let record = match self.queue.get(id).await {
            Ok(Some(r)) => r,
            Ok(None) => {
                debug!("tarea {} ya no existe, se saltea", id);
                return None;
            }
            Err(e) => {
                warn!("no se pudo leer la tarea {}: {}", id, e);
                return None;
            }
        };
        if record.status != TaskStatus::Pending {
            debug!("tarea {} en {:?}, se saltea", id, record.status);
            return None;
        }

        match &record.payload {
            TaskPayload::Upscale(t) => {
                if !self.fs.exists(&t.source_path).await {
                    warn!(
                        "tarea {}: no existe {}, se marca Failed",
                        id,
                        t.source_path.display()
                    );
                    let msg = format!("archivo fuente inexistente: {}", t.source_path.display());
                    self.persist(id, TaskStatus::Failed, Some(msg)).await;
                    return None;
                }
                if self.verifier.is_valid(&t.source_path, &t.output_path).await {
                    info!("tarea {}: la salida ya es válida, se completa sin trabajo", id);
                    self.persist(id, TaskStatus::Completed, None).await;
                    return None;
                }
                Some(record)
            }
            p if !p.kind().runs_remotely() => {
                debug!("tarea {} ({}) se desvía al procesador local", id, p.kind());
                self.queue.reroute(id);
                None
            }
            _ => Some(record),
        }
    }

    async fn bind(&self, record: TaskRecord, req: PendingRequest) -> Bind {
        let id = record.id;
        let lease = Lease::new(
            id,
            LeaseOwner::Remote {
                worker: req.worker.clone(),
            },
            Instant::now() + self.settings.heartbeat_grace,
        );
        let lease_id = lease.id;
        self.leases.insert(lease);

        let record = match self.queue.transition(id, TaskStatus::Processing, None).await {
            Ok(Some(r)) => r,
            Ok(None) => {
                self.leases.remove(id, lease_id);
                return Bind::Skipped(req);
            }
            Err(e) => {
                warn!("no se pudo marcar Processing la tarea {}: {}", id, e);
                self.leases.remove(id, lease_id);
                self.queue.lane(record.lane()).insert(id, record.order);
                return Bind::Skipped(req);
            }
        };

        let assignment = TaskAssignment::from_payload(id, lease_id, &record.payload);
        let worker = req.worker;
        if req.reply.send(assignment).is_err() {
            debug!("worker {} se fue antes de recibir la tarea {}", worker, id);
            self.leases.remove(id, lease_id);
            if let Err(e) = self.queue.retry(id).await {
                warn!("no se pudo reencolar la tarea {}: {}", id, e);
            }
            return Bind::RequesterGone;
        }

        info!(
            "tarea {} ({}) asignada a {} con lease {}{}",
            id,
            record.kind(),
            worker,
            lease_id,
            if req.prefetch { " (prefetch)" } else { "" }
        );
        Bind::Sent
    }

    async fn persist(&self, id: TaskId, status: TaskStatus, error: Option<String>) {
        if let Err(e) = self.queue.transition(id, status, error).await {
            warn!("no se pudo persistir {:?} para la tarea {}: {}", status, id, e);
        }
    }

    /// Lease local para un procesador del mismo proceso.
    pub fn bind_local(&self, task_id: TaskId, cancel: CancellationToken) -> Lease {
        let lease = Lease::new(task_id, LeaseOwner::Local, Instant::now()).with_cancel(cancel);
        self.leases.insert(lease.clone());
        lease
    }

    pub fn release(&self, task_id: TaskId, lease_id: LeaseId) {
        self.leases.remove(task_id, lease_id);
    }

    /* --------- RPC de workers --------- */

    pub async fn keep_alive(&self, req: KeepAliveRequest) -> KeepAliveResponse {
        let touch = self
            .leases
            .touch(req.task_id, req.lease_id, &req.progress, Instant::now());
        if req.prefetch {
            debug!("tarea {}: el worker anticipa su próximo pedido", req.task_id);
        }

        match touch {
            Touch::Alive => {
                if !req.progress.is_empty() {
                    if let (Ok(Some(task)), Some(lease)) =
                        (self.queue.get(req.task_id).await, self.leases.get(req.task_id))
                    {
                        self.queue.events().emit(TaskEvent::StatusChanged {
                            task,
                            progress: Some(lease.progress.snapshot()),
                        });
                    }
                }
                KeepAliveResponse { is_alive: true }
            }
            Touch::Canceled | Touch::Unknown => {
                debug!("keep-alive de la tarea {} sin lease vigente", req.task_id);
                KeepAliveResponse { is_alive: false }
            }
        }
    }

    /// Cierra la lease y marca Completed.
    pub async fn complete(
        &self,
        task_id: TaskId,
        lease_id: LeaseId,
    ) -> Result<TaskRecord, TaskError> {
        self.leases
            .remove(task_id, lease_id)
            .ok_or(TaskError::StaleLease(task_id))?;
        self.finish(task_id, TaskStatus::Completed, None).await
    }

    /// Cierra la lease y marca Failed. Una lease que ya no es la vigente se ignora.
    pub async fn fail(
        &self,
        task_id: TaskId,
        lease_id: LeaseId,
        message: String,
    ) -> Result<TaskRecord, TaskError> {
        self.leases
            .remove(task_id, lease_id)
            .ok_or(TaskError::StaleLease(task_id))?;
        warn!("tarea {} falló: {}", task_id, message);
        self.finish(task_id, TaskStatus::Failed, Some(message)).await
    }

    async fn finish(
        &self,
        task_id: TaskId,
        status: TaskStatus,
        error: Option<String>,
    ) -> Result<TaskRecord, TaskError> {
        self.queue
            .transition(task_id, status, error)
            .await
            .map_err(TaskError::execution)?
            .ok_or(TaskError::NotFound)
    }

    /// La lease sigue vigente y la tarea sigue en Processing.
    async fn check_result(
        &self,
        task_id: TaskId,
        lease_id: LeaseId,
    ) -> Result<TaskRecord, TaskError> {
        if !self.leases.matches(task_id, lease_id) {
            return Err(TaskError::StaleLease(task_id));
        }
        let record = self
            .queue
            .get(task_id)
            .await
            .map_err(TaskError::execution)?
            .ok_or(TaskError::NotFound)?;
        if record.status != TaskStatus::Processing {
            return Err(TaskError::StaleLease(task_id));
        }
        Ok(record)
    }

    /// Como `check_result`, pero además toma la lease.
    async fn claim_for_result(
        &self,
        task_id: TaskId,
        lease_id: LeaseId,
    ) -> Result<TaskRecord, TaskError> {
        let record = self.check_result(task_id, lease_id).await?;
        // desde acá el sweep ya no la ve
        self.leases
            .remove(task_id, lease_id)
            .ok_or(TaskError::StaleLease(task_id))?;
        Ok(record)
    }

    /// Ubica un resultado subido en la salida de la tarea y la completa.
    /// `staged` se borra si la subida ya no corresponde.
    pub async fn finish_upload(
        &self,
        task_id: TaskId,
        lease_id: LeaseId,
        staged: &Path,
    ) -> Result<TaskRecord, TaskError> {
        let record = match self.claim_for_result(task_id, lease_id).await {
            Ok(r) => r,
            Err(e) => {
                warn!("subida rechazada para la tarea {}: {}", task_id, e);
                let _ = self.fs.remove_file(staged).await;
                return Err(e);
            }
        };

        let Some(output) = record.payload.output_path() else {
            let _ = self.fs.remove_file(staged).await;
            let msg = format!("{} no produce archivo", record.kind());
            self.persist(task_id, TaskStatus::Failed, Some(msg.clone()))
                .await;
            return Err(TaskError::Execution(msg));
        };

        if let Err(e) = self.fs.move_file(staged, output).await {
            let msg = format!("no se pudo mover el resultado a {}: {e}", output.display());
            let _ = self.fs.remove_file(staged).await;
            self.persist(task_id, TaskStatus::Failed, Some(msg.clone()))
                .await;
            return Err(TaskError::Execution(msg));
        }

        info!("tarea {} completada, resultado en {}", task_id, output.display());
        self.finish(task_id, TaskStatus::Completed, None).await
    }

    /// Guarda los hallazgos de una detección y la completa.
    pub async fn complete_detection(
        &self,
        req: DetectionResultRequest,
    ) -> Result<TaskRecord, TaskError> {
        let mut record = self.check_result(req.task_id, req.lease_id).await?;
        let TaskPayload::DetectSplits(detect) = &mut record.payload else {
            let msg = format!("{} no acepta resultados de detección", record.kind());
            self.fail(req.task_id, req.lease_id, msg.clone()).await?;
            return Err(TaskError::Execution(msg));
        };
        detect.findings = Some(req.result_json);

        self.queue
            .store()
            .update(&record)
            .await
            .map_err(TaskError::execution)?;
        info!("tarea {}: detección recibida", req.task_id);
        self.complete(req.task_id, req.lease_id).await
    }

    /// Cancela la tarea sólo si la lease vigente coincide. Para una tarea
    /// sin lease no hace nada.
    pub async fn cancel(&self, task_id: TaskId, lease_id: Option<LeaseId>) -> bool {
        let Some(lease) = self.leases.cancel(task_id, lease_id) else {
            debug!("cancel de la tarea {} sin lease vigente, se ignora", task_id);
            return false;
        };
        info!("tarea {} cancelada (lease {})", task_id, lease.id);

        // la lease remota se descarta; el próximo keep-alive del worker recibe false
        if lease.owner != LeaseOwner::Local {
            self.leases.remove(task_id, lease.id);
        }
        self.persist(task_id, TaskStatus::Canceled, None).await;
        true
    }

    /* --------- recuperación --------- */

    /// Una pasada del sweep. Devuelve cuántas tareas se reencolaron.
    pub async fn sweep_once(&self, now: Instant) -> usize {
        let expired = self.leases.take_expired(now, self.settings.stale_after);
        let mut requeued = 0;

        for lease in expired {
            lease.cancel.cancel();
            let id = lease.task_id;
            match self.queue.get(id).await {
                Ok(Some(r)) if matches!(r.status, TaskStatus::Completed | TaskStatus::Canceled) => {
                    debug!("lease muerta de la tarea {} ya finalizada, se descarta", id);
                }
                Ok(Some(_)) => {
                    warn!(
                        "lease {} de la tarea {} sin heartbeat, se reencola",
                        lease.id, id
                    );
                    match self.queue.retry(id).await {
                        Ok(_) => requeued += 1,
                        Err(e) => warn!("no se pudo reencolar la tarea {}: {}", id, e),
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("sweep: no se pudo leer la tarea {}: {}", id, e),
            }
        }
        requeued
    }

    /// Al arrancar, cada tarea en Processing recibe una lease adoptada: o la
    /// reclama su worker con un heartbeat o el sweep la reencola.
    pub async fn adopt_stranded(&self) -> Result<usize, TaskError> {
        let stranded = self
            .queue
            .store()
            .list_by_status(TaskStatus::Processing)
            .await
            .map_err(TaskError::execution)?;
        let now = Instant::now();
        for r in &stranded {
            self.leases
                .insert(Lease::new(r.id, LeaseOwner::Adopted, now));
        }
        if !stranded.is_empty() {
            info!("{} tareas en Processing adoptadas al arrancar", stranded.len());
        }
        Ok(stranded.len())
    }

    pub fn list_leases(&self) -> Vec<LeaseInfo> {
        self.leases.list(Instant::now())
    }
}

async fn recv_handed(rx: &mut Option<mpsc::UnboundedReceiver<TaskId>>) -> Option<TaskId> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
