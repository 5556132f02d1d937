//! Cola ordenada de tareas: persiste en el store y reparte en dos carriles.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::{Lane, TaskId, TaskPayload, TaskRecord, TaskStatus};

use crate::events::{EventBus, TaskEvent};
use crate::lane::{handoff_channel, run_drain, Handoff, OrderedLane};
use crate::store::{StoreError, StoreResult, TaskStore};

pub struct TaskQueue {
    store: Arc<dyn TaskStore>,
    standard: Arc<OrderedLane>,
    upscale: Arc<OrderedLane>,
    events: EventBus,
    reroute_tx: mpsc::UnboundedSender<TaskId>,
    reroute_rx: Mutex<Option<mpsc::UnboundedReceiver<TaskId>>>,
    remote_tx: mpsc::UnboundedSender<TaskId>,
    remote_rx: Mutex<Option<mpsc::UnboundedReceiver<TaskId>>>,
    keep_completed: usize,
}

/// Consumidores de los dos carriles más los drains que los alimentan.
pub struct DrainLoops {
    pub standard: Handoff,
    pub upscale: Handoff,
    pub handles: Vec<JoinHandle<()>>,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn TaskStore>, events: EventBus, keep_completed: usize) -> Self {
        let (reroute_tx, reroute_rx) = mpsc::unbounded_channel();
        let (remote_tx, remote_rx) = mpsc::unbounded_channel();
        Self {
            store,
            standard: Arc::new(OrderedLane::new(Lane::Standard)),
            upscale: Arc::new(OrderedLane::new(Lane::Upscale)),
            events,
            reroute_tx,
            reroute_rx: Mutex::new(Some(reroute_rx)),
            remote_tx,
            remote_rx: Mutex::new(Some(remote_rx)),
            keep_completed,
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn lane(&self, lane: Lane) -> &Arc<OrderedLane> {
        match lane {
            Lane::Standard => &self.standard,
            Lane::Upscale => &self.upscale,
        }
    }

    pub async fn get(&self, id: TaskId) -> StoreResult<Option<TaskRecord>> {
        self.store.get(id).await
    }

    /// Persiste en Pending y la pone en su carril.
    pub async fn enqueue(&self, payload: TaskPayload) -> StoreResult<TaskRecord> {
        let record = self.store.create(payload).await?;
        self.lane(record.lane()).insert(record.id, record.order);
        info!(
            "tarea {} encolada (tipo={}, carril={}, order={})",
            record.id,
            record.kind(),
            record.lane(),
            record.order
        );
        self.events.emit(TaskEvent::Enqueued(record.clone()));

        if let Err(e) = self.cleanup_retention().await {
            warn!("no se pudo limpiar tareas viejas: {}", e);
        }
        Ok(record)
    }

    pub async fn reorder(&self, id: TaskId, order: i64) -> StoreResult<TaskRecord> {
        let mut record = self.store.get(id).await?.ok_or(StoreError::Missing(id))?;
        record.order = order;
        self.store.update(&record).await?;

        // sólo se reubica si todavía estaba esperando en el carril
        let lane = self.lane(record.lane());
        if lane.remove(id) {
            lane.insert(id, order);
        }
        debug!("tarea {} reordenada a {}", id, order);
        self.events.emit(TaskEvent::StatusChanged {
            task: record.clone(),
            progress: None,
        });
        Ok(record)
    }

    /// La pone delante de todo lo que hay en el store.
    pub async fn move_to_front(&self, id: TaskId) -> StoreResult<TaskRecord> {
        let min = self.store.min_order().await?.unwrap_or(0);
        self.reorder(id, min - 1).await
    }

    pub async fn remove(&self, id: TaskId) -> StoreResult<Option<TaskRecord>> {
        let removed = self.store.delete(id).await?;
        self.standard.remove(id);
        self.upscale.remove(id);
        if let Some(record) = &removed {
            info!("tarea {} eliminada", id);
            self.events.emit(TaskEvent::Removed(record.clone()));
        }
        Ok(removed)
    }

    pub async fn remove_batch(&self, ids: &[TaskId]) -> StoreResult<usize> {
        let mut removed = 0;
        for id in ids {
            if self.remove(*id).await?.is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Vuelve a Pending y reentra al carril.
    pub async fn retry(&self, id: TaskId) -> StoreResult<TaskRecord> {
        let mut record = self.store.get(id).await?.ok_or(StoreError::Missing(id))?;
        record.status = TaskStatus::Pending;
        record.processed_at = None;
        self.store.update(&record).await?;
        self.lane(record.lane()).insert(record.id, record.order);
        info!("tarea {} reencolada (reintentos={})", id, record.retry_count);
        self.events.emit(TaskEvent::Enqueued(record.clone()));
        Ok(record)
    }

    /// Al arrancar: siembra los carriles con lo Pending y con los Failed que
    /// todavía tienen presupuesto. Los Processing quedan para las leases adoptadas.
    pub async fn replay_pending_or_failed(&self) -> StoreResult<usize> {
        let mut seeded = 0;
        for mut record in self.store.list().await? {
            match record.status {
                TaskStatus::Pending => {}
                TaskStatus::Failed if record.can_retry() => {
                    record.status = TaskStatus::Pending;
                    record.processed_at = None;
                    self.store.update(&record).await?;
                }
                _ => continue,
            }
            self.lane(record.lane()).insert(record.id, record.order);
            seeded += 1;
        }
        if seeded > 0 {
            info!("replay: {} tareas vuelven a la cola", seeded);
        }
        Ok(seeded)
    }

    /// Persiste un cambio de estado con sus campos asociados y lo publica.
    /// Devuelve None si la tarea ya no existe.
    pub async fn transition(
        &self,
        id: TaskId,
        status: TaskStatus,
        error: Option<String>,
    ) -> StoreResult<Option<TaskRecord>> {
        let Some(mut record) = self.store.get(id).await? else {
            return Ok(None);
        };
        record.status = status;
        if status.is_terminal() {
            record.processed_at = Some(Utc::now());
        }
        if status == TaskStatus::Failed {
            record.retry_count += 1;
            record.last_error = error;
        }

        match self.store.update(&record).await {
            Ok(()) => {}
            Err(StoreError::Missing(_)) => return Ok(None),
            Err(e) => return Err(e),
        }
        debug!("tarea {} -> {:?}", id, status);
        self.events.emit(TaskEvent::StatusChanged {
            task: record.clone(),
            progress: None,
        });
        Ok(Some(record))
    }

    /// Manda la tarea directo al procesador local del carril upscale.
    pub fn reroute(&self, id: TaskId) {
        if self.reroute_tx.send(id).is_err() {
            warn!("nadie escucha el canal de reroute, tarea {} queda en espera", id);
        }
    }

    /// Sólo hay un lector de reroutes: el primero que lo pide se lo lleva.
    pub fn take_reroute_receiver(&self) -> Option<mpsc::UnboundedReceiver<TaskId>> {
        self.reroute_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Deja la tarea para el dispatcher remoto, que la atiende antes que
    /// el carril.
    pub fn hand_to_workers(&self, id: TaskId) {
        if self.remote_tx.send(id).is_err() {
            warn!("no hay dispatcher remoto, tarea {} queda en espera", id);
        }
    }

    pub fn take_remote_receiver(&self) -> Option<mpsc::UnboundedReceiver<TaskId>> {
        self.remote_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn spawn_drain_loops(&self, shutdown: &CancellationToken) -> DrainLoops {
        let (std_tx, standard) = handoff_channel(Lane::Standard);
        let (up_tx, upscale) = handoff_channel(Lane::Upscale);
        let handles = vec![
            tokio::spawn(run_drain(self.standard.clone(), std_tx, shutdown.clone())),
            tokio::spawn(run_drain(self.upscale.clone(), up_tx, shutdown.clone())),
        ];
        DrainLoops {
            standard,
            upscale,
            handles,
        }
    }

    pub async fn cleanup_retention(&self) -> StoreResult<usize> {
        let removed = self.store.prune_completed(self.keep_completed).await?;
        for record in &removed {
            self.events.emit(TaskEvent::Removed(record.clone()));
        }
        Ok(removed.len())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use common::task::{LogTask, RepairUpscaleTask, UpscaleTask};
    use common::UpscaleProfile;

    pub(crate) fn log(msg: &str) -> TaskPayload {
        TaskPayload::Log(LogTask {
            message: msg.to_string(),
            level: Default::default(),
            retry_budget: 3,
        })
    }

    pub(crate) fn upscale(src: &str, out: &str) -> TaskPayload {
        TaskPayload::Upscale(UpscaleTask {
            source_path: src.into(),
            output_path: out.into(),
            profile: UpscaleProfile::default(),
            retry_budget: 3,
        })
    }

    pub(crate) fn repair(src: &str) -> TaskPayload {
        TaskPayload::RepairUpscale(RepairUpscaleTask {
            source_path: src.into(),
            output_path: format!("{src}.out").into(),
            profile: UpscaleProfile::default(),
            retry_budget: 3,
        })
    }

    fn queue_with(keep: usize) -> TaskQueue {
        TaskQueue::new(Arc::new(MemoryStore::new()), EventBus::default(), keep)
    }

    #[tokio::test]
    async fn enqueue_routes_by_kind() {
        let q = queue_with(100);
        let a = q.enqueue(log("a")).await.unwrap();
        let b = q.enqueue(upscale("/in/b", "/out/b")).await.unwrap();
        let c = q.enqueue(repair("/in/c")).await.unwrap();

        assert_eq!(q.lane(Lane::Standard).snapshot(), vec![a.id]);
        assert_eq!(q.lane(Lane::Upscale).snapshot(), vec![b.id, c.id]);
    }

    #[tokio::test]
    async fn enqueue_emits_event() {
        let q = queue_with(100);
        let mut rx = q.events().subscribe();
        let a = q.enqueue(log("a")).await.unwrap();
        match rx.recv().await.unwrap() {
            TaskEvent::Enqueued(t) => assert_eq!(t.id, a.id),
            other => panic!("evento inesperado {other:?}"),
        }
    }

    #[tokio::test]
    async fn move_to_front_beats_duplicate_orders() {
        let q = queue_with(100);
        let a = q.enqueue(log("a")).await.unwrap();
        let b = q.enqueue(log("b")).await.unwrap();
        let c = q.enqueue(log("c")).await.unwrap();

        // b y c empatan en order; el id decide
        q.reorder(c.id, b.order).await.unwrap();
        assert_eq!(q.lane(Lane::Standard).snapshot(), vec![a.id, b.id, c.id]);

        let moved = q.move_to_front(c.id).await.unwrap();
        assert_eq!(moved.order, a.order - 1);
        assert_eq!(q.lane(Lane::Standard).snapshot(), vec![c.id, a.id, b.id]);
    }

    #[tokio::test]
    async fn reorder_does_not_resurrect_dispatched_task() {
        let q = queue_with(100);
        let a = q.enqueue(log("a")).await.unwrap();
        assert_eq!(q.lane(Lane::Standard).pop_min(), Some(a.id));

        q.reorder(a.id, 42).await.unwrap();
        assert!(q.lane(Lane::Standard).is_empty());
        assert_eq!(q.get(a.id).await.unwrap().unwrap().order, 42);
    }

    #[tokio::test]
    async fn remove_batch_clears_store_and_lane() {
        let q = queue_with(100);
        let a = q.enqueue(log("a")).await.unwrap();
        let b = q.enqueue(upscale("/in/b", "/out/b")).await.unwrap();
        let c = q.enqueue(log("c")).await.unwrap();

        let n = q.remove_batch(&[a.id, b.id, TaskId(999)]).await.unwrap();
        assert_eq!(n, 2);
        assert_eq!(q.lane(Lane::Standard).snapshot(), vec![c.id]);
        assert!(q.lane(Lane::Upscale).is_empty());
        assert!(q.get(a.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn transition_to_failed_counts_the_retry() {
        let q = queue_with(100);
        let a = q.enqueue(log("a")).await.unwrap();

        let t = q
            .transition(a.id, TaskStatus::Failed, Some("boom".into()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(t.retry_count, 1);
        assert_eq!(t.last_error.as_deref(), Some("boom"));
        assert!(t.processed_at.is_some());

        assert!(q
            .transition(TaskId(999), TaskStatus::Completed, None)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn replay_brings_back_pending_and_retryable_failed() {
        let store: Arc<dyn TaskStore> = Arc::new(MemoryStore::new());
        let pending = store.create(log("p")).await.unwrap();
        let mut retryable = store.create(upscale("/in/r", "/out/r")).await.unwrap();
        let mut spent = store.create(log("s")).await.unwrap();
        let mut processing = store.create(log("x")).await.unwrap();
        let mut done = store.create(log("d")).await.unwrap();

        retryable.status = TaskStatus::Failed;
        retryable.retry_count = 1;
        spent.status = TaskStatus::Failed;
        spent.retry_count = 3;
        processing.status = TaskStatus::Processing;
        done.status = TaskStatus::Completed;
        for r in [&retryable, &spent, &processing, &done] {
            store.update(r).await.unwrap();
        }

        let q = TaskQueue::new(store.clone(), EventBus::default(), 100);
        assert_eq!(q.replay_pending_or_failed().await.unwrap(), 2);
        assert_eq!(q.lane(Lane::Standard).snapshot(), vec![pending.id]);
        assert_eq!(q.lane(Lane::Upscale).snapshot(), vec![retryable.id]);

        let r = store.get(retryable.id).await.unwrap().unwrap();
        assert_eq!(r.status, TaskStatus::Pending);
        assert_eq!(r.retry_count, 1);
        let s = store.get(spent.id).await.unwrap().unwrap();
        assert_eq!(s.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn retention_prunes_old_completed_on_enqueue() {
        let q = queue_with(1);
        let a = q.enqueue(log("a")).await.unwrap();
        let b = q.enqueue(log("b")).await.unwrap();
        let f = q.enqueue(log("f")).await.unwrap();
        q.transition(a.id, TaskStatus::Completed, None).await.unwrap();
        q.transition(b.id, TaskStatus::Completed, None).await.unwrap();
        q.transition(f.id, TaskStatus::Failed, Some("x".into()))
            .await
            .unwrap();

        q.enqueue(log("nueva")).await.unwrap();

        assert!(q.get(a.id).await.unwrap().is_none());
        assert!(q.get(b.id).await.unwrap().is_some());
        assert!(q.get(f.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn reroute_receiver_is_taken_once() {
        let q = queue_with(100);
        let mut rx = q.take_reroute_receiver().unwrap();
        assert!(q.take_reroute_receiver().is_none());
        q.reroute(TaskId(4));
        assert_eq!(rx.recv().await, Some(TaskId(4)));
    }
}
