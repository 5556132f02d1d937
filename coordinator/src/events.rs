use serde::Serialize;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use common::{Progress, TaskId, TaskRecord};

/// Eventos hacia colaboradores locales (UI, logs).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    Enqueued(TaskRecord),
    StatusChanged {
        task: TaskRecord,
        progress: Option<Progress>,
    },
    Removed(TaskRecord),
}

impl TaskEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            TaskEvent::Enqueued(t) | TaskEvent::Removed(t) => t.id,
            TaskEvent::StatusChanged { task, .. } => task.id,
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TaskEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }

    /// Sin suscriptores el evento se pierde, y está bien.
    pub fn emit(&self, event: TaskEvent) {
        let _ = self.tx.send(event);
    }
}

/// Reenvía cambios de progreso al bus, como mucho uno por `debounce`.
pub fn spawn_progress_forwarder(
    bus: EventBus,
    task: TaskRecord,
    mut rx: watch::Receiver<Progress>,
    debounce: Duration,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }

            // junta los cambios que lleguen durante la ventana
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(debounce) => {}
            }

            let progress = rx.borrow_and_update().clone();
            bus.emit(TaskEvent::StatusChanged {
                task: task.clone(),
                progress: Some(progress),
            });
        }
    })
}
