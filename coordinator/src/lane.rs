//! Carriles de la cola: conjunto ordenado por `(order, id)` más un canal de
//! entrega de capacidad 1 hacia el consumidor.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use common::{Lane, TaskId};

#[derive(Default)]
struct LaneSet {
    keys: BTreeSet<(i64, TaskId)>,
    index: HashMap<TaskId, i64>,
}

impl LaneSet {
    fn remove(&mut self, id: TaskId) -> bool {
        match self.index.remove(&id) {
            Some(order) => self.keys.remove(&(order, id)),
            None => false,
        }
    }

    fn insert(&mut self, id: TaskId, order: i64) {
        self.remove(id);
        self.keys.insert((order, id));
        self.index.insert(id, order);
    }

    fn pop_min(&mut self) -> Option<TaskId> {
        let (_, id) = self.keys.pop_first()?;
        self.index.remove(&id);
        Some(id)
    }
}

/// Conjunto ordenado de un carril. El lock nunca cruza un `.await`.
pub struct OrderedLane {
    lane: Lane,
    set: Mutex<LaneSet>,
    notify: Notify,
}

impl OrderedLane {
    pub fn new(lane: Lane) -> Self {
        Self {
            lane,
            set: Mutex::new(LaneSet::default()),
            notify: Notify::new(),
        }
    }

    pub fn lane(&self) -> Lane {
        self.lane
    }

    fn with_set<R>(&self, f: impl FnOnce(&mut LaneSet) -> R) -> R {
        let mut set = self.set.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut set)
    }

    /// Inserta o reubica la tarea y despierta al drain.
    pub fn insert(&self, id: TaskId, order: i64) {
        self.with_set(|s| s.insert(id, order));
        self.notify.notify_one();
    }

    pub fn remove(&self, id: TaskId) -> bool {
        self.with_set(|s| s.remove(id))
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.with_set(|s| s.index.contains_key(&id))
    }

    pub fn pop_min(&self) -> Option<TaskId> {
        self.with_set(LaneSet::pop_min)
    }

    pub fn len(&self) -> usize {
        self.with_set(|s| s.keys.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<TaskId> {
        self.with_set(|s| s.keys.iter().map(|(_, id)| *id).collect())
    }

    /// Espera hasta que haya algo y saca el mínimo.
    pub async fn next(&self) -> TaskId {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(id) = self.pop_min() {
                return id;
            }
            notified.await;
        }
    }
}

/// Drain de un carril: primero reserva lugar en el canal de entrega y recién
/// entonces saca el mínimo. Así nunca hay más de una tarea entre el carril y
/// su consumidor, y un reorder llega a tiempo mientras el consumidor está ocupado.
pub async fn run_drain(
    lane: Arc<OrderedLane>,
    tx: mpsc::Sender<TaskId>,
    shutdown: CancellationToken,
) {
    loop {
        let permit = tokio::select! {
            _ = shutdown.cancelled() => break,
            permit = tx.reserve() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
        };

        let id = tokio::select! {
            _ = shutdown.cancelled() => break,
            id = lane.next() => id,
        };

        debug!("carril {} entrega la tarea {}", lane.lane(), id);
        permit.send(id);
    }
    debug!("drain del carril {} terminado", lane.lane());
}

/// Extremo consumidor de un carril. Se puede clonar: varios lectores
/// compiten por el mismo canal.
#[derive(Clone)]
pub struct Handoff {
    lane: Lane,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<TaskId>>>,
}

impl Handoff {
    pub fn new(lane: Lane, rx: mpsc::Receiver<TaskId>) -> Self {
        Self {
            lane,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }

    pub fn lane(&self) -> Lane {
        self.lane
    }

    /// None cuando el drain terminó.
    pub async fn recv(&self) -> Option<TaskId> {
        self.rx.lock().await.recv().await
    }
}

/// Crea el canal de capacidad 1 de un carril.
pub fn handoff_channel(lane: Lane) -> (mpsc::Sender<TaskId>, Handoff) {
    let (tx, rx) = mpsc::channel(1);
    (tx, Handoff::new(lane, rx))
}
