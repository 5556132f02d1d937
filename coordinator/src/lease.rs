//! Tabla de leases en memoria. Nunca se persiste: al reiniciar, las tareas
//! en Processing reciben una lease adoptada.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use common::protocol::{LeaseInfo, LeaseOwnerInfo};
use common::{LeaseId, ProgressTracker, ProgressUpdate, TaskId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOwner {
    /// Procesador en el mismo proceso. No pasa por el sweep.
    Local,
    Remote { worker: String },
    /// Tarea que estaba en Processing al arrancar y espera a su worker.
    Adopted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Active,
    Canceled,
}

#[derive(Debug, Clone)]
pub struct Lease {
    pub id: LeaseId,
    pub task_id: TaskId,
    pub owner: LeaseOwner,
    pub last_heartbeat: Instant,
    pub state: LeaseState,
    pub progress: ProgressTracker,
    pub cancel: CancellationToken,
}

impl Lease {
    pub fn new(task_id: TaskId, owner: LeaseOwner, last_heartbeat: Instant) -> Self {
        Self {
            id: LeaseId::new(),
            task_id,
            owner,
            last_heartbeat,
            state: LeaseState::Active,
            progress: ProgressTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn swept(&self) -> bool {
        self.state == LeaseState::Active && self.owner != LeaseOwner::Local
    }

    fn info(&self, now: Instant) -> LeaseInfo {
        let age = if now >= self.last_heartbeat {
            now.duration_since(self.last_heartbeat).as_secs_f64()
        } else {
            -self.last_heartbeat.duration_since(now).as_secs_f64()
        };
        LeaseInfo {
            lease_id: self.id,
            task_id: self.task_id,
            owner: match &self.owner {
                LeaseOwner::Local => LeaseOwnerInfo::Local,
                LeaseOwner::Remote { worker } => LeaseOwnerInfo::Remote {
                    worker: worker.clone(),
                },
                LeaseOwner::Adopted => LeaseOwnerInfo::Adopted,
            },
            canceled: self.state == LeaseState::Canceled,
            heartbeat_age_secs: age,
            progress: self.progress.snapshot(),
        }
    }
}

/// Resultado de un heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Touch {
    Alive,
    /// La lease existe pero fue cancelada.
    Canceled,
    /// No hay lease para la tarea o la identidad no coincide.
    Unknown,
}

#[derive(Default)]
pub struct LeaseTable {
    leases: Mutex<HashMap<TaskId, Lease>>,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut HashMap<TaskId, Lease>) -> R) -> R {
        let mut map = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut map)
    }

    /// Registra la lease. Si la tarea ya tenía una, la anterior se pisa.
    pub fn insert(&self, lease: Lease) -> Option<Lease> {
        self.with(|m| m.insert(lease.task_id, lease))
    }

    pub fn get(&self, task_id: TaskId) -> Option<Lease> {
        self.with(|m| m.get(&task_id).cloned())
    }

    /// La lease vigente de la tarea es exactamente `lease_id`.
    pub fn matches(&self, task_id: TaskId, lease_id: LeaseId) -> bool {
        self.with(|m| m.get(&task_id).is_some_and(|l| l.id == lease_id))
    }

    /// Refresca el heartbeat y mezcla el progreso. Una lease adoptada toma
    /// la identidad del worker que la reclama.
    pub fn touch(
        &self,
        task_id: TaskId,
        lease_id: LeaseId,
        progress: &ProgressUpdate,
        now: Instant,
    ) -> Touch {
        self.with(|m| {
            let Some(lease) = m.get_mut(&task_id) else {
                return Touch::Unknown;
            };
            if lease.owner == LeaseOwner::Adopted {
                lease.id = lease_id;
                lease.owner = LeaseOwner::Remote {
                    worker: "adopted".to_string(),
                };
            } else if lease.id != lease_id {
                return Touch::Unknown;
            }
            if lease.state == LeaseState::Canceled {
                return Touch::Canceled;
            }
            lease.last_heartbeat = lease.last_heartbeat.max(now);
            if !progress.is_empty() {
                lease.progress.apply(progress);
            }
            Touch::Alive
        })
    }

    /// Quita la lease sólo si la identidad coincide.
    pub fn remove(&self, task_id: TaskId, lease_id: LeaseId) -> Option<Lease> {
        self.with(|m| {
            if m.get(&task_id).is_some_and(|l| l.id == lease_id) {
                m.remove(&task_id)
            } else {
                None
            }
        })
    }

    /// Marca la lease como cancelada y dispara su token.
    pub fn cancel(&self, task_id: TaskId, lease_id: Option<LeaseId>) -> Option<Lease> {
        self.with(|m| {
            let lease = m.get_mut(&task_id)?;
            if lease_id.is_some_and(|id| id != lease.id) {
                return None;
            }
            lease.state = LeaseState::Canceled;
            lease.cancel.cancel();
            Some(lease.clone())
        })
    }

    /// Saca las leases remotas o adoptadas sin heartbeat hace más de `stale`.
    pub fn take_expired(&self, now: Instant, stale: Duration) -> Vec<Lease> {
        self.with(|m| {
            let expired: Vec<TaskId> = m
                .values()
                .filter(|l| l.swept() && now.saturating_duration_since(l.last_heartbeat) > stale)
                .map(|l| l.task_id)
                .collect();
            expired.iter().filter_map(|id| m.remove(id)).collect()
        })
    }

    pub fn len(&self) -> usize {
        self.with(|m| m.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn list(&self, now: Instant) -> Vec<LeaseInfo> {
        let mut out: Vec<LeaseInfo> = self.with(|m| m.values().map(|l| l.info(now)).collect());
        out.sort_by_key(|l| l.task_id);
        out
    }
}
