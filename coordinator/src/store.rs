//! Store de registros de tareas. Es la fuente de verdad: carriles y leases
//! son cachés que se reconcilian contra él.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use common::{TaskId, TaskPayload, TaskRecord, TaskStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("error de E/S en el store: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot inválido: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("la tarea {0} no existe")]
    Missing(TaskId),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persiste una tarea nueva en Pending con `order = max + 1`.
    async fn create(&self, payload: TaskPayload) -> StoreResult<TaskRecord>;

    async fn get(&self, id: TaskId) -> StoreResult<Option<TaskRecord>>;

    /// Reemplaza el registro entero. Falla si ya no existe.
    async fn update(&self, record: &TaskRecord) -> StoreResult<()>;

    /// Devuelve el registro borrado, si existía.
    async fn delete(&self, id: TaskId) -> StoreResult<Option<TaskRecord>>;

    /// Todas las tareas ordenadas por `(order, id)`.
    async fn list(&self) -> StoreResult<Vec<TaskRecord>>;

    async fn list_by_status(&self, status: TaskStatus) -> StoreResult<Vec<TaskRecord>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|t| t.status == status)
            .collect())
    }

    /// Menor `order` de todo el store.
    async fn min_order(&self) -> StoreResult<Option<i64>>;

    /// Borra los Completed más viejos dejando `keep`. Nunca toca Failed ni Canceled.
    async fn prune_completed(&self, keep: usize) -> StoreResult<Vec<TaskRecord>>;
}

#[derive(Default)]
struct Inner {
    next_id: i64,
    tasks: BTreeMap<TaskId, TaskRecord>,
}

impl Inner {
    fn max_order(&self) -> Option<i64> {
        self.tasks.values().map(|t| t.order).max()
    }
}

/// Store en memoria, con snapshot JSON opcional en disco.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    snapshot: Option<PathBuf>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                tasks: BTreeMap::new(),
            }),
            snapshot: None,
        }
    }

    /// Abre (o crea) un store respaldado por `path`.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut inner = Inner {
            next_id: 1,
            tasks: BTreeMap::new(),
        };

        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let records: Vec<TaskRecord> = serde_json::from_slice(&bytes)?;
                for r in records {
                    inner.next_id = inner.next_id.max(r.id.0 + 1);
                    inner.tasks.insert(r.id, r);
                }
                info!(
                    "store cargado desde {} ({} tareas)",
                    path.display(),
                    inner.tasks.len()
                );
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                }
                debug!("sin snapshot previo en {}", path.display());
            }
            Err(e) => return Err(e.into()),
        }

        Ok(Self {
            inner: Mutex::new(inner),
            snapshot: Some(path),
        })
    }

    /// Escribe el snapshot a un temporal y lo renombra encima del anterior.
    async fn persist(&self, inner: &Inner) -> StoreResult<()> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };
        let records: Vec<&TaskRecord> = inner.tasks.values().collect();
        let bytes = serde_json::to_vec_pretty(&records)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

fn sort_dispatch(records: &mut [TaskRecord]) {
    records.sort_by_key(|r| r.dispatch_key());
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn create(&self, payload: TaskPayload) -> StoreResult<TaskRecord> {
        let mut inner = self.inner.lock().await;
        let id = TaskId(inner.next_id);
        inner.next_id += 1;

        let record = TaskRecord {
            id,
            payload,
            status: TaskStatus::Pending,
            order: inner.max_order().map_or(0, |m| m + 1),
            created_at: Utc::now(),
            processed_at: None,
            retry_count: 0,
            last_error: None,
        };
        inner.tasks.insert(id, record.clone());
        self.persist(&inner).await?;
        Ok(record)
    }

    async fn get(&self, id: TaskId) -> StoreResult<Option<TaskRecord>> {
        Ok(self.inner.lock().await.tasks.get(&id).cloned())
    }

    async fn update(&self, record: &TaskRecord) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        match inner.tasks.get_mut(&record.id) {
            Some(slot) => *slot = record.clone(),
            None => return Err(StoreError::Missing(record.id)),
        }
        self.persist(&inner).await
    }

    async fn delete(&self, id: TaskId) -> StoreResult<Option<TaskRecord>> {
        let mut inner = self.inner.lock().await;
        let removed = inner.tasks.remove(&id);
        if removed.is_some() {
            self.persist(&inner).await?;
        }
        Ok(removed)
    }

    async fn list(&self) -> StoreResult<Vec<TaskRecord>> {
        let mut all: Vec<TaskRecord> = self.inner.lock().await.tasks.values().cloned().collect();
        sort_dispatch(&mut all);
        Ok(all)
    }

    async fn min_order(&self) -> StoreResult<Option<i64>> {
        Ok(self.inner.lock().await.tasks.values().map(|t| t.order).min())
    }

    async fn prune_completed(&self, keep: usize) -> StoreResult<Vec<TaskRecord>> {
        let mut inner = self.inner.lock().await;
        let mut completed: Vec<&TaskRecord> = inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Completed)
            .collect();
        if completed.len() <= keep {
            return Ok(Vec::new());
        }

        // los más nuevos primero
        completed.sort_by(|a, b| {
            b.processed_at
                .cmp(&a.processed_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        let doomed: Vec<TaskId> = completed[keep..].iter().map(|t| t.id).collect();

        let mut removed = Vec::with_capacity(doomed.len());
        for id in doomed {
            if let Some(r) = inner.tasks.remove(&id) {
                removed.push(r);
            }
        }
        self.persist(&inner).await?;
        Ok(removed)
    }
}
