use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

/// Estado de avance de una tarea.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub current: Option<u64>,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub status_message: String,
    #[serde(default)]
    pub phase: Option<String>,
}

impl Progress {
    /// Unidades que faltan, si se conoce el total.
    pub fn remaining(&self) -> Option<u64> {
        let total = self.total?;
        Some(total.saturating_sub(self.current.unwrap_or(0)))
    }
}

/// Cambio parcial: sólo los campos presentes pisan el estado.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

impl ProgressUpdate {
    pub fn is_empty(&self) -> bool {
        self == &ProgressUpdate::default()
    }

    pub fn message(msg: impl Into<String>) -> Self {
        Self {
            status_message: Some(msg.into()),
            ..Default::default()
        }
    }

    pub fn step(current: u64, total: u64) -> Self {
        Self {
            current: Some(current),
            total: Some(total),
            ..Default::default()
        }
    }

    /// Aplica la actualización sobre `target`. Devuelve true si algo cambió.
    pub fn apply_to(&self, target: &mut Progress) -> bool {
        let before = target.clone();
        if let Some(total) = self.total {
            target.total = Some(total);
        }
        if let Some(current) = self.current {
            target.current = Some(current);
        }
        if let Some(unit) = &self.unit {
            target.unit = unit.clone();
        }
        if let Some(msg) = &self.status_message {
            target.status_message = msg.clone();
        }
        if let Some(phase) = &self.phase {
            target.phase = Some(phase.clone());
        }
        *target != before
    }
}

impl From<&Progress> for ProgressUpdate {
    fn from(p: &Progress) -> Self {
        Self {
            total: p.total,
            current: p.current,
            unit: Some(p.unit.clone()),
            status_message: Some(p.status_message.clone()),
            phase: p.phase.clone(),
        }
    }
}

/// Progreso observable por varios suscriptores a la vez.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    tx: Arc<watch::Sender<Progress>>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Progress::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn snapshot(&self) -> Progress {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.tx.subscribe()
    }

    /// Mezcla la actualización y notifica sólo si hubo cambios.
    pub fn apply(&self, update: &ProgressUpdate) {
        self.tx.send_if_modified(|p| update.apply_to(p));
    }
}
