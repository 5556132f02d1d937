use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::task::TaskId;

/// Motivo de una cancelación. Decide el estado final de la tarea.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// Un operador la canceló: termina en Canceled.
    User,
    /// El servicio se está apagando: vuelve a Pending.
    Shutdown,
    /// El coordinador ya no reconoce la lease.
    LeaseLost,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::User => write!(f, "cancelada por el usuario"),
            CancelReason::Shutdown => write!(f, "cancelada por apagado"),
            CancelReason::LeaseLost => write!(f, "lease perdida"),
        }
    }
}

#[derive(Debug, Error)]
pub enum TaskError {
    /// Falla transitoria (coordinador caído, red). Se reintenta sin gastar presupuesto.
    #[error("servicio no disponible: {0}")]
    Unavailable(String),

    #[error("no encontrado")]
    NotFound,

    #[error("lease obsoleta para la tarea {0}")]
    StaleLease(TaskId),

    #[error("{0}")]
    Execution(String),

    #[error("{0}")]
    Cancelled(CancelReason),
}

impl TaskError {
    pub fn execution(msg: impl fmt::Display) -> Self {
        TaskError::Execution(msg.to_string())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled(_))
    }
}

impl From<std::io::Error> for TaskError {
    fn from(e: std::io::Error) -> Self {
        TaskError::Execution(e.to_string())
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(e: serde_json::Error) -> Self {
        TaskError::Execution(format!("json inválido: {e}"))
    }
}
