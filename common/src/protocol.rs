//! Mensajes entre coordinador, workers remotos y el CLI de operador.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::progress::{Progress, ProgressUpdate};
use crate::task::{TaskId, TaskKind, TaskPayload, TaskStatus, UpscaleProfile};

/// Identidad de una lease. Cambia en cada asignación de la misma tarea.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseId(pub Uuid);

impl LeaseId {
    pub fn new() -> Self {
        LeaseId(Uuid::new_v4())
    }
}

impl Default for LeaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/* --------- RPC de workers --------- */

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestTaskRequest {
    #[serde(default)]
    pub prefetch: bool,
    #[serde(default)]
    pub worker: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskParams {
    #[serde(default)]
    pub profile: Option<UpscaleProfile>,
    /// Nombre del archivo de entrada, para nombrar los temporales.
    #[serde(default)]
    pub input_name: String,
    #[serde(default)]
    pub upscale_regions: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub task_id: TaskId,
    pub lease_id: LeaseId,
    pub kind: TaskKind,
    pub params: TaskParams,
    #[serde(default)]
    pub split_findings: Option<serde_json::Value>,
}

impl TaskAssignment {
    /// Arma la asignación a partir del payload persistido.
    pub fn from_payload(task_id: TaskId, lease_id: LeaseId, payload: &TaskPayload) -> Self {
        let input_name = payload
            .source_path()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| format!("task-{task_id}"));

        let (upscale_regions, split_findings) = match payload {
            TaskPayload::ApplySplits(t) => (t.upscale_regions, Some(t.findings.clone())),
            _ => (false, None),
        };

        Self {
            task_id,
            lease_id,
            kind: payload.kind(),
            params: TaskParams {
                profile: payload.profile().cloned(),
                input_name,
                upscale_regions,
            },
            split_findings,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepAliveRequest {
    pub task_id: TaskId,
    pub lease_id: LeaseId,
    #[serde(flatten)]
    pub progress: ProgressUpdate,
    #[serde(default)]
    pub prefetch: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct KeepAliveResponse {
    pub is_alive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportTaskFailedRequest {
    pub task_id: TaskId,
    pub lease_id: LeaseId,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    pub success: bool,
    pub message: String,
    pub task_id: TaskId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionResultRequest {
    pub task_id: TaskId,
    pub lease_id: LeaseId,
    pub result_json: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionResultResponse {
    pub success: bool,
    pub message: String,
}

/// Query de GetFile y UploadFile. Sin `lease_id` el pedido se rechaza.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeaseQuery {
    #[serde(default)]
    pub lease_id: Option<LeaseId>,
    #[serde(default)]
    pub prefetch: bool,
}

/* --------- API de operador --------- */

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReorderRequest {
    pub order: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveBatchRequest {
    pub ids: Vec<TaskId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveBatchResponse {
    pub removed: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub lease_id: Option<LeaseId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    /// false si no había lease vigente con esa identidad.
    pub cancelled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LeaseOwnerInfo {
    Local,
    Remote { worker: String },
    Adopted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseInfo {
    pub lease_id: LeaseId,
    pub task_id: TaskId,
    pub owner: LeaseOwnerInfo,
    pub canceled: bool,
    /// Segundos desde el último heartbeat. Negativo durante el periodo de gracia.
    pub heartbeat_age_secs: f64,
    pub progress: Progress,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListTasksQuery {
    #[serde(default)]
    pub status: Option<TaskStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{ApplySplitsTask, UpscaleTask};

    #[test]
    fn keep_alive_flattens_progress_fields() {
        let lease_id = LeaseId::new();
        let req = KeepAliveRequest {
            task_id: TaskId(7),
            lease_id,
            progress: ProgressUpdate::step(2, 9),
            prefetch: false,
        };

        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["current"], 2);
        assert_eq!(json["total"], 9);
        assert!(json.get("unit").is_none());

        let back: KeepAliveRequest = serde_json::from_value(
            serde_json::json!({"task_id": 7, "lease_id": lease_id}),
        )
        .unwrap();
        assert!(back.progress.is_empty());
        assert_eq!(back.lease_id, lease_id);

        // sin identidad de lease el keep-alive no se acepta
        assert!(serde_json::from_value::<KeepAliveRequest>(serde_json::json!({"task_id": 7})).is_err());
    }

    #[test]
    fn assignment_carries_findings_for_apply_splits() {
        let payload = TaskPayload::ApplySplits(ApplySplitsTask {
            source_path: "/lib/vol1.cbz".into(),
            output_path: "/lib/out/vol1.cbz".into(),
            findings: serde_json::json!({"pages": [3]}),
            profile: UpscaleProfile::default(),
            upscale_regions: true,
            retry_budget: 3,
        });
        let a = TaskAssignment::from_payload(TaskId(1), LeaseId::new(), &payload);
        assert_eq!(a.kind, TaskKind::ApplySplits);
        assert_eq!(a.params.input_name, "vol1.cbz");
        assert!(a.params.upscale_regions);
        assert_eq!(a.split_findings, Some(serde_json::json!({"pages": [3]})));

        let payload = TaskPayload::Upscale(UpscaleTask {
            source_path: "/lib/vol2.cbz".into(),
            output_path: "/lib/out/vol2.cbz".into(),
            profile: UpscaleProfile::default(),
            retry_budget: 3,
        });
        let a = TaskAssignment::from_payload(TaskId(2), LeaseId::new(), &payload);
        assert!(a.split_findings.is_none());
        assert_eq!(a.params.profile, Some(UpscaleProfile::default()));
    }
}
