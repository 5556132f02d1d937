use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf};

/// Presupuesto de reintentos por defecto para cualquier tipo de tarea.
pub const DEFAULT_RETRY_BUDGET: u32 = 3;

fn default_retry_budget() -> u32 {
    DEFAULT_RETRY_BUDGET
}

/// Identidad estable de una tarea. La asigna el store al persistirla.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub i64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Canceled
        )
    }
}

/// Carril de prioridad al que va una tarea.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    Standard,
    Upscale,
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lane::Standard => write!(f, "standard"),
            Lane::Upscale => write!(f, "upscale"),
        }
    }
}

/* --------- Tipos de tarea --------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    Upscale,
    RepairUpscale,
    RenameSeriesTitle,
    ScanIngest,
    Log,
    IntegrityCheck,
    Merge,
    DetectSplits,
    ApplySplits,
}

impl TaskKind {
    pub const ALL: [TaskKind; 9] = [
        TaskKind::Upscale,
        TaskKind::RepairUpscale,
        TaskKind::RenameSeriesTitle,
        TaskKind::ScanIngest,
        TaskKind::Log,
        TaskKind::IntegrityCheck,
        TaskKind::Merge,
        TaskKind::DetectSplits,
        TaskKind::ApplySplits,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Upscale => "upscale",
            TaskKind::RepairUpscale => "repair-upscale",
            TaskKind::RenameSeriesTitle => "rename-series-title",
            TaskKind::ScanIngest => "scan-ingest",
            TaskKind::Log => "log",
            TaskKind::IntegrityCheck => "integrity-check",
            TaskKind::Merge => "merge",
            TaskKind::DetectSplits => "detect-splits",
            TaskKind::ApplySplits => "apply-splits",
        }
    }

    pub fn lane(self) -> Lane {
        match self {
            TaskKind::Upscale
            | TaskKind::RepairUpscale
            | TaskKind::RenameSeriesTitle
            | TaskKind::DetectSplits
            | TaskKind::ApplySplits => Lane::Upscale,
            TaskKind::ScanIngest
            | TaskKind::Log
            | TaskKind::IntegrityCheck
            | TaskKind::Merge => Lane::Standard,
        }
    }

    /// Tipos que un worker remoto puede ejecutar. Repair y rename tocan la
    /// biblioteca local y nunca salen del coordinador.
    pub fn runs_remotely(self) -> bool {
        matches!(
            self,
            TaskKind::Upscale | TaskKind::DetectSplits | TaskKind::ApplySplits
        )
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("tipo de tarea desconocido: {s}"))
    }
}

/// Perfil de escalado que se pasa tal cual al upscaler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpscaleProfile {
    pub name: String,
    pub scale: u8,
}

impl Default for UpscaleProfile {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            scale: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpscaleTask {
    pub source_path: PathBuf,
    pub output_path: PathBuf,
    #[serde(default)]
    pub profile: UpscaleProfile,
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairUpscaleTask {
    pub source_path: PathBuf,
    pub output_path: PathBuf,
    #[serde(default)]
    pub profile: UpscaleProfile,
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenameSeriesTitleTask {
    pub series: String,
    pub new_title: String,
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanIngestTask {
    pub library_path: PathBuf,
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogTask {
    pub message: String,
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityCheckTask {
    pub path: PathBuf,
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeTask {
    pub sources: Vec<PathBuf>,
    pub destination: PathBuf,
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectSplitsTask {
    pub source_path: PathBuf,
    /// Resultado de la detección, lo rellena el coordinador al recibirlo.
    #[serde(default)]
    pub findings: Option<serde_json::Value>,
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplySplitsTask {
    pub source_path: PathBuf,
    pub output_path: PathBuf,
    pub findings: serde_json::Value,
    #[serde(default)]
    pub profile: UpscaleProfile,
    /// Si es true, sólo se escalan las regiones recién cortadas.
    #[serde(default)]
    pub upscale_regions: bool,
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
}

/// Payload etiquetado por `kind`. Un struct por variante.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TaskPayload {
    Upscale(UpscaleTask),
    RepairUpscale(RepairUpscaleTask),
    RenameSeriesTitle(RenameSeriesTitleTask),
    ScanIngest(ScanIngestTask),
    Log(LogTask),
    IntegrityCheck(IntegrityCheckTask),
    Merge(MergeTask),
    DetectSplits(DetectSplitsTask),
    ApplySplits(ApplySplitsTask),
}

impl TaskPayload {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskPayload::Upscale(_) => TaskKind::Upscale,
            TaskPayload::RepairUpscale(_) => TaskKind::RepairUpscale,
            TaskPayload::RenameSeriesTitle(_) => TaskKind::RenameSeriesTitle,
            TaskPayload::ScanIngest(_) => TaskKind::ScanIngest,
            TaskPayload::Log(_) => TaskKind::Log,
            TaskPayload::IntegrityCheck(_) => TaskKind::IntegrityCheck,
            TaskPayload::Merge(_) => TaskKind::Merge,
            TaskPayload::DetectSplits(_) => TaskKind::DetectSplits,
            TaskPayload::ApplySplits(_) => TaskKind::ApplySplits,
        }
    }

    pub fn lane(&self) -> Lane {
        self.kind().lane()
    }

    pub fn retry_budget(&self) -> u32 {
        match self {
            TaskPayload::Upscale(t) => t.retry_budget,
            TaskPayload::RepairUpscale(t) => t.retry_budget,
            TaskPayload::RenameSeriesTitle(t) => t.retry_budget,
            TaskPayload::ScanIngest(t) => t.retry_budget,
            TaskPayload::Log(t) => t.retry_budget,
            TaskPayload::IntegrityCheck(t) => t.retry_budget,
            TaskPayload::Merge(t) => t.retry_budget,
            TaskPayload::DetectSplits(t) => t.retry_budget,
            TaskPayload::ApplySplits(t) => t.retry_budget,
        }
    }

    /// Archivo de entrada que un worker tiene que bajarse, si lo hay.
    pub fn source_path(&self) -> Option<&PathBuf> {
        match self {
            TaskPayload::Upscale(t) => Some(&t.source_path),
            TaskPayload::RepairUpscale(t) => Some(&t.source_path),
            TaskPayload::DetectSplits(t) => Some(&t.source_path),
            TaskPayload::ApplySplits(t) => Some(&t.source_path),
            _ => None,
        }
    }

    /// Dónde tiene que quedar el resultado final.
    pub fn output_path(&self) -> Option<&PathBuf> {
        match self {
            TaskPayload::Upscale(t) => Some(&t.output_path),
            TaskPayload::RepairUpscale(t) => Some(&t.output_path),
            TaskPayload::ApplySplits(t) => Some(&t.output_path),
            _ => None,
        }
    }

    pub fn profile(&self) -> Option<&UpscaleProfile> {
        match self {
            TaskPayload::Upscale(t) => Some(&t.profile),
            TaskPayload::RepairUpscale(t) => Some(&t.profile),
            TaskPayload::ApplySplits(t) => Some(&t.profile),
            _ => None,
        }
    }
}

/* --------- Registro persistido --------- */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub payload: TaskPayload,
    pub status: TaskStatus,
    /// Secuencia de despacho. No es única: los empates se rompen por `id`.
    pub order: i64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl TaskRecord {
    pub fn kind(&self) -> TaskKind {
        self.payload.kind()
    }

    pub fn lane(&self) -> Lane {
        self.payload.lane()
    }

    /// Clave de orden dentro de un carril.
    pub fn dispatch_key(&self) -> (i64, TaskId) {
        (self.order, self.id)
    }

    /// Un Failed vuelve a la cola sólo mientras le quede presupuesto.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.payload.retry_budget()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_is_tagged_by_kind() {
        let payload = TaskPayload::Upscale(UpscaleTask {
            source_path: "/lib/a.cbz".into(),
            output_path: "/lib/out/a.cbz".into(),
            profile: UpscaleProfile::default(),
            retry_budget: 2,
        });

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "upscale");
        assert_eq!(json["retry_budget"], 2);

        let json = serde_json::json!({
            "kind": "rename-series-title",
            "series": "abc",
            "new_title": "Abc"
        });
        let payload: TaskPayload = serde_json::from_value(json).unwrap();
        assert_eq!(payload.kind(), TaskKind::RenameSeriesTitle);
        assert_eq!(payload.retry_budget(), DEFAULT_RETRY_BUDGET);
    }

    #[test]
    fn kinds_are_routed_to_lanes() {
        assert_eq!(TaskKind::Upscale.lane(), Lane::Upscale);
        assert_eq!(TaskKind::RepairUpscale.lane(), Lane::Upscale);
        assert_eq!(TaskKind::RenameSeriesTitle.lane(), Lane::Upscale);
        assert_eq!(TaskKind::Log.lane(), Lane::Standard);
        assert_eq!(TaskKind::ScanIngest.lane(), Lane::Standard);
        assert_eq!(TaskKind::Merge.lane(), Lane::Standard);

        assert!(TaskKind::Upscale.runs_remotely());
        assert!(!TaskKind::RepairUpscale.runs_remotely());
        assert!(!TaskKind::RenameSeriesTitle.runs_remotely());
    }

    #[test]
    fn kind_parses_from_wire_name() {
        for kind in TaskKind::ALL {
            assert_eq!(kind.as_str().parse::<TaskKind>().unwrap(), kind);
        }
        assert!("resize".parse::<TaskKind>().is_err());
    }
}
