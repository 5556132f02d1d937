use clap::Parser;
use std::{path::PathBuf, time::Duration};

use common::ExternalTool;

/// Configuración del worker remoto.
#[derive(Debug, Clone, Parser)]
#[command(name = "worker", about = "Worker remoto de upscale")]
pub struct WorkerConfig {
    /// URL base del coordinador. En Docker: http://coordinator:8080
    #[arg(long, env = "COORDINATOR_URL", default_value = "http://localhost:8080")]
    pub coordinator_url: String,

    /// Directorio para entradas y salidas temporales.
    #[arg(long, env = "WORKER_WORK_DIR", default_value = "/tmp/upscale-worker")]
    pub work_dir: PathBuf,

    /// Nombre con el que se presenta; por defecto el hostname.
    #[arg(long, env = "WORKER_NAME")]
    pub name: Option<String>,

    #[arg(long, default_value_t = 15)]
    pub heartbeat_secs: u64,

    #[arg(long, default_value_t = 400)]
    pub progress_interval_ms: u64,

    #[arg(long, default_value_t = 5)]
    pub retry_backoff_secs: u64,

    #[arg(long, default_value_t = 1)]
    pub idle_delay_secs: u64,

    /// Resultados que pueden esperar subida a la vez.
    #[arg(long, default_value_t = 3)]
    pub upload_capacity: usize,

    #[arg(long, env = "UPSCALER_PROGRAM", default_value = "upscaler")]
    pub upscaler: String,

    #[arg(long, env = "SPLIT_DETECTOR_PROGRAM", default_value = "split-detector")]
    pub split_detector: String,

    #[arg(long, env = "SPLIT_APPLIER_PROGRAM", default_value = "split-applier")]
    pub split_applier: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            coordinator_url: "http://localhost:8080".to_string(),
            work_dir: PathBuf::from("/tmp/upscale-worker"),
            name: None,
            heartbeat_secs: 15,
            progress_interval_ms: 400,
            retry_backoff_secs: 5,
            idle_delay_secs: 1,
            upload_capacity: 3,
            upscaler: "upscaler".to_string(),
            split_detector: "split-detector".to_string(),
            split_applier: "split-applier".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }

    pub fn idle_delay(&self) -> Duration {
        Duration::from_secs(self.idle_delay_secs)
    }

    /// Nombre de host (o el configurado) para identificarse ante el coordinador.
    pub fn worker_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            hostname::get()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string()
        })
    }

    pub fn upscaler_tool(&self) -> ExternalTool {
        ExternalTool::new(self.upscaler.clone())
    }

    pub fn detector_tool(&self) -> ExternalTool {
        ExternalTool::new(self.split_detector.clone())
    }

    pub fn applier_tool(&self) -> ExternalTool {
        ExternalTool::new(self.split_applier.clone())
    }
}
