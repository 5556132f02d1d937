use clap::Parser;
use std::{net::SocketAddr, path::PathBuf, time::Duration};

use common::{ExternalTool, TaskKind};

/// Configuración del coordinador. Todo tiene default y variable de entorno.
#[derive(Debug, Clone, Parser)]
#[command(name = "coordinator", about = "Coordinador de la cola de upscale")]
pub struct CoordinatorConfig {
    #[arg(long, env = "COORDINATOR_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Directorio para el snapshot de tareas y las subidas de workers.
    #[arg(long, env = "COORDINATOR_DATA_DIR", default_value = "data")]
    pub data_dir: PathBuf,

    /// Sólo workers remotos ejecutan upscales; el procesador local atiende reroutes.
    #[arg(long, env = "COORDINATOR_REMOTE_ONLY", default_value_t = false)]
    pub remote_only: bool,

    #[arg(long, default_value_t = 30)]
    pub request_timeout_secs: u64,

    #[arg(long, default_value_t = 10)]
    pub remote_only_request_timeout_secs: u64,

    #[arg(long, default_value_t = 60)]
    pub lease_stale_secs: u64,

    #[arg(long, default_value_t = 10)]
    pub sweep_interval_secs: u64,

    #[arg(long, default_value_t = 5)]
    pub heartbeat_grace_secs: u64,

    #[arg(long, default_value_t = 250)]
    pub ui_debounce_ms: u64,

    /// Cuántas tareas Completed se conservan.
    #[arg(long, default_value_t = 100)]
    pub keep_completed: usize,

    #[arg(long, env = "UPSCALER_PROGRAM", default_value = "upscaler")]
    pub upscaler: String,

    #[arg(long = "upscaler-arg", allow_hyphen_values = true)]
    pub upscaler_args: Vec<String>,

    /// Handler externo por tipo: `--handler scan-ingest=/usr/bin/ingest`.
    #[arg(long = "handler", value_parser = parse_handler)]
    pub handlers: Vec<(TaskKind, String)>,
}

fn parse_handler(s: &str) -> Result<(TaskKind, String), String> {
    let (kind, program) = s
        .split_once('=')
        .ok_or_else(|| format!("se esperaba tipo=programa, vino {s}"))?;
    let kind: TaskKind = kind.trim().parse()?;
    if program.trim().is_empty() {
        return Err(format!("programa vacío para {kind}"));
    }
    Ok((kind, program.trim().to_string()))
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
            data_dir: PathBuf::from("data"),
            remote_only: false,
            request_timeout_secs: 30,
            remote_only_request_timeout_secs: 10,
            lease_stale_secs: 60,
            sweep_interval_secs: 10,
            heartbeat_grace_secs: 5,
            ui_debounce_ms: 250,
            keep_completed: 100,
            upscaler: "upscaler".to_string(),
            upscaler_args: Vec::new(),
            handlers: Vec::new(),
        }
    }
}

impl CoordinatorConfig {
    /// Cuánto espera un RequestTask antes de responder "no hay trabajo".
    pub fn request_timeout(&self) -> Duration {
        if self.remote_only {
            Duration::from_secs(self.remote_only_request_timeout_secs)
        } else {
            Duration::from_secs(self.request_timeout_secs)
        }
    }

    pub fn lease_stale(&self) -> Duration {
        Duration::from_secs(self.lease_stale_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn heartbeat_grace(&self) -> Duration {
        Duration::from_secs(self.heartbeat_grace_secs)
    }

    pub fn ui_debounce(&self) -> Duration {
        Duration::from_millis(self.ui_debounce_ms)
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join("tasks.json")
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }

    pub fn upscaler_tool(&self) -> ExternalTool {
        ExternalTool::new(self.upscaler.clone()).with_args(self.upscaler_args.clone())
    }
}
