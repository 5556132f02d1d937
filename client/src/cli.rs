use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use std::path::PathBuf;

use common::protocol::{
    CancelRequest, CancelResponse, LeaseInfo, LeaseOwnerInfo, RemoveBatchRequest,
    RemoveBatchResponse, ReorderRequest,
};
use common::task::{LogLevel, LogTask, RepairUpscaleTask, UpscaleTask};
use common::{LeaseId, TaskId, TaskPayload, TaskRecord, UpscaleProfile};

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "CLI para operar la cola del coordinador")]
struct Cli {
    /// En Docker: http://coordinator:8080
    #[arg(
        long,
        env = "COORDINATOR_URL",
        default_value = "http://localhost:8080",
        global = true
    )]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encola una tarea nueva
    Submit {
        #[command(subcommand)]
        what: Submit,
    },
    /// Lista las tareas en orden de despacho
    List {
        /// Filtra por estado (pending, processing, completed, failed, canceled)
        #[arg(long)]
        status: Option<String>,
    },
    /// Muestra una tarea
    Status {
        #[arg(value_name = "TASK_ID")]
        id: i64,
    },
    /// Vuelve a encolar una tarea fallida o cancelada
    Retry {
        #[arg(value_name = "TASK_ID")]
        id: i64,
    },
    /// Cancela una tarea; con --lease sólo si el lease coincide
    Cancel {
        #[arg(value_name = "TASK_ID")]
        id: i64,
        #[arg(long)]
        lease: Option<uuid::Uuid>,
    },
    /// Cambia la posición de despacho
    Reorder {
        #[arg(value_name = "TASK_ID")]
        id: i64,
        #[arg(value_name = "ORDEN", allow_hyphen_values = true)]
        order: i64,
    },
    /// Pasa una tarea al frente de su carril
    Front {
        #[arg(value_name = "TASK_ID")]
        id: i64,
    },
    /// Borra tareas
    Remove {
        #[arg(value_name = "TASK_ID", required = true)]
        ids: Vec<i64>,
    },
    /// Leases activos
    Leases,
}

#[derive(Subcommand)]
enum Submit {
    /// Escala una imagen
    Upscale {
        source: PathBuf,
        output: PathBuf,
        #[arg(long, default_value = "default")]
        profile: String,
        #[arg(long, default_value_t = 2)]
        scale: u8,
        /// Rehace la salida aunque ya exista
        #[arg(long)]
        repair: bool,
    },
    /// Escribe un mensaje en el log del coordinador
    Log {
        message: String,
        #[arg(long, default_value = "info")]
        level: String,
    },
    /// Payload JSON crudo, para los demás tipos
    Raw {
        /// Ej: {"kind":"integrity-check","path":"/data/a.png"}
        json: String,
    },
}

fn build_payload(what: Submit) -> Result<TaskPayload> {
    Ok(match what {
        Submit::Upscale {
            source,
            output,
            profile,
            scale,
            repair,
        } => {
            let profile = UpscaleProfile {
                name: profile,
                scale,
            };
            if repair {
                TaskPayload::RepairUpscale(RepairUpscaleTask {
                    source_path: source,
                    output_path: output,
                    profile,
                    retry_budget: common::task::DEFAULT_RETRY_BUDGET,
                })
            } else {
                TaskPayload::Upscale(UpscaleTask {
                    source_path: source,
                    output_path: output,
                    profile,
                    retry_budget: common::task::DEFAULT_RETRY_BUDGET,
                })
            }
        }
        Submit::Log { message, level } => {
            let level: LogLevel = serde_json::from_value(serde_json::Value::String(
                level.to_lowercase(),
            ))
            .with_context(|| format!("nivel inválido: {level}"))?;
            TaskPayload::Log(LogTask {
                message,
                level,
                retry_budget: common::task::DEFAULT_RETRY_BUDGET,
            })
        }
        Submit::Raw { json } => serde_json::from_str(&json).context("payload JSON inválido")?,
    })
}

async fn read<T: DeserializeOwned>(resp: Response) -> Result<T> {
    let status = resp.status();
    if !status.is_success() {
        bail!("el coordinador respondió {status}");
    }
    Ok(resp.json().await?)
}

fn print_task(t: &TaskRecord) {
    println!("Tarea {}:", t.id);
    println!("  tipo     : {} ({})", t.kind(), t.lane());
    println!("  estado   : {:?}", t.status);
    println!("  orden    : {}", t.order);
    println!("  creada   : {}", t.created_at);
    if let Some(done) = t.processed_at {
        println!("  procesada: {}", done);
    }
    println!(
        "  intentos : {}/{}",
        t.retry_count,
        t.payload.retry_budget()
    );
    if let Some(err) = &t.last_error {
        println!("  error    : {}", err);
    }
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = cli.url.trim_end_matches('/').to_string();

    match cli.command {
        Commands::Submit { what } => {
            let payload = build_payload(what)?;
            let url = format!("{}/api/v1/tasks", base_url);
            let task: TaskRecord = read(client.post(&url).json(&payload).send().await?).await?;
            println!("Tarea creada:");
            print_task(&task);
        }

        Commands::List { status } => {
            let mut url = format!("{}/api/v1/tasks", base_url);
            if let Some(s) = status {
                url.push_str(&format!("?status={}", s.to_uppercase()));
            }
            let tasks: Vec<TaskRecord> = read(client.get(&url).send().await?).await?;
            if tasks.is_empty() {
                println!("No hay tareas.");
            }
            for t in tasks {
                println!(
                    "{:>6}  {:<20} {:<10} orden={:<6} intentos={}",
                    t.id,
                    t.kind().as_str(),
                    format!("{:?}", t.status),
                    t.order,
                    t.retry_count
                );
            }
        }

        Commands::Status { id } => {
            let url = format!("{}/api/v1/tasks/{id}", base_url);
            let resp = client.get(&url).send().await?;
            if resp.status() == reqwest::StatusCode::NOT_FOUND {
                println!("No se encontró la tarea {id}");
            } else {
                let task: TaskRecord = read(resp).await?;
                print_task(&task);
            }
        }

        Commands::Retry { id } => {
            let url = format!("{}/api/v1/tasks/{id}/retry", base_url);
            let task: TaskRecord = read(client.post(&url).send().await?).await?;
            println!("Tarea {} reencolada (orden {})", task.id, task.order);
        }

        Commands::Cancel { id, lease } => {
            let url = format!("{}/api/v1/tasks/{id}/cancel", base_url);
            let body = CancelRequest {
                lease_id: lease.map(LeaseId),
            };
            let resp: CancelResponse = read(client.post(&url).json(&body).send().await?).await?;
            if resp.cancelled {
                println!("Tarea {id} cancelada");
            } else {
                println!("La tarea {id} no se canceló (lease distinto o ya terminada)");
            }
        }

        Commands::Reorder { id, order } => {
            let url = format!("{}/api/v1/tasks/{id}/reorder", base_url);
            let task: TaskRecord =
                read(client.post(&url).json(&ReorderRequest { order }).send().await?).await?;
            println!("Tarea {} ahora en orden {}", task.id, task.order);
        }

        Commands::Front { id } => {
            let url = format!("{}/api/v1/tasks/{id}/front", base_url);
            let task: TaskRecord = read(client.post(&url).send().await?).await?;
            println!("Tarea {} al frente (orden {})", task.id, task.order);
        }

        Commands::Remove { ids } => {
            let url = format!("{}/api/v1/tasks/remove", base_url);
            let body = RemoveBatchRequest {
                ids: ids.into_iter().map(TaskId).collect(),
            };
            let resp: RemoveBatchResponse =
                read(client.post(&url).json(&body).send().await?).await?;
            println!("{} tareas borradas", resp.removed);
        }

        Commands::Leases => {
            let url = format!("{}/api/v1/leases", base_url);
            let leases: Vec<LeaseInfo> = read(client.get(&url).send().await?).await?;
            if leases.is_empty() {
                println!("No hay leases activos.");
            }
            for l in leases {
                let owner = match &l.owner {
                    LeaseOwnerInfo::Local => "local".to_string(),
                    LeaseOwnerInfo::Remote { worker } => format!("remoto ({worker})"),
                    LeaseOwnerInfo::Adopted => "adoptado".to_string(),
                };
                println!("Lease {}", l.lease_id);
                println!("  tarea          : {}", l.task_id);
                println!("  dueño          : {}", owner);
                println!("  cancelado      : {}", l.canceled);
                println!("  último latido  : {:.1} s", l.heartbeat_age_secs);
                if let (Some(cur), Some(total)) = (l.progress.current, l.progress.total) {
                    println!("  progreso       : {}/{} {}", cur, total, l.progress.unit);
                }
                if !l.progress.status_message.is_empty() {
                    println!("  mensaje        : {}", l.progress.status_message);
                }
                println!();
            }
        }
    }

    Ok(())
}
