use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use common::task::LogLevel;
use common::{
    CancelReason, ExternalTool, ProgressTracker, ProgressUpdate, TaskError, TaskKind, TaskPayload,
    TaskRecord, Upscaler,
};

use crate::collaborators::{FileSystem, OutputVerifier};

/// Cuerpo de una tarea ejecutada en el proceso del coordinador.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(
        &self,
        task: &TaskRecord,
        progress: &ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<(), TaskError>;
}

/// Registro tipo -> handler. Se arma al iniciar y después sólo se lee.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskKind, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// El último registrado gana.
    pub fn register(&mut self, kind: TaskKind, handler: Arc<dyn TaskHandler>) {
        if self.handlers.insert(kind, handler).is_some() {
            debug!("handler de {} reemplazado", kind);
        }
    }

    pub fn get(&self, kind: TaskKind) -> Option<&Arc<dyn TaskHandler>> {
        self.handlers.get(&kind)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

pub struct Runtime {
    registry: Arc<HandlerRegistry>,
}

impl Runtime {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub async fn execute(
        &self,
        task: &TaskRecord,
        progress: &ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<(), TaskError> {
        let kind = task.kind();
        let handler = self
            .registry
            .get(kind)
            .ok_or_else(|| TaskError::Execution(format!("no hay handler para {kind}")))?;
        handler.handle(task, progress, cancel).await
    }
}

/* --------- handlers incluidos --------- */

/// Upscale y repair-upscale locales. Escribe a un temporal junto a la salida
/// y lo mueve al final, así nunca queda una salida a medias.
pub struct UpscaleHandler {
    upscaler: Arc<dyn Upscaler>,
    verifier: Arc<dyn OutputVerifier>,
    fs: Arc<dyn FileSystem>,
}

impl UpscaleHandler {
    pub fn new(
        upscaler: Arc<dyn Upscaler>,
        verifier: Arc<dyn OutputVerifier>,
        fs: Arc<dyn FileSystem>,
    ) -> Self {
        Self {
            upscaler,
            verifier,
            fs,
        }
    }
}

fn partial_path(output: &Path) -> PathBuf {
    let mut name = output
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    output.with_file_name(name)
}

#[async_trait]
impl TaskHandler for UpscaleHandler {
    async fn handle(
        &self,
        task: &TaskRecord,
        progress: &ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<(), TaskError> {
        let (source, output, profile, repair) = match &task.payload {
            TaskPayload::Upscale(t) => (&t.source_path, &t.output_path, &t.profile, false),
            TaskPayload::RepairUpscale(t) => (&t.source_path, &t.output_path, &t.profile, true),
            other => {
                return Err(TaskError::Execution(format!(
                    "UpscaleHandler no sabe ejecutar {}",
                    other.kind()
                )))
            }
        };

        if !self.fs.exists(source).await {
            return Err(TaskError::Execution(format!(
                "archivo fuente inexistente: {}",
                source.display()
            )));
        }
        // un repair siempre rehace la salida
        if !repair && self.verifier.is_valid(source, output).await {
            info!("tarea {}: salida ya válida, nada que hacer", task.id);
            return Ok(());
        }

        if let Some(parent) = output.parent() {
            if !parent.as_os_str().is_empty() {
                self.fs.create_dir_all(parent).await?;
            }
        }
        let partial = partial_path(output);
        progress.apply(&ProgressUpdate {
            phase: Some("upscale".into()),
            ..ProgressUpdate::message(format!("escalando {}", source.display()))
        });

        let res = self
            .upscaler
            .upscale(source, &partial, profile, Some(progress), cancel)
            .await;
        if let Err(e) = res {
            let _ = self.fs.remove_file(&partial).await;
            return Err(e);
        }
        if cancel.is_cancelled() {
            let _ = self.fs.remove_file(&partial).await;
            return Err(TaskError::Cancelled(CancelReason::User));
        }

        self.fs.move_file(&partial, output).await?;
        info!("tarea {}: salida escrita en {}", task.id, output.display());
        Ok(())
    }
}

/// Escribe el mensaje de una tarea `log` en el log del coordinador.
pub struct LogHandler;

#[async_trait]
impl TaskHandler for LogHandler {
    async fn handle(
        &self,
        task: &TaskRecord,
        _progress: &ProgressTracker,
        _cancel: &CancellationToken,
    ) -> Result<(), TaskError> {
        let TaskPayload::Log(t) = &task.payload else {
            return Err(TaskError::execution("LogHandler sólo acepta tareas log"));
        };
        match t.level {
            LogLevel::Debug => debug!(task = %task.id, "{}", t.message),
            LogLevel::Info => info!(task = %task.id, "{}", t.message),
            LogLevel::Warn => warn!(task = %task.id, "{}", t.message),
            LogLevel::Error => error!(task = %task.id, "{}", t.message),
        }
        Ok(())
    }
}

/// Delega la tarea en un programa externo que recibe el registro como JSON
/// por stdin.
pub struct CommandHandler {
    tool: ExternalTool,
}

impl CommandHandler {
    pub fn new(tool: ExternalTool) -> Self {
        Self { tool }
    }
}

#[async_trait]
impl TaskHandler for CommandHandler {
    async fn handle(
        &self,
        task: &TaskRecord,
        progress: &ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<(), TaskError> {
        let input = serde_json::to_vec(task)?;
        let out = self
            .tool
            .run(&[], Some(&input), Some(progress), cancel, CancelReason::User)
            .await?;
        if let Some(last) = out.last() {
            progress.apply(&ProgressUpdate::message(last.clone()));
        }
        Ok(())
    }
}
