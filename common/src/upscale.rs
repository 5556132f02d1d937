use async_trait::async_trait;
use std::path::Path;
use tokio_util::sync::CancellationToken;

use crate::error::{CancelReason, TaskError};
use crate::progress::ProgressTracker;
use crate::task::UpscaleProfile;
use crate::tool::ExternalTool;

/// Algoritmo de escalado. Para el scheduler es una caja negra.
#[async_trait]
pub trait Upscaler: Send + Sync {
    async fn upscale(
        &self,
        input: &Path,
        output: &Path,
        profile: &UpscaleProfile,
        progress: Option<&ProgressTracker>,
        cancel: &CancellationToken,
    ) -> Result<(), TaskError>;
}

/// Upscaler que delega en un programa externo:
/// `<program> <args...> --profile <name> --scale <n> <input> <output>`.
#[derive(Debug, Clone)]
pub struct CommandUpscaler {
    tool: ExternalTool,
    cancel_reason: CancelReason,
}

impl CommandUpscaler {
    pub fn new(tool: ExternalTool) -> Self {
        Self {
            tool,
            cancel_reason: CancelReason::User,
        }
    }

    /// Motivo que se reporta cuando el token se dispara durante el escalado.
    pub fn with_cancel_reason(mut self, reason: CancelReason) -> Self {
        self.cancel_reason = reason;
        self
    }
}

#[async_trait]
impl Upscaler for CommandUpscaler {
    async fn upscale(
        &self,
        input: &Path,
        output: &Path,
        profile: &UpscaleProfile,
        progress: Option<&ProgressTracker>,
        cancel: &CancellationToken,
    ) -> Result<(), TaskError> {
        let mut tool = self.tool.clone();
        tool.args.extend([
            "--profile".to_string(),
            profile.name.clone(),
            "--scale".to_string(),
            profile.scale.to_string(),
        ]);

        tool.run(&[input, output], None, progress, cancel, self.cancel_reason)
            .await?;

        if tokio::fs::metadata(output).await.is_err() {
            return Err(TaskError::Execution(format!(
                "{} no generó {}",
                self.tool.program,
                output.display()
            )));
        }
        Ok(())
    }
}
