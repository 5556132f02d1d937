use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use common::{
    CancelReason, CommandUpscaler, ExternalTool, ProgressTracker, TaskError, UpscaleProfile,
    Upscaler,
};

/// Operaciones de imagen que corre el worker. Son cajas negras.
#[async_trait]
pub trait ImageTools: Send + Sync {
    async fn upscale(
        &self,
        input: &Path,
        output: &Path,
        profile: &UpscaleProfile,
        progress: &ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<(), TaskError>;

    /// Analiza la entrada y devuelve los hallazgos en JSON.
    async fn detect_splits(
        &self,
        input: &Path,
        progress: &ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<Value, TaskError>;

    #[allow(clippy::too_many_arguments)]
    async fn apply_splits(
        &self,
        input: &Path,
        output: &Path,
        findings: &Value,
        upscale_regions: bool,
        profile: &UpscaleProfile,
        progress: &ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<(), TaskError>;
}

/// Implementación con programas externos.
#[derive(Debug, Clone)]
pub struct CommandTools {
    upscaler: CommandUpscaler,
    detector: ExternalTool,
    applier: ExternalTool,
}

impl CommandTools {
    pub fn new(upscaler: ExternalTool, detector: ExternalTool, applier: ExternalTool) -> Self {
        Self {
            // en el worker el token sólo se dispara al perder el lease
            upscaler: CommandUpscaler::new(upscaler).with_cancel_reason(CancelReason::LeaseLost),
            detector,
            applier,
        }
    }
}

#[async_trait]
impl ImageTools for CommandTools {
    async fn upscale(
        &self,
        input: &Path,
        output: &Path,
        profile: &UpscaleProfile,
        progress: &ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<(), TaskError> {
        self.upscaler
            .upscale(input, output, profile, Some(progress), cancel)
            .await
    }

    async fn detect_splits(
        &self,
        input: &Path,
        progress: &ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<Value, TaskError> {
        let lines = self
            .detector
            .run(&[input], None, Some(progress), cancel, CancelReason::LeaseLost)
            .await?;
        let raw = lines.join("\n");
        serde_json::from_str(&raw).map_err(|e| {
            TaskError::Execution(format!("{} devolvió JSON inválido: {e}", self.detector.program))
        })
    }

    async fn apply_splits(
        &self,
        input: &Path,
        output: &Path,
        findings: &Value,
        upscale_regions: bool,
        profile: &UpscaleProfile,
        progress: &ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<(), TaskError> {
        let mut tool = self.applier.clone();
        tool.args.extend([
            "--profile".to_string(),
            profile.name.clone(),
            "--scale".to_string(),
            profile.scale.to_string(),
        ]);
        if upscale_regions {
            tool.args.push("--upscale-regions".to_string());
        }

        // los hallazgos van por stdin
        let stdin = serde_json::to_vec(findings)?;
        tool.run(
            &[input, output],
            Some(&stdin),
            Some(progress),
            cancel,
            CancelReason::LeaseLost,
        )
        .await?;

        if tokio::fs::metadata(output).await.is_err() {
            return Err(TaskError::Execution(format!(
                "{} no generó {}",
                self.applier.program,
                output.display()
            )));
        }
        Ok(())
    }
}
