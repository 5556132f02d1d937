use std::path::Path;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{CancelReason, TaskError};
use crate::progress::{ProgressTracker, ProgressUpdate};

/// Programa externo que hace el trabajo pesado.
///
/// Cada línea de stdout con la forma `PROGRESS <actual>/<total> [mensaje]`
/// se vuelca al tracker; el resto se devuelve como salida.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalTool {
    pub program: String,
    pub args: Vec<String>,
}

impl ExternalTool {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Lanza el programa con `extra` detrás de los argumentos fijos.
    /// Si el token se cancela, mata al hijo y devuelve `Cancelled`.
    pub async fn run(
        &self,
        extra: &[&Path],
        stdin: Option<&[u8]>,
        progress: Option<&ProgressTracker>,
        cancel: &CancellationToken,
        reason: CancelReason,
    ) -> Result<Vec<String>, TaskError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .args(extra)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| TaskError::Execution(format!("no se pudo lanzar {}: {e}", self.program)))?;

        if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(bytes).await?;
            pipe.shutdown().await?;
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TaskError::execution("stdout no disponible"))?;
        let mut lines = BufReader::new(stdout).lines();
        let mut output = Vec::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    return Err(TaskError::Cancelled(reason));
                }
                line = lines.next_line() => {
                    match line? {
                        Some(line) => match parse_progress_line(&line) {
                            Some(update) => {
                                if let Some(p) = progress {
                                    p.apply(&update);
                                }
                            }
                            None => output.push(line),
                        },
                        None => break,
                    }
                }
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(TaskError::Cancelled(reason));
            }
            status = child.wait() => status?,
        };

        if status.success() {
            debug!("{} terminó ok", self.program);
            Ok(output)
        } else {
            let mut stderr = String::new();
            if let Some(mut err) = child.stderr.take() {
                use tokio::io::AsyncReadExt;
                let _ = err.read_to_string(&mut stderr).await;
            }
            Err(TaskError::Execution(format!(
                "{} salió con {}: {}",
                self.program,
                status,
                stderr.trim()
            )))
        }
    }
}

/// `PROGRESS 3/10 pagina 3` -> current=3, total=10, mensaje.
pub fn parse_progress_line(line: &str) -> Option<ProgressUpdate> {
    let rest = line.strip_prefix("PROGRESS ")?;
    let (counts, msg) = match rest.split_once(' ') {
        Some((c, m)) => (c, Some(m.trim())),
        None => (rest, None),
    };
    let (current, total) = counts.split_once('/')?;
    let mut update = ProgressUpdate::step(current.parse().ok()?, total.parse().ok()?);
    if let Some(m) = msg.filter(|m| !m.is_empty()) {
        update.status_message = Some(m.to_string());
    }
    Some(update)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_progress_lines() {
        let u = parse_progress_line("PROGRESS 3/10 pagina 3").unwrap();
        assert_eq!(u.current, Some(3));
        assert_eq!(u.total, Some(10));
        assert_eq!(u.status_message.as_deref(), Some("pagina 3"));

        let u = parse_progress_line("PROGRESS 1/2").unwrap();
        assert!(u.status_message.is_none());

        assert!(parse_progress_line("hola").is_none());
        assert!(parse_progress_line("PROGRESS x/2").is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn collects_output_and_progress() {
        let tool = ExternalTool::new("sh").with_args([
            "-c",
            "echo 'PROGRESS 1/2 uno'; echo listo; echo 'PROGRESS 2/2'",
        ]);
        let tracker = ProgressTracker::new();
        let out = tool
            .run(
                &[],
                None,
                Some(&tracker),
                &CancellationToken::new(),
                CancelReason::User,
            )
            .await
            .unwrap();

        assert_eq!(out, vec!["listo".to_string()]);
        let p = tracker.snapshot();
        assert_eq!(p.current, Some(2));
        assert_eq!(p.status_message, "uno");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancellation_kills_the_child() {
        let tool = ExternalTool::new("sh").with_args(["-c", "sleep 30"]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = tool
            .run(&[], None, None, &cancel, CancelReason::Shutdown)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Cancelled(CancelReason::Shutdown)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_is_an_execution_error() {
        let tool = ExternalTool::new("sh").with_args(["-c", "echo roto >&2; exit 3"]);
        let err = tool
            .run(&[], None, None, &CancellationToken::new(), CancelReason::User)
            .await
            .unwrap_err();
        match err {
            TaskError::Execution(msg) => assert!(msg.contains("roto")),
            other => panic!("esperaba Execution, vino {other:?}"),
        }
    }
}
