//! Cliente HTTP del worker hacia el coordinador.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Response, StatusCode};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::debug;

use common::protocol::{
    Ack, DetectionResultRequest, DetectionResultResponse, KeepAliveRequest, KeepAliveResponse,
    ReportTaskFailedRequest, RequestTaskRequest, UploadResponse,
};
use common::{LeaseId, TaskAssignment, TaskError, TaskId};

/// Llamadas que el pipeline hace al coordinador.
#[async_trait]
pub trait CoordinatorApi: Send + Sync {
    /// `NotFound` si no hubo trabajo dentro del timeout del coordinador.
    async fn request_task(&self, prefetch: bool) -> Result<TaskAssignment, TaskError>;

    /// Baja la entrada de la tarea a `dest`. Devuelve los bytes escritos.
    async fn download_input(
        &self,
        assignment: &TaskAssignment,
        prefetch: bool,
        dest: &Path,
    ) -> Result<u64, TaskError>;

    /// Devuelve `is_alive`.
    async fn keep_alive(&self, req: KeepAliveRequest) -> Result<bool, TaskError>;

    async fn report_failed(
        &self,
        task_id: TaskId,
        lease_id: LeaseId,
        message: String,
    ) -> Result<(), TaskError>;

    async fn upload_result(
        &self,
        task_id: TaskId,
        lease_id: LeaseId,
        path: &Path,
    ) -> Result<UploadResponse, TaskError>;

    async fn upload_detection_result(
        &self,
        req: DetectionResultRequest,
    ) -> Result<DetectionResultResponse, TaskError>;
}

pub struct HttpCoordinator {
    client: Client,
    base_url: String,
    worker: String,
}

// el coordinador retiene request-task hasta 30 s
const REQUEST_TASK_TIMEOUT: Duration = Duration::from_secs(45);
const CALL_TIMEOUT: Duration = Duration::from_secs(20);

impl HttpCoordinator {
    pub fn new(base_url: impl Into<String>, worker: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            worker: worker.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn transport(e: reqwest::Error) -> TaskError {
    if e.is_connect() || e.is_timeout() || e.is_request() {
        TaskError::Unavailable(e.to_string())
    } else {
        TaskError::Execution(e.to_string())
    }
}

/// Traduce códigos HTTP a la taxonomía de errores de tareas.
fn check(resp: Response, task_id: Option<TaskId>) -> Result<Response, TaskError> {
    match resp.status() {
        s if s.is_success() => Ok(resp),
        StatusCode::NOT_FOUND => Err(TaskError::NotFound),
        StatusCode::SERVICE_UNAVAILABLE | StatusCode::BAD_GATEWAY | StatusCode::GATEWAY_TIMEOUT => {
            Err(TaskError::Unavailable(format!("coordinador respondió {}", resp.status())))
        }
        StatusCode::CONFLICT => match task_id {
            Some(id) => Err(TaskError::StaleLease(id)),
            None => Err(TaskError::Execution("conflicto".into())),
        },
        s => Err(TaskError::Execution(format!("coordinador respondió {s}"))),
    }
}

#[async_trait]
impl CoordinatorApi for HttpCoordinator {
    async fn request_task(&self, prefetch: bool) -> Result<TaskAssignment, TaskError> {
        let resp = self
            .client
            .post(self.url("/api/v1/worker/request-task"))
            .timeout(REQUEST_TASK_TIMEOUT)
            .json(&RequestTaskRequest {
                prefetch,
                worker: Some(self.worker.clone()),
            })
            .send()
            .await
            .map_err(transport)?;
        let resp = check(resp, None)?;
        resp.json().await.map_err(transport)
    }

    async fn download_input(
        &self,
        assignment: &TaskAssignment,
        prefetch: bool,
        dest: &Path,
    ) -> Result<u64, TaskError> {
        let url = self.url(&format!(
            "/api/v1/worker/tasks/{}/file?lease_id={}&prefetch={}",
            assignment.task_id, assignment.lease_id, prefetch
        ));
        let resp = self.client.get(url).send().await.map_err(transport)?;
        let resp = check(resp, Some(assignment.task_id))?;

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = resp.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(transport)?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        debug!("bajados {} bytes para la tarea {}", written, assignment.task_id);
        Ok(written)
    }

    async fn keep_alive(&self, req: KeepAliveRequest) -> Result<bool, TaskError> {
        let task_id = req.task_id;
        let resp = self
            .client
            .post(self.url("/api/v1/worker/keep-alive"))
            .timeout(CALL_TIMEOUT)
            .json(&req)
            .send()
            .await
            .map_err(transport)?;
        let body: KeepAliveResponse = check(resp, Some(task_id))?
            .json()
            .await
            .map_err(transport)?;
        Ok(body.is_alive)
    }

    async fn report_failed(
        &self,
        task_id: TaskId,
        lease_id: LeaseId,
        message: String,
    ) -> Result<(), TaskError> {
        let resp = self
            .client
            .post(self.url("/api/v1/worker/failed"))
            .timeout(CALL_TIMEOUT)
            .json(&ReportTaskFailedRequest {
                task_id,
                lease_id,
                message,
            })
            .send()
            .await
            .map_err(transport)?;
        let ack: Ack = check(resp, Some(task_id))?
            .json()
            .await
            .map_err(transport)?;
        if !ack.ok {
            debug!("el coordinador ignoró la falla de la tarea {}", task_id);
        }
        Ok(())
    }

    async fn upload_result(
        &self,
        task_id: TaskId,
        lease_id: LeaseId,
        path: &Path,
    ) -> Result<UploadResponse, TaskError> {
        let file = tokio::fs::File::open(path).await?;
        let len = file.metadata().await?.len();
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));

        let resp = self
            .client
            .post(self.url(&format!(
                "/api/v1/worker/tasks/{task_id}/result?lease_id={lease_id}"
            )))
            .header(reqwest::header::CONTENT_LENGTH, len)
            .body(body)
            .send()
            .await
            .map_err(transport)?;
        check(resp, Some(task_id))?
            .json()
            .await
            .map_err(transport)
    }

    async fn upload_detection_result(
        &self,
        req: DetectionResultRequest,
    ) -> Result<DetectionResultResponse, TaskError> {
        let task_id = req.task_id;
        let resp = self
            .client
            .post(self.url("/api/v1/worker/detection-result"))
            .timeout(CALL_TIMEOUT)
            .json(&req)
            .send()
            .await
            .map_err(transport)?;
        check(resp, Some(task_id))?
            .json()
            .await
            .map_err(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_coordinator_is_unavailable() {
        // puerto 9 (discard): nadie escucha
        let api = HttpCoordinator::new("http://127.0.0.1:9/", "test");
        let err = api.request_task(false).await.unwrap_err();
        assert!(matches!(err, TaskError::Unavailable(_)), "{err:?}");
    }

    #[test]
    fn base_url_is_normalized() {
        let api = HttpCoordinator::new("http://coord:8080/", "w");
        assert_eq!(api.url("/health"), "http://coord:8080/health");
    }
}
