use std::io;

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use futures::TryStreamExt;
use tokio_util::io::{ReaderStream, StreamReader};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use common::protocol::{
    Ack, CancelRequest, CancelResponse, DetectionResultRequest, DetectionResultResponse,
    KeepAliveRequest, KeepAliveResponse, LeaseInfo, LeaseQuery, ListTasksQuery,
    RemoveBatchRequest, RemoveBatchResponse, ReorderRequest, ReportTaskFailedRequest,
    RequestTaskRequest, UploadResponse,
};
use common::{TaskAssignment, TaskError, TaskId, TaskPayload, TaskRecord, TaskStatus};

use crate::state::AppState;
use crate::store::StoreError;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        // operador
        .route("/api/v1/tasks", post(create_task).get(list_tasks))
        .route("/api/v1/tasks/remove", post(remove_tasks))
        .route("/api/v1/tasks/:id", get(get_task).delete(delete_task))
        .route("/api/v1/tasks/:id/retry", post(retry_task))
        .route("/api/v1/tasks/:id/reorder", post(reorder_task))
        .route("/api/v1/tasks/:id/front", post(move_to_front))
        .route("/api/v1/tasks/:id/cancel", post(cancel_task))
        .route("/api/v1/leases", get(list_leases))
        // workers remotos
        .route("/api/v1/worker/request-task", post(request_task))
        .route("/api/v1/worker/tasks/:id/file", get(get_file))
        .route(
            "/api/v1/worker/tasks/:id/result",
            post(upload_result).layer(DefaultBodyLimit::disable()),
        )
        .route("/api/v1/worker/keep-alive", post(keep_alive))
        .route("/api/v1/worker/failed", post(report_failed))
        .route("/api/v1/worker/detection-result", post(detection_result))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn store_status(e: StoreError) -> StatusCode {
    match e {
        StoreError::Missing(_) => StatusCode::NOT_FOUND,
        other => {
            warn!("error del store: {}", other);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn task_status(e: &TaskError) -> StatusCode {
    match e {
        TaskError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        TaskError::NotFound => StatusCode::NOT_FOUND,
        TaskError::StaleLease(_) | TaskError::Cancelled(_) => StatusCode::CONFLICT,
        TaskError::Execution(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/* ---------------- handlers HTTP: operador ---------------- */

async fn health() -> &'static str {
    "ok"
}

async fn create_task(
    State(state): State<AppState>,
    Json(payload): Json<TaskPayload>,
) -> Result<Json<TaskRecord>, StatusCode> {
    let record = state.queue.enqueue(payload).await.map_err(store_status)?;
    Ok(Json(record))
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(q): Query<ListTasksQuery>,
) -> Result<Json<Vec<TaskRecord>>, StatusCode> {
    let store = state.queue.store();
    let tasks = match q.status {
        Some(status) => store.list_by_status(status).await,
        None => store.list().await,
    }
    .map_err(store_status)?;
    Ok(Json(tasks))
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<TaskRecord>, StatusCode> {
    state
        .queue
        .get(TaskId(id))
        .await
        .map_err(store_status)?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

// Si está corriendo, primero se cancela su lease
async fn delete_task(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<TaskRecord>, StatusCode> {
    let id = TaskId(id);
    state.manager.cancel(id, None).await;
    state
        .queue
        .remove(id)
        .await
        .map_err(store_status)?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn remove_tasks(
    State(state): State<AppState>,
    Json(req): Json<RemoveBatchRequest>,
) -> Result<Json<RemoveBatchResponse>, StatusCode> {
    for id in &req.ids {
        state.manager.cancel(*id, None).await;
    }
    let removed = state
        .queue
        .remove_batch(&req.ids)
        .await
        .map_err(store_status)?;
    Ok(Json(RemoveBatchResponse { removed }))
}

async fn retry_task(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<TaskRecord>, StatusCode> {
    let id = TaskId(id);
    let current = state
        .queue
        .get(id)
        .await
        .map_err(store_status)?
        .ok_or(StatusCode::NOT_FOUND)?;
    // una tarea en curso no se reintenta
    if current.status == TaskStatus::Processing {
        return Err(StatusCode::CONFLICT);
    }
    let record = state.queue.retry(id).await.map_err(store_status)?;
    Ok(Json(record))
}

async fn reorder_task(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<ReorderRequest>,
) -> Result<Json<TaskRecord>, StatusCode> {
    let record = state
        .queue
        .reorder(TaskId(id), req.order)
        .await
        .map_err(store_status)?;
    Ok(Json(record))
}

async fn move_to_front(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<TaskRecord>, StatusCode> {
    let record = state
        .queue
        .move_to_front(TaskId(id))
        .await
        .map_err(store_status)?;
    Ok(Json(record))
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    body: Option<Json<CancelRequest>>,
) -> Json<CancelResponse> {
    let lease_id = body.and_then(|Json(b)| b.lease_id);
    let cancelled = state.manager.cancel(TaskId(id), lease_id).await;
    Json(CancelResponse { cancelled })
}

async fn list_leases(State(state): State<AppState>) -> Json<Vec<LeaseInfo>> {
    Json(state.manager.list_leases())
}

/* ---------------- handlers HTTP: workers ---------------- */

// Bloquea hasta que haya trabajo o venza el timeout (404)
async fn request_task(
    State(state): State<AppState>,
    Json(req): Json<RequestTaskRequest>,
) -> Result<Json<TaskAssignment>, StatusCode> {
    match state.manager.request_task(req).await {
        Ok(a) => Ok(Json(a)),
        Err(e) => {
            debug!("request-task sin asignación: {}", e);
            Err(task_status(&e))
        }
    }
}

async fn get_file(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(q): Query<LeaseQuery>,
) -> Result<Body, StatusCode> {
    let id = TaskId(id);
    let lease_id = q.lease_id.ok_or(StatusCode::BAD_REQUEST)?;
    if !state.manager.leases().matches(id, lease_id) {
        return Err(StatusCode::CONFLICT);
    }
    let record = state
        .queue
        .get(id)
        .await
        .map_err(store_status)?
        .ok_or(StatusCode::NOT_FOUND)?;
    let source = record.payload.source_path().ok_or(StatusCode::NOT_FOUND)?;

    let file = tokio::fs::File::open(source).await.map_err(|e| {
        warn!("no se pudo abrir {}: {}", source.display(), e);
        StatusCode::NOT_FOUND
    })?;
    debug!(
        "enviando {} para la tarea {}{}",
        source.display(),
        id,
        if q.prefetch { " (prefetch)" } else { "" }
    );
    Ok(Body::from_stream(ReaderStream::new(file)))
}

async fn upload_result(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(q): Query<LeaseQuery>,
    body: Body,
) -> Result<Json<UploadResponse>, StatusCode> {
    let id = TaskId(id);
    let lease_id = q.lease_id.ok_or(StatusCode::BAD_REQUEST)?;

    if !state.manager.leases().matches(id, lease_id) {
        return Ok(Json(UploadResponse {
            success: false,
            message: "lease obsoleta".to_string(),
            task_id: id,
        }));
    }

    let staged = state.uploads_dir.join(format!("{id}-{lease_id}.upload"));
    let stream = body
        .into_data_stream()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
    let mut reader = StreamReader::new(stream);

    let written = async {
        let mut file = tokio::fs::File::create(&staged).await?;
        let n = tokio::io::copy(&mut reader, &mut file).await?;
        tokio::io::AsyncWriteExt::flush(&mut file).await?;
        Ok::<u64, io::Error>(n)
    }
    .await;

    let bytes = match written {
        Ok(n) => n,
        Err(e) => {
            warn!("subida de la tarea {} cortada: {}", id, e);
            let _ = state.fs.remove_file(&staged).await;
            return Err(StatusCode::BAD_REQUEST);
        }
    };
    info!("recibidos {} bytes para la tarea {}", bytes, id);

    match state.manager.finish_upload(id, lease_id, &staged).await {
        Ok(_) => Ok(Json(UploadResponse {
            success: true,
            message: "ok".to_string(),
            task_id: id,
        })),
        Err(e @ TaskError::StaleLease(_)) => Ok(Json(UploadResponse {
            success: false,
            message: e.to_string(),
            task_id: id,
        })),
        Err(e) => {
            warn!("no se pudo completar la tarea {}: {}", id, e);
            Ok(Json(UploadResponse {
                success: false,
                message: e.to_string(),
                task_id: id,
            }))
        }
    }
}

async fn keep_alive(
    State(state): State<AppState>,
    Json(req): Json<KeepAliveRequest>,
) -> Json<KeepAliveResponse> {
    Json(state.manager.keep_alive(req).await)
}

async fn report_failed(
    State(state): State<AppState>,
    Json(req): Json<ReportTaskFailedRequest>,
) -> Json<Ack> {
    let ok = match state.manager.fail(req.task_id, req.lease_id, req.message).await {
        Ok(_) => true,
        Err(e) => {
            debug!("reporte de falla ignorado para {}: {}", req.task_id, e);
            false
        }
    };
    Json(Ack { ok })
}

async fn detection_result(
    State(state): State<AppState>,
    Json(req): Json<DetectionResultRequest>,
) -> Json<DetectionResultResponse> {
    let task_id = req.task_id;
    match state.manager.complete_detection(req).await {
        Ok(_) => Json(DetectionResultResponse {
            success: true,
            message: "ok".to_string(),
        }),
        Err(e) => {
            warn!("detección rechazada para {}: {}", task_id, e);
            Json(DetectionResultResponse {
                success: false,
                message: e.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::LocalFileSystem;
    use crate::events::EventBus;
    use crate::lease::LeaseTable;
    use crate::manager::{LeaseManager, LeaseSettings};
    use crate::queue::tests::{log, upscale};
    use crate::queue::TaskQueue;
    use crate::store::MemoryStore;
    use axum::http::{Method, Request};
    use common::LeaseId;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    struct App {
        router: Router,
        state: AppState,
        dir: tempfile::TempDir,
        shutdown: CancellationToken,
    }

    fn app() -> App {
        let dir = tempfile::tempdir().unwrap();
        let shutdown = CancellationToken::new();
        let queue = Arc::new(TaskQueue::new(
            Arc::new(MemoryStore::new()),
            EventBus::default(),
            100,
        ));
        let fs = Arc::new(LocalFileSystem);
        let manager = Arc::new(LeaseManager::new(
            queue.clone(),
            Arc::new(LeaseTable::new()),
            fs.clone(),
            Arc::new(crate::collaborators::ExistingOutput),
            LeaseSettings {
                request_timeout: Duration::from_millis(200),
                ..Default::default()
            },
            shutdown.clone(),
        ));
        let drains = queue.spawn_drain_loops(&shutdown);
        tokio::spawn(manager.clone().run_dispatch(drains.upscale, shutdown.clone()));

        let uploads_dir = dir.path().join("uploads");
        std::fs::create_dir_all(&uploads_dir).unwrap();
        let state = AppState {
            queue,
            manager,
            fs,
            uploads_dir,
        };
        App {
            router: build_router(state.clone()),
            state,
            dir,
            shutdown,
        }
    }

    fn json_request(method: Method, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json<T: serde::de::DeserializeOwned>(resp: axum::response::Response) -> T {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn operator_can_create_and_fetch_tasks() {
        let app = app();
        let payload = serde_json::to_value(log("desde http")).unwrap();

        let resp = app
            .router
            .clone()
            .oneshot(json_request(Method::POST, "/api/v1/tasks", payload))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let created: TaskRecord = body_json(resp).await;

        let resp = app
            .router
            .clone()
            .oneshot(
                Request::get(format!("/api/v1/tasks/{}", created.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let fetched: TaskRecord = body_json(resp).await;
        assert_eq!(fetched.id, created.id);

        let resp = app
            .router
            .clone()
            .oneshot(Request::get("/api/v1/tasks/999").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        app.shutdown.cancel();
    }

    #[tokio::test]
    async fn request_task_without_work_is_404() {
        let app = app();
        let resp = app
            .router
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/api/v1/worker/request-task",
                serde_json::json!({"prefetch": false}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        app.shutdown.cancel();
        let resp = app
            .router
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/api/v1/worker/request-task",
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn full_remote_round_trip_over_http() {
        let app = app();
        let src = app.dir.path().join("vol1.cbz");
        let out = app.dir.path().join("out").join("vol1.cbz");
        tokio::fs::write(&src, b"original").await.unwrap();
        let task = app
            .state
            .queue
            .enqueue(upscale(src.to_str().unwrap(), out.to_str().unwrap()))
            .await
            .unwrap();

        let resp = app
            .router
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/api/v1/worker/request-task",
                serde_json::json!({"prefetch": false, "worker": "gpu-1"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let a: TaskAssignment = body_json(resp).await;
        assert_eq!(a.task_id, task.id);

        // descarga
        let resp = app
            .router
            .clone()
            .oneshot(
                Request::get(format!(
                    "/api/v1/worker/tasks/{}/file?lease_id={}",
                    a.task_id, a.lease_id
                ))
                .body(Body::empty())
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"original");

        // heartbeat con progreso
        let resp = app
            .router
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/api/v1/worker/keep-alive",
                serde_json::json!({
                    "task_id": a.task_id,
                    "lease_id": a.lease_id,
                    "current": 3,
                    "total": 10
                }),
            ))
            .await
            .unwrap();
        let ka: KeepAliveResponse = body_json(resp).await;
        assert!(ka.is_alive);

        // subida con una lease inventada: rechazada
        let resp = app
            .router
            .clone()
            .oneshot(
                Request::post(format!(
                    "/api/v1/worker/tasks/{}/result?lease_id={}",
                    a.task_id,
                    LeaseId::new()
                ))
                .body(Body::from("basura"))
                .unwrap(),
            )
            .await
            .unwrap();
        let up: UploadResponse = body_json(resp).await;
        assert!(!up.success);

        // subida buena
        let resp = app
            .router
            .clone()
            .oneshot(
                Request::post(format!(
                    "/api/v1/worker/tasks/{}/result?lease_id={}",
                    a.task_id, a.lease_id
                ))
                .body(Body::from("escalado"))
                .unwrap(),
            )
            .await
            .unwrap();
        let up: UploadResponse = body_json(resp).await;
        assert!(up.success, "{}", up.message);
        assert_eq!(tokio::fs::read(&out).await.unwrap(), b"escalado");

        let r = app.state.queue.get(task.id).await.unwrap().unwrap();
        assert_eq!(r.status, TaskStatus::Completed);
        assert!(app.state.manager.leases().is_empty());
        app.shutdown.cancel();
    }

    #[tokio::test]
    async fn worker_calls_must_name_the_lease() {
        let app = app();
        let src = app.dir.path().join("vol2.cbz");
        tokio::fs::write(&src, b"original").await.unwrap();
        let out = app.dir.path().join("out").join("vol2.cbz");
        app.state
            .queue
            .enqueue(upscale(src.to_str().unwrap(), out.to_str().unwrap()))
            .await
            .unwrap();
        let a = app
            .state
            .manager
            .request_task(RequestTaskRequest::default())
            .await
            .unwrap();

        let resp = app
            .router
            .clone()
            .oneshot(
                Request::get(format!("/api/v1/worker/tasks/{}/file", a.task_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app
            .router
            .clone()
            .oneshot(
                Request::get(format!(
                    "/api/v1/worker/tasks/{}/file?lease_id={}",
                    a.task_id,
                    LeaseId::new()
                ))
                .body(Body::empty())
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        // un keep-alive sin lease no llega al manager
        let resp = app
            .router
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/api/v1/worker/keep-alive",
                serde_json::json!({"task_id": a.task_id}),
            ))
            .await
            .unwrap();
        assert!(resp.status().is_client_error());

        // y uno con otra lease no la mantiene viva
        let resp = app
            .router
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/api/v1/worker/keep-alive",
                serde_json::json!({"task_id": a.task_id, "lease_id": LeaseId::new()}),
            ))
            .await
            .unwrap();
        let ka: KeepAliveResponse = body_json(resp).await;
        assert!(!ka.is_alive);
        assert!(app.state.manager.leases().matches(a.task_id, a.lease_id));
        app.shutdown.cancel();
    }

    #[tokio::test]
    async fn cancel_without_lease_reports_false() {
        let app = app();
        let t = app.state.queue.enqueue(log("x")).await.unwrap();
        let resp = app
            .router
            .clone()
            .oneshot(json_request(
                Method::POST,
                &format!("/api/v1/tasks/{}/cancel", t.id),
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        let c: CancelResponse = body_json(resp).await;
        assert!(!c.cancelled);
        app.shutdown.cancel();
    }
}
