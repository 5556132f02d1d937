//! Pipeline del worker: Fetch -> Process -> Upload, cada etapa en su loop.
//!
//! Fetch y Process se unen por un canal de capacidad 1, así a lo sumo hay
//! una tarea descargada esperando GPU. Process y Upload por uno de capacidad
//! `upload_capacity`. Cada tarea pide la siguiente exactamente una vez: al
//! dispararse el prefetch o, si nunca se disparó, al terminar de procesarse.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::protocol::DetectionResultRequest;
use common::{
    CancelReason, LeaseId, ProgressTracker, TaskAssignment, TaskError, TaskId, TaskKind,
    UpscaleProfile,
};

use crate::client::CoordinatorApi;
use crate::config::WorkerConfig;
use crate::heartbeat::{Heartbeat, HeartbeatSettings};
use crate::predictor::{PrefetchPredictor, ProgressWatch};
use crate::tools::ImageTools;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub work_dir: PathBuf,
    pub heartbeat: HeartbeatSettings,
    pub retry_backoff: Duration,
    pub idle_delay: Duration,
    pub upload_capacity: usize,
}

impl From<&WorkerConfig> for PipelineSettings {
    fn from(cfg: &WorkerConfig) -> Self {
        Self {
            work_dir: cfg.work_dir.clone(),
            heartbeat: HeartbeatSettings {
                every: cfg.heartbeat(),
                progress_interval: cfg.progress_interval(),
            },
            retry_backoff: cfg.retry_backoff(),
            idle_delay: cfg.idle_delay(),
            upload_capacity: cfg.upload_capacity.max(1),
        }
    }
}

/// Tareas que el worker tiene entre Fetch y el fin de Upload, con la lease
/// vigente de cada una.
#[derive(Debug, Default)]
pub struct InFlight {
    leases: Mutex<HashMap<TaskId, watch::Sender<LeaseId>>>,
}

impl InFlight {
    /// Registra la tarea y devuelve su lease observable. Si ya estaba en
    /// vuelo, el coordinador la reasignó: pasa a la lease nueva y devuelve None.
    pub fn admit(&self, id: TaskId, lease: LeaseId) -> Option<watch::Receiver<LeaseId>> {
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        match leases.entry(id) {
            Entry::Occupied(e) => {
                e.get().send_replace(lease);
                None
            }
            Entry::Vacant(e) => {
                let (tx, rx) = watch::channel(lease);
                e.insert(tx);
                Some(rx)
            }
        }
    }

    pub fn remove(&self, id: TaskId) {
        self.leases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    pub fn len(&self) -> usize {
        self.leases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Tarea descargada, con su latido corriendo.
struct WorkItem {
    assignment: TaskAssignment,
    lease: watch::Receiver<LeaseId>,
    input: PathBuf,
    output: PathBuf,
    progress: ProgressTracker,
    cancel: CancellationToken,
    heartbeat: Heartbeat,
    signaled: AtomicBool,
}

impl WorkItem {
    fn id(&self) -> TaskId {
        self.assignment.task_id
    }

    fn lease_id(&self) -> LeaseId {
        *self.lease.borrow()
    }

    fn profile(&self) -> UpscaleProfile {
        self.assignment.params.profile.clone().unwrap_or_default()
    }
}

enum Outcome {
    File(PathBuf),
    Detection(Value),
}

struct Finished {
    item: WorkItem,
    outcome: Outcome,
}

pub struct Pipeline {
    api: Arc<dyn CoordinatorApi>,
    tools: Arc<dyn ImageTools>,
    settings: PipelineSettings,
    predictor: Mutex<PrefetchPredictor>,
    in_flight: InFlight,
    shutdown: CancellationToken,
}

impl Pipeline {
    pub fn new(
        api: Arc<dyn CoordinatorApi>,
        tools: Arc<dyn ImageTools>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            api,
            tools,
            settings,
            predictor: Mutex::new(PrefetchPredictor::default()),
            in_flight: InFlight::default(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancelarlo detiene las tres etapas.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    pub fn predictor(&self) -> PrefetchPredictor {
        self.predictor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Corre las tres etapas hasta que se cancele el token de apagado.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let shutdown = self.shutdown.clone();
        tokio::fs::create_dir_all(&self.settings.work_dir)
            .await
            .with_context(|| format!("creando {}", self.settings.work_dir.display()))?;

        let (signal_tx, signal_rx) = mpsc::channel::<()>(1);
        let (fetched_tx, fetched_rx) = mpsc::channel::<WorkItem>(1);
        let (done_tx, done_rx) = mpsc::channel::<Finished>(self.settings.upload_capacity);

        // la primera tarea se pide sin esperar a nadie
        let _ = signal_tx.try_send(());

        let fetch = tokio::spawn(self.clone().fetch_loop(signal_rx, fetched_tx, shutdown.clone()));
        let process = tokio::spawn(self.clone().process_loop(
            fetched_rx,
            done_tx,
            signal_tx,
            shutdown.clone(),
        ));
        let upload = tokio::spawn(self.clone().upload_loop(done_rx, shutdown.clone()));

        for (name, handle) in [("fetch", fetch), ("process", process), ("upload", upload)] {
            if let Err(e) = handle.await {
                warn!("la etapa {} terminó con panic: {}", name, e);
            }
        }
        info!("pipeline detenido");
        Ok(())
    }

    // ---------- fetch ----------

    async fn fetch_loop(
        self: Arc<Self>,
        mut signals: mpsc::Receiver<()>,
        fetched: mpsc::Sender<WorkItem>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                signal = signals.recv() => if signal.is_none() { break },
            }
            // señales repetidas valen por una
            while signals.try_recv().is_ok() {}

            let Some(item) = self.fetch_one(&shutdown).await else {
                break;
            };
            debug!("tarea {} lista para procesar", item.id());
            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    self.abandon(item, None).await;
                    break;
                }
                permit = fetched.reserve() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        self.abandon(item, None).await;
                        break;
                    }
                },
            };
            permit.send(item);
        }
        debug!("fetch detenido");
    }

    /// Pide tareas hasta conseguir una y bajarla. None sólo al apagar.
    async fn fetch_one(&self, shutdown: &CancellationToken) -> Option<WorkItem> {
        loop {
            if shutdown.is_cancelled() {
                return None;
            }
            let prefetch = !self.in_flight.is_empty();

            let assignment = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return None,
                res = self.api.request_task(prefetch) => res,
            };
            let assignment = match assignment {
                Ok(a) => a,
                Err(TaskError::NotFound) => {
                    self.pause(self.settings.idle_delay, shutdown).await;
                    continue;
                }
                Err(TaskError::Unavailable(msg)) => {
                    debug!("coordinador no disponible: {}", msg);
                    self.pause(self.settings.retry_backoff, shutdown).await;
                    continue;
                }
                Err(e) => {
                    warn!("request-task falló: {}", e);
                    self.pause(self.settings.retry_backoff, shutdown).await;
                    continue;
                }
            };

            let id = assignment.task_id;
            let Some(lease) = self.in_flight.admit(id, assignment.lease_id) else {
                info!(
                    "la tarea {} ya está en vuelo, sigue con la lease {}",
                    id, assignment.lease_id
                );
                continue;
            };
            info!(
                "tarea {} asignada ({}, lease {}, prefetch = {})",
                id, assignment.kind, assignment.lease_id, prefetch
            );

            let cancel = shutdown.child_token();
            let progress = ProgressTracker::new();
            let heartbeat = Heartbeat::spawn(
                self.api.clone(),
                id,
                lease.clone(),
                progress.subscribe(),
                self.settings.heartbeat,
                cancel.clone(),
            );
            let input = self
                .settings
                .work_dir
                .join(format!("{id}-in-{}", assignment.params.input_name));
            let output = self
                .settings
                .work_dir
                .join(format!("{id}-out-{}", assignment.params.input_name));

            let item = WorkItem {
                assignment,
                lease,
                input,
                output,
                progress,
                cancel,
                heartbeat,
                signaled: AtomicBool::new(false),
            };

            let started = Instant::now();
            let downloaded = tokio::select! {
                biased;
                _ = item.cancel.cancelled() => Err(TaskError::Cancelled(CancelReason::LeaseLost)),
                res = self.api.download_input(&item.assignment, prefetch, &item.input) => res,
            };
            match downloaded {
                Ok(bytes) => {
                    self.lock_predictor().record_download(started.elapsed());
                    debug!("tarea {}: {} bytes en {:?}", id, bytes, started.elapsed());
                    return Some(item);
                }
                Err(e) => {
                    warn!("no se pudo bajar la tarea {}: {}", id, e);
                    self.abandon(item, Some(e)).await;
                }
            }
        }
    }

    async fn pause(&self, wait: Duration, shutdown: &CancellationToken) {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = sleep(wait) => {}
        }
    }

    // ---------- process ----------

    async fn process_loop(
        self: Arc<Self>,
        mut fetched: mpsc::Receiver<WorkItem>,
        done: mpsc::Sender<Finished>,
        signal: mpsc::Sender<()>,
        shutdown: CancellationToken,
    ) {
        loop {
            let item = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                item = fetched.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            let id = item.id();
            let result = self.process_one(&item, &signal).await;
            // si el prefetch nunca se disparó, la próxima se pide ahora
            self.signal_once(&item, &signal);

            match result {
                Ok(outcome) => {
                    debug!("tarea {} procesada", id);
                    if let Err(mpsc::error::SendError(finished)) =
                        done.send(Finished { item, outcome }).await
                    {
                        self.abandon(finished.item, None).await;
                        break;
                    }
                }
                Err(e) => {
                    warn!("tarea {} falló al procesar: {}", id, e);
                    self.abandon(item, Some(e)).await;
                }
            }
        }
        // lo ya descargado que no llegó a procesarse se suelta
        fetched.close();
        while let Ok(item) = fetched.try_recv() {
            debug!("tarea {} descartada sin procesar", item.id());
            self.abandon(item, None).await;
        }
        debug!("process detenido");
    }

    async fn process_one(
        &self,
        item: &WorkItem,
        signal: &mpsc::Sender<()>,
    ) -> Result<Outcome, TaskError> {
        let op = self.run_tool(item);
        tokio::pin!(op);

        let mut rx = item.progress.subscribe();
        let mut watch = ProgressWatch::new();
        loop {
            tokio::select! {
                res = &mut op => return res,
                Ok(()) = rx.changed() => {
                    let progress = rx.borrow_and_update().clone();
                    let fire = watch.observe(&mut self.lock_predictor(), &progress, Instant::now());
                    if fire {
                        debug!("prefetch disparado por la tarea {}", item.id());
                        self.signal_once(item, signal);
                    }
                }
            }
        }
    }

    async fn run_tool(&self, item: &WorkItem) -> Result<Outcome, TaskError> {
        let profile = item.profile();
        match item.assignment.kind {
            TaskKind::Upscale => {
                self.tools
                    .upscale(&item.input, &item.output, &profile, &item.progress, &item.cancel)
                    .await?;
                Ok(Outcome::File(item.output.clone()))
            }
            TaskKind::DetectSplits => {
                let found = self
                    .tools
                    .detect_splits(&item.input, &item.progress, &item.cancel)
                    .await?;
                Ok(Outcome::Detection(found))
            }
            TaskKind::ApplySplits => {
                let findings = item
                    .assignment
                    .split_findings
                    .clone()
                    .ok_or_else(|| TaskError::execution("apply-splits sin hallazgos"))?;
                self.tools
                    .apply_splits(
                        &item.input,
                        &item.output,
                        &findings,
                        item.assignment.params.upscale_regions,
                        &profile,
                        &item.progress,
                        &item.cancel,
                    )
                    .await?;
                Ok(Outcome::File(item.output.clone()))
            }
            other => Err(TaskError::Execution(format!(
                "el worker no sabe ejecutar {other}"
            ))),
        }
    }

    fn signal_once(&self, item: &WorkItem, signal: &mpsc::Sender<()>) {
        if !item.signaled.swap(true, Ordering::SeqCst) {
            // lleno = ya hay una señal pendiente
            let _ = signal.try_send(());
        }
    }

    // ---------- upload ----------

    async fn upload_loop(
        self: Arc<Self>,
        mut done: mpsc::Receiver<Finished>,
        shutdown: CancellationToken,
    ) {
        loop {
            let finished = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                f = done.recv() => match f {
                    Some(f) => f,
                    None => break,
                },
            };
            self.upload_one(finished, &shutdown).await;
        }
        // lo que quedó encolado se limpia sin reportar
        while let Ok(finished) = done.try_recv() {
            self.abandon(finished.item, None).await;
        }
        debug!("upload detenido");
    }

    async fn upload_one(&self, finished: Finished, shutdown: &CancellationToken) {
        let Finished { item, outcome } = finished;
        let id = item.id();

        loop {
            // la lease puede cambiar entre intentos si el coordinador la reasignó
            let lease_id = item.lease_id();
            let res = match &outcome {
                Outcome::File(path) => self
                    .api
                    .upload_result(id, lease_id, path)
                    .await
                    .map(|r| (r.success, r.message)),
                Outcome::Detection(found) => self
                    .api
                    .upload_detection_result(DetectionResultRequest {
                        task_id: id,
                        lease_id,
                        result_json: found.clone(),
                    })
                    .await
                    .map(|r| (r.success, r.message)),
            };

            match res {
                Ok((true, _)) => {
                    info!("tarea {} subida", id);
                    self.finish(item).await;
                    return;
                }
                Ok((false, message)) => {
                    warn!("el coordinador rechazó la tarea {}: {}", id, message);
                    self.finish(item).await;
                    return;
                }
                Err(TaskError::Unavailable(msg)) if !shutdown.is_cancelled() => {
                    debug!("subida de la tarea {} pospuesta: {}", id, msg);
                    self.pause(self.settings.retry_backoff, shutdown).await;
                }
                Err(e) => {
                    warn!("no se pudo subir la tarea {}: {}", id, e);
                    self.abandon(item, Some(e)).await;
                    return;
                }
            }
        }
    }

    // ---------- limpieza ----------

    async fn finish(&self, item: WorkItem) {
        let id = item.id();
        cleanup(&[&item.input, &item.output]).await;
        item.heartbeat.stop().await;
        self.in_flight.remove(id);
    }

    /// Suelta la tarea: borra temporales, corta el latido y, si hay error y
    /// no se está apagando, lo reporta al coordinador.
    async fn abandon(&self, item: WorkItem, error: Option<TaskError>) {
        let id = item.id();
        let lease_id = item.lease_id();

        item.cancel.cancel();
        self.finish(item).await;

        let Some(error) = error else { return };
        if self.shutdown.is_cancelled() {
            // el sweep del coordinador la reencola
            debug!("tarea {} soltada al apagar", id);
            return;
        }
        if let Err(e) = self.api.report_failed(id, lease_id, error.to_string()).await {
            warn!("no se pudo reportar la falla de la tarea {}: {}", id, e);
        }
    }

    fn lock_predictor(&self) -> std::sync::MutexGuard<'_, PrefetchPredictor> {
        self.predictor.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn cleanup(paths: &[&Path]) {
    for path in paths {
        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!("borrado {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("no se pudo borrar {}: {}", path.display(), e),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use common::protocol::{DetectionResultResponse, KeepAliveRequest, TaskParams, UploadResponse};
    use common::{LeaseId, ProgressUpdate};

    /// Coordinador en memoria: reparte lo encolado y anota cada llamada.
    #[derive(Default)]
    pub(crate) struct FakeApi {
        queue: Mutex<VecDeque<TaskAssignment>>,
        dead: AtomicBool,
        requests: Mutex<Vec<bool>>,
        keep_alives: Mutex<Vec<KeepAliveRequest>>,
        failures: Mutex<Vec<(TaskId, String)>>,
        uploads: Mutex<Vec<(TaskId, Vec<u8>)>>,
        upload_leases: Mutex<Vec<LeaseId>>,
        detections: Mutex<Vec<(TaskId, Value)>>,
    }

    impl FakeApi {
        pub(crate) fn push(&self, a: TaskAssignment) {
            self.queue.lock().unwrap().push_back(a);
        }

        pub(crate) fn set_alive(&self, alive: bool) {
            self.dead.store(!alive, Ordering::SeqCst);
        }

        pub(crate) fn keep_alives(&self) -> Vec<KeepAliveRequest> {
            self.keep_alives.lock().unwrap().clone()
        }

        fn requests(&self) -> Vec<bool> {
            self.requests.lock().unwrap().clone()
        }

        fn failures(&self) -> Vec<(TaskId, String)> {
            self.failures.lock().unwrap().clone()
        }

        fn uploads(&self) -> Vec<(TaskId, Vec<u8>)> {
            self.uploads.lock().unwrap().clone()
        }

        fn upload_leases(&self) -> Vec<LeaseId> {
            self.upload_leases.lock().unwrap().clone()
        }

        fn detections(&self) -> Vec<(TaskId, Value)> {
            self.detections.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CoordinatorApi for FakeApi {
        async fn request_task(&self, prefetch: bool) -> Result<TaskAssignment, TaskError> {
            self.requests.lock().unwrap().push(prefetch);
            self.queue
                .lock()
                .unwrap()
                .pop_front()
                .ok_or(TaskError::NotFound)
        }

        async fn download_input(
            &self,
            a: &TaskAssignment,
            _prefetch: bool,
            dest: &Path,
        ) -> Result<u64, TaskError> {
            let body = format!("input-{}", a.task_id);
            tokio::fs::write(dest, &body).await?;
            Ok(body.len() as u64)
        }

        async fn keep_alive(&self, req: KeepAliveRequest) -> Result<bool, TaskError> {
            self.keep_alives.lock().unwrap().push(req);
            Ok(!self.dead.load(Ordering::SeqCst))
        }

        async fn report_failed(
            &self,
            task_id: TaskId,
            _lease_id: LeaseId,
            message: String,
        ) -> Result<(), TaskError> {
            self.failures.lock().unwrap().push((task_id, message));
            Ok(())
        }

        async fn upload_result(
            &self,
            task_id: TaskId,
            lease_id: LeaseId,
            path: &Path,
        ) -> Result<UploadResponse, TaskError> {
            let bytes = tokio::fs::read(path).await?;
            self.uploads.lock().unwrap().push((task_id, bytes));
            self.upload_leases.lock().unwrap().push(lease_id);
            Ok(UploadResponse {
                success: true,
                message: "ok".into(),
                task_id,
            })
        }

        async fn upload_detection_result(
            &self,
            req: DetectionResultRequest,
        ) -> Result<DetectionResultResponse, TaskError> {
            self.detections
                .lock()
                .unwrap()
                .push((req.task_id, req.result_json));
            Ok(DetectionResultResponse {
                success: true,
                message: "ok".into(),
            })
        }
    }

    /// Herramientas falsas: avanzan `steps` unidades y copian la entrada.
    /// Una entrada con "bad" en el nombre falla.
    #[derive(Default)]
    struct FakeTools {
        steps: u64,
        linger: Duration,
        block: bool,
    }

    #[async_trait]
    impl ImageTools for FakeTools {
        async fn upscale(
            &self,
            input: &Path,
            output: &Path,
            _profile: &UpscaleProfile,
            progress: &ProgressTracker,
            cancel: &CancellationToken,
        ) -> Result<(), TaskError> {
            for i in 1..=self.steps {
                progress.apply(&ProgressUpdate::step(i, self.steps));
                tokio::task::yield_now().await;
            }
            if self.block {
                cancel.cancelled().await;
                return Err(TaskError::Cancelled(CancelReason::LeaseLost));
            }
            sleep(self.linger).await;
            if input.to_string_lossy().contains("bad") {
                return Err(TaskError::execution("imagen rota"));
            }
            tokio::fs::copy(input, output).await?;
            Ok(())
        }

        async fn detect_splits(
            &self,
            _input: &Path,
            _progress: &ProgressTracker,
            _cancel: &CancellationToken,
        ) -> Result<Value, TaskError> {
            Ok(serde_json::json!({"splits": [4, 9]}))
        }

        async fn apply_splits(
            &self,
            input: &Path,
            output: &Path,
            _findings: &Value,
            _upscale_regions: bool,
            _profile: &UpscaleProfile,
            _progress: &ProgressTracker,
            _cancel: &CancellationToken,
        ) -> Result<(), TaskError> {
            tokio::fs::copy(input, output).await?;
            Ok(())
        }
    }

    fn assignment(id: i64, kind: TaskKind, name: &str) -> TaskAssignment {
        TaskAssignment {
            task_id: TaskId(id),
            lease_id: LeaseId::new(),
            kind,
            params: TaskParams {
                profile: None,
                input_name: name.to_string(),
                upscale_regions: false,
            },
            split_findings: None,
        }
    }

    fn settings(dir: &Path) -> PipelineSettings {
        PipelineSettings {
            work_dir: dir.to_path_buf(),
            heartbeat: HeartbeatSettings {
                every: Duration::from_millis(50),
                progress_interval: Duration::from_millis(5),
            },
            retry_backoff: Duration::from_millis(10),
            idle_delay: Duration::from_millis(10),
            upload_capacity: 3,
        }
    }

    async fn wait_until(what: &str, cond: impl Fn() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("timeout esperando: {what}");
    }

    struct Running {
        api: Arc<FakeApi>,
        pipeline: Arc<Pipeline>,
        join: tokio::task::JoinHandle<Result<()>>,
        dir: tempfile::TempDir,
    }

    fn start(tools: FakeTools, tasks: Vec<TaskAssignment>) -> Running {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(FakeApi::default());
        for t in tasks {
            api.push(t);
        }
        let pipeline = Arc::new(Pipeline::new(
            api.clone(),
            Arc::new(tools),
            settings(dir.path()),
        ));
        let join = tokio::spawn(pipeline.clone().run());
        Running {
            api,
            pipeline,
            join,
            dir,
        }
    }

    impl Running {
        async fn stop(self) -> (Arc<FakeApi>, Arc<Pipeline>, tempfile::TempDir) {
            self.pipeline.shutdown_token().cancel();
            self.join.await.unwrap().unwrap();
            (self.api, self.pipeline, self.dir)
        }
    }

    fn leftovers(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[tokio::test]
    async fn tasks_flow_through_every_stage() {
        let run = start(
            FakeTools {
                steps: 4,
                ..Default::default()
            },
            vec![
                assignment(1, TaskKind::Upscale, "a.png"),
                assignment(2, TaskKind::Upscale, "b.png"),
                assignment(3, TaskKind::ApplySplits, "c.png"),
            ],
        );
        // apply-splits sin hallazgos tiene que fallar
        let api = run.api.clone();
        wait_until("dos subidas y una falla", || {
            api.uploads().len() == 2 && api.failures().len() == 1
        })
        .await;

        let (api, pipeline, dir) = run.stop().await;
        let mut uploads = api.uploads();
        uploads.sort_by_key(|(id, _)| *id);
        assert_eq!(uploads[0], (TaskId(1), b"input-1".to_vec()));
        assert_eq!(uploads[1], (TaskId(2), b"input-2".to_vec()));
        assert_eq!(api.failures()[0].0, TaskId(3));
        assert!(api.failures()[0].1.contains("hallazgos"));

        assert!(pipeline.in_flight().is_empty());
        assert_eq!(pipeline.predictor().download_stats().count(), 3);
        assert_eq!(leftovers(dir.path()), 0);
    }

    #[tokio::test]
    async fn split_kinds_reach_their_endpoints() {
        let mut apply = assignment(2, TaskKind::ApplySplits, "s.png");
        apply.split_findings = Some(serde_json::json!({"splits": [1]}));
        let run = start(
            FakeTools::default(),
            vec![assignment(1, TaskKind::DetectSplits, "s.png"), apply],
        );
        let api = run.api.clone();
        wait_until("detección y subida", || {
            api.detections().len() == 1 && api.uploads().len() == 1
        })
        .await;

        let (api, _, dir) = run.stop().await;
        let (id, found) = &api.detections()[0];
        assert_eq!(*id, TaskId(1));
        assert_eq!(found["splits"][1], 9);
        assert_eq!(api.uploads()[0].0, TaskId(2));
        assert_eq!(leftovers(dir.path()), 0);
    }

    #[tokio::test]
    async fn tool_failure_is_reported_and_cleaned_up() {
        let run = start(
            FakeTools {
                steps: 2,
                ..Default::default()
            },
            vec![
                assignment(1, TaskKind::Upscale, "bad.png"),
                assignment(2, TaskKind::Upscale, "good.png"),
            ],
        );
        let api = run.api.clone();
        wait_until("una falla y una subida", || {
            api.failures().len() == 1 && api.uploads().len() == 1
        })
        .await;

        let (api, pipeline, dir) = run.stop().await;
        assert_eq!(api.failures()[0].0, TaskId(1));
        assert!(api.failures()[0].1.contains("imagen rota"));
        assert_eq!(api.uploads()[0].0, TaskId(2));
        assert!(pipeline.in_flight().is_empty());
        assert_eq!(leftovers(dir.path()), 0);
    }

    #[tokio::test]
    async fn lost_lease_cancels_the_work() {
        let run = start(
            FakeTools {
                steps: 3,
                block: true,
                ..Default::default()
            },
            vec![assignment(7, TaskKind::Upscale, "x.png")],
        );
        run.api.set_alive(false);
        let api = run.api.clone();
        wait_until("falla por lease perdido", || api.failures().len() == 1).await;

        let (api, pipeline, dir) = run.stop().await;
        assert!(api.uploads().is_empty());
        assert_eq!(api.failures()[0].0, TaskId(7));
        assert!(pipeline.in_flight().is_empty());
        assert_eq!(leftovers(dir.path()), 0);
    }

    #[tokio::test]
    async fn next_task_is_prefetched_while_processing() {
        let run = start(
            FakeTools {
                steps: 20,
                linger: Duration::from_millis(200),
                ..Default::default()
            },
            vec![
                assignment(1, TaskKind::Upscale, "a.png"),
                assignment(2, TaskKind::Upscale, "b.png"),
            ],
        );
        let api = run.api.clone();
        wait_until("dos subidas", || api.uploads().len() == 2).await;

        let (api, _, _dir) = run.stop().await;
        let requests = api.requests();
        // la primera sale sin nada en vuelo; la segunda mientras la 1 procesa
        assert!(!requests[0]);
        assert!(requests[1]);
    }

    #[tokio::test]
    async fn reassigned_task_moves_to_the_new_lease() {
        let first = assignment(5, TaskKind::Upscale, "d.png");
        let mut again = first.clone();
        again.lease_id = LeaseId::new();
        let run = start(
            FakeTools {
                steps: 2,
                linger: Duration::from_millis(300),
                ..Default::default()
            },
            vec![first.clone(), again.clone()],
        );
        let api = run.api.clone();
        wait_until("una subida", || api.uploads().len() == 1).await;

        let (api, pipeline, dir) = run.stop().await;
        assert!(api.requests().len() >= 2);
        assert_eq!(api.uploads()[0].0, TaskId(5));
        assert_eq!(api.upload_leases(), vec![again.lease_id]);
        assert!(api.failures().is_empty());
        // el latido también pasó a la lease nueva
        assert!(api.keep_alives().iter().any(|r| r.lease_id == again.lease_id));
        assert!(pipeline.in_flight().is_empty());
        assert_eq!(leftovers(dir.path()), 0);
    }

    #[tokio::test]
    async fn shutdown_releases_downloaded_but_unprocessed_tasks() {
        let run = start(
            FakeTools {
                steps: 3,
                block: true,
                ..Default::default()
            },
            vec![
                assignment(1, TaskKind::Upscale, "a.png"),
                assignment(2, TaskKind::Upscale, "b.png"),
            ],
        );
        // la 1 queda procesando y la 2 descargada esperando turno
        let dir = run.dir.path().to_path_buf();
        let pipeline = run.pipeline.clone();
        wait_until("dos entradas bajadas", || {
            leftovers(&dir) == 2 && pipeline.in_flight().len() == 2
        })
        .await;
        sleep(Duration::from_millis(20)).await;

        let (api, pipeline, dir) = run.stop().await;
        assert!(pipeline.in_flight().is_empty());
        assert_eq!(leftovers(dir.path()), 0);
        assert!(api.failures().is_empty());
        assert!(api.uploads().is_empty());
    }

    #[test]
    fn in_flight_rebinds_duplicates() {
        let f = InFlight::default();
        let first = LeaseId::new();
        let rx = f.admit(TaskId(1), first).unwrap();
        assert_eq!(*rx.borrow(), first);

        let second = LeaseId::new();
        assert!(f.admit(TaskId(1), second).is_none());
        assert_eq!(*rx.borrow(), second);
        assert_eq!(f.len(), 1);

        f.remove(TaskId(1));
        assert!(f.is_empty());
        assert!(f.admit(TaskId(1), first).is_some());
    }
}
