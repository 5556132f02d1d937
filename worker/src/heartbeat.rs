//! KeepAlive por tarea: empuja el último progreso y corta el trabajo si el
//! coordinador dice que el lease ya no existe. Siempre late con la lease
//! vigente de la tarea, que puede cambiar si el coordinador la reasigna.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use common::protocol::KeepAliveRequest;
use common::{LeaseId, Progress, ProgressUpdate, TaskId};

use crate::client::CoordinatorApi;

#[derive(Debug, Clone, Copy)]
pub struct HeartbeatSettings {
    /// Latido sin progreso nuevo.
    pub every: Duration,
    /// Cada cuánto se mira si hay progreso para enviar.
    pub progress_interval: Duration,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            every: Duration::from_secs(15),
            progress_interval: Duration::from_millis(400),
        }
    }
}

/// Loop de KeepAlive de una tarea. Se detiene con `stop` o al soltarlo.
pub struct Heartbeat {
    stop: CancellationToken,
    join: Option<JoinHandle<()>>,
}

impl Heartbeat {
    /// `work` se cancela si el coordinador responde `is_alive = false`.
    pub fn spawn(
        api: Arc<dyn CoordinatorApi>,
        task_id: TaskId,
        lease: watch::Receiver<LeaseId>,
        progress: watch::Receiver<Progress>,
        settings: HeartbeatSettings,
        work: CancellationToken,
    ) -> Self {
        let stop = CancellationToken::new();
        let join = tokio::spawn(run(
            api,
            task_id,
            lease,
            progress,
            settings,
            work,
            stop.clone(),
        ));
        Self {
            stop,
            join: Some(join),
        }
    }

    pub async fn stop(mut self) {
        self.stop.cancel();
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn run(
    api: Arc<dyn CoordinatorApi>,
    task_id: TaskId,
    mut lease: watch::Receiver<LeaseId>,
    mut progress: watch::Receiver<Progress>,
    settings: HeartbeatSettings,
    work: CancellationToken,
    stop: CancellationToken,
) {
    let mut ticker = interval(settings.progress_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_sent = Instant::now();

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let changed = progress.has_changed().unwrap_or(false);
        let rebound = lease.has_changed().unwrap_or(false);
        if !changed && !rebound && last_sent.elapsed() < settings.every {
            continue;
        }
        let lease_id = *lease.borrow_and_update();
        let update = if changed {
            ProgressUpdate::from(&*progress.borrow_and_update())
        } else {
            ProgressUpdate::default()
        };

        let req = KeepAliveRequest {
            task_id,
            lease_id,
            progress: update,
            prefetch: false,
        };
        match api.keep_alive(req).await {
            Ok(true) => {
                last_sent = Instant::now();
            }
            Ok(false) if lease.has_changed().unwrap_or(false) => {
                debug!("la tarea {} cambió de lease durante el latido", task_id);
            }
            Ok(false) => {
                warn!("el coordinador soltó la tarea {}, cancelando", task_id);
                work.cancel();
                break;
            }
            Err(e) => {
                // se reintenta en el próximo latido
                debug!("keep-alive de la tarea {} falló: {}", task_id, e);
                last_sent = Instant::now();
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::pipeline::tests::FakeApi;
    use common::ProgressTracker;

    fn lease() -> watch::Receiver<LeaseId> {
        watch::channel(LeaseId::new()).1
    }

    fn fast() -> HeartbeatSettings {
        HeartbeatSettings {
            every: Duration::from_millis(50),
            progress_interval: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn progress_is_forwarded() {
        let api = Arc::new(FakeApi::default());
        let tracker = ProgressTracker::new();
        let hb = Heartbeat::spawn(
            api.clone(),
            TaskId(1),
            lease(),
            tracker.subscribe(),
            fast(),
            CancellationToken::new(),
        );

        tracker.apply(&ProgressUpdate::step(3, 10));
        tokio::time::sleep(Duration::from_millis(60)).await;
        hb.stop().await;

        let sent = api.keep_alives();
        assert!(sent.iter().any(|r| r.progress.current == Some(3)));
        assert!(sent.iter().all(|r| r.task_id == TaskId(1)));
    }

    #[tokio::test]
    async fn dead_lease_cancels_work() {
        let api = Arc::new(FakeApi::default());
        api.set_alive(false);
        let work = CancellationToken::new();
        let tracker = ProgressTracker::new();
        let _hb = Heartbeat::spawn(
            api.clone(),
            TaskId(2),
            lease(),
            tracker.subscribe(),
            fast(),
            work.clone(),
        );

        tracker.apply(&ProgressUpdate::message("arrancando"));
        tokio::time::timeout(Duration::from_secs(2), work.cancelled())
            .await
            .expect("el trabajo debería cancelarse");
    }

    #[tokio::test]
    async fn rebound_lease_is_used_from_then_on() {
        let api = Arc::new(FakeApi::default());
        let first = LeaseId::new();
        let (tx, rx) = watch::channel(first);
        let tracker = ProgressTracker::new();
        let hb = Heartbeat::spawn(
            api.clone(),
            TaskId(4),
            rx,
            tracker.subscribe(),
            fast(),
            CancellationToken::new(),
        );

        tracker.apply(&ProgressUpdate::step(1, 5));
        tokio::time::sleep(Duration::from_millis(30)).await;
        let second = LeaseId::new();
        tx.send_replace(second);
        tokio::time::sleep(Duration::from_millis(30)).await;
        hb.stop().await;

        let sent = api.keep_alives();
        assert_eq!(sent[0].lease_id, first);
        assert_eq!(sent.last().map(|r| r.lease_id), Some(second));
    }

    #[tokio::test]
    async fn idle_task_still_beats() {
        let api = Arc::new(FakeApi::default());
        let tracker = ProgressTracker::new();
        let hb = Heartbeat::spawn(
            api.clone(),
            TaskId(3),
            lease(),
            tracker.subscribe(),
            fast(),
            CancellationToken::new(),
        );

        tokio::time::sleep(Duration::from_millis(180)).await;
        hb.stop().await;
        assert!(api.keep_alives().len() >= 2);
        assert!(api.keep_alives().iter().all(|r| r.progress.is_empty()));
    }
}
