use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::manager::LeaseManager;

/// Loop de tolerancia a fallos:
/// - busca leases remotas sin heartbeat
/// - reencola las tareas que no terminaron
pub async fn run_sweep_loop(
    manager: Arc<LeaseManager>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    info!(
        "sweep de leases cada {:?} (umbral {:?})",
        interval,
        manager.settings().stale_after
    );
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = sleep(interval) => {}
        }

        let requeued = manager.sweep_once(Instant::now()).await;
        if requeued > 0 {
            info!("sweep: {} tareas reencoladas", requeued);
        } else {
            debug!("sweep sin novedades");
        }
    }
    debug!("sweep detenido");
}
