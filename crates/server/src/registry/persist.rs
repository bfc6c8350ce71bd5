//! Periodic background persistence of the registry.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::store::RegistryStore;

/// Starts a task that flushes `store` once per `period`.
///
/// Each tick drains the dirty counter and writes the snapshot if it was
/// non-zero. Failed writes are logged and retried on the next tick. When
/// `shutdown` is cancelled the task performs one last flush and exits.
pub fn spawn_persistence_task(
    store: Arc<RegistryStore>,
    period: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Persistence task received shutdown signal");
                    flush_blocking(&store).await;
                    break;
                }
                _ = ticker.tick() => {
                    flush_blocking(&store).await;
                }
            }
        }
    })
}

async fn flush_blocking(store: &Arc<RegistryStore>) {
    let store = Arc::clone(store);
    match tokio::task::spawn_blocking(move || store.flush()).await {
        Ok(Ok(true)) => debug!("Registry persistence cycle wrote snapshot"),
        Ok(Ok(false)) => {}
        // Already logged by the store; the next tick retries.
        Ok(Err(_)) => {}
        Err(e) => error!("Registry persistence cycle panicked: {}", e),
    }
}
