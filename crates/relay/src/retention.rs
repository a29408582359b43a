//! Periodic purge of COMPLETED outbox rows.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use logistics_outbox::{OutboxStore, OutboxStoreError};

/// Delete COMPLETED rows processed more than `retention` before `now`.
pub async fn purge_expired<S: OutboxStore>(
    store: &S,
    retention: Duration,
    now: DateTime<Utc>,
) -> Result<u64, OutboxStoreError> {
    let cutoff = chrono::Duration::from_std(retention)
        .ok()
        .and_then(|retention| now.checked_sub_signed(retention))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    store.purge_completed(cutoff).await
}

pub struct RetentionHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl RetentionHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            warn!(error = %e, "retention task ended abnormally");
        }
    }
}

/// Run `purge_expired` every `every` until shut down. The first sweep runs
/// immediately.
pub fn spawn<S>(store: S, retention: Duration, every: Duration) -> RetentionHandle
where
    S: OutboxStore + 'static,
{
    let (shutdown, mut shutdown_rx) = watch::channel(false);

    let join = tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => break,
                _ = interval.tick() => {
                    match purge_expired(&store, retention, Utc::now()).await {
                        Ok(0) => {}
                        Ok(purged) => info!(purged, retention_secs = retention.as_secs(), "purged completed outbox events"),
                        Err(e) => error!(error = %e, "outbox retention sweep failed"),
                    }
                }
            }
        }
    });

    RetentionHandle { shutdown, join }
}
