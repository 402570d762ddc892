use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{Duration, sleep};
use tracing::{debug, error, info};

use crate::db::JobStore;

/// Periodically remove terminal jobs older than `retention`
///
/// Expired ids read as not found afterwards. Jobs that are still accepted or
/// running are never removed.
pub async fn run_retention(
    store: JobStore,
    retention: Duration,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!("Retention sweeper started: retention={:?}, interval={:?}", retention, interval);

    loop {
        tokio::select! {
            _ = sleep(interval) => {}
            _ = shutdown_rx.changed() => {}
        }
        if *shutdown_rx.borrow() {
            info!("Retention sweeper stopping");
            break;
        }

        let cutoff = match chrono::Duration::from_std(retention) {
            Ok(retention) => Utc::now() - retention,
            Err(e) => {
                error!("Invalid retention period {:?}: {}", retention, e);
                break;
            }
        };

        match store.expire(cutoff).await {
            Ok(0) => debug!("No jobs expired"),
            Ok(expired) => info!("Expired {} jobs finished before {}", expired, cutoff),
            Err(e) => error!("Failed to expire jobs: {:?}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::JobOutcome;
    use serde_json::json;

    #[tokio::test]
    async fn sweeper_expires_finished_jobs() {
        let store = JobStore::memory();
        let job = store.create("execute", json!({})).await.unwrap();
        store.acquire_next().await.unwrap();
        store
            .complete(job.id, JobOutcome::failure("X", "y", "loc".into()))
            .await
            .unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_retention(
            store.clone(),
            Duration::ZERO,
            Duration::from_millis(10),
            shutdown_rx,
        ));

        for _ in 0..100 {
            if store.get(job.id).await.unwrap().is_none() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(store.get(job.id).await.unwrap().is_none());

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
