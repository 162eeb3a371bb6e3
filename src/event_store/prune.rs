//! Periodic retention
//!
//! A background task that prunes the durable log on a fixed interval until
//! its cancel token fires.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cancel::CancelToken;

use super::store::EventStore;

/// Spawn the prune loop. The first pass runs after one full interval.
pub fn spawn_prune_task(
    store: Arc<EventStore>,
    interval: Duration,
    cancel: CancelToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if !store.has_log() {
            debug!("no event log, prune task idle");
            return;
        }

        let period = interval.max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("prune task stopping");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = store.prune().await {
                        warn!(error = %e, "event log prune failed");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancel_pair;
    use crate::event_store::{AppendLog, EventStoreConfig};
    use crate::utils::FakeClock;
    use serde_json::json;

    #[tokio::test]
    async fn test_prune_task_applies_retention_and_stops() {
        let clock = FakeClock::at_epoch_millis(0);
        let config = EventStoreConfig {
            buffer_size: 1,
            retention: Duration::from_secs(1),
            ..Default::default()
        };
        let store = Arc::new(
            EventStore::with_log(config, AppendLog::open_in_memory().unwrap())
                .unwrap()
                .with_clock(Arc::new(clock.clone())),
        );
        store.publish("t", "e", &json!(1)).unwrap();
        clock.advance(Duration::from_secs(10));

        let (handle, token) = cancel_pair();
        let task = spawn_prune_task(store.clone(), Duration::from_millis(20), token);

        let mut pruned = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if store.log().unwrap().min_seq().await.unwrap().is_none() {
                pruned = true;
                break;
            }
        }
        assert!(pruned);

        handle.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
