use std::time::Duration;

use berth_core::Result;
use berth_store::Store;
use tracing::{debug, error};

use crate::broker::Broker;

#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Tick between tail reads. 1s in production, 10ms in tests.
    pub interval: Duration,
    /// Rows fetched per tail read.
    pub batch_size: i64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            batch_size: 500,
        }
    }
}

/// Tails event rows after the persisted cursor and forwards them to the
/// broker. The cursor is advanced after each forwarded batch, so a restart
/// republishes at most one batch — subscribers are cursor-based and
/// tolerate at-least-once delivery.
pub struct Poller {
    store: Store,
    broker: Broker,
    config: PollerConfig,
}

impl Poller {
    pub fn new(store: Store, broker: Broker, config: PollerConfig) -> Self {
        Self {
            store,
            broker,
            config,
        }
    }

    /// Forward everything currently unseen. Returns how many rows were
    /// published.
    pub async fn poll_once(&self) -> Result<usize> {
        let mut cursor = self.store.events().poller_cursor().await?;
        let mut published = 0;

        loop {
            let batch = self
                .store
                .events()
                .list_after(cursor, self.config.batch_size)
                .await?;
            if batch.is_empty() {
                break;
            }

            cursor = batch.last().map(|e| e.id).unwrap_or(cursor);
            for event in batch {
                self.broker.publish(event);
                published += 1;
            }
            self.store.events().set_poller_cursor(cursor).await?;
        }

        if published > 0 {
            debug!(published, cursor, "forwarded event rows");
        }
        Ok(published)
    }

    /// Run forever on the configured interval. Spawn this on its own task;
    /// abort the task to stop.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(e) = self.poll_once().await {
                error!(error = %e, "event poll failed");
            }
        }
    }
}
