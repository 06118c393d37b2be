//! Background garbage collection of finalized messages.
//!
//! Lease expiry never depends on this task. It only deletes `Acked` and `Dead`
//! records and dedupe claims once their retention has passed.

use std::time::Duration;

use tokio::{task::JoinHandle, time::MissedTickBehavior};

use crate::{service::Service, store::ReapStats};

/// Runs [`Service::reap`] every `period` until the task is aborted.
/// Failures are logged and retried on the next tick.
pub fn spawn(service: Service, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            match service.reap().await {
                Ok(stats) if stats == ReapStats::default() => {}
                Ok(stats) => tracing::info!(
                    acked = stats.acked,
                    dead = stats.dead,
                    dedupe_keys = stats.dedupe_keys,
                    "Reaped expired records"
                ),
                Err(e) => tracing::warn!("Reap failed: {e}"),
            }
        }
    })
}
