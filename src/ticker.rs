//! Periodic background tasks with cooperative cancellation

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Run `task` every `period` until `shutdown` flips to true.
///
/// Runs of the same ticker never overlap: a run that outlasts the period
/// causes the missed ticks to be skipped, not queued.
pub fn spawn_ticker<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut task: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        debug!(ticker = name, period_ms = period.as_millis() as u64, "Ticker started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    task().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        debug!(ticker = name, "Ticker stopped");
    })
}
