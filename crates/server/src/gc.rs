use std::sync::Arc;
use std::time::Duration;

use concierge_agent::AgentRuntime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

/// Removes rate windows that ended more than an hour ago. Returns the number deleted.
pub async fn sweep(runtime: &AgentRuntime) -> Option<u64> {
    match runtime.cleanup_expired_rate_limits().await {
        Ok(removed) => {
            info!(event_name = "system.rate_limit_gc.swept", removed, "expired rate windows removed");
            Some(removed)
        }
        Err(error) => {
            error!(
                event_name = "system.rate_limit_gc.failed",
                error = %error,
                "rate window cleanup failed"
            );
            None
        }
    }
}

/// Sweeps every `interval` until `shutdown` flips to true. The first sweep waits one interval.
pub fn spawn(
    runtime: Arc<AgentRuntime>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    sweep(&runtime).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(event_name = "system.rate_limit_gc.stopped", "rate window cleanup stopped");
    })
}
