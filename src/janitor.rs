//! Periodic idle-session sweeper.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::session::SessionStore;

/// Sweep idle sessions on every tick until shutdown. Cancellation
/// interrupts the sleeping tick within one interval.
pub async fn run(store: Arc<SessionStore>, period: Duration, shutdown: CancellationToken) {
    let mut ticker =
        tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let removed = store.sweep_idle();
                if removed > 0 {
                    info!(removed, "idle sessions swept");
                }
            }
            _ = shutdown.cancelled() => {
                debug!("janitor stopped");
                return;
            }
        }
    }
}
