//! Periodic keepalive requests

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

use crate::client::Shared;

/// Ping the current session every `period` until the client stops
///
/// Failures are logged and otherwise ignored; detecting a dead session is
/// left to the session itself.
pub(crate) async fn run(shared: Arc<Shared>, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shared.stop.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let session = shared.state.lock().await.session.clone();
        let Some(session) = session else {
            continue;
        };

        tokio::select! {
            _ = shared.stop.cancelled() => break,
            result = tokio::time::timeout(period, session.ping()) => match result {
                Ok(Ok(())) => debug!("[{}] Keepalive acknowledged", session.id()),
                Ok(Err(e)) => debug!("[{}] Keepalive failed: {}", session.id(), e),
                Err(_) => debug!("[{}] Keepalive timed out after {:?}", session.id(), period),
            },
        }
    }

    debug!("Keepalive stopped");
}
