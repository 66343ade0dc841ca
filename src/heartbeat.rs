//! Heartbeat manager (4.6): getter-side periodic send, giver-side
//! cancel/re-arm timeout that drives the `num_getters` accounting.
//!
//! Grounded on the same `tokio::select!` shape used by tunnel heartbeat
//! loops elsewhere in the retrieved corpus: a sleep branch races an
//! inbound-reset channel.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;
use webrtc::data_channel::RTCDataChannel;

use crate::registry::Registry;

const GETTER_SEND_INTERVAL: Duration = Duration::from_secs(5);
const GIVER_TIMEOUT: Duration = Duration::from_secs(15);

/// Starts the getter's periodic heartbeat send loop on the given channel.
///
/// Deliberately not cancelled on session teardown: the design note (§5,
/// "Cancellation and timeouts") calls this leak out explicitly, and this
/// implementation preserves it rather than adding a stop path the
/// specification doesn't ask for.
pub fn spawn_getter_send_loop(channel: Arc<RTCDataChannel>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(GETTER_SEND_INTERVAL);
        loop {
            interval.tick().await;
            if channel.send_text("heartbeat".to_string()).await.is_err() {
                break;
            }
        }
    });
}

/// Handle the giver-side data-channel message handler uses to report
/// "a message arrived" to the timeout task (message contents are unused).
#[derive(Clone)]
pub struct GiverHeartbeatHandle {
    reset_tx: mpsc::UnboundedSender<()>,
}

impl GiverHeartbeatHandle {
    pub fn on_message(&self) {
        let _ = self.reset_tx.send(());
    }
}

/// Arms the giver-side liveness timeout (4.6 steps 2-5). Increments
/// `num_getters` immediately; the returned handle's `on_message` cancels
/// and re-arms the 15s timeout. Dropping the handle (session teardown)
/// cancels the timer without a further decrement.
pub fn spawn_giver_timeout(registry: Registry, client_id: String) -> GiverHeartbeatHandle {
    let (reset_tx, mut reset_rx) = mpsc::unbounded_channel::<()>();
    registry.increment_getters();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(GIVER_TIMEOUT) => {
                    registry.decrement_getters();
                    debug!(client_id = %client_id, "heartbeat timeout; num_getters decremented");
                    break;
                }
                got = reset_rx.recv() => {
                    if got.is_none() {
                        debug!(client_id = %client_id, "heartbeat handle dropped; timer cancelled");
                        break;
                    }
                }
            }
        }
    });

    GiverHeartbeatHandle { reset_tx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::BrokerConfig;

    #[tokio::test]
    async fn timeout_decrements_without_reset() {
        let registry = Registry::new(BrokerConfig::default());
        let _handle = spawn_giver_timeout(registry.clone(), "zc0".to_string());
        assert_eq!(registry.num_getters(), 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(registry.num_getters(), 1); // hasn't timed out yet in a 50ms window
    }

    #[tokio::test]
    async fn on_message_keeps_the_handle_alive() {
        let registry = Registry::new(BrokerConfig::default());
        let handle = spawn_giver_timeout(registry.clone(), "zc1".to_string());
        handle.on_message();
        assert_eq!(registry.num_getters(), 1);
    }
}
