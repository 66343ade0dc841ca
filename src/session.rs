//! Per-Zork-client session state (3): mode, legacy latch, peer connection,
//! pending ICE queue, transform stash, and (giver-side) SOCKS session table.
//!
//! Confined to a single owning task per the concurrency model (5): mutable
//! fields live behind a `tokio::sync::Mutex` so WebRTC callbacks, which are
//! `'static` closures without direct access to the owning task's stack, can
//! still touch session state without racing the control-transport loop.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Notify};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::RTCPeerConnection;

use crate::commands::Mode;
use crate::forwarding::ForwardingSocket;
use crate::registry::Registry;
use crate::socks5::SocksSession;

/// Reserved data-channel label for the heartbeat channel (4.4-4.6).
pub const HEARTBEAT_LABEL: &str = "HEARTBEAT";

/// A giver-side SOCKS session plus the bookkeeping the proxy bridge (4.7)
/// needs alongside it: the composite registration key (step 1: `"<client_id>:
/// <channel_label>"`), the legacy first-packet latch, the connected
/// forwarding socket (once the CONNECT handshake completes), and whether a
/// backpressure drain timer is currently running for this channel.
pub struct SocksSessionSlot {
    pub session_key: String,
    pub session: SocksSession,
    pub sent_first_legacy_packet: bool,
    pub forwarding: Option<ForwardingSocket>,
    pub drain_timer_active: bool,
}

impl SocksSessionSlot {
    pub fn new(session_key: String, session: SocksSession) -> Self {
        Self {
            session_key,
            session,
            sent_first_legacy_packet: false,
            forwarding: None,
            drain_timer_active: false,
        }
    }
}

pub struct SessionState {
    pub mode: Option<Mode>,
    pub legacy: bool,
    pub remote_received: bool,
    pub pending_ice: Vec<RTCIceCandidateInit>,
    pub transform_name: Option<String>,
    pub transform_config: Option<String>,
    pub peer_connection: Option<Arc<RTCPeerConnection>>,
    /// Giver-side only: data-channel label -> SOCKS session.
    pub socks_sessions: HashMap<String, SocksSessionSlot>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            mode: None,
            legacy: false,
            remote_received: false,
            pending_ice: Vec::new(),
            transform_name: None,
            transform_config: None,
            peer_connection: None,
            socks_sessions: HashMap::new(),
        }
    }
}

/// A single inbound Zork control connection.
#[derive(Clone)]
pub struct Session {
    pub client_id: String,
    pub registry: Registry,
    pub state: Arc<Mutex<SessionState>>,
    /// Outbound control-transport lines, drained by the connection's writer task.
    pub control_tx: mpsc::UnboundedSender<String>,
    /// Signals the writer task to close the control socket (4.6 step 1: the
    /// handoff to the data channel is complete once the heartbeat channel opens).
    pub control_close: Arc<Notify>,
}

impl Session {
    pub fn new(
        client_id: String,
        registry: Registry,
        control_tx: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            client_id,
            registry,
            state: Arc::new(Mutex::new(SessionState::default())),
            control_tx,
            control_close: Arc::new(Notify::new()),
        }
    }

    /// Queues a line to be written (with `\n` appended) on the control transport.
    /// Silently dropped if the control transport has already closed.
    pub fn reply(&self, line: impl Into<String>) {
        let _ = self.control_tx.send(line.into());
    }

    /// Closes the control transport: signaling is done, the heartbeat channel
    /// has taken over (4.6 step 1).
    pub fn close_control_transport(&self) {
        self.control_close.notify_one();
    }

    /// Socks-session registration key, per 4.7: `"<client_id>:<channel_label>"`.
    pub fn socks_session_key(&self, channel_label: &str) -> String {
        format!("{}:{}", self.client_id, channel_label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{BrokerConfig, Registry};

    #[tokio::test]
    async fn mode_transitions_once_and_never_reverts() {
        let registry = Registry::new(BrokerConfig::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = Session::new("zc0".to_string(), registry, tx);

        {
            let mut state = session.state.lock().await;
            assert_eq!(state.mode, None);
            state.mode = Some(Mode::Give);
        }
        let state = session.state.lock().await;
        assert_eq!(state.mode, Some(Mode::Give));
    }

    #[test]
    fn socks_session_key_format() {
        let registry = Registry::new(BrokerConfig::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = Session::new("zc3".to_string(), registry, tx);
        assert_eq!(session.socks_session_key("abc123"), "zc3:abc123");
    }
}
