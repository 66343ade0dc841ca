//! Proxy data-channel handler, giver side (4.7): one SOCKS session per
//! non-heartbeat data channel, wired to an outbound forwarding socket with
//! bidirectional backpressure.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use tracing::{debug, error};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;

use crate::forwarding::ForwardingSocket;
use crate::protocol::{self, LegacyChannelControl, LegacyChannelMessage};
use crate::session::{Session, SocksSessionSlot};
use crate::socks5::{SocksEvent, SocksSession};

/// High- and low-water mark for the backpressure scheme (4.7). Equal by
/// specification: hysteresis comes from the drain timer's dwell, not from
/// separating the marks (see DESIGN.md, Open Question C).
const BACKPRESSURE_THRESHOLD_BYTES: usize = 500_000;
const DRAIN_CHECK_INTERVAL: Duration = Duration::from_millis(50);

/// Wires a non-heartbeat data channel opened while in give mode.
pub async fn setup_proxy_channel(session: Session, channel: Arc<RTCDataChannel>) {
    let label = channel.label().to_string();
    let legacy = session.state.lock().await.legacy;

    let initial = if legacy {
        SocksSession::awaiting_request()
    } else {
        SocksSession::awaiting_auths()
    };
    let session_key = session.socks_session_key(&label);
    {
        let mut state = session.state.lock().await;
        state
            .socks_sessions
            .insert(label.clone(), SocksSessionSlot::new(session_key.clone(), initial));
    }
    debug!(label = %label, session_key = %session_key, legacy, "proxy SOCKS session constructed");

    let msg_session = session.clone();
    let msg_channel = channel.clone();
    let msg_label = label.clone();
    channel.on_message(Box::new(move |msg: DataChannelMessage| {
        let session = msg_session.clone();
        let channel = msg_channel.clone();
        let label = msg_label.clone();
        Box::pin(async move {
            handle_inbound_message(session, channel, label, msg).await;
        })
    }));
}

async fn handle_inbound_message(
    session: Session,
    channel: Arc<RTCDataChannel>,
    label: String,
    msg: DataChannelMessage,
) {
    let legacy = session.state.lock().await.legacy;

    if !legacy {
        drive_socks_events(&session, &channel, &label, msg.data.to_vec()).await;
        return;
    }

    let text = match String::from_utf8(msg.data.to_vec()) {
        Ok(t) => t,
        Err(_) => {
            error!(label = %label, "legacy channel received non-UTF8 text payload");
            return;
        }
    };

    match protocol::parse_legacy_channel_message(&text) {
        LegacyChannelMessage::Heartbeat => {
            let _ = channel.send_text("heartbeat".to_string()).await;
        }
        LegacyChannelMessage::Control(LegacyChannelControl::Open) => {
            let session_key = session.socks_session_key(&label);
            let mut state = session.state.lock().await;
            state.socks_sessions.insert(
                label.clone(),
                SocksSessionSlot::new(session_key.clone(), SocksSession::awaiting_request()),
            );
            debug!(label = %label, session_key = %session_key, "legacy pool control OPEN: SOCKS session reset");
        }
        LegacyChannelMessage::Control(LegacyChannelControl::Close) => {
            // Ignored per 4.7: CLOSE is a legacy pool signal, not a teardown request.
        }
        LegacyChannelMessage::ControlUnknown(other) => {
            error!(label = %label, control = %other, "unrecognized legacy control value");
        }
        LegacyChannelMessage::SocksRequestData(value) => match socks_request_bytes(&value) {
            Ok(bytes) => drive_socks_events(&session, &channel, &label, bytes).await,
            Err(e) => error!(label = %label, error = %e, "malformed legacy SOCKS request payload"),
        },
    }
}

fn socks_request_bytes(value: &Value) -> Result<Vec<u8>, String> {
    let s = value.as_str().ok_or("expected .data to be a string")?;
    Ok(s.chars().map(|c| c as u8).collect())
}

async fn drive_socks_events(
    session: &Session,
    channel: &Arc<RTCDataChannel>,
    label: &str,
    bytes: Vec<u8>,
) {
    let events = {
        let mut state = session.state.lock().await;
        let Some(slot) = state.socks_sessions.get_mut(label) else {
            return;
        };
        slot.session.on_client_bytes(&bytes)
    };

    for event in events {
        match event {
            SocksEvent::Reply(out) => send_to_socks_client(session, channel, label, out).await,
            SocksEvent::Fatal(msg) => {
                error!(label = %label, error = %msg, "SOCKS session fault");
            }
            SocksEvent::ConnectRequested { host, port } => {
                start_forwarding(session.clone(), channel.clone(), label.to_string(), host, port)
                    .await;
            }
            SocksEvent::Upstream(data) => {
                let forwarding = {
                    let state = session.state.lock().await;
                    state
                        .socks_sessions
                        .get(label)
                        .and_then(|s| s.forwarding.clone())
                };
                if let Some(fwd) = forwarding {
                    fwd.send(data);
                }
            }
        }
    }
}

async fn start_forwarding(
    session: Session,
    channel: Arc<RTCDataChannel>,
    label: String,
    host: String,
    port: u16,
) {
    let cb_session = session.clone();
    let cb_channel = channel.clone();
    let cb_label = label.clone();
    let on_upstream_data = move |data: Vec<u8>| {
        let session = cb_session.clone();
        let channel = cb_channel.clone();
        let label = cb_label.clone();
        tokio::spawn(async move {
            send_to_socks_client(&session, &channel, &label, data).await;
        });
    };

    let connect_result = ForwardingSocket::connect(&host, port, on_upstream_data).await;
    let ok = connect_result.is_ok();
    if let Err(ref e) = connect_result {
        error!(label = %label, host, port, error = %e, "forwarding connect failed");
    }

    let reply_event = {
        let mut state = session.state.lock().await;
        let Some(slot) = state.socks_sessions.get_mut(&label) else {
            return;
        };
        if let Ok(fwd) = connect_result {
            slot.forwarding = Some(fwd);
        }
        slot.session.connect_result(ok)
    };

    if let SocksEvent::Reply(bytes) = reply_event {
        send_to_socks_client(&session, &channel, &label, bytes).await;
    }
}

/// Implements 4.7 item 4: modern peers get bytes directly; legacy peers get
/// their first outbound packet wrapped as `{data:<stringified>}` text, then
/// plain binary afterward. Always followed by a backpressure check.
async fn send_to_socks_client(
    session: &Session,
    channel: &Arc<RTCDataChannel>,
    label: &str,
    bytes: Vec<u8>,
) {
    let (legacy, wrap_as_text) = {
        let mut state = session.state.lock().await;
        let legacy = state.legacy;
        let wrap_as_text = match state.socks_sessions.get_mut(label) {
            Some(slot) => {
                let first = legacy && !slot.sent_first_legacy_packet;
                if first {
                    slot.sent_first_legacy_packet = true;
                }
                first
            }
            None => false,
        };
        (legacy, wrap_as_text)
    };
    let _ = legacy;

    let sent = if wrap_as_text {
        let text = protocol::wrap_legacy_data_text(&bytes);
        channel.send_text(text).await
    } else {
        channel.send(&Bytes::from(bytes)).await.map(|_| ())
    };

    if let Err(e) = sent {
        error!(label = %label, error = %e, "failed to send data to SOCKS client channel");
        return;
    }

    maybe_apply_backpressure(session, channel, label).await;
}

async fn maybe_apply_backpressure(session: &Session, channel: &Arc<RTCDataChannel>, label: &str) {
    let buffered = channel.buffered_amount().await;
    if buffered < BACKPRESSURE_THRESHOLD_BYTES {
        return;
    }

    let should_start_timer = {
        let mut state = session.state.lock().await;
        match state.socks_sessions.get_mut(label) {
            Some(slot) if !slot.drain_timer_active => {
                slot.drain_timer_active = true;
                if let Some(fwd) = &slot.forwarding {
                    fwd.pause();
                }
                true
            }
            _ => false,
        }
    };
    if !should_start_timer {
        return;
    }

    let session = session.clone();
    let channel = channel.clone();
    let label = label.to_string();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(DRAIN_CHECK_INTERVAL);
        loop {
            interval.tick().await;
            let buffered = channel.buffered_amount().await;
            if buffered < BACKPRESSURE_THRESHOLD_BYTES {
                let mut state = session.state.lock().await;
                if let Some(slot) = state.socks_sessions.get_mut(&label) {
                    slot.drain_timer_active = false;
                    if let Some(fwd) = &slot.forwarding {
                        fwd.resume();
                    }
                }
                break;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_request_data_round_trips_through_char_codes() {
        let bytes = vec![0x05u8, 0x01, 0x00, 0x01, 1, 2, 3, 4, 0x00, 0x50];
        let text = protocol::wrap_legacy_data_text(&bytes);
        let value: Value = serde_json::from_str(&text).unwrap();
        let data = value.get("data").cloned().unwrap();
        let decoded = socks_request_bytes(&data).unwrap();
        assert_eq!(decoded, bytes);
    }
}
