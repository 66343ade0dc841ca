//! Signaling bridge (4.3): translates Zork-framed JSON into WebRTC
//! offer/answer/ICE calls, including the legacy `{signals:{PLAIN:[...]}}`
//! envelope and its numerically tagged inner union.

use serde_json::Value;
use tracing::{debug, error, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use crate::commands::Mode;
use crate::protocol::{
    self, parse_legacy_inner, parse_modern, LegacyEnvelope, LegacyInner, ModernSignal,
    SessionDescriptionMsg,
};
use crate::session::Session;
use crate::webrtc_peer::{self, BrokerError};

/// Entry point: one signaling-phase line (mode already != unset).
pub async fn handle_line(session: &Session, raw: &str) -> Result<(), BrokerError> {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            error!(client_id = %session.client_id, error = %e, "malformed signaling JSON");
            return Err(format!("malformed signaling JSON: {e}").into());
        }
    };

    if value.get("signals").is_some() {
        return handle_legacy(session, value).await;
    }
    handle_modern(session, value).await
}

async fn handle_legacy(session: &Session, value: Value) -> Result<(), BrokerError> {
    let envelope: LegacyEnvelope = serde_json::from_value(value)
        .map_err(|e| -> BrokerError { format!("malformed legacy envelope: {e}").into() })?;

    let plain = envelope.signals.plain.ok_or_else(|| -> BrokerError {
        "only the PLAIN signals channel is supported".to_string().into()
    })?;

    if plain.len() != 1 {
        let msg = format!(
            "legacy envelope must carry exactly one inner message, got {}",
            plain.len()
        );
        error!(client_id = %session.client_id, "{msg}");
        return Err(msg.into());
    }

    {
        let mut state = session.state.lock().await;
        state.legacy = true;
    }

    let inner = parse_legacy_inner(&plain[0]).map_err(|e| -> BrokerError { e.into() })?;
    match inner {
        LegacyInner::Offer(desc) => handle_offer(session, desc).await,
        LegacyInner::Answer(desc) => handle_answer(session, desc).await,
        LegacyInner::Candidate(raw) => handle_candidate(session, &raw).await,
    }
}

async fn handle_modern(session: &Session, value: Value) -> Result<(), BrokerError> {
    match parse_modern(&value) {
        Some(ModernSignal::Offer(desc)) => handle_offer(session, desc).await,
        Some(ModernSignal::Answer(desc)) => handle_answer(session, desc).await,
        Some(ModernSignal::Candidate(raw)) => handle_candidate(session, &raw).await,
        None => {
            warn!(client_id = %session.client_id, "ignoring unrecognized signaling message");
            Ok(())
        }
    }
}

async fn handle_offer(session: &Session, desc: SessionDescriptionMsg) -> Result<(), BrokerError> {
    let (mode, legacy, pc) = {
        let state = session.state.lock().await;
        (state.mode, state.legacy, state.peer_connection.clone())
    };

    if mode != Some(Mode::Give) {
        warn!(client_id = %session.client_id, "ignoring offer outside give mode");
        return Ok(());
    }
    let Some(pc) = pc else {
        warn!(client_id = %session.client_id, "offer received before peer connection existed");
        return Ok(());
    };

    webrtc_peer::set_remote_description(&pc, &desc).await?;

    let queued = {
        let mut state = session.state.lock().await;
        state.remote_received = true;
        std::mem::take(&mut state.pending_ice)
    };
    for candidate in queued {
        webrtc_peer::add_ice_candidate(&pc, candidate).await?;
    }

    let answer = webrtc_peer::create_answer(&pc).await?;

    if legacy {
        let wrapped = protocol::wrap_legacy_answer(&answer);
        session.reply(wrapped.to_string());
    } else {
        session.reply(serde_json::json!({"type": "answer", "sdp": answer.sdp}).to_string());
    }
    debug!(client_id = %session.client_id, "answer emitted for inbound offer");
    Ok(())
}

async fn handle_answer(session: &Session, desc: SessionDescriptionMsg) -> Result<(), BrokerError> {
    let (mode, pc) = {
        let state = session.state.lock().await;
        (state.mode, state.peer_connection.clone())
    };
    if mode != Some(Mode::Get) {
        warn!(client_id = %session.client_id, "ignoring answer outside get mode");
        return Ok(());
    }
    let Some(pc) = pc else {
        warn!(client_id = %session.client_id, "answer received before peer connection existed");
        return Ok(());
    };

    webrtc_peer::set_remote_description(&pc, &desc).await?;
    let mut state = session.state.lock().await;
    state.remote_received = true;
    Ok(())
}

async fn handle_candidate(session: &Session, raw: &Value) -> Result<(), BrokerError> {
    let candidate = candidate_init_from_json(raw)?;

    let (remote_received, pc) = {
        let state = session.state.lock().await;
        (state.remote_received, state.peer_connection.clone())
    };

    if !remote_received {
        let mut state = session.state.lock().await;
        state.pending_ice.push(candidate);
        return Ok(());
    }

    let Some(pc) = pc else {
        warn!(client_id = %session.client_id, "candidate received with no peer connection");
        return Ok(());
    };
    webrtc_peer::add_ice_candidate(&pc, candidate).await
}

fn candidate_init_from_json(value: &Value) -> Result<RTCIceCandidateInit, BrokerError> {
    let candidate = value
        .get("candidate")
        .and_then(Value::as_str)
        .ok_or("candidate container missing .candidate")?
        .to_string();
    let sdp_mid = value
        .get("sdpMid")
        .and_then(Value::as_str)
        .map(|s| s.to_string());
    let sdp_mline_index = value
        .get("sdpMLineIndex")
        .and_then(Value::as_u64)
        .map(|n| n as u16);

    Ok(RTCIceCandidateInit {
        candidate,
        sdp_mid,
        sdp_mline_index,
        username_fragment: None,
    })
}

/// Emits a locally-originated ICE candidate (from the peer connection's
/// gathering callback) on the control transport, wrapped per the legacy
/// latch.
pub async fn emit_local_candidate(session: &Session, candidate_json: Value) {
    let legacy = session.state.lock().await.legacy;
    let payload = if legacy {
        protocol::wrap_legacy_candidate(&candidate_json)
    } else {
        candidate_json
    };
    session.reply(payload.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_container_round_trip() {
        let v = serde_json::json!({"candidate": "candidate:1 1 UDP 1 1.2.3.4 9 typ host", "sdpMid": "0", "sdpMLineIndex": 0});
        let init = candidate_init_from_json(&v).unwrap();
        assert_eq!(init.sdp_mid.as_deref(), Some("0"));
        assert_eq!(init.sdp_mline_index, Some(0));
    }
}
