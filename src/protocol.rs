//! Wire types for the Zork control protocol: command replies and the two
//! signaling envelope shapes (modern and legacy).

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: &str = "zork-1";

/// An inbound ICE candidate or SDP description, as carried on the wire.
/// Kept as raw JSON: the WebRTC layer is responsible for interpreting it,
/// this module only distinguishes *which* signaling shape arrived.
pub type RawJson = Value;

/// A session description (offer or answer) in the modern envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescriptionMsg {
    #[serde(rename = "type")]
    pub kind: String, // "offer" | "answer"
    pub sdp: String,
}

/// Modern (non-legacy) signaling message: either a session description or
/// an ICE candidate container.
#[derive(Debug, Clone)]
pub enum ModernSignal {
    Offer(SessionDescriptionMsg),
    Answer(SessionDescriptionMsg),
    Candidate(RawJson),
}

/// Parses a single modern-envelope JSON object. Returns `None` if the
/// shape matches neither an SDP object nor a candidate container.
pub fn parse_modern(value: &Value) -> Option<ModernSignal> {
    if let Some(kind) = value.get("type").and_then(Value::as_str) {
        if let Some(sdp) = value.get("sdp").and_then(Value::as_str) {
            let msg = SessionDescriptionMsg {
                kind: kind.to_string(),
                sdp: sdp.to_string(),
            };
            return match kind {
                "offer" => Some(ModernSignal::Offer(msg)),
                "answer" => Some(ModernSignal::Answer(msg)),
                _ => None,
            };
        }
    }
    if value.get("candidate").is_some() {
        return Some(ModernSignal::Candidate(value.clone()));
    }
    None
}

/// The legacy `{signals:{PLAIN:[...]}}` envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct LegacyEnvelope {
    pub signals: LegacySignals,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LegacySignals {
    #[serde(rename = "PLAIN")]
    pub plain: Option<Vec<Value>>,
    #[serde(flatten)]
    pub other: std::collections::HashMap<String, Value>,
}

/// The numerically tagged inner message of a legacy envelope.
#[derive(Debug, Clone)]
pub enum LegacyInner {
    /// `type == 0`: SDP offer nested as `.description`.
    Offer(SessionDescriptionMsg),
    /// `type == 1`: SDP answer nested as `.description` (outbound-only shape).
    Answer(SessionDescriptionMsg),
    /// `type == 2`: ICE candidate; the outer object is itself the candidate container.
    Candidate(RawJson),
}

/// Parses the single inner element of a legacy `signals.PLAIN` array.
pub fn parse_legacy_inner(value: &Value) -> Result<LegacyInner, String> {
    let tag = value
        .get("type")
        .and_then(Value::as_i64)
        .ok_or_else(|| "legacy inner message missing numeric type".to_string())?;
    match tag {
        0 => {
            let desc = value
                .get("description")
                .ok_or_else(|| "legacy offer missing description".to_string())?;
            let msg: SessionDescriptionMsg = serde_json::from_value(desc.clone())
                .map_err(|e| format!("legacy offer description malformed: {e}"))?;
            Ok(LegacyInner::Offer(msg))
        }
        1 => {
            let desc = value
                .get("description")
                .ok_or_else(|| "legacy answer missing description".to_string())?;
            let msg: SessionDescriptionMsg = serde_json::from_value(desc.clone())
                .map_err(|e| format!("legacy answer description malformed: {e}"))?;
            Ok(LegacyInner::Answer(msg))
        }
        2 => Ok(LegacyInner::Candidate(value.clone())),
        other => Err(format!("unsupported legacy inner type tag: {other}")),
    }
}

/// Wraps a locally-produced answer in the legacy outbound envelope.
pub fn wrap_legacy_answer(answer: &SessionDescriptionMsg) -> Value {
    serde_json::json!({
        "signals": {
            "PLAIN": [{ "type": 1, "description": answer }]
        }
    })
}

/// Wraps a locally-originated ICE candidate in the legacy outbound envelope.
pub fn wrap_legacy_candidate(candidate: &Value) -> Value {
    serde_json::json!({
        "signals": {
            "PLAIN": [{ "type": 2, "candidate": candidate }]
        }
    })
}

/// The legacy per-channel control sub-protocol (`{control: "OPEN"|"CLOSE"}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyChannelControl {
    Open,
    Close,
}

/// A decoded legacy data-channel text payload.
#[derive(Debug, Clone)]
pub enum LegacyChannelMessage {
    Heartbeat,
    Control(LegacyChannelControl),
    ControlUnknown(String),
    SocksRequestData(Value),
}

pub fn parse_legacy_channel_message(text: &str) -> LegacyChannelMessage {
    if text == "heartbeat" {
        return LegacyChannelMessage::Heartbeat;
    }
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        return LegacyChannelMessage::SocksRequestData(Value::Null);
    };
    if let Some(control) = value.get("control").and_then(Value::as_str) {
        return match control {
            "OPEN" => LegacyChannelMessage::Control(LegacyChannelControl::Open),
            "CLOSE" => LegacyChannelMessage::Control(LegacyChannelControl::Close),
            other => LegacyChannelMessage::ControlUnknown(other.to_string()),
        };
    }
    let data = value.get("data").cloned().unwrap_or(Value::Null);
    LegacyChannelMessage::SocksRequestData(data)
}

/// Wraps a SOCKS response as the legacy first-outbound-packet text frame.
pub fn wrap_legacy_data_text(response: &[u8]) -> String {
    let stringified: String = response.iter().map(|&b| b as char).collect();
    serde_json::json!({ "data": stringified }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_modern_offer() {
        let v = serde_json::json!({"type": "offer", "sdp": "v=0..."});
        match parse_modern(&v) {
            Some(ModernSignal::Offer(msg)) => assert_eq!(msg.sdp, "v=0..."),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parses_modern_candidate() {
        let v = serde_json::json!({"candidate": "candidate:1 1 UDP ..."});
        assert!(matches!(parse_modern(&v), Some(ModernSignal::Candidate(_))));
    }

    #[test]
    fn parses_legacy_offer_envelope() {
        let v: Value = serde_json::from_str(
            r#"{"signals":{"PLAIN":[{"type":0,"description":{"type":"offer","sdp":"S"}}]}}"#,
        )
        .unwrap();
        let env: LegacyEnvelope = serde_json::from_value(v).unwrap();
        let plain = env.signals.plain.unwrap();
        assert_eq!(plain.len(), 1);
        match parse_legacy_inner(&plain[0]) {
            Ok(LegacyInner::Offer(msg)) => assert_eq!(msg.sdp, "S"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn legacy_round_trip_answer_shape() {
        let answer = SessionDescriptionMsg {
            kind: "answer".to_string(),
            sdp: "S2".to_string(),
        };
        let wrapped = wrap_legacy_answer(&answer);
        assert_eq!(
            wrapped["signals"]["PLAIN"][0]["type"],
            serde_json::json!(1)
        );
        assert_eq!(
            wrapped["signals"]["PLAIN"][0]["description"]["sdp"],
            serde_json::json!("S2")
        );
    }

    #[test]
    fn legacy_channel_message_heartbeat() {
        assert!(matches!(
            parse_legacy_channel_message("heartbeat"),
            LegacyChannelMessage::Heartbeat
        ));
    }

    #[test]
    fn legacy_channel_message_control_open() {
        assert!(matches!(
            parse_legacy_channel_message(r#"{"control":"OPEN"}"#),
            LegacyChannelMessage::Control(LegacyChannelControl::Open)
        ));
    }
}
