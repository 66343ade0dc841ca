//! Thin wrapper over the `webrtc` crate's peer-connection API: fixed STUN
//! configuration, offer/answer helpers, and data-channel creation/callback
//! registration, giving the rest of the crate exactly the primitives the
//! broker's design treats as external.

use std::sync::Arc;

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::protocol::SessionDescriptionMsg;

/// Fixed list of public STUN servers (4.4, 4.11).
const STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];

pub type BrokerError = Box<dyn std::error::Error + Send + Sync>;

fn ice_servers() -> Vec<RTCIceServer> {
    STUN_SERVERS
        .iter()
        .map(|&url| RTCIceServer {
            urls: vec![url.to_string()],
            ..Default::default()
        })
        .collect()
}

/// Builds a fresh peer connection configured with the broker's fixed STUN list.
pub async fn new_peer_connection() -> Result<Arc<RTCPeerConnection>, BrokerError> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let config = RTCConfiguration {
        ice_servers: ice_servers(),
        ..Default::default()
    };

    let pc = api.new_peer_connection(config).await?;
    Ok(Arc::new(pc))
}

/// Creates a locally-originated data channel (the getter creates the
/// heartbeat channel and one per accepted SOCKS client; see 4.5, 4.8).
pub async fn create_data_channel(
    pc: &RTCPeerConnection,
    label: &str,
) -> Result<Arc<RTCDataChannel>, BrokerError> {
    let init = RTCDataChannelInit {
        ordered: Some(true),
        ..Default::default()
    };
    let channel = pc.create_data_channel(label, Some(init)).await?;
    Ok(channel)
}

pub async fn create_offer(pc: &RTCPeerConnection) -> Result<SessionDescriptionMsg, BrokerError> {
    let offer = pc.create_offer(None).await?;
    pc.set_local_description(offer.clone()).await?;
    Ok(SessionDescriptionMsg {
        kind: "offer".to_string(),
        sdp: offer.sdp,
    })
}

pub async fn create_answer(pc: &RTCPeerConnection) -> Result<SessionDescriptionMsg, BrokerError> {
    let answer = pc.create_answer(None).await?;
    pc.set_local_description(answer.clone()).await?;
    Ok(SessionDescriptionMsg {
        kind: "answer".to_string(),
        sdp: answer.sdp,
    })
}

pub async fn set_remote_description(
    pc: &RTCPeerConnection,
    desc: &SessionDescriptionMsg,
) -> Result<(), BrokerError> {
    let rtc_desc = match desc.kind.as_str() {
        "offer" => RTCSessionDescription::offer(desc.sdp.clone())?,
        "answer" => RTCSessionDescription::answer(desc.sdp.clone())?,
        other => return Err(format!("unknown session description kind: {other}").into()),
    };
    pc.set_remote_description(rtc_desc).await?;
    Ok(())
}

pub async fn add_ice_candidate(
    pc: &RTCPeerConnection,
    candidate: RTCIceCandidateInit,
) -> Result<(), BrokerError> {
    pc.add_ice_candidate(candidate).await?;
    Ok(())
}
