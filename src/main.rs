//! Zork proxy broker daemon.
//!
//! Accepts Zork control connections on `ZORK_PORT`, runs each through the
//! command phase (4.2), and on `give`/`get` hands it off to the matching
//! init protocol (4.4 / 4.5). From there the connection either idles behind
//! a WebRTC data channel (giver) or keeps signaling until the handoff
//! (getter).

mod commands;
mod forwarding;
mod framer;
mod heartbeat;
mod protocol;
mod registry;
mod session;
mod signaling;
mod socks5;
mod socks_bridge;
mod socks_server;
mod webrtc_peer;

use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, warn};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;

use commands::{CommandOutcome, Mode};
use framer::LineFramer;
use registry::{BrokerConfig, Registry};
use session::{Session, HEARTBEAT_LABEL};
use webrtc_peer::BrokerError;

#[derive(Parser, Debug)]
#[command(name = "zork-broker", version, about = "Zork P2P proxy broker daemon")]
struct Args {
    /// Port the Zork control protocol listens on. Non-numeric values print
    /// usage and exit 1 rather than going through clap's own parse-error path.
    #[arg(default_value = "9000")]
    zork_port: String,

    #[arg(default_value = "9999")]
    socks_port: String,
}

fn usage_and_exit() -> ! {
    eprintln!("usage: zork-broker [ZORK_PORT] [SOCKS_PORT]");
    std::process::exit(1);
}

fn parse_port(raw: &str) -> u16 {
    raw.parse().unwrap_or_else(|_| usage_and_exit())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "zork_broker=info".into()),
        )
        .init();

    let args = Args::parse();
    let zork_port = parse_port(&args.zork_port);
    let socks_port = parse_port(&args.socks_port);

    let registry = Registry::new(BrokerConfig {
        zork_port,
        socks_port,
    });

    let listener = match TcpListener::bind(("0.0.0.0", zork_port)).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, port = zork_port, "failed to bind Zork control listener");
            std::process::exit(1);
        }
    };
    info!(port = zork_port, "Zork control listener bound");

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "accept failed on Zork control listener");
                continue;
            }
        };

        let registry = registry.clone();
        tokio::spawn(async move {
            let client_id = registry.next_client_id();
            debug!(client_id = %client_id, peer = %peer_addr, "accepted Zork control connection");
            if let Err(e) = handle_connection(registry, client_id.clone(), stream).await {
                error!(client_id = %client_id, error = %e, "connection ended with error");
            }
        });
    }
}

async fn handle_connection(
    registry: Registry,
    client_id: String,
    stream: tokio::net::TcpStream,
) -> Result<(), BrokerError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, LineFramer);

    let (control_tx, mut control_rx) = mpsc::unbounded_channel::<String>();
    let session = Session::new(client_id.clone(), registry.clone(), control_tx);

    let writer_close = session.control_close.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = writer_close.notified() => break,
                line = control_rx.recv() => {
                    let Some(line) = line else { break };
                    if write_half.write_all(framer::frame_outbound(&line).as_bytes()).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = write_half.shutdown().await;
    });

    while let Some(line) = reader.next().await {
        let line = line?;
        let mode = { session.state.lock().await.mode };

        match mode {
            None => {
                let outcome = {
                    let mut state = session.state.lock().await;
                    let num_getters = registry.num_getters();
                    commands::dispatch(
                        &line,
                        num_getters,
                        &mut state.transform_name,
                        &mut state.transform_config,
                    )
                };
                match outcome {
                    CommandOutcome::Reply(text) => session.reply(text),
                    CommandOutcome::NoReply => {}
                    CommandOutcome::Quit => break,
                    CommandOutcome::EnterMode(entered) => {
                        {
                            let mut state = session.state.lock().await;
                            state.mode = Some(entered);
                        }
                        let result = match entered {
                            Mode::Give => give_init(&session).await,
                            Mode::Get => get_init(&session).await,
                        };
                        if let Err(e) = result {
                            error!(client_id = %session.client_id, error = %e, "init protocol failed");
                            break;
                        }
                    }
                }
            }
            Some(_) => {
                // 7: protocol errors here (malformed JSON, multi-message legacy
                // envelope, unsupported signals channel) leave the session in
                // an incoherent state, so they fail the session rather than
                // being tolerated like a WebRTC negotiation failure would be.
                if let Err(e) = signaling::handle_line(&session, &line).await {
                    error!(client_id = %session.client_id, error = %e, "signaling protocol error; closing session");
                    break;
                }
            }
        }
    }

    debug!(client_id = %session.client_id, "control connection loop exited");
    Ok(())
}

/// 4.4: passive side. Creates the peer connection and waits for the remote
/// peer's offer and data channels; creates none of its own.
async fn give_init(session: &Session) -> Result<(), BrokerError> {
    let pc = webrtc_peer::new_peer_connection().await?;
    {
        let mut state = session.state.lock().await;
        state.peer_connection = Some(pc.clone());
    }

    wire_local_ice_candidates(session, &pc);

    let dc_session = session.clone();
    pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
        let session = dc_session.clone();
        Box::pin(async move {
            if channel.label() == HEARTBEAT_LABEL {
                wire_giver_heartbeat(session, channel);
            } else {
                socks_bridge::setup_proxy_channel(session, channel).await;
            }
        })
    }));

    Ok(())
}

/// 4.5: active side. The heartbeat channel must exist before `createOffer`
/// or the underlying stack will not progress ICE gathering.
async fn get_init(session: &Session) -> Result<(), BrokerError> {
    let pc = webrtc_peer::new_peer_connection().await?;
    {
        let mut state = session.state.lock().await;
        state.peer_connection = Some(pc.clone());
    }

    wire_local_ice_candidates(session, &pc);

    // 4.9: a getter never expects the remote peer to create data channels.
    let unexpected_session = session.clone();
    pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
        let client_id = unexpected_session.client_id.clone();
        Box::pin(async move {
            let label = channel.label().to_string();
            let _ = channel.close().await;
            error!(client_id = %client_id, label = %label, "unexpected data channel while in get mode; closed");
        })
    }));

    let server_registry = session.registry.clone();
    let server_pc = pc.clone();
    let server_client_id = session.client_id.clone();
    tokio::spawn(async move {
        if let Err(e) = socks_server::run(server_registry, server_pc).await {
            error!(client_id = %server_client_id, error = %e, "local SOCKS listener terminated");
        }
    });

    let heartbeat_channel = webrtc_peer::create_data_channel(&pc, HEARTBEAT_LABEL).await?;
    heartbeat::spawn_getter_send_loop(heartbeat_channel);

    let offer = webrtc_peer::create_offer(&pc).await?;
    session.reply(serde_json::json!({"type": "offer", "sdp": offer.sdp}).to_string());
    debug!(client_id = %session.client_id, "offer emitted");

    Ok(())
}

fn wire_local_ice_candidates(session: &Session, pc: &Arc<webrtc::peer_connection::RTCPeerConnection>) {
    let ice_session = session.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        let session = ice_session.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else { return };
            let Ok(init) = candidate.to_json() else { return };
            let json = serde_json::json!({
                "candidate": init.candidate,
                "sdpMid": init.sdp_mid,
                "sdpMLineIndex": init.sdp_mline_index,
            });
            signaling::emit_local_candidate(&session, json).await;
        })
    }));
}

/// Wires the giver-side heartbeat channel (4.6): on open, hand off from the
/// control transport to the timeout-armed counter; on each message, reset
/// the timeout.
fn wire_giver_heartbeat(session: Session, channel: Arc<RTCDataChannel>) {
    let handle_slot: Arc<tokio::sync::Mutex<Option<heartbeat::GiverHeartbeatHandle>>> =
        Arc::new(tokio::sync::Mutex::new(None));

    let open_session = session.clone();
    let open_slot = handle_slot.clone();
    channel.on_open(Box::new(move || {
        let session = open_session.clone();
        let slot = open_slot.clone();
        Box::pin(async move {
            session.close_control_transport();
            let handle =
                heartbeat::spawn_giver_timeout(session.registry.clone(), session.client_id.clone());
            *slot.lock().await = Some(handle);
        })
    }));

    let msg_slot = handle_slot.clone();
    let msg_client_id = session.client_id.clone();
    channel.on_message(Box::new(move |_msg: DataChannelMessage| {
        let slot = msg_slot.clone();
        let client_id = msg_client_id.clone();
        Box::pin(async move {
            match slot.lock().await.as_ref() {
                Some(handle) => handle.on_message(),
                None => warn!(client_id = %client_id, "heartbeat message before channel open handler ran"),
            }
        })
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    /// S1/S4-ish integration check: the command phase's `give` dispatch
    /// really does flip `mode`, and the signaling bridge really does see
    /// and latch a legacy envelope, entirely through the public module
    /// surface main.rs wires together (no real peer connection involved,
    /// so this doesn't touch the network).
    #[tokio::test]
    async fn give_then_legacy_offer_sets_mode_and_legacy_latch() {
        let registry = Registry::new(BrokerConfig::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = Session::new("zc0".to_string(), registry.clone(), tx);

        let mut name = None;
        let mut config = None;
        let outcome = commands::dispatch("give", registry.num_getters(), &mut name, &mut config);
        assert!(matches!(outcome, CommandOutcome::EnterMode(Mode::Give)));
        session.state.lock().await.mode = Some(Mode::Give);

        let legacy_offer =
            r#"{"signals":{"PLAIN":[{"type":0,"description":{"type":"offer","sdp":"v=0..."}}]}}"#;
        signaling::handle_line(&session, legacy_offer).await.unwrap();

        let state = session.state.lock().await;
        assert_eq!(state.mode, Some(Mode::Give));
        assert!(state.legacy);
    }
}
