//! Getter-side local SOCKS5 listener (4.8).
//!
//! Accepts real SOCKS5 clients on the local machine and pipes their bytes
//! verbatim over a per-client data channel labeled with an opaque
//! `session_id`; the giver's SOCKS session engine (socks5.rs, via
//! socks_bridge.rs) is what actually speaks RFC 1928 to those bytes.

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, error, info};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::peer_connection::RTCPeerConnection;

use crate::registry::Registry;
use crate::webrtc_peer::{self, BrokerError};

/// Binds and runs the getter's local SOCKS5 listener. The first getter in
/// the process binds the configured port; subsequent getters bind an
/// OS-assigned ephemeral port (both latch through `Registry::socks_bind_port`).
pub async fn run(registry: Registry, pc: Arc<RTCPeerConnection>) -> Result<(), BrokerError> {
    let port = registry.socks_bind_port().await;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    let bound_port = listener.local_addr()?.port();
    info!(port = bound_port, "getter SOCKS5 listener bound");

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "SOCKS listener accept failed");
                continue;
            }
        };
        let session_id = uuid::Uuid::new_v4().to_string();
        debug!(session_id = %session_id, peer = %peer_addr, "accepted local SOCKS client");

        let pc = pc.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_client(&pc, &session_id, stream).await {
                error!(session_id = %session_id, error = %e, "failed to bridge SOCKS client to data channel");
            }
        });
    }
}

async fn serve_client(
    pc: &RTCPeerConnection,
    session_id: &str,
    stream: tokio::net::TcpStream,
) -> Result<(), BrokerError> {
    let channel = webrtc_peer::create_data_channel(pc, session_id).await?;
    let (mut read_half, mut write_half) = stream.into_split();

    let (write_tx, mut write_rx) = tokio::sync::mpsc::unbounded_channel::<Vec<u8>>();
    tokio::spawn(async move {
        while let Some(chunk) = write_rx.recv().await {
            if write_half.write_all(&chunk).await.is_err() {
                break;
            }
        }
    });

    // on_data_for_socks_client(cb): bytes arriving on the data channel are
    // written straight back to the local SOCKS client's TCP socket.
    channel.on_message(Box::new(move |msg: DataChannelMessage| {
        let write_tx = write_tx.clone();
        Box::pin(async move {
            let _ = write_tx.send(msg.data.to_vec());
        })
    }));

    // on_disconnect(cb): log only; cb is intentionally ignored (4.8).
    let close_session_id = session_id.to_string();
    channel.on_close(Box::new(move || {
        let session_id = close_session_id.clone();
        Box::pin(async move {
            debug!(session_id = %session_id, "proxy data channel closed (getter does not react)");
        })
    }));

    // handle_data_from_socks_client(bytes): forward local TCP bytes onto the channel.
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) => {
                // handle_disconnect(): log only; the channel is NOT closed here.
                // The getter is the sole authority for channel lifecycle (4.8 design note).
                debug!(session_id = %session_id, "local SOCKS client disconnected");
                break;
            }
            Ok(n) => {
                if channel.send(&Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                    error!(session_id = %session_id, "data channel send failed");
                    break;
                }
            }
            Err(e) => {
                error!(session_id = %session_id, error = %e, "local SOCKS client read error");
                break;
            }
        }
    }

    Ok(())
}
