//! Outbound TCP forwarder used by the giver-side SOCKS bridge (4.12):
//! connects to the CONNECT target, relays bytes in both directions, and
//! exposes pause/resume for the backpressure scheme in 4.7.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use crate::webrtc_peer::BrokerError;

/// A connected outbound socket. The read side can be paused/resumed;
/// writes (bytes arriving from the SOCKS client) are always accepted.
/// Cheap to clone: every clone shares the same underlying pump tasks.
#[derive(Clone)]
pub struct ForwardingSocket {
    write_tx: mpsc::UnboundedSender<Vec<u8>>,
    paused_tx: watch::Sender<bool>,
}

impl ForwardingSocket {
    /// Connects to `host:port` and spawns the read/write pump tasks.
    /// `on_upstream_data` is called with each chunk read from the Internet,
    /// to be delivered back to the SOCKS client's data channel.
    pub async fn connect<F>(host: &str, port: u16, on_upstream_data: F) -> Result<Self, BrokerError>
    where
        F: Fn(Vec<u8>) + Send + Sync + 'static,
    {
        let stream = TcpStream::connect((host, port)).await?;
        let (mut read_half, mut write_half) = stream.into_split();

        let (paused_tx, mut paused_rx) = watch::channel(false);

        tokio::spawn(async move {
            let mut buf = vec![0u8; 16 * 1024];
            loop {
                // `watch` always holds the latest value rather than a queue
                // of notifications, so re-checking `borrow()` after every
                // wake can't miss a pause/resume or act on a stale one the
                // way a bool-gated `Notify` permit could.
                while *paused_rx.borrow() {
                    if paused_rx.changed().await.is_err() {
                        return;
                    }
                }
                match read_half.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => on_upstream_data(buf[..n].to_vec()),
                    Err(_) => break,
                }
            }
        });

        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        tokio::spawn(async move {
            while let Some(chunk) = write_rx.recv().await {
                if write_half.write_all(&chunk).await.is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            write_tx,
            paused_tx,
        })
    }

    /// Queues bytes (received from the SOCKS client) to write upstream.
    pub fn send(&self, data: Vec<u8>) {
        let _ = self.write_tx.send(data);
    }

    /// Stops reading from the forwarding socket (backpressure engaged).
    pub fn pause(&self) {
        let _ = self.paused_tx.send(true);
    }

    /// Resumes reading from the forwarding socket.
    pub fn resume(&self) {
        let _ = self.paused_tx.send(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn paused_reader_ignores_a_stale_resume_pulse() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            // Give the client time to land its pause/resume/pause sequence
            // before any bytes are available to read.
            tokio::time::sleep(Duration::from_millis(100)).await;
            stream.write_all(b"after-resume").await.unwrap();
        });

        let received: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let received_cb = received.clone();
        let socket = ForwardingSocket::connect(addr.ip().to_string().as_str(), addr.port(), move |data| {
            received_cb.lock().unwrap().extend_from_slice(&data);
        })
        .await
        .unwrap();

        // A resume sandwiched between two pauses, with no await in between to
        // let the reader task observe the intermediate "resumed" value, must
        // not leave the reader running: the final state is paused.
        socket.pause();
        socket.resume();
        socket.pause();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(
            received.lock().unwrap().is_empty(),
            "reader should still be paused after the stale resume pulse"
        );

        socket.resume();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(&received.lock().unwrap()[..], b"after-resume");
    }
}
