//! Minimal RFC 1928 SOCKS5 session engine: CONNECT-only, no authentication.
//!
//! The specification treats the SOCKS session as an external collaborator
//! specified only at its interface (`on_forwarding_socket_required`,
//! `handle_data_from_socks_client`, `on_data_for_socks_client`). This module
//! provides a concrete state machine satisfying that interface, since a
//! runnable daemon needs one; no generic SOCKS5 crate appears anywhere in
//! the retrieved corpus; and the original daemon's own split between a
//! handshake-completed-by-peer start state (`AwaitingRequest`, used for
//! legacy clients) and a full-handshake start state (`AwaitingAuths`) maps
//! directly onto the two states below.

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const REP_SUCCESS: u8 = 0x00;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REP_GENERAL_FAILURE: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksState {
    AwaitingAuths,
    AwaitingRequest,
    Streaming,
    Closed,
}

/// What the bridge should do in response to bytes fed into the engine.
#[derive(Debug, Clone)]
pub enum SocksEvent {
    /// Send these bytes back to the SOCKS client on its data channel.
    Reply(Vec<u8>),
    /// The CONNECT request parsed successfully; the bridge must open a
    /// forwarding socket to `host:port` and call `connect_result` with the
    /// outcome once it knows.
    ConnectRequested { host: String, port: u16 },
    /// Bytes to relay upstream, once in the `Streaming` state.
    Upstream(Vec<u8>),
    /// Malformed input or an unsupported command; the session is now closed.
    Fatal(String),
}

/// A CONNECT-only SOCKS5 session, fed bytes from the data channel and
/// producing the bytes/actions described by `SocksEvent`.
pub struct SocksSession {
    state: SocksState,
    inbuf: Vec<u8>,
}

impl SocksSession {
    /// Full handshake required: method selection, then request.
    pub fn awaiting_auths() -> Self {
        Self {
            state: SocksState::AwaitingAuths,
            inbuf: Vec::new(),
        }
    }

    /// Method selection already completed by the peer (legacy clients,
    /// per 4.7): go straight to expecting the CONNECT request.
    pub fn awaiting_request() -> Self {
        Self {
            state: SocksState::AwaitingRequest,
            inbuf: Vec::new(),
        }
    }

    pub fn state(&self) -> SocksState {
        self.state
    }

    /// Feeds bytes arriving from the SOCKS client (data-channel payload)
    /// into the engine, draining as many complete frames as are buffered.
    pub fn on_client_bytes(&mut self, bytes: &[u8]) -> Vec<SocksEvent> {
        self.inbuf.extend_from_slice(bytes);
        let mut events = Vec::new();
        loop {
            match self.state {
                SocksState::AwaitingAuths => match try_parse_method_selection(&self.inbuf) {
                    ParseResult::Incomplete => break,
                    ParseResult::Invalid(msg) => {
                        self.state = SocksState::Closed;
                        events.push(SocksEvent::Fatal(msg));
                        break;
                    }
                    ParseResult::Ok(consumed) => {
                        self.inbuf.drain(..consumed);
                        self.state = SocksState::AwaitingRequest;
                        events.push(SocksEvent::Reply(vec![SOCKS_VERSION, METHOD_NO_AUTH]));
                    }
                },
                SocksState::AwaitingRequest => match try_parse_request(&self.inbuf) {
                    ParseResult::Incomplete => break,
                    ParseResult::Invalid(msg) => {
                        self.state = SocksState::Closed;
                        events.push(SocksEvent::Fatal(msg));
                        break;
                    }
                    ParseResult::Ok((consumed, request)) => {
                        self.inbuf.drain(..consumed);
                        match request.cmd {
                            CMD_CONNECT => {
                                events.push(SocksEvent::ConnectRequested {
                                    host: request.host,
                                    port: request.port,
                                });
                                // Remain in AwaitingRequest until connect_result()
                                // transitions us to Streaming or Closed.
                                break;
                            }
                            _ => {
                                self.state = SocksState::Closed;
                                events.push(SocksEvent::Reply(build_reply(
                                    REP_COMMAND_NOT_SUPPORTED,
                                )));
                                break;
                            }
                        }
                    }
                },
                SocksState::Streaming => {
                    if self.inbuf.is_empty() {
                        break;
                    }
                    let data = std::mem::take(&mut self.inbuf);
                    events.push(SocksEvent::Upstream(data));
                }
                SocksState::Closed => break,
            }
        }
        events
    }

    /// Called by the bridge once the forwarding socket connect attempt for
    /// a pending CONNECT request resolves.
    pub fn connect_result(&mut self, ok: bool) -> SocksEvent {
        if ok {
            self.state = SocksState::Streaming;
            SocksEvent::Reply(build_reply(REP_SUCCESS))
        } else {
            self.state = SocksState::Closed;
            SocksEvent::Reply(build_reply(REP_GENERAL_FAILURE))
        }
    }
}

struct ParsedRequest {
    cmd: u8,
    host: String,
    port: u16,
}

enum ParseResult<T> {
    Incomplete,
    Invalid(String),
    Ok(T),
}

fn try_parse_method_selection(buf: &[u8]) -> ParseResult<usize> {
    if buf.len() < 2 {
        return ParseResult::Incomplete;
    }
    if buf[0] != SOCKS_VERSION {
        return ParseResult::Invalid(format!("unsupported SOCKS version {}", buf[0]));
    }
    let nmethods = buf[1] as usize;
    let total = 2 + nmethods;
    if buf.len() < total {
        return ParseResult::Incomplete;
    }
    ParseResult::Ok(total)
}

fn try_parse_request(buf: &[u8]) -> ParseResult<(usize, ParsedRequest)> {
    if buf.len() < 4 {
        return ParseResult::Incomplete;
    }
    if buf[0] != SOCKS_VERSION {
        return ParseResult::Invalid(format!("unsupported SOCKS version {}", buf[0]));
    }
    let cmd = buf[1];
    let atyp = buf[3];

    let (host, addr_len) = match atyp {
        0x01 => {
            if buf.len() < 4 + 4 {
                return ParseResult::Incomplete;
            }
            let octets = &buf[4..8];
            (
                format!("{}.{}.{}.{}", octets[0], octets[1], octets[2], octets[3]),
                4,
            )
        }
        0x03 => {
            if buf.len() < 5 {
                return ParseResult::Incomplete;
            }
            let len = buf[4] as usize;
            if buf.len() < 5 + len {
                return ParseResult::Incomplete;
            }
            let name = String::from_utf8_lossy(&buf[5..5 + len]).to_string();
            (name, 1 + len)
        }
        0x04 => {
            if buf.len() < 4 + 16 {
                return ParseResult::Incomplete;
            }
            let octets = &buf[4..20];
            let mut parts = Vec::with_capacity(8);
            for chunk in octets.chunks(2) {
                parts.push(format!("{:02x}{:02x}", chunk[0], chunk[1]));
            }
            (parts.join(":"), 16)
        }
        other => {
            return ParseResult::Invalid(format!("unsupported address type {other}"));
        }
    };

    let port_offset = 4 + addr_len;
    if buf.len() < port_offset + 2 {
        return ParseResult::Incomplete;
    }
    let port = u16::from_be_bytes([buf[port_offset], buf[port_offset + 1]]);
    let consumed = port_offset + 2;

    ParseResult::Ok((consumed, ParsedRequest { cmd, host, port }))
}

fn build_reply(rep: u8) -> Vec<u8> {
    // BND.ADDR/BND.PORT are not meaningful for this broker's forwarding
    // model; zero-filled IPv4 is a conventional stand-in.
    vec![SOCKS_VERSION, rep, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_handshake_then_connect_ipv4() {
        let mut session = SocksSession::awaiting_auths();
        let events = session.on_client_bytes(&[0x05, 0x01, 0x00]);
        assert!(matches!(&events[0], SocksEvent::Reply(r) if r == &[0x05, 0x00]));
        assert_eq!(session.state(), SocksState::AwaitingRequest);

        let request = [0x05, 0x01, 0x00, 0x01, 93, 184, 216, 34, 0x00, 0x50];
        let events = session.on_client_bytes(&request);
        match &events[0] {
            SocksEvent::ConnectRequested { host, port } => {
                assert_eq!(host, "93.184.216.34");
                assert_eq!(*port, 80);
            }
            other => panic!("unexpected: {other:?}"),
        }

        let reply = session.connect_result(true);
        assert!(matches!(reply, SocksEvent::Reply(r) if r[1] == REP_SUCCESS));
        assert_eq!(session.state(), SocksState::Streaming);
    }

    #[test]
    fn legacy_session_skips_method_selection() {
        let mut session = SocksSession::awaiting_request();
        let request = [0x05, 0x01, 0x00, 0x03, 7, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 0x01, 0xbb];
        let events = session.on_client_bytes(&request);
        match &events[0] {
            SocksEvent::ConnectRequested { host, port } => {
                assert_eq!(host, "example");
                assert_eq!(*port, 443);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unsupported_command_replies_not_supported_and_closes() {
        let mut session = SocksSession::awaiting_request();
        // BIND (0x02)
        let request = [0x05, 0x02, 0x00, 0x01, 1, 2, 3, 4, 0x00, 0x50];
        let events = session.on_client_bytes(&request);
        assert!(matches!(&events[0], SocksEvent::Reply(r) if r[1] == REP_COMMAND_NOT_SUPPORTED));
        assert_eq!(session.state(), SocksState::Closed);
    }

    #[test]
    fn streaming_relays_subsequent_bytes_upstream() {
        let mut session = SocksSession::awaiting_request();
        let request = [0x05, 0x01, 0x00, 0x01, 1, 2, 3, 4, 0x00, 0x50];
        session.on_client_bytes(&request);
        session.connect_result(true);

        let events = session.on_client_bytes(b"GET / HTTP/1.1\r\n\r\n");
        assert!(matches!(&events[0], SocksEvent::Upstream(b) if b == b"GET / HTTP/1.1\r\n\r\n"));
    }

    #[test]
    fn request_split_across_reads_is_buffered() {
        let mut session = SocksSession::awaiting_request();
        assert!(session.on_client_bytes(&[0x05, 0x01, 0x00, 0x01]).is_empty());
        let events = session.on_client_bytes(&[1, 2, 3, 4, 0x00, 0x50]);
        assert!(matches!(&events[0], SocksEvent::ConnectRequested { .. }));
    }
}
