//! Line framer for the Zork control transport.
//!
//! Splits an incoming byte stream into newline-delimited messages,
//! tolerating a leading `\r` before `\n`. Partial fragments are carried
//! across reads; empty messages are dropped silently. A `Decoder` composes
//! naturally with `tokio_util::codec::Framed` over the control socket,
//! giving a `Stream<Item = io::Result<String>>` rather than a hand-rolled
//! read loop.

use bytes::BytesMut;
use tokio_util::codec::Decoder;

pub struct LineFramer;

impl Decoder for LineFramer {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(newline_pos) = src.iter().position(|&b| b == b'\n') else {
                return Ok(None);
            };

            let mut line = src.split_to(newline_pos + 1);
            line.truncate(line.len() - 1); // drop '\n'
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }

            if line.is_empty() {
                continue;
            }

            let text = String::from_utf8(line.to_vec()).map_err(|e| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, e)
            })?;
            return Ok(Some(text));
        }
    }
}

/// Appends the terminator the framer emits for outbound replies.
pub fn frame_outbound(line: &str) -> String {
    format!("{line}\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn decode_all(chunks: &[&[u8]]) -> Vec<String> {
        let mut framer = LineFramer;
        let mut buf = BytesMut::new();
        let mut out = Vec::new();
        for chunk in chunks {
            buf.extend_from_slice(chunk);
            while let Some(msg) = framer.decode(&mut buf).unwrap() {
                out.push(msg);
            }
        }
        out
    }

    #[test]
    fn splits_on_lf() {
        assert_eq!(decode_all(&[b"ping\nxyzzy\n"]), vec!["ping", "xyzzy"]);
    }

    #[test]
    fn tolerates_crlf() {
        assert_eq!(decode_all(&[b"ping\r\nxyzzy\r\n"]), vec!["ping", "xyzzy"]);
    }

    #[test]
    fn buffers_partial_fragments_across_reads() {
        assert_eq!(
            decode_all(&[b"pi", b"ng\nxy", b"zzy\n"]),
            vec!["ping", "xyzzy"]
        );
    }

    #[test]
    fn drops_empty_messages() {
        assert_eq!(decode_all(&[b"\n\nping\n\n"]), vec!["ping"]);
    }

    #[test]
    fn arbitrary_chunking_matches_concatenation_split() {
        let whole = b"ping\r\nxyzzy\ngetters\r\n\nquit\n".to_vec();
        for split_at in 0..whole.len() {
            let (a, b) = whole.split_at(split_at);
            let got = decode_all(&[a, b]);
            assert_eq!(got, vec!["ping", "xyzzy", "getters", "quit"]);
        }
    }
}
