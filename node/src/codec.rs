//! Wire codec for peer links.
//!
//! Messages are UTF-8 text with fields separated by `$` (no escaping):
//!
//! ```text
//! identify$<identity>
//! ping
//! pong
//! broadcast$<msgId>$election$<candidate>
//! broadcast$<msgId>$victory$<leader>
//! ```
//!
//! Each message is terminated by `\n` on the wire so that a read which
//! returns half a message, or three of them, is reassembled correctly.
//! Decoding never fails on content: anything unrecognized comes out as
//! [`Message::Unknown`] for the consumer to drop.

use bytes::{BufMut, BytesMut};
use std::fmt;
use tokio_util::codec::{Decoder, Encoder};

use crate::msg::{Gossip, Message};
use crate::{NodeError, Result};

/// Longest frame accepted before the terminator, in bytes.
pub const MAX_FRAME_LEN: usize = 4096;

const SEPARATOR: char = '$';
const TERMINATOR: u8 = b'\n';

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Identify { identity } => write!(f, "identify{SEPARATOR}{identity}"),
            Message::Ping => f.write_str("ping"),
            Message::Pong => f.write_str("pong"),
            Message::Broadcast { id, body } => {
                write!(f, "broadcast{SEPARATOR}{id}{SEPARATOR}{body}")
            }
            Message::Unknown(raw) => f.write_str(raw),
        }
    }
}

/// Parses one logical message (without its terminator).
pub fn decode_line(line: &str) -> Message {
    let mut fields = line.splitn(3, SEPARATOR);
    match (fields.next(), fields.next(), fields.next()) {
        (Some("identify"), Some(identity), _) if !identity.is_empty() => Message::Identify {
            identity: identity.to_string(),
        },
        (Some("ping"), None, None) => Message::Ping,
        (Some("pong"), None, None) => Message::Pong,
        (Some("broadcast"), Some(id), body) if !id.is_empty() => Message::Broadcast {
            id: id.to_string(),
            body: body.unwrap_or_default().to_string(),
        },
        _ => Message::Unknown(line.to_string()),
    }
}

/// Identities travel as a single field, so they may hold neither the
/// separator nor a line break.
pub fn check_identity(identity: &str) -> Result<()> {
    if identity.is_empty() {
        return Err(invalid("identity", identity, "is empty"));
    }
    if identity.contains(SEPARATOR) {
        return Err(invalid("identity", identity, "contains '$'"));
    }
    check_line("identity", identity)
}

/// Broadcast bodies are `$`-separated themselves but must stay on one line.
pub fn check_body(body: &str) -> Result<()> {
    check_line("broadcast body", body)
}

fn check_line(field: &'static str, value: &str) -> Result<()> {
    if value.contains(&['\n', '\r'][..]) {
        return Err(invalid(field, value, "contains a line break"));
    }
    Ok(())
}

fn invalid(field: &'static str, value: &str, reason: &'static str) -> NodeError {
    NodeError::InvalidField {
        field,
        value: value.to_string(),
        reason,
    }
}

impl Gossip {
    pub fn parse(body: &str) -> Gossip {
        let mut fields = body.split(SEPARATOR);
        match (fields.next(), fields.next()) {
            (Some("election"), Some(candidate)) if !candidate.is_empty() => Gossip::Election {
                candidate: candidate.to_string(),
            },
            (Some("victory"), Some(leader)) if !leader.is_empty() => Gossip::Victory {
                leader: leader.to_string(),
            },
            _ => Gossip::Other(body.to_string()),
        }
    }
}

/// Newline framing over [`Message`]s, for use with
/// `tokio_util::codec::Framed`.
#[derive(Debug, Default)]
pub struct WireCodec {
    /// Bytes already scanned for a terminator.
    scanned: usize,
}

impl WireCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn take_frame(&mut self, src: &mut BytesMut, len: usize, skip: usize) -> Message {
        let frame = src.split_to(len + skip);
        self.scanned = 0;
        let mut line = &frame[..len];
        if let Some(stripped) = line.strip_suffix(b"\r") {
            line = stripped;
        }
        match std::str::from_utf8(line) {
            Ok(text) => decode_line(text),
            Err(_) => Message::Unknown(String::from_utf8_lossy(line).into_owned()),
        }
    }
}

impl Decoder for WireCodec {
    type Item = Message;
    type Error = NodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        let start = self.scanned.min(src.len());
        let terminator = src[start..]
            .iter()
            .position(|b| *b == TERMINATOR)
            .map(|offset| start + offset);
        match terminator {
            Some(len) if len > MAX_FRAME_LEN => Err(NodeError::FrameTooLong {
                len,
                max: MAX_FRAME_LEN,
            }),
            Some(len) => Ok(Some(self.take_frame(src, len, 1))),
            None if src.len() > MAX_FRAME_LEN => Err(NodeError::FrameTooLong {
                len: src.len(),
                max: MAX_FRAME_LEN,
            }),
            None => {
                self.scanned = src.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        match self.decode(src)? {
            Some(msg) => Ok(Some(msg)),
            // An unterminated tail at end of stream is still a message.
            None if !src.is_empty() => {
                let len = src.len();
                Ok(Some(self.take_frame(src, len, 0)))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<Message> for WireCodec {
    type Error = NodeError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<()> {
        let text = msg.to_string();
        dst.reserve(text.len() + 1);
        dst.put_slice(text.as_bytes());
        dst.put_u8(TERMINATOR);
        Ok(())
    }
}
