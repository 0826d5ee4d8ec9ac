//! STOMP wire codec built on `tokio_util::codec`.

use bytes::{Buf, BufMut, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

use crate::frame::Frame;
use crate::parser::{escape_header, parse_frame_slice, unescape_header};

/// Items carried on the wire: a full frame, or a single-LF heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireItem {
    /// A decoded STOMP frame (command + headers + body)
    Frame(Frame),
    /// A heartbeat pulse (bare LF)
    Ping,
}

/// STOMP 1.1+ escapes header keys and values, but never on the handshake
/// frames (CONNECT/CONNECTED are transmitted unescaped per STOMP 1.2).
fn escaped_command(command: &str) -> bool {
    !matches!(command, "CONNECT" | "CONNECTED")
}

/// Encoder/decoder for the STOMP wire format.
///
/// Decoding extracts zero or more complete items per call and always leaves
/// the unterminated tail in the buffer, so arbitrary chunk boundaries are
/// safe. Encoding injects a `content-length` header for non-empty bodies
/// that do not already declare one, keeping framing binary-safe.
#[derive(Debug, Default)]
pub struct StompCodec {
    // stateless; the caller's BytesMut is the partial-frame accumulator
}

impl StompCodec {
    pub fn new() -> Self {
        Self {}
    }
}

fn invalid(err: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err.to_string())
}

impl Decoder for StompCodec {
    type Item = WireItem;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match src.first() {
            None => return Ok(None),
            Some(&b'\n') => {
                src.advance(1);
                return Ok(Some(WireItem::Ping));
            }
            Some(_) => {}
        }

        let raw = match parse_frame_slice(src.chunk()) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Ok(None),
            Err(err) => return Err(invalid(err)),
        };
        src.advance(raw.consumed);

        let command = String::from_utf8(raw.command)
            .map_err(|_| invalid("frame command is not valid UTF-8"))?;
        let unescape = escaped_command(&command);

        let mut headers = Vec::with_capacity(raw.headers.len());
        for (key, value) in raw.headers {
            let (key, value) = if unescape {
                (
                    unescape_header(&key).map_err(invalid)?,
                    unescape_header(&value).map_err(invalid)?,
                )
            } else {
                (key, value)
            };
            headers.push((
                String::from_utf8(key).map_err(|_| invalid("header key is not valid UTF-8"))?,
                String::from_utf8(value).map_err(|_| invalid("header value is not valid UTF-8"))?,
            ));
        }

        Ok(Some(WireItem::Frame(Frame {
            command,
            headers,
            body: raw.body,
        })))
    }
}

impl Encoder<WireItem> for StompCodec {
    type Error = io::Error;

    fn encode(&mut self, item: WireItem, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let frame = match item {
            WireItem::Ping => {
                dst.put_u8(b'\n');
                return Ok(());
            }
            WireItem::Frame(frame) => frame,
        };

        dst.extend_from_slice(frame.command.as_bytes());
        dst.put_u8(b'\n');

        let escape = escaped_command(&frame.command);
        let mut headers = frame.headers;
        if !frame.body.is_empty() && !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("content-length")) {
            headers.push(("content-length".to_string(), frame.body.len().to_string()));
        }

        for (key, value) in headers {
            if escape {
                dst.extend_from_slice(escape_header(&key).as_bytes());
                dst.put_u8(b':');
                dst.extend_from_slice(escape_header(&value).as_bytes());
            } else {
                dst.extend_from_slice(key.as_bytes());
                dst.put_u8(b':');
                dst.extend_from_slice(value.as_bytes());
            }
            dst.put_u8(b'\n');
        }

        dst.put_u8(b'\n');
        dst.extend_from_slice(&frame.body);
        dst.put_u8(0);
        Ok(())
    }
}
