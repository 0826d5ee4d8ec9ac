//! Incremental slice-based STOMP frame parser.
//!
//! The parser never fails on a well-formed partial buffer: it returns
//! `Ok(None)` until a complete frame (including its NUL terminator) is
//! present, so callers can feed bytes in arbitrary chunks and retry.

use thiserror::Error;

/// Errors for malformed wire data. Partial input is not an error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed header line (no colon): {0:?}")]
    MalformedHeader(String),
    #[error("invalid content-length header: {0:?}")]
    BadContentLength(String),
    #[error("missing NUL terminator after content-length body")]
    MissingTerminator,
    #[error("invalid escape sequence \\{0} in header")]
    InvalidEscape(char),
    #[error("truncated escape sequence in header")]
    TruncatedEscape,
}

/// A frame parsed out of a byte slice, still in raw (unescaped) form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub command: Vec<u8>,
    pub headers: Vec<(Vec<u8>, Vec<u8>)>,
    pub body: Vec<u8>,
    /// Total bytes consumed from the input, including terminator and any
    /// trailing LF.
    pub consumed: usize,
}

/// Take one LF-terminated line starting at `pos`, stripping a trailing CR.
///
/// Returns the line and the position just past the LF, or `None` when the
/// buffer ends before an LF.
fn take_line(input: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    let rel = input[pos..].iter().position(|&b| b == b'\n')?;
    let mut line = &input[pos..pos + rel];
    if line.last() == Some(&b'\r') {
        line = &line[..line.len() - 1];
    }
    Some((line, pos + rel + 1))
}

fn content_length(headers: &[(Vec<u8>, Vec<u8>)]) -> Result<Option<usize>, ParseError> {
    for (k, v) in headers {
        if k.eq_ignore_ascii_case(b"content-length") {
            let text = std::str::from_utf8(v)
                .map_err(|_| ParseError::BadContentLength(String::from_utf8_lossy(v).into()))?;
            return text
                .trim()
                .parse::<usize>()
                .map(Some)
                .map_err(|_| ParseError::BadContentLength(text.to_string()));
        }
    }
    Ok(None)
}

/// Parse a single STOMP frame from the start of `input`.
///
/// Leading LF bytes (heartbeats) are not handled here; the codec strips
/// them before delegating. Returns `Ok(None)` when more bytes are needed.
pub fn parse_frame_slice(input: &[u8]) -> Result<Option<RawFrame>, ParseError> {
    let Some((command_line, mut pos)) = take_line(input, 0) else {
        return Ok(None);
    };
    let command = command_line.to_vec();

    let mut headers: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    loop {
        let Some((line, next)) = take_line(input, pos) else {
            return Ok(None);
        };
        pos = next;
        if line.is_empty() {
            break;
        }
        match line.iter().position(|&b| b == b':') {
            Some(colon) => {
                headers.push((line[..colon].to_vec(), line[colon + 1..].to_vec()));
            }
            None => {
                return Err(ParseError::MalformedHeader(
                    String::from_utf8_lossy(line).into(),
                ));
            }
        }
    }

    let body = match content_length(&headers)? {
        Some(declared) => {
            // length-delimited body, then a mandatory NUL
            let end = match pos.checked_add(declared) {
                // a length no buffer could ever satisfy is hostile input,
                // not a partial frame
                None => return Err(ParseError::BadContentLength(declared.to_string())),
                Some(end) if end >= input.len() => return Ok(None),
                Some(end) => end,
            };
            let body = input[pos..end].to_vec();
            pos = end;
            if input[pos] != 0 {
                return Err(ParseError::MissingTerminator);
            }
            pos += 1;
            body
        }
        None => {
            let Some(rel) = input[pos..].iter().position(|&b| b == 0) else {
                return Ok(None);
            };
            let body = input[pos..pos + rel].to_vec();
            pos += rel + 1;
            body
        }
    };

    // optional trailing LF after the terminator
    if input.get(pos) == Some(&b'\n') {
        pos += 1;
    }

    Ok(Some(RawFrame {
        command,
        headers,
        body,
        consumed: pos,
    }))
}

/// Undo STOMP 1.1+ header escaping (`\\`, `\n`, `\r`, `\c`).
pub fn unescape_header(input: &[u8]) -> Result<Vec<u8>, ParseError> {
    let mut out = Vec::with_capacity(input.len());
    let mut iter = input.iter();
    while let Some(&b) = iter.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match iter.next() {
            Some(b'\\') => out.push(b'\\'),
            Some(b'n') => out.push(b'\n'),
            Some(b'r') => out.push(b'\r'),
            Some(b'c') => out.push(b':'),
            Some(&other) => return Err(ParseError::InvalidEscape(other as char)),
            None => return Err(ParseError::TruncatedEscape),
        }
    }
    Ok(out)
}

/// Apply STOMP 1.1+ header escaping to a key or value.
pub fn escape_header(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            _ => out.push(ch),
        }
    }
    out
}
