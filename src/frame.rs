use std::fmt;

/// A single STOMP frame: command, ordered headers, raw body bytes.
///
/// Frames are immutable by convention once built; the codec is the only
/// wire-side producer. Header lookups are first-wins, matching the STOMP
/// rule for repeated header names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// STOMP command (e.g. CONNECT, SEND, SUBSCRIBE)
    pub command: String,
    /// Ordered headers as (key, value) pairs; keys are case-sensitive
    pub headers: Vec<(String, String)>,
    /// Raw body bytes, possibly empty
    pub body: Vec<u8>,
}

impl Frame {
    /// Create a frame with the given command and empty headers/body.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Append a header (builder style).
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Set the frame body (builder style).
    pub fn set_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// First header value matching `key` (case-sensitive), if any.
    ///
    /// Duplicate header names resolve first-wins per the STOMP spec.
    pub fn get_header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Whether any header with the given name is present.
    pub fn has_header(&self, key: &str) -> bool {
        self.headers.iter().any(|(k, _)| k == key)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.command)?;
        for (k, v) in &self.headers {
            write!(f, " {}:{}", k, v)?;
        }
        write!(f, " ({} byte body)", self.body.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_collects_headers_in_order() {
        let f = Frame::new("SEND")
            .header("destination", "/queue/a")
            .header("priority", "4")
            .set_body(b"hi".to_vec());
        assert_eq!(f.command, "SEND");
        assert_eq!(f.headers[0].0, "destination");
        assert_eq!(f.headers[1].0, "priority");
        assert_eq!(f.body, b"hi");
    }

    #[test]
    fn get_header_is_first_wins() {
        let f = Frame::new("MESSAGE")
            .header("foo", "first")
            .header("foo", "second");
        assert_eq!(f.get_header("foo"), Some("first"));
        assert_eq!(f.get_header("missing"), None);
    }

    #[test]
    fn display_summarizes_frame() {
        let f = Frame::new("CONNECT").header("accept-version", "1.2");
        let s = format!("{}", f);
        assert!(s.contains("CONNECT"));
        assert!(s.contains("accept-version:1.2"));
    }
}
