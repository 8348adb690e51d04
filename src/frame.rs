use std::fmt;

use crate::error::Error;

/// The closed set of STOMP commands this client speaks.
///
/// Client frames are CONNECT, SUBSCRIBE, SEND and DISCONNECT; server frames
/// are CONNECTED, MESSAGE, ERROR and RECEIPT. A command word outside this set
/// is rejected at decode time as a malformed frame rather than carried around
/// as a free-form string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Connected,
    Subscribe,
    Send,
    Message,
    Error,
    Disconnect,
    Receipt,
}

impl Command {
    /// The wire spelling of the command.
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Connected => "CONNECTED",
            Command::Subscribe => "SUBSCRIBE",
            Command::Send => "SEND",
            Command::Message => "MESSAGE",
            Command::Error => "ERROR",
            Command::Disconnect => "DISCONNECT",
            Command::Receipt => "RECEIPT",
        }
    }
}

impl TryFrom<&str> for Command {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Error> {
        match value {
            "CONNECT" => Ok(Command::Connect),
            "CONNECTED" => Ok(Command::Connected),
            "SUBSCRIBE" => Ok(Command::Subscribe),
            "SEND" => Ok(Command::Send),
            "MESSAGE" => Ok(Command::Message),
            "ERROR" => Ok(Command::Error),
            "DISCONNECT" => Ok(Command::Disconnect),
            "RECEIPT" => Ok(Command::Receipt),
            other => Err(Error::MalformedFrame(format!(
                "unknown command: {:?}",
                other
            ))),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single STOMP frame.
///
/// `Frame` holds the command, an ordered list of headers (key/value pairs)
/// and the raw body bytes. Header order is preserved exactly as decoded or
/// built; duplicate keys are allowed and [`Frame::get_header`] resolves them
/// last-wins. An empty body means the frame has none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// STOMP command
    pub command: Command,
    /// Ordered headers as (key, value) pairs
    pub headers: Vec<(String, String)>,
    /// Raw body bytes
    pub body: Vec<u8>,
}

impl Frame {
    /// Create a new frame with the given command and empty headers/body.
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Add a header (builder style).
    ///
    /// Returns the mutated `Frame` allowing builder-style chaining.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Set the frame body (builder style).
    ///
    /// Returns the mutated `Frame` allowing builder-style chaining.
    pub fn set_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Get the value of a header by name.
    ///
    /// When a key appears more than once the last occurrence wins, so a
    /// repeated header overrides earlier ones on lookup while the full
    /// sequence stays available in [`Frame::headers`].
    pub fn get_header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// The body reinterpreted as UTF-8 text, lossily.
    pub fn body_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Command: {}", self.command)?;
        for (k, v) in &self.headers {
            writeln!(f, "{}: {}", k, v)?;
        }
        writeln!(f, "Body ({} bytes)", self.body.len())
    }
}
