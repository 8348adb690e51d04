use crate::error::Error;

/// Everything one client run needs to know, fixed up front.
///
/// A `Config` is built by the caller (the CLI binary, or library code),
/// handed to the session by reference and never mutated afterwards. The
/// presence of [`Config::payload`] selects send mode: connect, publish one
/// message, disconnect. Without it the client subscribes to
/// [`Config::destination`] and listens until stopped.
#[derive(Debug, Clone)]
pub struct Config {
    /// Broker hostname, without scheme or port
    pub host: String,
    /// Broker WebSocket port
    pub port: u16,
    /// Destination to subscribe or publish to (e.g. `/topic/events`)
    pub destination: String,
    /// Login for the CONNECT frame
    pub username: String,
    /// Passcode for the CONNECT frame
    pub password: String,
    /// Connect with `wss://` and verify the certificate chain
    pub use_tls: bool,
    /// Skip certificate and hostname verification (TLS only, never default)
    pub insecure_tls: bool,
    /// Wrap the connection in SockJS framing
    pub use_sockjs: bool,
    /// One-shot payload; when set the client sends this and exits
    pub payload: Option<String>,
    /// Flatten the payload's `key=value` tokens into a JSON object
    pub json_encode: bool,
    /// Heartbeat interval proposed in CONNECT, both directions, milliseconds
    pub heartbeat_ms: u64,
    /// Echo message headers alongside bodies in listen mode
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 61614,
            destination: String::new(),
            username: String::new(),
            password: String::new(),
            use_tls: false,
            insecure_tls: false,
            use_sockjs: false,
            payload: None,
            json_encode: false,
            heartbeat_ms: 10_000,
            debug: false,
        }
    }
}

impl Config {
    /// Check the fields a run cannot do without.
    ///
    /// Callers that parse user input should have rejected missing fields
    /// already; this is the session's own guard so that an incomplete
    /// `Config` fails fast with [`Error::Config`] instead of producing a
    /// half-formed CONNECT frame.
    pub fn validate(&self) -> Result<(), Error> {
        if self.host.is_empty() {
            return Err(Error::Config("host must not be empty".into()));
        }
        if self.destination.is_empty() {
            return Err(Error::Config("destination must not be empty".into()));
        }
        if self.username.is_empty() {
            return Err(Error::Config("username must not be empty".into()));
        }
        if self.password.is_empty() {
            return Err(Error::Config("password must not be empty".into()));
        }
        if self.insecure_tls && !self.use_tls {
            return Err(Error::Config(
                "insecure_tls is only meaningful together with use_tls".into(),
            ));
        }
        Ok(())
    }
}
