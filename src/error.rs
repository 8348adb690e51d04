use thiserror::Error;

/// Errors produced by the client.
///
/// Every variant is terminal for the run it occurs in: the session moves to
/// `Failed` and no reconnect is attempted. The one exception is
/// `MalformedFrame` on an inbound message while subscribed, which the session
/// logs and skips so that one bad frame cannot kill a long-running listener.
#[derive(Debug, Error)]
pub enum Error {
    /// The configuration handed to the session is incomplete or invalid.
    /// Raised before any connection attempt is made.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// DNS, TCP, TLS, WebSocket upgrade or SockJS negotiation failure, or
    /// the peer vanished where the protocol required it to speak.
    #[error("connect failed: {0}")]
    Connect(String),

    /// A payload could not be parsed as a STOMP frame.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The server rejected the CONNECT frame with an ERROR frame.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// No inbound activity within the negotiated window (milliseconds).
    #[error("heartbeat timeout: no activity within {0}ms")]
    HeartbeatTimeout(u64),

    /// An outbound write failed after the connection was established.
    #[error("send failed: {0}")]
    Send(String),

    /// The server sent an ERROR frame outside the connect handshake.
    #[error("protocol error: {0}")]
    Protocol(String),
}
