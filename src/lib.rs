pub mod codec;
pub mod config;
pub mod driver;
pub mod error;
pub mod frame;
pub mod heartbeat;
pub mod json;
pub mod session;
pub mod transport;

pub use codec::{FrameCodec, WireItem};
pub use config::Config;
pub use error::Error;
pub use frame::{Command, Frame};
pub use heartbeat::{HeartbeatMonitor, negotiate_heartbeats, parse_heartbeat_header};
pub use session::{Session, SessionState, StopHandle};
pub use transport::{Peer, Transport};
