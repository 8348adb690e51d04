use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Multiplier applied to the negotiated incoming interval before the
/// connection is declared dead. Two full intervals absorbs one missed beat
/// plus scheduling jitter.
pub const GRACE_FACTOR: u64 = 2;

/// Parse a STOMP `heart-beat` header into its two interval fields.
///
/// Returns a tuple `(cx, cy)` in milliseconds: what the peer can send and
/// what it wants to receive. Missing or invalid fields default to `0`
/// (no heartbeat in that direction).
pub fn parse_heartbeat_header(header: &str) -> (u64, u64) {
    let mut parts = header.split(',');
    let cx = parts
        .next()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(0);
    let cy = parts
        .next()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(0);
    (cx, cy)
}

/// Negotiate heartbeat intervals between client and server.
///
/// `client_out`/`client_in` are the intervals this client proposed in its
/// CONNECT frame, `server_out`/`server_in` the ones the server answered with
/// in CONNECTED. Returns `(outgoing, incoming)`: how often this client must
/// send a beat and how often it may expect one.
///
/// A direction is disabled (`None`) as soon as either side proposes `0` for
/// it; otherwise the effective interval is the maximum of the two proposals,
/// so the slower party sets the pace.
pub fn negotiate_heartbeats(
    client_out: u64,
    client_in: u64,
    server_out: u64,
    server_in: u64,
) -> (Option<Duration>, Option<Duration>) {
    let outgoing = if client_out == 0 || server_in == 0 {
        None
    } else {
        Some(Duration::from_millis(std::cmp::max(client_out, server_in)))
    };
    let incoming = if client_in == 0 || server_out == 0 {
        None
    } else {
        Some(Duration::from_millis(std::cmp::max(client_in, server_out)))
    };
    (outgoing, incoming)
}

/// Liveness bookkeeping for one connection.
///
/// Holds the negotiated intervals, stamps inbound activity, answers the
/// watchdog's "have we waited too long" question, and owns the outbound
/// pulse task. The monitor itself never touches the network: the pulse task
/// writes through the same channel as frame sends, and the timeout check is
/// driven by the session's timer, so neither ever waits on frame processing.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    outgoing: Option<Duration>,
    incoming: Option<Duration>,
    origin: Instant,
    last_activity_ms: Arc<AtomicU64>,
}

impl HeartbeatMonitor {
    pub fn new(outgoing: Option<Duration>, incoming: Option<Duration>) -> Self {
        Self {
            outgoing,
            incoming,
            origin: Instant::now(),
            last_activity_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    /// A monitor with both directions disabled, the state before the
    /// CONNECTED negotiation has happened.
    pub fn inactive() -> Self {
        Self::new(None, None)
    }

    pub fn outgoing(&self) -> Option<Duration> {
        self.outgoing
    }

    pub fn incoming(&self) -> Option<Duration> {
        self.incoming
    }

    /// Record that something arrived from the peer. Any inbound item counts:
    /// frames, lone heartbeat bytes, SockJS control payloads.
    pub fn record_activity(&self) {
        self.last_activity_ms
            .store(self.elapsed_ms(), Ordering::SeqCst);
    }

    /// Milliseconds since the last recorded inbound activity.
    pub fn idle_ms(&self) -> u64 {
        self.elapsed_ms()
            .saturating_sub(self.last_activity_ms.load(Ordering::SeqCst))
    }

    /// Whether the peer has been silent past the grace window. Always false
    /// when no incoming heartbeat was negotiated.
    pub fn timed_out(&self) -> bool {
        match self.incoming {
            Some(interval) => {
                self.idle_ms() > (interval.as_millis() as u64).saturating_mul(GRACE_FACTOR)
            }
            None => false,
        }
    }

    /// The full silence window in milliseconds, incoming interval times
    /// grace factor. `None` when no incoming heartbeat was negotiated.
    pub fn grace_window_ms(&self) -> Option<u64> {
        self.incoming
            .map(|d| (d.as_millis() as u64).saturating_mul(GRACE_FACTOR))
    }

    /// The cadence at which the session should run the timeout check: half
    /// the incoming interval, `None` when no check is needed.
    pub fn watchdog_period(&self) -> Option<Duration> {
        self.incoming
            .map(|d| std::cmp::max(d / 2, Duration::from_millis(1)))
    }

    /// Spawn the outbound pulse task, if an outgoing interval was
    /// negotiated.
    ///
    /// The task pushes `beat` (the pre-encoded heartbeat payload for the
    /// connection's framing mode) into `tx` on every tick until `cancel`
    /// fires or the writer side goes away. Beats are sent unconditionally
    /// rather than suppressed behind data frames; this client is read-mostly
    /// and the extra byte is cheaper than coupling the pulse to the writer.
    pub fn spawn_pulse(
        &self,
        tx: mpsc::Sender<Bytes>,
        beat: Bytes,
        cancel: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        let period = self.outgoing?;
        debug!("starting heartbeat pulse every {:?}", period);
        Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately; the peer already heard
            // from us via CONNECT
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        if tx.send(beat.clone()).await.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("heartbeat pulse stopped");
        }))
    }

    fn elapsed_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}
