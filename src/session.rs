use std::collections::VecDeque;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::{FrameCodec, WireItem};
use crate::config::Config;
use crate::error::Error;
use crate::frame::{Command, Frame};
use crate::heartbeat::{HeartbeatMonitor, negotiate_heartbeats, parse_heartbeat_header};
use crate::transport::Transport;

/// Where a session is in its life.
///
/// States advance monotonically along the happy path (Disconnected,
/// Connecting, Connected, Subscribed, Closing, Closed); `Failed` can be
/// entered from anywhere and, like `Closed`, is terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Subscribed,
    Closing,
    Closed,
    /// Terminal failure; carries the human-readable reason.
    Failed(String),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed(_))
    }
}

/// Requests a graceful shutdown of a running [`Session`] from outside.
///
/// Cloneable and idempotent; the first [`StopHandle::stop`] wins and later
/// calls are no-ops.
#[derive(Debug, Clone)]
pub struct StopHandle {
    cancel: CancellationToken,
}

impl StopHandle {
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

/// The STOMP protocol state machine for one connection.
///
/// A session is built from a borrowed [`Config`], driven to completion once,
/// and then done; there is no reconnect. [`Session::start`] opens the
/// transport itself, [`Session::run`] accepts one (which is how the tests
/// drive the machine over an in-memory pair). Inbound MESSAGE frames for the
/// subscription are handed to the output sink; everything terminal is
/// reflected in [`Session::state`] and the returned `Result`.
pub struct Session<'a> {
    config: &'a Config,
    codec: FrameCodec,
    state: SessionState,
    monitor: HeartbeatMonitor,
    stop: CancellationToken,
    subscription: Option<String>,
    sub_seq: u64,
}

impl<'a> Session<'a> {
    /// Build a session over `config`, failing fast with [`Error::Config`]
    /// when the configuration is incomplete.
    pub fn new(config: &'a Config) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            codec: FrameCodec::new(config.use_sockjs),
            config,
            state: SessionState::Disconnected,
            monitor: HeartbeatMonitor::inactive(),
            stop: CancellationToken::new(),
            subscription: None,
            sub_seq: 0,
        })
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            cancel: self.stop.clone(),
        }
    }

    /// Connect the transport and run the machine to a terminal state.
    pub async fn start(&mut self, sink: mpsc::Sender<Frame>) -> Result<(), Error> {
        self.transition(SessionState::Connecting);
        let transport = match Transport::connect(self.config).await {
            Ok(transport) => transport,
            Err(e) => {
                error!("session failed: {}", e);
                self.transition(SessionState::Failed(e.to_string()));
                return Err(e);
            }
        };
        self.run(transport, sink).await
    }

    /// Run the machine over an already-open transport.
    ///
    /// Every fatal error lands here exactly once: the state moves to
    /// `Failed`, the transport is closed, and the error is returned.
    pub async fn run(
        &mut self,
        mut transport: Transport,
        sink: mpsc::Sender<Frame>,
    ) -> Result<(), Error> {
        if self.state == SessionState::Disconnected {
            self.transition(SessionState::Connecting);
        }
        let mut pulse = None;
        let outcome = self.drive(&mut transport, &sink, &mut pulse).await;
        if let Err(e) = &outcome {
            self.fail(&transport, e);
        }
        // the transport is closed on every exit path by now, which is what
        // lets the pulse task finish
        if let Some(handle) = pulse.take() {
            let _ = handle.await;
        }
        outcome
    }

    async fn drive(
        &mut self,
        transport: &mut Transport,
        sink: &mpsc::Sender<Frame>,
        pulse: &mut Option<JoinHandle<()>>,
    ) -> Result<(), Error> {
        let stop = self.stop.clone();
        self.send_frame(transport, self.connect_frame()).await?;

        let mut pending: VecDeque<WireItem> = VecDeque::new();
        if !self.handshake(transport, &stop, &mut pending).await? {
            // stopped before the broker answered; there is no session to
            // disconnect from
            transport.close();
            self.transition(SessionState::Closed);
            return Ok(());
        }

        *pulse = self.monitor.spawn_pulse(
            transport.sender(),
            self.codec.encode_heartbeat(),
            transport.cancel_token(),
        );
        let mut watchdog = self.monitor.watchdog_period().map(tokio::time::interval);

        if self.config.payload.is_some() {
            self.send_once(transport).await
        } else {
            self.listen(transport, sink, &stop, &mut pending, &mut watchdog)
                .await
        }
    }

    /// Wait for CONNECTED and negotiate heartbeats. Returns `false` when an
    /// external stop arrived first.
    async fn handshake(
        &mut self,
        transport: &mut Transport,
        stop: &CancellationToken,
        pending: &mut VecDeque<WireItem>,
    ) -> Result<bool, Error> {
        loop {
            while let Some(item) = pending.pop_front() {
                match item {
                    WireItem::Frame(frame) => match frame.command {
                        Command::Connected => {
                            let server_hb = frame.get_header("heart-beat").unwrap_or("0,0");
                            let (sx, sy) = parse_heartbeat_header(server_hb);
                            let (outgoing, incoming) = negotiate_heartbeats(
                                self.config.heartbeat_ms,
                                self.config.heartbeat_ms,
                                sx,
                                sy,
                            );
                            info!(
                                "connected to {}; heartbeats: outgoing {:?}, incoming {:?}",
                                self.config.host, outgoing, incoming
                            );
                            self.monitor = HeartbeatMonitor::new(outgoing, incoming);
                            self.transition(SessionState::Connected);
                            return Ok(true);
                        }
                        Command::Error => return Err(Error::Auth(error_diagnostic(&frame))),
                        other => debug!("ignoring {} frame before CONNECTED", other),
                    },
                    WireItem::Heartbeat => {}
                    WireItem::SockJsOpen => debug!("sockjs session opened"),
                    WireItem::SockJsClose { code, reason } => {
                        return Err(Error::Connect(format!(
                            "sockjs session closed during handshake ({:?}: {})",
                            code, reason
                        )));
                    }
                }
            }
            tokio::select! {
                _ = stop.cancelled() => return Ok(false),
                payload = transport.recv() => match payload {
                    Some(payload) => match self.codec.decode(&payload) {
                        Ok(items) => pending.extend(items),
                        // an unparseable answer this early means the endpoint
                        // is not speaking STOMP to us
                        Err(e) => return Err(Error::Connect(format!("handshake failed: {}", e))),
                    },
                    None => return Err(Error::Connect("connection closed during handshake".into())),
                },
            }
        }
    }

    /// Send-mode tail: one SEND, then straight into the graceful close.
    /// Never enters `Subscribed`.
    async fn send_once(&mut self, transport: &mut Transport) -> Result<(), Error> {
        let payload = self.config.payload.clone().unwrap_or_default();
        let body = if self.config.json_encode {
            crate::json::flatten_key_values(&payload).to_string()
        } else {
            payload
        };
        info!(
            "publishing {} bytes to {}",
            body.len(),
            self.config.destination
        );
        let frame = self.send_payload_frame(body);
        self.send_frame(transport, frame).await?;
        self.graceful_close(transport).await;
        Ok(())
    }

    /// Listen-mode steady state: deliver MESSAGE frames until stopped or
    /// something fatal happens.
    async fn listen(
        &mut self,
        transport: &mut Transport,
        sink: &mpsc::Sender<Frame>,
        stop: &CancellationToken,
        pending: &mut VecDeque<WireItem>,
        watchdog: &mut Option<Interval>,
    ) -> Result<(), Error> {
        let sub_id = self.next_subscription_id();
        let subscribe = Frame::new(Command::Subscribe)
            .header("id", sub_id.clone())
            .header("destination", self.config.destination.clone())
            .header("ack", "auto");
        self.send_frame(transport, subscribe).await?;
        self.subscription = Some(sub_id);
        self.transition(SessionState::Subscribed);
        info!("subscribed to {}", self.config.destination);

        loop {
            while let Some(item) = pending.pop_front() {
                match item {
                    WireItem::Frame(frame) => self.handle_frame(frame, sink).await?,
                    WireItem::Heartbeat | WireItem::SockJsOpen => {}
                    WireItem::SockJsClose { code, reason } => {
                        return Err(Error::Connect(format!(
                            "sockjs session closed ({:?}: {})",
                            code, reason
                        )));
                    }
                }
            }
            tokio::select! {
                _ = stop.cancelled() => {
                    self.graceful_close(transport).await;
                    return Ok(());
                }
                _ = maybe_tick(watchdog) => {
                    if self.monitor.timed_out() {
                        return Err(Error::HeartbeatTimeout(
                            self.monitor.grace_window_ms().unwrap_or_default(),
                        ));
                    }
                }
                payload = transport.recv() => match payload {
                    Some(payload) => {
                        self.monitor.record_activity();
                        match self.codec.decode(&payload) {
                            Ok(items) => pending.extend(items),
                            // one bad frame must not kill a long-running
                            // listener
                            Err(e) => warn!("dropping undecodable payload: {}", e),
                        }
                    }
                    None => return Err(Error::Connect("connection closed by server".into())),
                },
            }
        }
    }

    /// Steady-state dispatch, exhaustive over the command set.
    async fn handle_frame(&mut self, frame: Frame, sink: &mpsc::Sender<Frame>) -> Result<(), Error> {
        match frame.command {
            Command::Message => {
                // a missing subscription header still counts as ours; some
                // brokers omit it
                let foreign = matches!(
                    (frame.get_header("subscription"), self.subscription.as_deref()),
                    (Some(sub), Some(ours)) if sub != ours
                );
                if foreign {
                    warn!(
                        "dropping MESSAGE for unknown subscription {:?}",
                        frame.get_header("subscription")
                    );
                } else {
                    debug!(
                        "delivering MESSAGE from {:?}",
                        frame.get_header("destination")
                    );
                    if sink.send(frame).await.is_err() {
                        debug!("output sink closed; dropping message");
                    }
                }
            }
            Command::Error => return Err(Error::Protocol(error_diagnostic(&frame))),
            Command::Receipt => {
                debug!("ignoring RECEIPT {:?}", frame.get_header("receipt-id"));
            }
            Command::Connected => debug!("ignoring duplicate CONNECTED"),
            Command::Connect | Command::Subscribe | Command::Send | Command::Disconnect => {
                warn!("server sent client command {}; dropping", frame.command);
            }
        }
        Ok(())
    }

    /// The one graceful teardown: DISCONNECT, then close the transport.
    async fn graceful_close(&mut self, transport: &Transport) {
        let disconnect = Frame::new(Command::Disconnect);
        if let Err(e) = transport.send(self.codec.encode(&disconnect)).await {
            debug!("DISCONNECT not sent: {}", e);
        }
        self.transition(SessionState::Closing);
        transport.close();
        self.transition(SessionState::Closed);
    }

    fn fail(&mut self, transport: &Transport, err: &Error) {
        error!("session failed: {}", err);
        self.transition(SessionState::Failed(err.to_string()));
        transport.close();
    }

    async fn send_frame(&self, transport: &Transport, frame: Frame) -> Result<(), Error> {
        debug!("sending {}", frame.command);
        transport.send(self.codec.encode(&frame)).await
    }

    fn connect_frame(&self) -> Frame {
        Frame::new(Command::Connect)
            .header("accept-version", "1.1,1.2")
            .header("host", self.config.host.clone())
            .header("login", self.config.username.clone())
            .header("passcode", self.config.password.clone())
            .header("heart-beat", format!("{0},{0}", self.config.heartbeat_ms))
    }

    fn send_payload_frame(&self, body: String) -> Frame {
        let content_type = if self.config.json_encode {
            "application/json"
        } else {
            "text/plain"
        };
        Frame::new(Command::Send)
            .header("destination", self.config.destination.clone())
            .header("content-type", content_type)
            .header("content-length", body.len().to_string())
            .set_body(body)
    }

    fn next_subscription_id(&mut self) -> String {
        let id = format!("sub-{}", self.sub_seq);
        self.sub_seq += 1;
        id
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            debug!("session state {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }
}

fn error_diagnostic(frame: &Frame) -> String {
    let message = frame.get_header("message").unwrap_or("server error");
    let body = frame.body_text();
    let body = body.trim_end();
    if body.is_empty() {
        message.to_string()
    } else {
        format!("{}: {}", message, body)
    }
}

/// Tick the watchdog when there is one; otherwise park forever so the
/// select! branch never fires.
async fn maybe_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
