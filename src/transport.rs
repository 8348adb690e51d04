use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use rand::distributions::Alphanumeric;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{
    Connector, MaybeTlsStream, WebSocketStream, connect_async, connect_async_tls_with_config,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::config::Config;
use crate::error::Error;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CHANNEL_CAPACITY: usize = 32;
const INFO_TIMEOUT: Duration = Duration::from_secs(10);

/// The WebSocket leg of a connection.
///
/// A `Transport` hides the socket behind two channels: an outbound feed
/// drained by a single writer task (so frame sends and heartbeat bytes can
/// come from different tasks without interleaving on the wire) and an inbound
/// sequence of raw payloads that ends when the peer goes away. [`Transport::close`]
/// is idempotent and is the only teardown path; it unblocks both sides.
pub struct Transport {
    outbound: mpsc::Sender<Bytes>,
    inbound: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
}

impl Transport {
    /// Open the WebSocket described by `config`.
    ///
    /// Plain mode connects straight to the well-known STOMP endpoint. SockJS
    /// mode first performs the `/info` preflight over HTTP and then upgrades
    /// on a freshly generated session path. Any DNS, TCP, TLS, HTTP or
    /// upgrade failure surfaces as [`Error::Connect`].
    pub async fn connect(config: &Config) -> Result<Self, Error> {
        let url = if config.use_sockjs {
            sockjs_preflight(config).await?;
            let (server_id, session_id) = sockjs_session_ids();
            sockjs_websocket_url(config, &server_id, &session_id)?
        } else {
            plain_websocket_url(config)?
        };
        debug!("connecting to {}", url);

        let (stream, _response) = if config.use_tls && config.insecure_tls {
            // The one explicit code path that skips verification. Both the
            // chain check and the hostname check are disabled, nothing else.
            let tls = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()
                .map_err(|e| Error::Connect(format!("tls connector: {}", e)))?;
            connect_async_tls_with_config(url.as_str(), None, false, Some(Connector::NativeTls(tls)))
                .await
        } else {
            connect_async(url.as_str()).await
        }
        .map_err(|e| Error::Connect(format!("websocket connect to {}: {}", url, e)))?;

        debug!("websocket established");
        Ok(Self::spawn_io(stream))
    }

    /// An in-memory transport wired to a [`Peer`] handle instead of a
    /// socket. The peer can inject inbound payloads, observe what the client
    /// writes, and watch for close. Used by the test suite and useful for
    /// embedding against a fake broker.
    pub fn pair() -> (Self, Peer) {
        let (out_tx, out_rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let transport = Transport {
            outbound: out_tx,
            inbound: in_rx,
            cancel: cancel.clone(),
        };
        let peer = Peer {
            to_client: in_tx,
            from_client: out_rx,
            cancel,
        };
        (transport, peer)
    }

    fn spawn_io(stream: WsStream) -> Self {
        let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let (mut sink, mut source) = stream.split();

        // Writer task: sole owner of the sink. Everything outbound funnels
        // through one channel, which is what keeps concurrent frame and
        // heartbeat writes from interleaving.
        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    maybe = out_rx.recv() => match maybe {
                        Some(payload) => {
                            let message = match std::str::from_utf8(&payload) {
                                Ok(text) => Message::Text(text.to_owned()),
                                Err(_) => Message::Binary(payload.to_vec()),
                            };
                            if sink.send(message).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
            debug!("websocket writer stopped");
        });

        // Reader task: forwards text/binary payloads until the peer closes,
        // then lets the inbound channel end.
        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    item = source.next() => match item {
                        Some(Ok(Message::Text(text))) => {
                            if in_tx.send(Bytes::from(text.into_bytes())).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Binary(data))) => {
                            if in_tx.send(Bytes::from(data)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            debug!("websocket closed by peer: {:?}", frame);
                            break;
                        }
                        Some(Ok(_)) => {} // ping/pong are handled by the library
                        Some(Err(e)) => {
                            warn!("websocket read error: {}", e);
                            break;
                        }
                        None => break,
                    },
                }
            }
            debug!("websocket reader stopped");
        });

        Transport {
            outbound: out_tx,
            inbound: in_rx,
            cancel,
        }
    }

    /// Queue one payload for the writer task.
    pub async fn send(&self, payload: Bytes) -> Result<(), Error> {
        if self.cancel.is_cancelled() {
            return Err(Error::Send("transport is closed".into()));
        }
        self.outbound
            .send(payload)
            .await
            .map_err(|_| Error::Send("connection writer is gone".into()))
    }

    /// Next inbound payload; `None` once the connection is over.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.inbound.recv().await
    }

    /// A clone of the outbound feed, for tasks that write on their own
    /// schedule (the heartbeat pulse). Writes stay serialized behind the
    /// single writer.
    pub fn sender(&self) -> mpsc::Sender<Bytes> {
        self.outbound.clone()
    }

    /// Tear the connection down. Safe to call from any state, any number of
    /// times; only the first call does anything.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// The far side of an in-memory [`Transport::pair`].
pub struct Peer {
    to_client: mpsc::Sender<Bytes>,
    from_client: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
}

impl Peer {
    /// Deliver one payload to the client side.
    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<(), Error> {
        self.to_client
            .send(payload.into())
            .await
            .map_err(|_| Error::Send("client inbound side dropped".into()))
    }

    /// Next payload the client wrote; `None` once the client side is gone.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.from_client.recv().await
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the client has invoked [`Transport::close`].
    pub async fn wait_closed(&self) {
        self.cancel.cancelled().await
    }
}

/// Endpoint for plain STOMP-over-WebSocket: `ws[s]://host:port/ws`.
pub fn plain_websocket_url(config: &Config) -> Result<Url, Error> {
    let scheme = if config.use_tls { "wss" } else { "ws" };
    parse_endpoint(format!("{}://{}:{}/ws", scheme, config.host, config.port))
}

/// Endpoint for an upgraded SockJS session:
/// `ws[s]://host:port/stomp/<server-id>/<session-id>/websocket`.
pub fn sockjs_websocket_url(
    config: &Config,
    server_id: &str,
    session_id: &str,
) -> Result<Url, Error> {
    let scheme = if config.use_tls { "wss" } else { "ws" };
    parse_endpoint(format!(
        "{}://{}:{}/stomp/{}/{}/websocket",
        scheme, config.host, config.port, server_id, session_id
    ))
}

/// The SockJS negotiation endpoint: `http[s]://host:port/stomp/info`.
pub fn sockjs_info_url(config: &Config) -> Result<Url, Error> {
    let scheme = if config.use_tls { "https" } else { "http" };
    parse_endpoint(format!(
        "{}://{}:{}/stomp/info",
        scheme, config.host, config.port
    ))
}

fn parse_endpoint(raw: String) -> Result<Url, Error> {
    Url::parse(&raw).map_err(|e| Error::Connect(format!("invalid endpoint {:?}: {}", raw, e)))
}

/// SockJS ids are client-generated: a three digit server id and a short
/// random session token.
fn sockjs_session_ids() -> (String, String) {
    let mut rng = rand::thread_rng();
    let server_id = format!("{:03}", rng.gen_range(0..1000));
    let session_id: String = (&mut rng)
        .sample_iter(Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    (server_id, session_id)
}

/// SockJS session negotiation: `GET /stomp/info` must answer 2xx and must
/// not advertise `"websocket": false`.
async fn sockjs_preflight(config: &Config) -> Result<(), Error> {
    let url = sockjs_info_url(config)?;
    let mut builder = reqwest::Client::builder().timeout(INFO_TIMEOUT);
    if config.use_tls && config.insecure_tls {
        builder = builder
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true);
    }
    let client = builder
        .build()
        .map_err(|e| Error::Connect(format!("http client: {}", e)))?;
    let response = client
        .get(url.clone())
        .send()
        .await
        .map_err(|e| Error::Connect(format!("sockjs info request to {}: {}", url, e)))?;
    if !response.status().is_success() {
        return Err(Error::Connect(format!(
            "sockjs info returned {}",
            response.status()
        )));
    }
    let info: serde_json::Value = response
        .json()
        .await
        .map_err(|e| Error::Connect(format!("sockjs info body: {}", e)))?;
    if info.get("websocket").and_then(serde_json::Value::as_bool) == Some(false) {
        return Err(Error::Connect(
            "server reports websocket transport disabled".into(),
        ));
    }
    debug!("sockjs info ok: {}", info);
    Ok(())
}
