//! End-to-end session tests over an in-memory transport.
//!
//! Each test plays the broker side of the conversation through the
//! [`Peer`] half of [`Transport::pair`] while the session runs in the same
//! task via `tokio::join!`, so every exchange is fully deterministic.

use bytes::Bytes;
use tokio::sync::mpsc;

use stomp_ws::codec::{FrameCodec, WireItem};
use stomp_ws::transport::Peer;
use stomp_ws::{Command, Config, Error, Frame, Session, SessionState, Transport};

fn listen_config() -> Config {
    Config {
        host: "broker.test".into(),
        destination: "/topic/events".into(),
        username: "user".into(),
        password: "secret".into(),
        heartbeat_ms: 0,
        ..Config::default()
    }
}

/// Read client payloads until one decodes to a frame, skipping heartbeats.
async fn recv_frame(peer: &mut Peer, codec: &FrameCodec) -> Frame {
    loop {
        let payload = peer.recv().await.expect("client hung up early");
        let items = codec
            .decode(&payload)
            .expect("client sent an undecodable payload");
        for item in items {
            match item {
                WireItem::Frame(frame) => return frame,
                WireItem::Heartbeat => {}
                other => panic!("unexpected client item {:?}", other),
            }
        }
    }
}

fn encode(frame: &Frame) -> Bytes {
    FrameCodec::new(false).encode(frame)
}

fn connected_frame(heart_beat: &str) -> Frame {
    Frame::new(Command::Connected)
        .header("version", "1.2")
        .header("heart-beat", heart_beat)
}

fn message_frame(subscription: &str, body: &str) -> Frame {
    Frame::new(Command::Message)
        .header("subscription", subscription)
        .header("destination", "/topic/events")
        .set_body(body.as_bytes().to_vec())
}

// =============================================================================
// Listen mode
// =============================================================================

/// Full happy path: connect, subscribe, two deliveries in order, graceful
/// stop with exactly one DISCONNECT before the close.
#[tokio::test]
async fn listen_session_delivers_messages_in_order_and_closes_gracefully() {
    let config = listen_config();
    let mut session = Session::new(&config).unwrap();
    let stop = session.stop_handle();
    let (transport, mut peer) = Transport::pair();
    let (sink_tx, mut sink_rx) = mpsc::channel::<Frame>(32);
    let codec = FrameCodec::new(false);

    let broker = async {
        let connect = recv_frame(&mut peer, &codec).await;
        assert_eq!(connect.command, Command::Connect);
        assert_eq!(connect.get_header("accept-version"), Some("1.1,1.2"));
        assert_eq!(connect.get_header("host"), Some("broker.test"));
        assert_eq!(connect.get_header("login"), Some("user"));
        assert_eq!(connect.get_header("passcode"), Some("secret"));
        assert_eq!(connect.get_header("heart-beat"), Some("0,0"));
        peer.send(encode(&connected_frame("0,0"))).await.unwrap();

        let subscribe = recv_frame(&mut peer, &codec).await;
        assert_eq!(subscribe.command, Command::Subscribe);
        assert_eq!(subscribe.get_header("destination"), Some("/topic/events"));
        assert_eq!(subscribe.get_header("ack"), Some("auto"));
        let sub_id = subscribe.get_header("id").expect("id header").to_string();

        peer.send(encode(&message_frame(&sub_id, "first"))).await.unwrap();
        peer.send(encode(&message_frame(&sub_id, "second"))).await.unwrap();

        let first = sink_rx.recv().await.expect("first delivery");
        let second = sink_rx.recv().await.expect("second delivery");
        assert_eq!(first.body, b"first");
        assert_eq!(second.body, b"second");
        assert_eq!(first.get_header("subscription"), Some(sub_id.as_str()));

        stop.stop();
        let disconnect = recv_frame(&mut peer, &codec).await;
        assert_eq!(disconnect.command, Command::Disconnect);
        peer.wait_closed().await;
    };

    let (outcome, ()) = tokio::join!(session.run(transport, sink_tx), broker);
    outcome.unwrap();
    assert_eq!(session.state(), &SessionState::Closed);
}

/// A MESSAGE tagged with an unknown subscription id is dropped, not
/// delivered.
#[tokio::test]
async fn message_for_unknown_subscription_is_dropped() {
    let config = listen_config();
    let mut session = Session::new(&config).unwrap();
    let stop = session.stop_handle();
    let (transport, mut peer) = Transport::pair();
    let (sink_tx, mut sink_rx) = mpsc::channel::<Frame>(32);
    let codec = FrameCodec::new(false);

    let broker = async {
        recv_frame(&mut peer, &codec).await;
        peer.send(encode(&connected_frame("0,0"))).await.unwrap();
        let subscribe = recv_frame(&mut peer, &codec).await;
        let sub_id = subscribe.get_header("id").expect("id header").to_string();

        peer.send(encode(&message_frame("someone-else", "not ours")))
            .await
            .unwrap();
        peer.send(encode(&message_frame(&sub_id, "ours"))).await.unwrap();

        let delivered = sink_rx.recv().await.expect("delivery");
        assert_eq!(delivered.body, b"ours");

        stop.stop();
        recv_frame(&mut peer, &codec).await; // DISCONNECT
        peer.wait_closed().await;
        sink_rx
    };

    let (outcome, mut sink_rx) = tokio::join!(session.run(transport, sink_tx), broker);
    outcome.unwrap();
    assert!(sink_rx.try_recv().is_err(), "the foreign message leaked through");
}

/// Brokers that omit the subscription header still get their messages
/// delivered.
#[tokio::test]
async fn message_without_subscription_header_is_delivered() {
    let config = listen_config();
    let mut session = Session::new(&config).unwrap();
    let stop = session.stop_handle();
    let (transport, mut peer) = Transport::pair();
    let (sink_tx, mut sink_rx) = mpsc::channel::<Frame>(32);
    let codec = FrameCodec::new(false);

    let broker = async {
        recv_frame(&mut peer, &codec).await;
        peer.send(encode(&connected_frame("0,0"))).await.unwrap();
        recv_frame(&mut peer, &codec).await; // SUBSCRIBE

        let anonymous = Frame::new(Command::Message)
            .header("destination", "/topic/events")
            .set_body(b"anon".to_vec());
        peer.send(encode(&anonymous)).await.unwrap();

        assert_eq!(sink_rx.recv().await.expect("delivery").body, b"anon");

        stop.stop();
        recv_frame(&mut peer, &codec).await; // DISCONNECT
        peer.wait_closed().await;
    };

    let (outcome, ()) = tokio::join!(session.run(transport, sink_tx), broker);
    outcome.unwrap();
}

/// One undecodable payload must not kill the listener; later frames still
/// arrive.
#[tokio::test]
async fn malformed_payload_is_skipped_while_subscribed() {
    let config = listen_config();
    let mut session = Session::new(&config).unwrap();
    let stop = session.stop_handle();
    let (transport, mut peer) = Transport::pair();
    let (sink_tx, mut sink_rx) = mpsc::channel::<Frame>(32);
    let codec = FrameCodec::new(false);

    let broker = async {
        recv_frame(&mut peer, &codec).await;
        peer.send(encode(&connected_frame("0,0"))).await.unwrap();
        let subscribe = recv_frame(&mut peer, &codec).await;
        let sub_id = subscribe.get_header("id").expect("id header").to_string();

        peer.send(Bytes::from_static(b"THISISNOTSTOMP\n\n\0"))
            .await
            .unwrap();
        peer.send(encode(&message_frame(&sub_id, "still alive")))
            .await
            .unwrap();

        let delivered = sink_rx.recv().await.expect("delivery after bad payload");
        assert_eq!(delivered.body, b"still alive");

        stop.stop();
        recv_frame(&mut peer, &codec).await; // DISCONNECT
        peer.wait_closed().await;
    };

    let (outcome, ()) = tokio::join!(session.run(transport, sink_tx), broker);
    outcome.unwrap();
    assert_eq!(session.state(), &SessionState::Closed);
}

/// An ERROR frame after the handshake is a protocol failure, not an auth
/// one.
#[tokio::test]
async fn error_frame_while_subscribed_is_a_protocol_failure() {
    let config = listen_config();
    let mut session = Session::new(&config).unwrap();
    let (transport, mut peer) = Transport::pair();
    let (sink_tx, _sink_rx) = mpsc::channel(32);
    let codec = FrameCodec::new(false);

    let broker = async {
        recv_frame(&mut peer, &codec).await;
        peer.send(encode(&connected_frame("0,0"))).await.unwrap();
        recv_frame(&mut peer, &codec).await; // SUBSCRIBE

        let error = Frame::new(Command::Error).header("message", "queue deleted");
        peer.send(encode(&error)).await.unwrap();
        peer.wait_closed().await;
    };

    let (outcome, ()) = tokio::join!(session.run(transport, sink_tx), broker);
    let err = outcome.unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));
    assert!(format!("{}", err).contains("queue deleted"));
    assert!(matches!(session.state(), SessionState::Failed(_)));
    assert!(session.state().is_terminal());
}

/// The peer vanishing mid-subscription is a connection failure.
#[tokio::test]
async fn server_hangup_fails_the_session() {
    let config = listen_config();
    let mut session = Session::new(&config).unwrap();
    let (transport, mut peer) = Transport::pair();
    let (sink_tx, _sink_rx) = mpsc::channel(32);
    let codec = FrameCodec::new(false);

    let broker = async move {
        recv_frame(&mut peer, &codec).await;
        peer.send(encode(&connected_frame("0,0"))).await.unwrap();
        recv_frame(&mut peer, &codec).await; // SUBSCRIBE
        drop(peer);
    };

    let (outcome, ()) = tokio::join!(session.run(transport, sink_tx), broker);
    let err = outcome.unwrap_err();
    assert!(matches!(err, Error::Connect(_)));
    assert!(format!("{}", err).contains("closed"));
    assert!(matches!(session.state(), SessionState::Failed(_)));
}

// =============================================================================
// Handshake
// =============================================================================

/// An ERROR answer to CONNECT is an authentication failure carrying the
/// broker's diagnostic.
#[tokio::test]
async fn error_during_handshake_fails_with_auth() {
    let config = listen_config();
    let mut session = Session::new(&config).unwrap();
    let (transport, mut peer) = Transport::pair();
    let (sink_tx, _sink_rx) = mpsc::channel(32);
    let codec = FrameCodec::new(false);

    let broker = async {
        let connect = recv_frame(&mut peer, &codec).await;
        assert_eq!(connect.command, Command::Connect);
        let error = Frame::new(Command::Error)
            .header("message", "Authentication failed")
            .set_body(b"bad credentials".to_vec());
        peer.send(encode(&error)).await.unwrap();
        peer.wait_closed().await;
    };

    let (outcome, ()) = tokio::join!(session.run(transport, sink_tx), broker);
    let err = outcome.unwrap_err();
    assert!(matches!(err, Error::Auth(_)));
    let text = format!("{}", err);
    assert!(text.contains("Authentication failed"));
    assert!(text.contains("bad credentials"));
    match session.state() {
        SessionState::Failed(reason) => assert!(reason.contains("Authentication failed")),
        other => panic!("expected Failed, got {:?}", other),
    }
}

/// Hanging up before CONNECTED is a connection failure, not a timeout.
#[tokio::test]
async fn hangup_before_connected_fails_with_connect_error() {
    let config = listen_config();
    let mut session = Session::new(&config).unwrap();
    let (transport, mut peer) = Transport::pair();
    let (sink_tx, _sink_rx) = mpsc::channel(32);
    let codec = FrameCodec::new(false);

    let broker = async move {
        recv_frame(&mut peer, &codec).await;
        drop(peer);
    };

    let (outcome, ()) = tokio::join!(session.run(transport, sink_tx), broker);
    let err = outcome.unwrap_err();
    assert!(matches!(err, Error::Connect(_)));
    assert!(format!("{}", err).contains("handshake"));
}

/// Garbage instead of CONNECTED means the endpoint is not speaking STOMP;
/// that is fatal during the handshake even though it would be skippable
/// later.
#[tokio::test]
async fn malformed_answer_during_handshake_is_fatal() {
    let config = listen_config();
    let mut session = Session::new(&config).unwrap();
    let (transport, mut peer) = Transport::pair();
    let (sink_tx, _sink_rx) = mpsc::channel(32);
    let codec = FrameCodec::new(false);

    let broker = async {
        recv_frame(&mut peer, &codec).await;
        peer.send(Bytes::from_static(b"HTTP/1.1 400 Bad Request\r\n\r\n"))
            .await
            .unwrap();
        peer.wait_closed().await;
    };

    let (outcome, ()) = tokio::join!(session.run(transport, sink_tx), broker);
    let err = outcome.unwrap_err();
    assert!(matches!(err, Error::Connect(_)));
    assert!(matches!(session.state(), SessionState::Failed(_)));
}

/// Stopping while the broker is still silent closes without a DISCONNECT,
/// because there is no session to disconnect from yet.
#[tokio::test]
async fn stop_before_connected_closes_cleanly() {
    let config = listen_config();
    let mut session = Session::new(&config).unwrap();
    let stop = session.stop_handle();
    let (transport, mut peer) = Transport::pair();
    let (sink_tx, _sink_rx) = mpsc::channel(32);
    let codec = FrameCodec::new(false);

    let broker = async move {
        let connect = recv_frame(&mut peer, &codec).await;
        assert_eq!(connect.command, Command::Connect);
        stop.stop();
        peer.wait_closed().await;
        peer
    };

    let (outcome, mut peer) = tokio::join!(session.run(transport, sink_tx), broker);
    outcome.unwrap();
    assert_eq!(session.state(), &SessionState::Closed);
    assert!(peer.recv().await.is_none(), "nothing should follow the CONNECT");
}

/// A transport that cannot even be opened leaves the session Failed, with
/// the connect diagnostic as the reason.
#[tokio::test]
async fn unconnectable_endpoint_fails_the_session_before_any_frames() {
    let mut config = listen_config();
    config.host = "not a hostname".into();
    let mut session = Session::new(&config).unwrap();
    let (sink_tx, _sink_rx) = mpsc::channel(32);

    let err = session.start(sink_tx).await.unwrap_err();
    assert!(matches!(err, Error::Connect(_)));
    assert!(matches!(session.state(), SessionState::Failed(_)));
    assert!(session.state().is_terminal());
}

// =============================================================================
// Send mode
// =============================================================================

/// Send mode publishes one sized frame and leaves without ever subscribing.
#[tokio::test]
async fn send_mode_publishes_once_and_disconnects() {
    let mut config = listen_config();
    config.payload = Some("hello world".into());
    let mut session = Session::new(&config).unwrap();
    let (transport, mut peer) = Transport::pair();
    let (sink_tx, _sink_rx) = mpsc::channel(32);
    let codec = FrameCodec::new(false);

    let broker = async {
        let connect = recv_frame(&mut peer, &codec).await;
        assert_eq!(connect.command, Command::Connect);
        peer.send(encode(&connected_frame("0,0"))).await.unwrap();

        // the very next frame is the SEND; no SUBSCRIBE in this mode
        let send = recv_frame(&mut peer, &codec).await;
        assert_eq!(send.command, Command::Send);
        assert_eq!(send.get_header("destination"), Some("/topic/events"));
        assert_eq!(send.get_header("content-type"), Some("text/plain"));
        assert_eq!(send.get_header("content-length"), Some("11"));
        assert_eq!(send.body, b"hello world");

        let disconnect = recv_frame(&mut peer, &codec).await;
        assert_eq!(disconnect.command, Command::Disconnect);
        peer.wait_closed().await;
    };

    let (outcome, ()) = tokio::join!(session.run(transport, sink_tx), broker);
    outcome.unwrap();
    assert_eq!(session.state(), &SessionState::Closed);
}

/// With JSON encoding on, the payload's key=value tokens travel as a typed
/// JSON object.
#[tokio::test]
async fn json_send_flattens_key_value_payload() {
    let mut config = listen_config();
    config.payload = Some("name=test temperature=23.5 active=true".into());
    config.json_encode = true;
    let mut session = Session::new(&config).unwrap();
    let (transport, mut peer) = Transport::pair();
    let (sink_tx, _sink_rx) = mpsc::channel(32);
    let codec = FrameCodec::new(false);

    let broker = async {
        recv_frame(&mut peer, &codec).await;
        peer.send(encode(&connected_frame("0,0"))).await.unwrap();

        let send = recv_frame(&mut peer, &codec).await;
        assert_eq!(send.get_header("content-type"), Some("application/json"));
        let value: serde_json::Value = serde_json::from_slice(&send.body).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"name": "test", "temperature": 23.5, "active": true})
        );
        let declared: usize = send
            .get_header("content-length")
            .expect("content-length header")
            .parse()
            .unwrap();
        assert_eq!(declared, send.body.len());

        recv_frame(&mut peer, &codec).await; // DISCONNECT
        peer.wait_closed().await;
    };

    let (outcome, ()) = tokio::join!(session.run(transport, sink_tx), broker);
    outcome.unwrap();
}

// =============================================================================
// Heartbeats
// =============================================================================

/// A broker that negotiates beats and then goes silent gets abandoned after
/// the grace window.
#[tokio::test(start_paused = true)]
async fn missing_heartbeats_fail_the_session() {
    let mut config = listen_config();
    config.heartbeat_ms = 1000;
    let mut session = Session::new(&config).unwrap();
    let (transport, mut peer) = Transport::pair();
    let (sink_tx, _sink_rx) = mpsc::channel(32);
    let codec = FrameCodec::new(false);

    let broker = async {
        let connect = recv_frame(&mut peer, &codec).await;
        assert_eq!(connect.get_header("heart-beat"), Some("1000,1000"));
        peer.send(encode(&connected_frame("1000,1000"))).await.unwrap();
        let subscribe = recv_frame(&mut peer, &codec).await;
        assert_eq!(subscribe.command, Command::Subscribe);
        // stay connected but completely silent from here on
        peer.wait_closed().await;
    };

    let (outcome, ()) = tokio::join!(session.run(transport, sink_tx), broker);
    match outcome {
        Err(Error::HeartbeatTimeout(window)) => assert_eq!(window, 2000),
        other => panic!("expected heartbeat timeout, got {:?}", other),
    }
    assert!(matches!(session.state(), SessionState::Failed(_)));
}

/// Inbound traffic, heartbeat bytes included, keeps the watchdog quiet.
#[tokio::test(start_paused = true)]
async fn inbound_heartbeats_keep_the_session_alive() {
    let mut config = listen_config();
    config.heartbeat_ms = 1000;
    let mut session = Session::new(&config).unwrap();
    let stop = session.stop_handle();
    let (transport, mut peer) = Transport::pair();
    let (sink_tx, _sink_rx) = mpsc::channel(32);
    let codec = FrameCodec::new(false);

    let broker = async {
        recv_frame(&mut peer, &codec).await;
        peer.send(encode(&connected_frame("1000,1000"))).await.unwrap();
        recv_frame(&mut peer, &codec).await; // SUBSCRIBE

        // four beats, one per second, well past the 2s grace window
        for _ in 0..4 {
            tokio::time::sleep(std::time::Duration::from_millis(1000)).await;
            peer.send(Bytes::from_static(b"\n")).await.unwrap();
        }

        stop.stop();
        loop {
            // drain the client's own beats until the DISCONNECT shows up
            let frame = recv_frame(&mut peer, &codec).await;
            if frame.command == Command::Disconnect {
                break;
            }
        }
        peer.wait_closed().await;
    };

    let (outcome, ()) = tokio::join!(session.run(transport, sink_tx), broker);
    outcome.unwrap();
    assert_eq!(session.state(), &SessionState::Closed);
}

// =============================================================================
// SockJS
// =============================================================================

fn sockjs_server_payload(stomp_text: &str) -> Bytes {
    Bytes::from(format!("a{}", serde_json::json!([stomp_text])))
}

/// A SockJS session handshakes through the envelope, delivers wrapped
/// messages, and treats the server close notice as fatal.
#[tokio::test]
async fn sockjs_session_delivers_and_fails_on_close_notice() {
    let mut config = listen_config();
    config.use_sockjs = true;
    let mut session = Session::new(&config).unwrap();
    let (transport, mut peer) = Transport::pair();
    let (sink_tx, mut sink_rx) = mpsc::channel::<Frame>(32);
    let codec = FrameCodec::new(true);

    let broker = async {
        peer.send(Bytes::from_static(b"o")).await.unwrap();

        let connect = recv_frame(&mut peer, &codec).await;
        assert_eq!(connect.command, Command::Connect);

        peer.send(sockjs_server_payload(
            "CONNECTED\nversion:1.2\nheart-beat:0,0\n\n\0",
        ))
        .await
        .unwrap();

        let subscribe = recv_frame(&mut peer, &codec).await;
        let sub_id = subscribe.get_header("id").expect("id header").to_string();

        peer.send(sockjs_server_payload(&format!(
            "MESSAGE\nsubscription:{}\ndestination:/topic/events\n\nwrapped\0",
            sub_id
        )))
        .await
        .unwrap();

        let delivered = sink_rx.recv().await.expect("delivery");
        assert_eq!(delivered.body, b"wrapped");

        peer.send(Bytes::from_static(b"c[1002,\"Connection interrupted\"]"))
            .await
            .unwrap();
        peer.wait_closed().await;
    };

    let (outcome, ()) = tokio::join!(session.run(transport, sink_tx), broker);
    let err = outcome.unwrap_err();
    assert!(matches!(err, Error::Connect(_)));
    let text = format!("{}", err);
    assert!(text.contains("sockjs"));
    assert!(text.contains("Connection interrupted"));
    assert!(matches!(session.state(), SessionState::Failed(_)));
}
