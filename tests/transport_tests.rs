// Transport tests against an in-process WebSocket relay: authenticated
// handshake, message round-trips, clean vs abnormal close handling,
// reconnect, and the wire format.

use futures::{SinkExt, StreamExt};
use kaiwa_voice::config::RelayConfig;
use kaiwa_voice::error::VoiceError;
use kaiwa_voice::transport::{RelayMessage, Transport, TransportEvent, WsTransport};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

const GOOD_TOKEN: &str = "good-token";

/// How the relay treats a connection after the handshake
#[derive(Clone, Copy)]
enum RelayMode {
    /// Echo every message back; answer protocol pings with pongs
    Echo,
    /// Close immediately with a normal close code
    CloseClean,
    /// Drop the first connection without a close frame, echo afterwards
    DropFirstThenEcho,
}

/// Spawn a relay on an ephemeral port and return its URL. The relay checks
/// the bearer credential at handshake and rejects anything else with 401.
async fn spawn_relay(mode: RelayMode) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut connections = 0u32;

        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            connections += 1;

            let callback = |req: &Request, resp: Response| {
                let expected = format!("Bearer {}", GOOD_TOKEN);
                let authorized = req
                    .headers()
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    == Some(expected.as_str());

                if authorized {
                    Ok(resp)
                } else {
                    let mut reject = ErrorResponse::new(None);
                    *reject.status_mut() = StatusCode::UNAUTHORIZED;
                    Err(reject)
                }
            };

            let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await
            else {
                continue;
            };

            match mode {
                RelayMode::CloseClean => {
                    let _ = ws
                        .close(Some(CloseFrame {
                            code: CloseCode::Normal,
                            reason: "done".into(),
                        }))
                        .await;
                    continue;
                }
                RelayMode::DropFirstThenEcho if connections == 1 => {
                    drop(ws);
                    continue;
                }
                _ => {}
            }

            tokio::spawn(async move {
                while let Some(Ok(message)) = ws.next().await {
                    match message {
                        Message::Text(text) => {
                            let reply = match serde_json::from_str::<RelayMessage>(&text) {
                                Ok(RelayMessage::Ping) => {
                                    serde_json::to_string(&RelayMessage::Pong).unwrap()
                                }
                                _ => text,
                            };
                            if ws.send(Message::Text(reply)).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }
            });
        }
    });

    format!("ws://{}", addr)
}

fn test_config(url: String) -> RelayConfig {
    RelayConfig {
        url,
        max_reconnect_attempts: 5,
        reconnect_delay_ms: 10,
        ping_interval_secs: 30,
        missed_pong_warn_threshold: 2,
    }
}

async fn next_transport_event(
    events: &mut tokio::sync::mpsc::Receiver<TransportEvent>,
) -> TransportEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for transport event")
        .expect("transport event channel closed")
}

#[tokio::test]
async fn messages_round_trip_through_the_relay() {
    let url = spawn_relay(RelayMode::Echo).await;
    let transport = WsTransport::new(test_config(url));

    let mut handle = transport.open(GOOD_TOKEN).await.unwrap();

    assert!(matches!(
        next_transport_event(&mut handle.events).await,
        TransportEvent::Opened
    ));

    let header = RelayMessage::Header {
        mime_type: "audio/webm;codecs=opus".to_string(),
        data: vec![1, 2, 3, 4],
        start_time: 1_700_000_000_000,
    };
    let stream = RelayMessage::Stream {
        chunks: vec![vec![5, 6], vec![7]],
    };

    handle.sender.send(header.clone()).await.unwrap();
    handle.sender.send(stream.clone()).await.unwrap();

    match next_transport_event(&mut handle.events).await {
        TransportEvent::Message(echoed) => assert_eq!(echoed, header),
        other => panic!("expected echoed header, got {:?}", other),
    }
    match next_transport_event(&mut handle.events).await {
        TransportEvent::Message(echoed) => assert_eq!(echoed, stream),
        other => panic!("expected echoed stream, got {:?}", other),
    }
}

#[tokio::test]
async fn rejected_credential_is_an_auth_error() {
    let url = spawn_relay(RelayMode::Echo).await;
    let transport = WsTransport::new(test_config(url));

    match transport.open("stale-token").await {
        Err(VoiceError::Auth(_)) => {}
        Err(other) => panic!("expected Auth error, got {}", other),
        Ok(_) => panic!("handshake should have been rejected"),
    }
}

#[tokio::test]
async fn client_close_does_not_reconnect() {
    let url = spawn_relay(RelayMode::Echo).await;
    let transport = WsTransport::new(test_config(url));

    let handle = transport.open(GOOD_TOKEN).await.unwrap();
    let (_sender, mut events, closer) = handle.split();

    assert!(matches!(
        next_transport_event(&mut events).await,
        TransportEvent::Opened
    ));

    closer.close();

    assert!(matches!(
        next_transport_event(&mut events).await,
        TransportEvent::Closed { retrying: false }
    ));
    assert!(events.recv().await.is_none(), "no events after a clean close");
}

#[tokio::test]
async fn normal_remote_close_does_not_reconnect() {
    let url = spawn_relay(RelayMode::CloseClean).await;
    let transport = WsTransport::new(test_config(url));

    let mut handle = transport.open(GOOD_TOKEN).await.unwrap();

    assert!(matches!(
        next_transport_event(&mut handle.events).await,
        TransportEvent::Opened
    ));
    assert!(matches!(
        next_transport_event(&mut handle.events).await,
        TransportEvent::Closed { retrying: false }
    ));
}

#[tokio::test]
async fn abnormal_drop_reconnects_automatically() {
    let url = spawn_relay(RelayMode::DropFirstThenEcho).await;
    let transport = WsTransport::new(test_config(url));

    let mut handle = transport.open(GOOD_TOKEN).await.unwrap();

    assert!(matches!(
        next_transport_event(&mut handle.events).await,
        TransportEvent::Opened
    ));
    assert!(matches!(
        next_transport_event(&mut handle.events).await,
        TransportEvent::Closed { retrying: true }
    ));
    assert!(matches!(
        next_transport_event(&mut handle.events).await,
        TransportEvent::Opened
    ));

    // The replacement connection carries traffic
    let ping_back = RelayMessage::Stream {
        chunks: vec![vec![42]],
    };
    handle.sender.send(ping_back.clone()).await.unwrap();
    match next_transport_event(&mut handle.events).await {
        TransportEvent::Message(echoed) => assert_eq!(echoed, ping_back),
        other => panic!("expected echoed message, got {:?}", other),
    }
}

// ---- wire format -----------------------------------------------------------

#[test]
fn header_serializes_with_base64_payload() {
    let message = RelayMessage::Header {
        mime_type: "audio/webm;codecs=opus".to_string(),
        data: vec![0xDE, 0xAD, 0xBE, 0xEF],
        start_time: 42,
    };

    let json = serde_json::to_string(&message).unwrap();
    assert!(json.contains(r#""type":"header""#));
    assert!(json.contains(r#""mime_type":"audio/webm;codecs=opus""#));
    assert!(json.contains(r#""data":"3q2+7w==""#));
    assert!(json.contains(r#""start_time":42"#));

    assert_eq!(serde_json::from_str::<RelayMessage>(&json).unwrap(), message);
}

#[test]
fn stream_serializes_chunks_as_base64_array() {
    let message = RelayMessage::Stream {
        chunks: vec![vec![1], vec![2, 3]],
    };

    let json = serde_json::to_string(&message).unwrap();
    assert!(json.contains(r#""type":"stream""#));
    assert!(json.contains(r#""chunks":["AQ==","AgM="]"#));

    assert_eq!(serde_json::from_str::<RelayMessage>(&json).unwrap(), message);
}

#[test]
fn keepalive_messages_are_bare_tags() {
    assert_eq!(
        serde_json::to_string(&RelayMessage::Ping).unwrap(),
        r#"{"type":"ping"}"#
    );
    assert_eq!(
        serde_json::from_str::<RelayMessage>(r#"{"type":"pong"}"#).unwrap(),
        RelayMessage::Pong
    );
}

#[test]
fn unknown_message_types_fail_to_parse() {
    assert!(serde_json::from_str::<RelayMessage>(r#"{"type":"upgrade"}"#).is_err());
    assert!(serde_json::from_str::<RelayMessage>(r#"{"type":"header","data":"!!"}"#).is_err());
}
