use crate::config::RelayConfig;
use crate::error::{Result, VoiceError};
use crate::transport::messages::{RelayMessage, TransportEvent};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, COOKIE};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// An open transport connection: an outbound message sender, an inbound
/// event receiver, and a closer for clean teardown.
pub struct TransportHandle {
    pub sender: mpsc::Sender<RelayMessage>,
    pub events: mpsc::Receiver<TransportEvent>,
    shutdown: watch::Sender<bool>,
}

/// Requests a clean close of the connection it came from
#[derive(Clone)]
pub struct TransportCloser {
    shutdown: watch::Sender<bool>,
}

impl TransportCloser {
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl TransportHandle {
    pub fn new(
        sender: mpsc::Sender<RelayMessage>,
        events: mpsc::Receiver<TransportEvent>,
        shutdown: watch::Sender<bool>,
    ) -> Self {
        Self {
            sender,
            events,
            shutdown,
        }
    }

    pub fn split(
        self,
    ) -> (
        mpsc::Sender<RelayMessage>,
        mpsc::Receiver<TransportEvent>,
        TransportCloser,
    ) {
        let closer = TransportCloser {
            shutdown: self.shutdown,
        };
        (self.sender, self.events, closer)
    }
}

/// A persistent, message-oriented, authenticated connection to the relay
#[async_trait]
pub trait Transport: Send + Sync {
    /// Authenticate with the given bearer credential and open a connection.
    ///
    /// Fails with `Auth` when the relay rejects the credential at handshake,
    /// `Transport` for any other handshake failure.
    async fn open(&self, credential: &str) -> Result<TransportHandle>;
}

/// WebSocket transport backed by tokio-tungstenite.
///
/// Reconnects automatically on abnormal closes with a bounded, linearly
/// increasing backoff; a clean client-initiated close never reconnects.
pub struct WsTransport {
    url: String,
    config: RelayConfig,
}

enum ConnectionEnd {
    /// Client asked for teardown
    Shutdown,
    /// Relay closed with a normal/going-away code
    Clean,
    /// Abnormal close or stream error; reconnect applies
    Lost(String),
}

impl WsTransport {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            url: config.url.clone(),
            config,
        }
    }

    /// Perform the authenticated handshake.
    ///
    /// The credential rides in the `Authorization` header; a `__session`
    /// cookie carries it as well for relays behind proxies that strip
    /// authorization headers.
    async fn handshake(url: &str, credential: &str) -> Result<WsStream> {
        let mut request = url
            .into_client_request()
            .map_err(|e| VoiceError::Transport(format!("invalid relay url: {}", e)))?;

        let bearer = format!("Bearer {}", credential)
            .parse()
            .map_err(|_| VoiceError::Auth("credential is not header-safe".to_string()))?;
        let cookie = format!("__session={}", credential)
            .parse()
            .map_err(|_| VoiceError::Auth("credential is not header-safe".to_string()))?;

        request.headers_mut().insert(AUTHORIZATION, bearer);
        request.headers_mut().insert(COOKIE, cookie);

        match connect_async(request).await {
            Ok((ws, _response)) => {
                info!("Relay handshake complete: {}", url);
                Ok(ws)
            }
            Err(tungstenite::Error::Http(response))
                if response.status().as_u16() == 401 || response.status().as_u16() == 403 =>
            {
                Err(VoiceError::Auth(format!(
                    "relay rejected credential ({})",
                    response.status()
                )))
            }
            Err(e) => Err(VoiceError::Transport(e.to_string())),
        }
    }

    /// Drive one socket until it ends, forwarding messages both ways.
    async fn run_connection(
        ws: WsStream,
        outbound_rx: &mut mpsc::Receiver<RelayMessage>,
        events_tx: &mpsc::Sender<TransportEvent>,
        shutdown_rx: &mut watch::Receiver<bool>,
        config: &RelayConfig,
    ) -> ConnectionEnd {
        let (mut sink, mut stream) = ws.split();

        let mut ping = tokio::time::interval(Duration::from_secs(config.ping_interval_secs));
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // Consume the immediate first tick; the handshake just proved
        // liveness.
        ping.tick().await;

        let mut pongs_outstanding: u32 = 0;

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return ConnectionEnd::Shutdown;
                }

                outbound = outbound_rx.recv() => {
                    let Some(message) = outbound else {
                        // Sender dropped; treat like a requested teardown
                        let _ = sink.send(Message::Close(None)).await;
                        return ConnectionEnd::Shutdown;
                    };

                    let json = match serde_json::to_string(&message) {
                        Ok(json) => json,
                        Err(e) => {
                            error!("Failed to encode relay message: {}", e);
                            continue;
                        }
                    };

                    if let Err(e) = sink.send(Message::Text(json)).await {
                        return ConnectionEnd::Lost(format!("send failed: {}", e));
                    }
                }

                _ = ping.tick() => {
                    pongs_outstanding += 1;
                    if pongs_outstanding > config.missed_pong_warn_threshold {
                        warn!(
                            "{} keepalive pings unanswered; relay may be unresponsive",
                            pongs_outstanding
                        );
                    }

                    if let Ok(json) = serde_json::to_string(&RelayMessage::Ping) {
                        if let Err(e) = sink.send(Message::Text(json)).await {
                            return ConnectionEnd::Lost(format!("ping failed: {}", e));
                        }
                    }
                }

                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<RelayMessage>(&text) {
                            Ok(RelayMessage::Pong) => {
                                pongs_outstanding = 0;
                                debug!("Keepalive pong received");
                            }
                            Ok(message) => {
                                if events_tx
                                    .send(TransportEvent::Message(message))
                                    .await
                                    .is_err()
                                {
                                    return ConnectionEnd::Shutdown;
                                }
                            }
                            Err(e) => {
                                // Malformed frames are dropped, never fatal
                                warn!("Dropping malformed relay message: {}", e);
                            }
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        warn!("Dropping unexpected binary frame from relay");
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            return ConnectionEnd::Lost("pong failed".to_string());
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        pongs_outstanding = 0;
                    }
                    Some(Ok(Message::Close(close_frame))) => {
                        let clean = close_frame
                            .as_ref()
                            .map(|f| {
                                f.code == CloseCode::Normal || f.code == CloseCode::Away
                            })
                            .unwrap_or(false);

                        if clean {
                            return ConnectionEnd::Clean;
                        }
                        return ConnectionEnd::Lost(format!(
                            "relay closed connection: {:?}",
                            close_frame
                        ));
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => {
                        return ConnectionEnd::Lost(e.to_string());
                    }
                    None => {
                        return ConnectionEnd::Lost("relay stream ended".to_string());
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, credential: &str) -> Result<TransportHandle> {
        let first = Self::handshake(&self.url, credential).await?;

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<RelayMessage>(64);
        let (events_tx, events_rx) = mpsc::channel::<TransportEvent>(64);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let url = self.url.clone();
        let config = self.config.clone();
        let credential = credential.to_string();

        tokio::spawn(async move {
            let _ = events_tx.send(TransportEvent::Opened).await;
            let mut ws = first;

            loop {
                let end = Self::run_connection(
                    ws,
                    &mut outbound_rx,
                    &events_tx,
                    &mut shutdown_rx,
                    &config,
                )
                .await;

                match end {
                    ConnectionEnd::Shutdown => {
                        info!("Relay connection closed by client");
                        let _ = events_tx
                            .send(TransportEvent::Closed { retrying: false })
                            .await;
                        return;
                    }
                    ConnectionEnd::Clean => {
                        info!("Relay closed connection cleanly");
                        let _ = events_tx
                            .send(TransportEvent::Closed { retrying: false })
                            .await;
                        return;
                    }
                    ConnectionEnd::Lost(reason) => {
                        error!("Relay connection lost: {}", reason);
                        let _ = events_tx
                            .send(TransportEvent::Closed { retrying: true })
                            .await;

                        match Self::reconnect(
                            &url,
                            &credential,
                            &config,
                            &mut shutdown_rx,
                        )
                        .await
                        {
                            Some(socket) => {
                                let _ = events_tx.send(TransportEvent::Opened).await;
                                ws = socket;
                            }
                            None => {
                                let _ = events_tx
                                    .send(TransportEvent::Failed(format!(
                                        "reconnect attempts exhausted after: {}",
                                        reason
                                    )))
                                    .await;
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(TransportHandle::new(outbound_tx, events_rx, shutdown_tx))
    }
}

impl WsTransport {
    /// Bounded reconnect with linearly increasing delay. Returns `None` when
    /// attempts are exhausted or a shutdown arrives mid-backoff.
    async fn reconnect(
        url: &str,
        credential: &str,
        config: &RelayConfig,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Option<WsStream> {
        for attempt in 1..=config.max_reconnect_attempts {
            let delay = Duration::from_millis(config.reconnect_delay_ms * attempt as u64);
            info!(
                "Reconnecting to relay in {:?} (attempt {}/{})",
                delay, attempt, config.max_reconnect_attempts
            );

            tokio::select! {
                _ = shutdown_rx.changed() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            match Self::handshake(url, credential).await {
                Ok(ws) => {
                    info!("Reconnected to relay");
                    return Some(ws);
                }
                Err(VoiceError::Auth(reason)) => {
                    // Credential went bad; retrying with it cannot succeed
                    error!("Reconnect refused: {}", reason);
                    return None;
                }
                Err(e) => {
                    warn!("Reconnect attempt {} failed: {}", attempt, e);
                }
            }
        }

        None
    }
}
