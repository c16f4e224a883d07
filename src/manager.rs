//! Connection manager: the single source of truth for connection state,
//! recording state, and in-flight session transitions.
//!
//! One manager owns one relay connection shared by any number of UI
//! attachments (tracked by a reference count), at most one recording session,
//! and at most one playback session. It is an explicitly constructed service
//! object: build it once at the composition root with injected transport,
//! capture, playback, and credential collaborators, then pass clones around.

use crate::audio::capture::CaptureFactory;
use crate::audio::recorder::{AudioRecorder, RecorderEvent};
use crate::audio::streamer::{AudioStreamer, PlayerFactory};
use crate::config::Config;
use crate::error::{Result, VoiceError};
use crate::transport::{RelayMessage, Transport, TransportCloser, TransportEvent};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

/// Relay connection lifecycle, owned exclusively by the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Recording session lifecycle.
///
/// A single enum instead of `starting`/`recording`/`stopping` flags, so
/// impossible combinations cannot be represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Active,
    Stopping,
}

/// Microphone state projected for the UI; derived, never stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicState {
    Idle,
    Pending,
    Listening,
}

/// Tagged event stream consumed by UI subscribers
#[derive(Debug, Clone)]
pub enum VoiceEvent {
    Connection(ConnectionState),
    Mic(MicState),
    Recording(bool),
    Error(String),
}

/// Supplies short-lived bearer credentials for the relay handshake
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Returns `Ok(None)` when no credential is available (not signed in).
    async fn token(&self) -> Result<Option<String>>;
}

/// Fixed-credential provider for CLI use and tests
pub struct StaticTokenProvider(pub String);

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn token(&self) -> Result<Option<String>> {
        Ok(Some(self.0.clone()))
    }
}

struct ManagerState {
    connection: ConnectionState,
    session: SessionState,
    /// Bumped on every playback-session reset, stop, and disconnect; events
    /// from an older epoch are stale and get dropped.
    epoch: u64,
    /// Identifies the live transport connection so a routing task from a
    /// torn-down connection cannot mutate newer state.
    conn_id: u64,
    /// Active UI attachments sharing this connection
    hooks: u32,
    recorder: Option<AudioRecorder>,
    streamer: Option<AudioStreamer>,
    sender: Option<mpsc::Sender<RelayMessage>>,
    closer: Option<TransportCloser>,
    /// Start playback as soon as the next header lands
    play_on_header: bool,
    /// One autoplay retry is available on the next user gesture
    gesture_retry_armed: bool,
}

struct Inner {
    transport: Arc<dyn Transport>,
    capture_factory: Arc<dyn CaptureFactory>,
    player_factory: Arc<dyn PlayerFactory>,
    token_provider: Arc<dyn TokenProvider>,
    config: Config,
    state: Mutex<ManagerState>,
    events_tx: broadcast::Sender<VoiceEvent>,
    connection_watch: watch::Sender<ConnectionState>,
    mic_watch: watch::Sender<MicState>,
}

/// Cloneable handle to one shared voice relay connection
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        capture_factory: Arc<dyn CaptureFactory>,
        player_factory: Arc<dyn PlayerFactory>,
        token_provider: Arc<dyn TokenProvider>,
        config: Config,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(64);
        let (connection_watch, _) = watch::channel(ConnectionState::Disconnected);
        let (mic_watch, _) = watch::channel(MicState::Idle);

        Self {
            inner: Arc::new(Inner {
                transport,
                capture_factory,
                player_factory,
                token_provider,
                config,
                state: Mutex::new(ManagerState {
                    connection: ConnectionState::Disconnected,
                    session: SessionState::Idle,
                    epoch: 0,
                    conn_id: 0,
                    hooks: 0,
                    recorder: None,
                    streamer: None,
                    sender: None,
                    closer: None,
                    play_on_header: false,
                    gesture_retry_armed: false,
                }),
                events_tx,
                connection_watch,
                mic_watch,
            }),
        }
    }

    /// Subscribe to the tagged event stream
    pub fn subscribe(&self) -> broadcast::Receiver<VoiceEvent> {
        self.inner.events_tx.subscribe()
    }

    pub fn watch_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection_watch.subscribe()
    }

    pub fn watch_mic_state(&self) -> watch::Receiver<MicState> {
        self.inner.mic_watch.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.connection_watch.borrow()
    }

    pub fn mic_state(&self) -> MicState {
        *self.inner.mic_watch.borrow()
    }

    pub fn is_recording(&self) -> bool {
        self.mic_state() == MicState::Listening
    }

    pub async fn session_state(&self) -> SessionState {
        self.inner.state.lock().await.session
    }

    /// Obtain a credential and open the relay connection.
    ///
    /// No-op while already connecting or connected. Auth or handshake failure
    /// leaves the manager in the error state until the next explicit call.
    pub async fn connect(&self) -> Result<()> {
        // The generation pins this attempt: a disconnect issued while the
        // credential fetch or handshake is in flight bumps conn_id, and the
        // continuation below must then discard its result.
        let generation = {
            let mut state = self.inner.state.lock().await;
            match state.connection {
                ConnectionState::Connecting | ConnectionState::Connected => {
                    debug!("Connect ignored: already {:?}", state.connection);
                    return Ok(());
                }
                _ => {}
            }
            self.inner
                .set_connection(&mut state, ConnectionState::Connecting);
            state.conn_id
        };

        let credential = match self.inner.token_provider.token().await {
            Ok(Some(token)) => token,
            Ok(None) => {
                let err = VoiceError::Auth("no credential available".to_string());
                self.inner.fail_connect(generation, &err).await;
                return Err(err);
            }
            Err(e) => {
                self.inner.fail_connect(generation, &e).await;
                return Err(e);
            }
        };

        let handle = match self.inner.transport.open(&credential).await {
            Ok(handle) => handle,
            Err(e) => {
                self.inner.fail_connect(generation, &e).await;
                return Err(e);
            }
        };

        let (sender, events, closer) = handle.split();

        let conn_id = {
            let mut state = self.inner.state.lock().await;

            if state.conn_id != generation || state.connection != ConnectionState::Connecting {
                debug!("Connect superseded mid-handshake; closing fresh connection");
                drop(state);
                closer.close();
                return Ok(());
            }

            state.conn_id += 1;
            state.sender = Some(sender);
            state.closer = Some(closer);
            self.inner
                .set_connection(&mut state, ConnectionState::Connected);
            state.conn_id
        };

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.route_transport_events(conn_id, events).await;
        });

        info!("Connected to relay");
        Ok(())
    }

    /// Tear down the relay connection and both media sessions. Idempotent.
    pub async fn disconnect(&self) {
        let recorder = {
            let mut state = self.inner.state.lock().await;

            if state.connection == ConnectionState::Disconnected && state.closer.is_none() {
                return;
            }

            info!("Disconnecting from relay");
            self.inner.teardown(&mut state, ConnectionState::Disconnected)
        };

        Self::release_recorder(recorder).await;
    }

    /// Begin a recording session, forwarding captured chunks to the relay.
    ///
    /// Rejected (logged no-op, `Ok(false)`) while a start is already in
    /// flight, while recording, or while not connected. A failure during
    /// start surfaces one error event and leaves the manager idle.
    pub async fn start_streaming(&self) -> Result<bool> {
        let (mut recorder, events_rx, sender, epoch, prior_recorder) = {
            let mut state = self.inner.state.lock().await;

            if state.session != SessionState::Idle {
                warn!("Start streaming ignored: session is {:?}", state.session);
                return Ok(false);
            }
            if state.connection != ConnectionState::Connected {
                warn!(
                    "Start streaming ignored: connection is {:?}",
                    state.connection
                );
                return Ok(false);
            }

            let Some(sender) = state.sender.clone() else {
                warn!("Start streaming ignored: no transport sender");
                return Ok(false);
            };

            // Anything left over from an earlier session is stopped before a
            // new one begins.
            let prior_recorder = state.recorder.take();

            // Fresh playback session: a new session's header must never be
            // appended onto stale chunks.
            if let Some(streamer) = &mut state.streamer {
                streamer.stop();
            }
            let player = match self.inner.player_factory.create() {
                Ok(player) => player,
                Err(e) => {
                    self.inner.emit_error(&e);
                    return Err(e);
                }
            };
            state.streamer = Some(AudioStreamer::new(player, &self.inner.config.playback));

            state.epoch += 1;
            state.play_on_header = true;
            state.gesture_retry_armed = false;

            self.inner.set_session(&mut state, SessionState::Starting);

            let capturer = match self.inner.capture_factory.create() {
                Ok(capturer) => capturer,
                Err(e) => {
                    self.inner.set_session(&mut state, SessionState::Idle);
                    self.inner.emit_error(&e);
                    return Err(e);
                }
            };

            let (recorder, events_rx) =
                AudioRecorder::new(capturer, &self.inner.config.audio);

            (recorder, events_rx, sender, state.epoch, prior_recorder)
        };

        Self::release_recorder(prior_recorder).await;

        // Device acquisition happens outside the state lock; the Starting
        // session state is the guard against a concurrent second attempt.
        let started = recorder.start_recording().await;

        match started {
            Ok(_) => {
                let mut state = self.inner.state.lock().await;

                if state.epoch != epoch || state.session != SessionState::Starting {
                    // A stop or disconnect superseded this start mid-flight
                    drop(state);
                    let _ = recorder.stop_recording().await;
                    return Ok(false);
                }

                state.recorder = Some(recorder);
                self.inner.set_session(&mut state, SessionState::Active);
                drop(state);

                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move {
                    inner.route_recorder_events(epoch, events_rx, sender).await;
                });

                info!("Streaming started");
                Ok(true)
            }
            Err(e) => {
                let mut state = self.inner.state.lock().await;
                if state.epoch == epoch && state.session == SessionState::Starting {
                    self.inner.set_session(&mut state, SessionState::Idle);
                }
                drop(state);

                self.inner.emit_error(&e);
                error!("Failed to start streaming: {}", e);
                Err(e)
            }
        }
    }

    /// Stop the recording session and halt playback. No-op while idle.
    pub async fn stop_streaming(&self) {
        let recorder = {
            let mut state = self.inner.state.lock().await;

            match state.session {
                SessionState::Starting | SessionState::Active => {}
                _ => {
                    debug!("Stop streaming ignored: session is {:?}", state.session);
                    return;
                }
            }

            self.inner.set_session(&mut state, SessionState::Stopping);

            // Late header/chunk deliveries for this session are stale from
            // here on.
            state.epoch += 1;
            state.play_on_header = false;
            state.gesture_retry_armed = false;

            if let Some(streamer) = &mut state.streamer {
                streamer.stop();
            }

            let recorder = state.recorder.take();
            self.inner.set_session(&mut state, SessionState::Idle);
            recorder
        };

        Self::release_recorder(recorder).await;
        info!("Streaming stopped");
    }

    /// Record a UI attachment sharing this connection
    pub async fn increment_hook_count(&self) -> u32 {
        let mut state = self.inner.state.lock().await;
        state.hooks += 1;
        state.hooks
    }

    /// Drop a UI attachment; the last one out tears the connection down
    pub async fn decrement_hook_count(&self) -> u32 {
        let remaining = {
            let mut state = self.inner.state.lock().await;
            state.hooks = state.hooks.saturating_sub(1);
            state.hooks
        };

        if remaining == 0 {
            self.disconnect().await;
        }

        remaining
    }

    pub async fn hook_count(&self) -> u32 {
        self.inner.state.lock().await.hooks
    }

    /// The UI calls this on any pointer/key interaction. If playback was
    /// blocked pending a gesture, retry it exactly once.
    pub async fn notify_user_gesture(&self) {
        let mut state = self.inner.state.lock().await;

        if !state.gesture_retry_armed {
            return;
        }
        state.gesture_retry_armed = false;

        if let Some(streamer) = &mut state.streamer {
            match streamer.play_stream() {
                Ok(()) => debug!("Playback resumed after user gesture"),
                // A later gesture starts a fresh session anyway
                Err(e) => debug!("Playback retry after gesture failed: {}", e),
            }
        }
    }

    async fn release_recorder(recorder: Option<AudioRecorder>) {
        if let Some(mut recorder) = recorder {
            if let Err(e) = recorder.stop_recording().await {
                error!("Failed to release recorder: {}", e);
            }
        }
    }
}

impl Inner {
    fn mic_from(&self, state: &ManagerState) -> MicState {
        if state.session == SessionState::Active {
            MicState::Listening
        } else if state.session == SessionState::Starting
            || state.connection == ConnectionState::Connecting
        {
            MicState::Pending
        } else {
            MicState::Idle
        }
    }

    fn publish_mic(&self, state: &ManagerState) {
        let mic = self.mic_from(state);
        let changed = self.mic_watch.send_if_modified(|current| {
            if *current == mic {
                false
            } else {
                *current = mic;
                true
            }
        });
        if changed {
            let _ = self.events_tx.send(VoiceEvent::Mic(mic));
        }
    }

    fn set_connection(&self, state: &mut ManagerState, new: ConnectionState) {
        if state.connection == new {
            return;
        }
        state.connection = new;
        // send_replace: the stored value must update even with no receivers
        self.connection_watch.send_replace(new);
        let _ = self.events_tx.send(VoiceEvent::Connection(new));
        self.publish_mic(state);
    }

    fn set_session(&self, state: &mut ManagerState, new: SessionState) {
        if state.session == new {
            return;
        }
        let was_recording = state.session == SessionState::Active;
        state.session = new;

        if new == SessionState::Active {
            let _ = self.events_tx.send(VoiceEvent::Recording(true));
        } else if was_recording {
            let _ = self.events_tx.send(VoiceEvent::Recording(false));
        }
        self.publish_mic(state);
    }

    fn emit_error(&self, err: &VoiceError) {
        let _ = self.events_tx.send(VoiceEvent::Error(user_message(err)));
    }

    async fn fail_connect(&self, generation: u64, err: &VoiceError) {
        let mut state = self.state.lock().await;
        if state.conn_id != generation || state.connection != ConnectionState::Connecting {
            debug!("Connect failure from a superseded attempt; ignoring");
            return;
        }
        self.set_connection(&mut state, ConnectionState::Error);
        drop(state);
        self.emit_error(err);
    }

    /// Stop both media sessions and drop the transport wiring; the caller
    /// awaits the returned recorder's release outside the lock.
    fn teardown(
        &self,
        state: &mut ManagerState,
        connection: ConnectionState,
    ) -> Option<AudioRecorder> {
        state.conn_id += 1;
        state.epoch += 1;
        state.play_on_header = false;
        state.gesture_retry_armed = false;

        if let Some(closer) = state.closer.take() {
            closer.close();
        }
        state.sender = None;

        if let Some(streamer) = &mut state.streamer {
            streamer.stop();
        }
        state.streamer = None;

        let recorder = state.recorder.take();

        self.set_session(state, SessionState::Idle);
        self.set_connection(state, connection);

        recorder
    }

    /// Forward one session's recorder events to the relay.
    async fn route_recorder_events(
        &self,
        epoch: u64,
        mut events_rx: mpsc::Receiver<RecorderEvent>,
        sender: mpsc::Sender<RelayMessage>,
    ) {
        while let Some(event) = events_rx.recv().await {
            if !self.session_live(epoch).await {
                debug!("Dropping recorder event from stale session");
                break;
            }

            match event {
                RecorderEvent::Header(header) => {
                    let message = RelayMessage::Header {
                        mime_type: header.mime_type,
                        data: header.data,
                        start_time: header.start_time,
                    };
                    if sender.send(message).await.is_err() {
                        break;
                    }
                }
                RecorderEvent::Buffer { chunks, .. } => {
                    if sender.send(RelayMessage::Stream { chunks }).await.is_err() {
                        break;
                    }
                }
                RecorderEvent::State(true) => {}
                RecorderEvent::State(false) => {
                    // Capture ended on its own (source exhausted or device
                    // revoked); fold the session back to idle.
                    let mut state = self.state.lock().await;
                    if state.epoch == epoch {
                        state.recorder = None;
                        state.epoch += 1;
                        state.play_on_header = false;
                        self.set_session(&mut state, SessionState::Idle);
                    }
                    break;
                }
            }
        }
    }

    async fn session_live(&self, epoch: u64) -> bool {
        let state = self.state.lock().await;
        state.epoch == epoch
            && matches!(
                state.session,
                SessionState::Starting | SessionState::Active
            )
    }

    /// Route transport lifecycle and relay messages for one connection.
    async fn route_transport_events(
        &self,
        conn_id: u64,
        mut events: mpsc::Receiver<TransportEvent>,
    ) {
        while let Some(event) = events.recv().await {
            let mut state = self.state.lock().await;

            if state.conn_id != conn_id {
                debug!("Dropping transport event from stale connection");
                return;
            }

            match event {
                TransportEvent::Opened => {
                    self.set_connection(&mut state, ConnectionState::Connected);
                }
                TransportEvent::Closed { retrying: true } => {
                    self.set_connection(&mut state, ConnectionState::Connecting);
                }
                TransportEvent::Closed { retrying: false } => {
                    let recorder = self.teardown(&mut state, ConnectionState::Disconnected);
                    drop(state);
                    ConnectionManager::release_recorder(recorder).await;
                    return;
                }
                TransportEvent::Failed(reason) => {
                    error!("Relay connection failed: {}", reason);
                    let recorder = self.teardown(&mut state, ConnectionState::Error);
                    drop(state);
                    self.emit_error(&VoiceError::Transport(reason));
                    ConnectionManager::release_recorder(recorder).await;
                    return;
                }
                TransportEvent::Message(message) => {
                    self.route_relay_message(&mut state, message);
                }
            }
        }
    }

    /// Inbound audio goes to the streamer only while a session is starting
    /// or active; anything else is a leftover from a stopped session and is
    /// dropped.
    fn route_relay_message(&self, state: &mut ManagerState, message: RelayMessage) {
        match message {
            RelayMessage::Header {
                mime_type, data, ..
            } => {
                if !matches!(
                    state.session,
                    SessionState::Starting | SessionState::Active
                ) {
                    debug!("Dropping header outside an active session");
                    return;
                }

                let play = state.play_on_header;
                let Some(streamer) = &mut state.streamer else {
                    return;
                };

                if let Err(e) = streamer.set_buffer_header(&mime_type, data) {
                    self.emit_error(&e);
                    return;
                }

                if play {
                    match streamer.play_stream() {
                        Ok(()) => {}
                        Err(VoiceError::AutoplayBlocked) => {
                            info!("Playback blocked; will retry on next user gesture");
                            state.gesture_retry_armed = true;
                        }
                        Err(e) => self.emit_error(&e),
                    }
                }
            }
            RelayMessage::Stream { chunks } => {
                if !matches!(
                    state.session,
                    SessionState::Starting | SessionState::Active
                ) {
                    debug!("Dropping chunks outside an active session");
                    return;
                }

                if let Some(streamer) = &mut state.streamer {
                    if let Err(e) = streamer.receive_buffer(chunks) {
                        self.emit_error(&e);
                    }
                }
            }
            RelayMessage::Error { message } => {
                error!("Relay reported error: {}", message);
                self.set_connection(state, ConnectionState::Error);
                let _ = self.events_tx.send(VoiceEvent::Error(format!(
                    "Relay error: {}. Try reconnecting.",
                    message
                )));
            }
            RelayMessage::Ping | RelayMessage::Pong => {}
        }
    }
}

/// Map an error to the message subscribers see.
fn user_message(err: &VoiceError) -> String {
    match err {
        VoiceError::PermissionDenied => {
            "Microphone access was denied. Re-enable microphone permission in \
             your browser or system settings, then try again."
                .to_string()
        }
        VoiceError::NoDevice => {
            "No microphone was found. Connect one and try again.".to_string()
        }
        VoiceError::UnsupportedCodec => {
            "This platform supports none of the required audio formats.".to_string()
        }
        VoiceError::Auth(_) => "Sign in again to use voice chat.".to_string(),
        VoiceError::Transport(_) => {
            "Connection to the voice service failed. Try again in a moment.".to_string()
        }
        other => other.to_string(),
    }
}
