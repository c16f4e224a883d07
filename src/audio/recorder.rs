use crate::audio::capture::{Capturer, MimeType};
use crate::audio::init_segment;
use crate::config::AudioConfig;
use crate::error::{Result, VoiceError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Container init bytes announcing a new decodable stream
#[derive(Debug, Clone)]
pub struct BufferHeader {
    pub mime_type: String,
    pub data: Vec<u8>,
    /// Unix milliseconds when the session started
    pub start_time: i64,
}

/// Events emitted by a recording session
///
/// Exactly one `Header` is emitted per session, before any `Buffer`.
#[derive(Debug, Clone)]
pub enum RecorderEvent {
    Header(BufferHeader),
    Buffer {
        chunks: Vec<Vec<u8>>,
        /// Capture-time offset in milliseconds (diagnostics only)
        streamed_at_ms: u64,
    },
    State(bool),
}

/// Owns one capture session: negotiates the container/codec pair, probes for
/// the init segment at a short interval, then records chunks at the steady
/// latency until stopped.
pub struct AudioRecorder {
    capturer: Arc<Mutex<Box<dyn Capturer>>>,
    latency: Duration,
    header_probe: Duration,
    mime_type: Option<MimeType>,
    recording: Arc<AtomicBool>,
    events_tx: mpsc::Sender<RecorderEvent>,
    task: Option<JoinHandle<()>>,
}

impl AudioRecorder {
    pub fn new(
        capturer: Box<dyn Capturer>,
        config: &AudioConfig,
    ) -> (Self, mpsc::Receiver<RecorderEvent>) {
        let (events_tx, events_rx) = mpsc::channel(64);

        let recorder = Self {
            capturer: Arc::new(Mutex::new(capturer)),
            latency: Duration::from_millis(config.latency_ms),
            header_probe: Duration::from_millis(config.header_probe_ms),
            mime_type: None,
            recording: Arc::new(AtomicBool::new(false)),
            events_tx,
            task: None,
        };

        (recorder, events_rx)
    }

    /// The container/codec pair negotiated by the last `start_recording`
    pub fn mime_type(&self) -> Option<MimeType> {
        self.mime_type
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    /// Pick the first supported pair from the preference order.
    async fn negotiate_mime(&self) -> Result<MimeType> {
        let capturer = self.capturer.lock().await;

        for mime in MimeType::PREFERENCE_ORDER {
            if capturer.supports(&mime) {
                debug!("Negotiated mime type: {}", mime);
                return Ok(mime);
            }
        }

        Err(VoiceError::UnsupportedCodec)
    }

    /// Acquire the capture device and begin a recording session.
    ///
    /// Idempotent: returns `Ok(false)` without side effects while already
    /// recording. Capture starts at the header probe interval so the init
    /// segment arrives quickly, then switches to the steady latency.
    pub async fn start_recording(&mut self) -> Result<bool> {
        if self.recording.load(Ordering::SeqCst) {
            warn!("Recording already started");
            return Ok(false);
        }

        let mime = self.negotiate_mime().await?;
        self.mime_type = Some(mime);

        let mut chunks_rx = {
            let mut capturer = self.capturer.lock().await;
            capturer.start(self.header_probe).await?
        };

        self.recording.store(true, Ordering::SeqCst);
        info!("Recording started ({})", mime);

        let capturer = Arc::clone(&self.capturer);
        let recording = Arc::clone(&self.recording);
        let events_tx = self.events_tx.clone();
        let latency = self.latency;
        let header_probe = self.header_probe;

        let task = tokio::spawn(async move {
            let _ = events_tx.send(RecorderEvent::State(true)).await;

            let mut header_sent = false;

            while let Some(chunk) = chunks_rx.recv().await {
                if !recording.load(Ordering::SeqCst) {
                    break;
                }

                if !header_sent {
                    header_sent = true;

                    // Substitute the canned init segment when one exists for
                    // this mime type; the probe chunk itself is discarded.
                    let header_bytes =
                        init_segment::precomputed(&mime).unwrap_or(chunk.data);
                    init_segment::check_header_size(header_bytes.len());

                    let header = BufferHeader {
                        mime_type: mime.to_string(),
                        data: header_bytes,
                        start_time: chrono::Utc::now().timestamp_millis(),
                    };

                    if events_tx.send(RecorderEvent::Header(header)).await.is_err() {
                        break;
                    }

                    // Probe done, record at the configured latency
                    if latency != header_probe {
                        let mut capturer = capturer.lock().await;
                        if let Err(e) = capturer.set_interval(latency).await {
                            error!("Failed to switch capture interval: {}", e);
                        }
                    }

                    continue;
                }

                let event = RecorderEvent::Buffer {
                    chunks: vec![chunk.data],
                    streamed_at_ms: chunk.captured_at_ms,
                };

                if events_tx.send(event).await.is_err() {
                    break;
                }
            }

            // Source ran dry on its own; release the device and report the
            // terminal state. An explicit stop already did both.
            if recording.swap(false, Ordering::SeqCst) {
                let mut capturer = capturer.lock().await;
                if let Err(e) = capturer.stop().await {
                    error!("Failed to stop capturer: {}", e);
                }
                let _ = events_tx.send(RecorderEvent::State(false)).await;
            }

            debug!("Recording task finished");
        });

        self.task = Some(task);

        Ok(true)
    }

    /// Halt capture and release the device.
    ///
    /// Idempotent: a no-op while not recording. The terminal `State(false)`
    /// transition is emitted before this returns.
    pub async fn stop_recording(&mut self) -> Result<()> {
        if !self.recording.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        info!("Stopping recording");

        {
            let mut capturer = self.capturer.lock().await;
            capturer.stop().await?;
        }

        if let Some(task) = self.task.take() {
            task.abort();
        }

        let _ = self.events_tx.send(RecorderEvent::State(false)).await;

        Ok(())
    }
}
