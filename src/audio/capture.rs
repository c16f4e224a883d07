use crate::error::{Result, VoiceError};
use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Audio container format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Container {
    Webm,
    Ogg,
}

/// Audio codec inside the container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    Opus,
    Vorbis,
}

/// A negotiated container/codec pair, e.g. `audio/webm;codecs=opus`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MimeType {
    pub container: Container,
    pub codec: Codec,
}

impl MimeType {
    pub const WEBM_OPUS: MimeType = MimeType {
        container: Container::Webm,
        codec: Codec::Opus,
    };

    /// Negotiation preference order: first supported pair wins
    pub const PREFERENCE_ORDER: [MimeType; 4] = [
        MimeType { container: Container::Webm, codec: Codec::Opus },
        MimeType { container: Container::Webm, codec: Codec::Vorbis },
        MimeType { container: Container::Ogg, codec: Codec::Opus },
        MimeType { container: Container::Ogg, codec: Codec::Vorbis },
    ];

    pub fn essence(&self) -> &'static str {
        match self.container {
            Container::Webm => "audio/webm",
            Container::Ogg => "audio/ogg",
        }
    }

    pub fn parse(s: &str) -> Option<MimeType> {
        for mime in Self::PREFERENCE_ORDER {
            if mime.to_string() == s {
                return Some(mime);
            }
        }
        None
    }
}

impl fmt::Display for MimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let codec = match self.codec {
            Codec::Opus => "opus",
            Codec::Vorbis => "vorbis",
        };
        write!(f, "{};codecs={}", self.essence(), codec)
    }
}

/// One compressed-audio chunk from a capture source
#[derive(Debug, Clone)]
pub struct CapturedChunk {
    /// Opaque container bytes
    pub data: Vec<u8>,
    /// Milliseconds since capture started (diagnostics only, not sequencing)
    pub captured_at_ms: u64,
}

/// Audio capture capability interface
///
/// Platform adapters (microphone, file, test mock) implement this. The
/// recorder drives capture through it and never touches platform APIs
/// directly.
#[async_trait]
pub trait Capturer: Send + Sync {
    /// Acquire the capture device and begin emitting chunks at `interval`.
    ///
    /// Returns a channel receiver that will receive chunks. Fails with
    /// `PermissionDenied` if device access is refused, `NoDevice` if no
    /// capture device exists.
    async fn start(&mut self, interval: Duration) -> Result<mpsc::Receiver<CapturedChunk>>;

    /// Change the chunk slicing interval mid-capture (header probe to
    /// steady state).
    async fn set_interval(&mut self, interval: Duration) -> Result<()>;

    /// Halt capture and release the underlying device.
    async fn stop(&mut self) -> Result<()>;

    /// Check if the capturer is currently producing chunks
    fn is_capturing(&self) -> bool;

    /// Whether this source can produce the given container/codec pair
    fn supports(&self, mime: &MimeType) -> bool;

    /// Get capturer name for logging
    fn name(&self) -> &str;
}

/// Creates one capturer per recording session
pub trait CaptureFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn Capturer>>;
}

/// File-backed capture source
///
/// Slices a pre-recorded container file into timed chunks. Used by the CLI
/// demo and tests; stands in for a live microphone adapter.
pub struct FileCapturer {
    path: PathBuf,
    mime: MimeType,
    chunk_bytes: usize,
    capturing: Arc<AtomicBool>,
    interval_tx: Option<watch::Sender<Duration>>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl FileCapturer {
    /// Default slice size per emitted chunk
    pub const DEFAULT_CHUNK_BYTES: usize = 4096;

    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mime = match path.extension().and_then(|e| e.to_str()) {
            Some("webm") => MimeType { container: Container::Webm, codec: Codec::Opus },
            Some("ogg") => MimeType { container: Container::Ogg, codec: Codec::Opus },
            _ => return Err(VoiceError::UnsupportedCodec),
        };

        Ok(Self {
            path,
            mime,
            chunk_bytes: Self::DEFAULT_CHUNK_BYTES,
            capturing: Arc::new(AtomicBool::new(false)),
            interval_tx: None,
            task: Arc::new(Mutex::new(None)),
        })
    }

    pub fn with_chunk_bytes(mut self, chunk_bytes: usize) -> Self {
        self.chunk_bytes = chunk_bytes;
        self
    }
}

#[async_trait]
impl Capturer for FileCapturer {
    async fn start(&mut self, interval: Duration) -> Result<mpsc::Receiver<CapturedChunk>> {
        if self.capturing.load(Ordering::SeqCst) {
            return Err(VoiceError::Protocol("capturer already started".to_string()));
        }

        let data = tokio::fs::read(&self.path)
            .await
            .map_err(|_| VoiceError::NoDevice)?;

        info!(
            "File capture started: {} ({} bytes, {} per chunk)",
            self.path.display(),
            data.len(),
            self.chunk_bytes
        );

        let (interval_tx, interval_rx) = watch::channel(interval);
        self.interval_tx = Some(interval_tx);
        self.capturing.store(true, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(64);
        let capturing = Arc::clone(&self.capturing);
        let chunk_bytes = self.chunk_bytes;

        let task = tokio::spawn(async move {
            let started = Instant::now();

            for slice in data.chunks(chunk_bytes) {
                let pause = *interval_rx.borrow();
                tokio::time::sleep(pause).await;

                if !capturing.load(Ordering::SeqCst) {
                    break;
                }

                let chunk = CapturedChunk {
                    data: slice.to_vec(),
                    captured_at_ms: started.elapsed().as_millis() as u64,
                };

                if tx.send(chunk).await.is_err() {
                    break;
                }
            }

            capturing.store(false, Ordering::SeqCst);
            debug!("File capture task finished");
        });

        {
            let mut handle = self.task.lock().await;
            *handle = Some(task);
        }

        Ok(rx)
    }

    async fn set_interval(&mut self, interval: Duration) -> Result<()> {
        if let Some(tx) = &self.interval_tx {
            tx.send(interval)
                .map_err(|_| VoiceError::Protocol("capture task gone".to_string()))?;
        }
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.capturing.store(false, Ordering::SeqCst);

        let mut handle = self.task.lock().await;
        if let Some(task) = handle.take() {
            task.abort();
        }

        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
    }

    fn supports(&self, mime: &MimeType) -> bool {
        *mime == self.mime
    }

    fn name(&self) -> &str {
        "file"
    }
}
