use crate::config::PlaybackConfig;
use crate::error::Result;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Audio playback capability interface
///
/// Platform adapters (media element, file sink, test mock) implement this.
/// The streamer assembles header + chunks into a continuous decodable byte
/// stream and feeds it through here in arrival order.
pub trait Player: Send + Sync {
    /// Begin a new decodable stream for the given mime type, discarding any
    /// previous source.
    fn start_source(&mut self, mime_type: &str) -> Result<()>;

    /// Append container bytes to the current stream
    fn feed(&mut self, data: &[u8]) -> Result<()>;

    /// Start audible playback; may fail with `AutoplayBlocked` when the
    /// platform requires a user gesture first.
    fn play(&mut self) -> Result<()>;

    /// Halt playback and release the source. Idempotent.
    fn stop(&mut self);
}

/// Creates one player per playback session
pub trait PlayerFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn Player>>;
}

/// Owns the playback pipeline for one session.
///
/// Chunks arriving before the header are buffered (bounded, oldest dropped)
/// and drained into the stream in original order once the header is set.
pub struct AudioStreamer {
    player: Box<dyn Player>,
    header: Option<Vec<u8>>,
    mime_type: Option<String>,
    pending: VecDeque<Vec<u8>>,
    pending_cap: usize,
    playing: bool,
}

impl AudioStreamer {
    pub fn new(player: Box<dyn Player>, config: &PlaybackConfig) -> Self {
        Self {
            player,
            header: None,
            mime_type: None,
            pending: VecDeque::new(),
            pending_cap: config.pending_chunk_cap,
            playing: false,
        }
    }

    pub fn has_header(&self) -> bool {
        self.header.is_some()
    }

    /// Mime type of the current stream, once a header has been set
    pub fn mime_type(&self) -> Option<&str> {
        self.mime_type.as_deref()
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Store the session header and start a new decodable stream from it.
    ///
    /// Calling again mid-session begins a fresh stream; chunks queued before
    /// this call still drain into the new stream, preserving order.
    pub fn set_buffer_header(&mut self, mime_type: &str, data: Vec<u8>) -> Result<()> {
        info!(
            "Setting buffer header: {} ({} bytes, {} chunks pending)",
            mime_type,
            data.len(),
            self.pending.len()
        );

        self.player.start_source(mime_type)?;
        self.player.feed(&data)?;

        self.header = Some(data);
        self.mime_type = Some(mime_type.to_string());

        while let Some(chunk) = self.pending.pop_front() {
            self.player.feed(&chunk)?;
        }

        Ok(())
    }

    /// Append chunks in arrival order.
    ///
    /// Without a header they accumulate up to the configured cap; past it the
    /// oldest chunk is dropped so a stalled header cannot grow the queue
    /// without bound.
    pub fn receive_buffer(&mut self, chunks: Vec<Vec<u8>>) -> Result<()> {
        if self.header.is_some() {
            for chunk in &chunks {
                self.player.feed(chunk)?;
            }
            return Ok(());
        }

        for chunk in chunks {
            if self.pending.len() >= self.pending_cap {
                self.pending.pop_front();
                warn!(
                    "Pending chunk queue overflow (cap {}); dropping oldest chunk",
                    self.pending_cap
                );
            }
            self.pending.push_back(chunk);
        }

        Ok(())
    }

    /// Begin feeding the assembled stream into audible playback.
    ///
    /// Fails with `AutoplayBlocked` when the platform refuses to start
    /// without a user gesture; the caller retries once after the next
    /// gesture.
    pub fn play_stream(&mut self) -> Result<()> {
        if self.playing {
            return Ok(());
        }

        self.player.play()?;
        self.playing = true;
        debug!("Playback started");

        Ok(())
    }

    /// Halt playback, discard queue and header, release the player source.
    /// Idempotent.
    pub fn stop(&mut self) {
        if self.header.is_none() && self.pending.is_empty() && !self.playing {
            return;
        }

        self.player.stop();
        self.header = None;
        self.mime_type = None;
        self.pending.clear();
        self.playing = false;

        debug!("Playback stopped");
    }
}

/// Writes the assembled container stream to disk.
///
/// Stands in for a live media-element adapter in the CLI demo and tests; the
/// output file is a valid container (header + chunks in order) that an
/// external decoder accepts.
pub struct FilePlayer {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    playing: bool,
}

impl FilePlayer {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            writer: None,
            playing: false,
        }
    }
}

impl Player for FilePlayer {
    fn start_source(&mut self, mime_type: &str) -> Result<()> {
        let file = File::create(&self.path).map_err(|e| {
            crate::error::VoiceError::Playback(format!(
                "failed to create output file {}: {}",
                self.path.display(),
                e
            ))
        })?;

        info!("Writing {} stream to {}", mime_type, self.path.display());
        self.writer = Some(BufWriter::new(file));

        Ok(())
    }

    fn feed(&mut self, data: &[u8]) -> Result<()> {
        if let Some(writer) = &mut self.writer {
            writer.write_all(data).map_err(|e| {
                crate::error::VoiceError::Playback(format!("write failed: {}", e))
            })?;
        }
        Ok(())
    }

    fn play(&mut self) -> Result<()> {
        self.playing = true;
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.flush() {
                warn!("Failed to flush player output on stop: {}", e);
            }
        }
        self.playing = false;
    }
}

impl Drop for FilePlayer {
    fn drop(&mut self) {
        self.stop();
    }
}
