pub mod capture;
pub mod init_segment;
pub mod recorder;
pub mod streamer;

pub use capture::{CaptureFactory, CapturedChunk, Capturer, Codec, Container, FileCapturer, MimeType};
pub use recorder::{AudioRecorder, BufferHeader, RecorderEvent};
pub use streamer::{AudioStreamer, FilePlayer, Player, PlayerFactory};
