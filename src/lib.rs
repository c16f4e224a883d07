pub mod audio;
pub mod config;
pub mod error;
pub mod manager;
pub mod transport;

pub use audio::{
    AudioRecorder, AudioStreamer, BufferHeader, CaptureFactory, CapturedChunk, Capturer,
    FileCapturer, FilePlayer, MimeType, Player, PlayerFactory, RecorderEvent,
};
pub use config::Config;
pub use error::VoiceError;
pub use manager::{
    ConnectionManager, ConnectionState, MicState, SessionState, StaticTokenProvider,
    TokenProvider, VoiceEvent,
};
pub use transport::{RelayMessage, Transport, TransportEvent, TransportHandle, WsTransport};
