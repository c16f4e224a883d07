use thiserror::Error;

/// Errors surfaced by the voice relay client.
///
/// Capture and codec errors are caught at the recorder boundary and surfaced
/// once through the event stream; transport errors drive the connection state
/// machine into its error state.
#[derive(Debug, Error)]
pub enum VoiceError {
    /// No credential available or the relay rejected it at handshake
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The user denied access to the capture device
    #[error("capture device access denied")]
    PermissionDenied,

    /// No capture device exists on this system
    #[error("no capture device available")]
    NoDevice,

    /// No container/codec pair from the preference list is supported
    #[error("no supported audio container/codec combination")]
    UnsupportedCodec,

    /// Playback refused to start without a user gesture
    #[error("playback blocked until a user gesture occurs")]
    AutoplayBlocked,

    /// Playback sink failed to accept or render stream bytes
    #[error("playback error: {0}")]
    Playback(String),

    /// Handshake or connection failure on the relay transport
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed header/chunk sequence on the wire
    #[error("protocol error: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, VoiceError>;
