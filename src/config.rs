use anyhow::Result;
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub relay: RelayConfig,
    pub audio: AudioConfig,
    pub playback: PlaybackConfig,
}

/// Relay endpoint and connection policy
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// WebSocket URL of the relay endpoint
    pub url: String,
    /// Reconnect attempts before the connection is considered lost
    pub max_reconnect_attempts: u32,
    /// Base reconnect delay in milliseconds (multiplied by the attempt number)
    pub reconnect_delay_ms: u64,
    /// Keepalive ping interval in seconds
    pub ping_interval_secs: u64,
    /// Consecutive missed pongs before a liveness warning is logged
    pub missed_pong_warn_threshold: u32,
}

/// Capture-side chunking
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Steady-state chunk interval in milliseconds
    pub latency_ms: u64,
    /// Short probe interval used to obtain the header chunk quickly
    pub header_probe_ms: u64,
}

/// Playback-side buffering
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Maximum chunks buffered while waiting for a header (oldest dropped)
    pub pending_chunk_cap: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:3001/relay".to_string(),
            max_reconnect_attempts: 5,
            reconnect_delay_ms: 1000,
            ping_interval_secs: 30,
            missed_pong_warn_threshold: 2,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            latency_ms: 1000,
            header_probe_ms: 100,
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            pending_chunk_cap: 256,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}
