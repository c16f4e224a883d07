use anyhow::{Context, Result};
use clap::Parser;
use kaiwa_voice::{
    CaptureFactory, Capturer, ConnectionManager, Config, FileCapturer, FilePlayer, Player,
    PlayerFactory, StaticTokenProvider, VoiceEvent, WsTransport,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Stream a pre-recorded container file through the voice relay and write
/// whatever comes back to disk.
#[derive(Parser)]
#[command(name = "kaiwa-voice", about = "Voice relay streaming client")]
struct Args {
    /// Capture source: a .webm or .ogg container file
    #[arg(long)]
    input: PathBuf,

    /// Output file for the relayed audio stream
    #[arg(long, default_value = "relayed.webm")]
    output: PathBuf,

    /// Relay endpoint URL (overrides config)
    #[arg(long)]
    url: Option<String>,

    /// Bearer credential for the relay handshake
    #[arg(long, env = "KAIWA_TOKEN")]
    token: String,

    /// Optional config file (falls back to built-in defaults)
    #[arg(long)]
    config: Option<String>,

    /// How long to stream before stopping
    #[arg(long, default_value_t = 10)]
    duration_secs: u64,
}

struct FileCaptureFactory {
    path: PathBuf,
}

impl CaptureFactory for FileCaptureFactory {
    fn create(&self) -> kaiwa_voice::error::Result<Box<dyn Capturer>> {
        Ok(Box::new(FileCapturer::new(&self.path)?))
    }
}

struct FilePlayerFactory {
    path: PathBuf,
}

impl PlayerFactory for FilePlayerFactory {
    fn create(&self) -> kaiwa_voice::error::Result<Box<dyn Player>> {
        Ok(Box::new(FilePlayer::new(&self.path)))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path).context("Failed to load config")?,
        None => Config::default(),
    };
    if let Some(url) = args.url {
        config.relay.url = url;
    }

    info!("kaiwa-voice v0.1.0");
    info!("Relay endpoint: {}", config.relay.url);

    let manager = ConnectionManager::new(
        Arc::new(WsTransport::new(config.relay.clone())),
        Arc::new(FileCaptureFactory {
            path: args.input.clone(),
        }),
        Arc::new(FilePlayerFactory {
            path: args.output.clone(),
        }),
        Arc::new(StaticTokenProvider(args.token)),
        config,
    );

    let mut events = manager.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                VoiceEvent::Error(message) => tracing::error!("{}", message),
                other => info!("{:?}", other),
            }
        }
    });

    manager.increment_hook_count().await;
    manager.connect().await.context("Failed to connect")?;

    manager
        .start_streaming()
        .await
        .context("Failed to start streaming")?;

    info!(
        "Streaming {} for {}s; relayed audio goes to {}",
        args.input.display(),
        args.duration_secs,
        args.output.display()
    );
    tokio::time::sleep(Duration::from_secs(args.duration_secs)).await;

    manager.stop_streaming().await;
    manager.decrement_hook_count().await;

    info!("Done");
    Ok(())
}
