//! mrcp-media - run one media session against a remote RTP endpoint
//!
//! Usage: `mrcp-media [config.json] [prompt text...]`
//!
//! The far end defaults to a loopback RTP port; set `MRCP_MEDIA_REMOTE` to
//! point it elsewhere. Listens for caller audio, optionally speaks a prompt,
//! and prints every session event until interrupted with Ctrl-C.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use mrcp_media::{BackendFactory, MediaSession, SessionConfig, SessionEvent, SessionRegistry};
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_REMOTE: &str = "127.0.0.1:40000";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let remote = std::env::var("MRCP_MEDIA_REMOTE").unwrap_or_else(|_| DEFAULT_REMOTE.to_string());
    let remote: SocketAddr = remote
        .parse()
        .with_context(|| format!("invalid remote address {:?}", remote))?;

    let mut args = std::env::args().skip(1);

    let config = match args.next().or_else(|| std::env::var("MRCP_MEDIA_CONFIG").ok()) {
        Some(path) => SessionConfig::from_json_file(&path)
            .with_context(|| format!("failed to load config from {}", path))?,
        None => SessionConfig::default(),
    };
    let prompt: Vec<String> = args.collect();

    info!("Starting mrcp-media session towards {}", remote);

    let registry = SessionRegistry::new();
    let factory = BackendFactory::new(config.backends.clone());
    let (events_tx, mut events) = mpsc::unbounded_channel();

    let session = MediaSession::start("cli", config, remote, &factory, events_tx)
        .await
        .context("failed to start media session")?;
    registry.insert(session.clone())?;
    println!("RTP listening on {}", session.local_addr());

    session.start_recognition();
    if !prompt.is_empty() {
        session.speak(&prompt.join(" "));
    }
    drop(session);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(SessionEvent::RecognitionComplete(text)) => println!("📝 {}", text),
                Some(event) => println!("{:?}", event),
                None => {
                    warn!("Session event stream ended");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    registry.close_all();
    Ok(())
}
