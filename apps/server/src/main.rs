//! Takion Server - standalone headless driver for a Remote Play session.
//!
//! This binary provides no UI, no HTTP registration, and no media sink of
//! its own: it reads an already-acquired session token from a config file
//! (the out-of-scope bootstrap step), hands it to `takion-core`, and logs
//! the frames and events the engine produces. It exists to exercise the
//! engine end-to-end without a browser or console-side fixture; embedding
//! it in a real Remote Play client means swapping [`LoggingAvReceiver`] for
//! an actual decoder/renderer.

mod config;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use takion_core::{AvReceiver, EngineEvent, EventEmitter, TakionSession};
use tokio::signal;

use crate::config::ServerConfig;

/// Takion Server - headless Remote Play session driver.
#[derive(Parser, Debug)]
#[command(name = "takion-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "TAKION_LOG_LEVEL")]
    log_level: log::LevelFilter,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Takion Server v{}", env!("CARGO_PKG_VERSION"));

    let config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    let session = config.to_session().context("Invalid session configuration")?;

    log::info!(
        "Connecting to {:?} at {} (session_id={})",
        session.host_type,
        session.host_endpoint,
        session.session_id
    );

    let receiver = Arc::new(LoggingAvReceiver::default());
    let emitter = Arc::new(LoggingEventBridge);

    let handle = TakionSession::builder(session, receiver)
        .emitter(emitter)
        .connect()
        .await
        .context("Takion handshake failed")?;

    log::info!("Session is READY");

    shutdown_signal().await;

    log::info!("Shutdown signal received, disconnecting...");
    if let Err(err) = handle.stop("client shutdown").await {
        log::warn!("error while disconnecting: {err}");
    }

    log::info!("Shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Minimal [`AvReceiver`] that logs what it would otherwise hand to a
/// decoder. Real embedders (a WebRTC re-encoder, an HLS muxer, a local
/// decoder) replace this entirely; it exists so the binary has something to
/// drive end-to-end without pulling in a media stack.
#[derive(Default)]
struct LoggingAvReceiver {
    video_frames: AtomicU64,
    audio_frames: AtomicU64,
}

impl AvReceiver for LoggingAvReceiver {
    fn on_stream_info(&self, video_header_with_padding: &[u8], audio_header: &[u8]) {
        log::info!(
            "stream info: video_header={}B audio_header={}B",
            video_header_with_padding.len(),
            audio_header.len()
        );
    }

    fn on_video_frame(&self, bytes: &[u8], is_keyframe: bool, frame_index: u16) {
        let count = self.video_frames.fetch_add(1, Ordering::Relaxed) + 1;
        if is_keyframe || count % 120 == 0 {
            log::debug!(
                "video frame {frame_index} ({} bytes, keyframe={is_keyframe}), total={count}",
                bytes.len()
            );
        }
    }

    fn on_audio_frame(&self, bytes: &[u8], frame_index: u16) {
        let count = self.audio_frames.fetch_add(1, Ordering::Relaxed) + 1;
        if count % 500 == 0 {
            log::debug!(
                "audio frame {frame_index} ({} bytes), total={count}",
                bytes.len()
            );
        }
    }

    fn enter_wait_for_idr(&self) {
        log::info!("receiver (re)attached, waiting for next keyframe");
    }
}

/// Logs every [`EngineEvent`] at an appropriate level. A real embedder would
/// forward rumble/pad-info events to a controller driver and disconnect to
/// whatever owns the outer user session.
struct LoggingEventBridge;

impl EventEmitter for LoggingEventBridge {
    fn emit(&self, event: EngineEvent) {
        match event {
            EngineEvent::Rumble(event) => {
                log::trace!("rumble: left={} right={}", event.left, event.right);
            }
            EngineEvent::PadInfo(event) => {
                log::debug!("pad info: {event:?}");
            }
            EngineEvent::TriggerEffects(event) => {
                log::trace!("trigger effects: {} bytes", event.payload.len());
            }
            EngineEvent::Health(event) => {
                log::debug!(
                    "stream health: {:?} (frame {}, consecutive_failures={})",
                    event.status,
                    event.frame_index,
                    event.consecutive_failures
                );
            }
            EngineEvent::Disconnect { reason, .. } => {
                log::warn!("console disconnected: {reason:?}");
            }
        }
    }
}
