//! # Lumen Server
//!
//! Self-hosted media-library server: point it at a directory tree of images
//! and videos and browse, search, and play them from any browser.
//!
//! ## Architecture
//!
//! The server is built on Axum and uses:
//! - SQLite (via sqlx) for the metadata projection of the media tree
//! - A background indexer with polling change detection
//! - FFmpeg/FFprobe for probing, thumbnails, and on-demand transcoding
//! - A content-addressed cache for transcoded MP4s and thumbnails

/// Error types and HTTP mapping
pub mod errors;

/// Request handlers
pub mod handlers;

/// API route table
pub mod routes;

/// Timeout-protected stream plumbing
pub mod streamio;

/// Transcoding: hardware detection, cache, encoder runs
pub mod transcoding;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use lumen_config::Config;
use lumen_core::indexer::{Indexer, IndexerOptions};
use lumen_core::scanner::ScanOptions;
use lumen_core::store::MediaStore;
use lumen_core::thumbs::ThumbnailService;
use lumen_core::Prober;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::transcoding::{HardwareAccel, TranscodeOptions, TranscodeService};

/// Command line arguments for the Lumen media server
#[derive(Parser, Debug)]
#[command(name = "lumen-server")]
#[command(about = "Self-hosted media-library server with on-demand transcoding")]
struct Args {
    /// Server host (overrides config)
    #[arg(long, env = "SERVER_HOST")]
    host: Option<String>,

    /// Server port (overrides config)
    #[arg(short, long, env = "SERVER_PORT")]
    port: Option<u16>,
}

/// Server application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: MediaStore,
    pub indexer: Arc<Indexer>,
    pub thumbs: Arc<ThumbnailService>,
    pub transcoder: Arc<TranscodeService>,
    pub prober: Prober,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config = Config::from_env().context("loading configuration")?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    for warning in config.validate() {
        warn!("config: {warning}");
    }

    tokio::fs::create_dir_all(config.thumbnail_dir()).await?;
    tokio::fs::create_dir_all(config.transcode_dir()).await?;

    let store = MediaStore::open(&config.database_dir)
        .await
        .context("opening metadata store")?;

    let indexer = Indexer::new(
        store.clone(),
        &config.media_dir,
        IndexerOptions {
            scan: ScanOptions {
                workers: config.index_workers,
                ..ScanOptions::default()
            },
            index_interval: config.index_interval,
            poll_interval: config.poll_interval,
            ..IndexerOptions::default()
        },
    );

    let thumbs = ThumbnailService::new(
        store.clone(),
        &config.media_dir,
        config.thumbnail_dir(),
        &config.ffmpeg_path,
        &config.ffprobe_path,
        config.index_workers,
    );

    let transcoder = TranscodeService::new(
        &config.ffmpeg_path,
        config.transcode_dir(),
        HardwareAccel::new(&config.ffmpeg_path, config.gpu_accel),
        TranscodeOptions::default(),
    );

    // New index results feed the thumbnail pre-generation sweep.
    {
        let thumbs = Arc::clone(&thumbs);
        indexer.set_on_index_complete(move || {
            tokio::spawn(Arc::clone(&thumbs).sweep());
        });
    }
    indexer.start();

    // Periodic sweep as a safety net for sources touched between indexes.
    {
        let thumbs = Arc::clone(&thumbs);
        let period = config.thumbnail_interval;
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                Arc::clone(&thumbs).sweep().await;
            }
        });
    }

    let state = AppState {
        prober: Prober::new(&config.ffprobe_path),
        config: Arc::new(config),
        store,
        indexer,
        thumbs,
        transcoder,
    };

    let app = routes::router(state.clone());
    let addr: SocketAddr = format!("{}:{}", state.config.host, state.config.port)
        .parse()
        .context("invalid listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("lumen-server listening on {addr}");
    info!("media root: {}", state.config.media_dir.display());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down");
    state.indexer.stop();
    state.transcoder.cleanup().await;
    state.store.close().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
