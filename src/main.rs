use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::bounded;
use depth_capture::backoff::BackoffPolicy;
use depth_capture::config::{SessionConfig, Venue};
use depth_capture::snapshot::RestSnapshotSource;
use depth_capture::stream::WsEventSource;
use depth_capture::supervisor::CaptureSupervisor;
use dotenvy::dotenv;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(version, about = "Depth diffs + trades recorder with a synchronized local book")]
struct Args {
    /// Venue (binance or binanceus)
    #[arg(long, env = "VENUE", default_value = "binance")]
    venue: String,

    /// Symbol, e.g. BTCUSDT
    #[arg(long, env = "SYMBOL", default_value = "BTCUSDT")]
    symbol: String,

    /// Session duration in minutes
    #[arg(long, env = "MINUTES", default_value_t = 60)]
    minutes: u64,

    /// Root directory for raw partitions
    #[arg(long, env = "RAW_DIR", default_value = "raw")]
    raw_dir: PathBuf,

    /// Periodic resnapshot interval in seconds
    #[arg(long, env = "SNAPSHOT_EVERY_SEC", default_value_t = 600)]
    snapshot_every_sec: u64,

    /// Depth levels requested per snapshot
    #[arg(long, default_value_t = 1000)]
    snapshot_limit: u32,

    /// Depth updates held while waiting for a covering snapshot
    #[arg(long, default_value_t = 1000)]
    pending_capacity: usize,

    /// Reconciler-driven resyncs tolerated per minute before giving up
    #[arg(long, default_value_t = 10)]
    max_resyncs_per_minute: u32,

    /// HTTP timeout for one snapshot request, in milliseconds
    #[arg(long, default_value_t = 20_000)]
    rest_timeout_ms: u64,

    /// Attempts per snapshot fetch
    #[arg(long, default_value_t = 5)]
    snapshot_attempts: u32,

    /// Consecutive failed stream connects before the session fails
    #[arg(long, default_value_t = 8)]
    reconnect_attempts: u32,

    #[arg(long, default_value_t = 250)]
    backoff_base_ms: u64,

    #[arg(long, default_value_t = 10_000)]
    backoff_max_ms: u64,
}

fn main() -> Result<()> {
    // Load environment variables from .env if present
    let _ = dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("depth_capture=info")),
        )
        .init();
    let args = Args::parse();

    let venue: Venue = args.venue.parse().context("parse --venue")?;
    let mut config = SessionConfig::new(venue, args.symbol.clone(), args.raw_dir.clone());
    config.duration = Duration::from_secs(args.minutes.saturating_mul(60));
    config.resnapshot_interval = Duration::from_secs(args.snapshot_every_sec);
    config.snapshot_limit = args.snapshot_limit;
    config.pending_capacity = args.pending_capacity;
    config.max_resyncs_per_minute = args.max_resyncs_per_minute;
    config.snapshot_attempts = args.snapshot_attempts;
    config.reconnect_attempts = args.reconnect_attempts;
    config.backoff = BackoffPolicy {
        base: Duration::from_millis(args.backoff_base_ms),
        max: Duration::from_millis(args.backoff_max_ms),
        multiplier: 2.0,
    };
    // fail on bad input before any socket is opened
    let config = config.validate().context("invalid session configuration")?;

    let snapshots = RestSnapshotSource::new(
        venue,
        &config.symbol,
        config.snapshot_limit,
        Duration::from_millis(args.rest_timeout_ms),
    )
    .context("build snapshot client")?;
    let events = WsEventSource::new(venue.stream_url(&config.symbol));

    let (stop_tx, stop_rx) = bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .context("install Ctrl+C handler")?;

    info!(symbol = %config.symbol, venue = %venue, dir = %config.raw_dir.display(), "starting capture");
    let status = CaptureSupervisor::new(config, snapshots, events)?
        .with_shutdown(stop_rx)
        .run()
        .context("capture session")?;

    println!("{}", serde_json::to_string_pretty(&status).context("encode session status")?);
    if let Some(reason) = &status.fatal {
        warn!(%reason, "session ended on a fatal error");
        std::process::exit(2);
    }
    Ok(())
}
