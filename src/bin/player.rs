use anyhow::{Context, Result};
use clap::Parser;
use depth_capture::book::PriceLevel;
use depth_capture::record::SessionLayout;
use depth_capture::replay::{ReplayStep, load_session, replay_frames};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(about = "Replay a recorded depth/trades session and reconstruct the book")]
struct Args {
    /// Root directory the recorder wrote to
    #[arg(long, default_value = "raw")]
    root: PathBuf,

    /// Capture date (YYYY-MM-DD, UTC)
    #[arg(long)]
    date: String,

    #[arg(long, default_value = "binance")]
    venue: String,

    #[arg(long)]
    symbol: String,

    /// Session id (HHMMSS start time, as in the file names)
    #[arg(long)]
    session: String,

    /// Override the buffer capacity recorded in the session header
    #[arg(long)]
    pending_capacity: Option<usize>,

    /// Print every reconciler decision
    #[arg(long, default_value_t = false)]
    decisions: bool,

    /// Print trades as they are read
    #[arg(long, default_value_t = false)]
    print_trades: bool,

    /// Number of levels to print for the final book
    #[arg(long, default_value_t = 5)]
    top: usize,
}

fn fmt_level(l: Option<&PriceLevel>) -> String {
    l.map(|l| format!("{:>14} x {:<14}", l.price, l.quantity)).unwrap_or_else(|| format!("{:>14}   {:<14}", "-", ""))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();
    let args = Args::parse();
    let layout = SessionLayout {
        root: args.root.clone(),
        date: args.date.clone(),
        venue: args.venue.to_lowercase(),
        symbol: args.symbol.to_uppercase(),
        session: args.session.clone(),
    };
    let recording =
        load_session(&layout).with_context(|| format!("load session under {:?}", layout.base_dir()))?;
    let capacity = args.pending_capacity.unwrap_or(recording.pending_capacity);
    let frames = &recording.frames;
    let replay = replay_frames(frames, capacity).context("replay session")?;

    for step in &replay.steps {
        match step {
            ReplayStep::Trade { seq, trade } if args.print_trades => {
                println!(
                    "TRADE seq={} id={} ts={} price={} qty={} side={:?}",
                    seq, trade.trade_id, trade.ts_ms, trade.price, trade.qty, trade.side
                );
            }
            ReplayStep::Trade { .. } => {}
            other if args.decisions => {
                if let Some(decision) = other.decision() {
                    println!("seq={} {:?}", other.seq(), decision);
                }
            }
            _ => {}
        }
    }

    let book = replay.reconciler.book();
    let bids = book.bids.top(args.top);
    let asks = book.asks.top(args.top);
    println!(
        "state={:?} last_applied_seq={} epoch={} | top{} bids / asks:",
        book.state, book.last_applied_seq, book.epoch, args.top
    );
    for i in 0..bids.len().max(asks.len()) {
        println!("{:>3}: {} | {}", i, fmt_level(bids.get(i)), fmt_level(asks.get(i)));
    }
    let t = &replay.decisions;
    eprintln!(
        "Read {} records (pending capacity {}). applied={} stale={} skipped={} gaps={} synced={} buffered={} evicted={} resets={}",
        frames.len(),
        capacity,
        t.applied,
        t.stale,
        t.skipped,
        t.gaps,
        t.synced,
        t.buffered,
        t.evicted,
        t.resets
    );
    Ok(())
}
