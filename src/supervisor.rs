//! Capture session orchestration.
//!
//! One control flow owns the reconciler, the recorder and every counter. It
//! wakes on exactly one of: next stream event, resnapshot tick, session
//! deadline, interrupt. Snapshot fetches are blocking calls made from that same
//! flow, so no state is ever shared across threads; stream frames keep
//! queueing in the pump channel while a fetch is in flight.
use crate::backoff::BackoffPolicy;
use crate::config::{ConfigError, SessionConfig};
use crate::envelope::{DiffEnvelope, Trade};
use crate::reconcile::{Decision, DecisionTally, Reconciler};
use crate::record::{RawRecorder, RecordError, SessionLayout};
use crate::snapshot::{SnapshotSource, fetch_with_retry};
use crate::status::{SessionStatus, StopReason};
use crate::stream::{EventSource, PumpConfig, StreamEvent, spawn_pump};
use crossbeam_channel::{Receiver, Sender, at, bounded, never, select, tick};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("raw persistence failed: {0}")]
    Persistence(#[from] RecordError),
    #[error("{count} resyncs within {window_secs}s exceeds the limit of {limit}")]
    ResyncLimit { count: usize, limit: u32, window_secs: u64 },
    #[error("event stream failed: {0}")]
    Stream(String),
    #[error("failed to start stream pump: {0}")]
    Spawn(std::io::Error),
}

/// Sliding one-minute window over reconciler-driven snapshot requests.
#[derive(Debug)]
pub struct ResyncGuard {
    limit: u32,
    window: Duration,
    recent: VecDeque<Instant>,
}

impl ResyncGuard {
    pub fn per_minute(limit: u32) -> Self {
        Self { limit, window: Duration::from_secs(60), recent: VecDeque::new() }
    }

    /// Record one resync at `now`, failing once the window already holds `limit`.
    pub fn admit(&mut self, now: Instant) -> Result<(), CaptureError> {
        while let Some(&oldest) = self.recent.front() {
            if now.duration_since(oldest) >= self.window {
                self.recent.pop_front();
            } else {
                break;
            }
        }
        if self.recent.len() >= self.limit as usize {
            return Err(CaptureError::ResyncLimit {
                count: self.recent.len() + 1,
                limit: self.limit,
                window_secs: self.window.as_secs(),
            });
        }
        self.recent.push_back(now);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Bootstrap,
    Timer,
    Resync,
    Reconnect,
}

impl Trigger {
    fn counts_as_resync(self) -> bool {
        matches!(self, Trigger::Resync | Trigger::Reconnect)
    }
}

pub struct CaptureSupervisor<S, E> {
    config: SessionConfig,
    snapshots: S,
    events: E,
    shutdown: Option<Receiver<()>>,
    trades: Option<Sender<Trade>>,
}

impl<S: SnapshotSource, E: EventSource> CaptureSupervisor<S, E> {
    /// Validates `config`; nothing touches the network or disk yet.
    pub fn new(config: SessionConfig, snapshots: S, events: E) -> Result<Self, CaptureError> {
        Ok(Self { config: config.validate()?, snapshots, events, shutdown: None, trades: None })
    }

    /// Stop the session when a message arrives (or the sender is dropped).
    pub fn with_shutdown(mut self, rx: Receiver<()>) -> Self {
        self.shutdown = Some(rx);
        self
    }

    /// Forward trade prints downstream. Full channels drop prints (counted).
    pub fn with_trade_sink(mut self, tx: Sender<Trade>) -> Self {
        self.trades = Some(tx);
        self
    }

    /// Run one capture session to completion. Errors are only returned when the
    /// session cannot start; anything fatal afterwards ends up in the status.
    pub fn run(self) -> Result<SessionStatus, CaptureError> {
        let Self { config, snapshots, events, shutdown, trades } = self;
        let started = time::OffsetDateTime::now_utc();
        let layout = SessionLayout::new(&config.raw_dir, config.venue.as_str(), &config.symbol, started);
        let recorder = RawRecorder::open(layout, config.pending_capacity, config.writer_queue, config.flush_interval)?;

        let (tx, rx) = bounded::<StreamEvent>(config.stream_queue);
        let pump_cfg = PumpConfig { backoff: config.backoff, reconnect_attempts: config.reconnect_attempts };
        spawn_pump(events, tx, pump_cfg).map_err(CaptureError::Spawn)?;

        info!(
            venue = %config.venue,
            symbol = %config.symbol,
            duration_s = config.duration.as_secs(),
            resnapshot_s = config.resnapshot_interval.as_secs(),
            "capture session starting"
        );
        let deadline = Instant::now() + config.duration;
        let mut session = Session {
            reconciler: Reconciler::new(config.pending_capacity),
            guard: ResyncGuard::per_minute(config.max_resyncs_per_minute),
            counters: Counters::default(),
            resync_on_connect: false,
            snapshots,
            recorder,
            trades,
            config,
        };
        let outcome = session.drive(&rx, deadline, shutdown.as_ref());
        // stop consuming: the pump exits on its next send
        drop(rx);
        Ok(session.finish(outcome))
    }
}

#[derive(Debug, Default)]
struct Counters {
    depth_recorded: u64,
    trades_recorded: u64,
    snapshots_recorded: u64,
    disconnects: u64,
    ignored_frames: u64,
    decisions: DecisionTally,
    resync_requests: u64,
    snapshot_failures: u64,
    snapshot_unavailable: bool,
    trades_forwarded: u64,
    trades_dropped: u64,
}

struct Session<S> {
    config: SessionConfig,
    snapshots: S,
    recorder: RawRecorder,
    reconciler: Reconciler,
    guard: ResyncGuard,
    counters: Counters,
    resync_on_connect: bool,
    trades: Option<Sender<Trade>>,
}

impl<S: SnapshotSource> Session<S> {
    fn drive(
        &mut self,
        rx: &Receiver<StreamEvent>,
        deadline: Instant,
        shutdown: Option<&Receiver<()>>,
    ) -> Result<StopReason, CaptureError> {
        self.resnapshot(Trigger::Bootstrap, deadline)?;

        let ticker = tick(self.config.resnapshot_interval);
        let expiry = at(deadline);
        let idle = never::<()>();
        let shutdown = shutdown.unwrap_or(&idle);
        loop {
            select! {
                recv(rx) -> msg => match msg {
                    Ok(event) => {
                        if let Some(stop) = self.on_stream(event, deadline)? {
                            return Ok(stop);
                        }
                    }
                    Err(_) => return Err(CaptureError::Stream("stream pump exited".into())),
                },
                recv(ticker) -> _ => self.resnapshot(Trigger::Timer, deadline)?,
                recv(expiry) -> _ => return Ok(StopReason::DurationElapsed),
                recv(shutdown) -> _ => {
                    info!("shutdown requested");
                    return Ok(StopReason::Interrupted);
                }
            }
        }
    }

    fn on_stream(&mut self, event: StreamEvent, deadline: Instant) -> Result<Option<StopReason>, CaptureError> {
        match event {
            StreamEvent::Envelope(received) => {
                // write-ahead: recorded before the reconciler gets a say
                self.recorder.record_envelope(&received)?;
                match received.envelope {
                    DiffEnvelope::DepthUpdate(update) => {
                        self.counters.depth_recorded += 1;
                        let decision = self.reconciler.on_depth(update);
                        self.settle(decision, deadline)?;
                    }
                    DiffEnvelope::Trade(trade) => {
                        self.counters.trades_recorded += 1;
                        self.forward(trade);
                    }
                }
            }
            StreamEvent::Connected { attempt } => {
                if self.resync_on_connect {
                    self.resync_on_connect = false;
                    info!(attempt, "reconnected, fetching fresh snapshot");
                    self.resnapshot(Trigger::Reconnect, deadline)?;
                }
            }
            StreamEvent::Unparsed { recv_unix_ns, text, reason } => {
                // not reconciled, but the raw log keeps everything received
                self.recorder.record_unparsed(&text, recv_unix_ns, &reason)?;
                self.counters.ignored_frames += 1;
                debug!(%reason, "recorded non-envelope frame");
            }
            StreamEvent::Disconnected { reason } => {
                self.recorder.record_disconnect(&reason)?;
                self.counters.disconnects += 1;
                let decision = self.reconciler.on_disconnect();
                self.counters.decisions.observe(&decision);
                self.resync_on_connect = true;
            }
            StreamEvent::Ended => {
                info!("event stream ended");
                return Ok(Some(StopReason::StreamEnded));
            }
            StreamEvent::Fatal(reason) => return Err(CaptureError::Stream(reason)),
        }
        Ok(None)
    }

    fn settle(&mut self, decision: Decision, deadline: Instant) -> Result<(), CaptureError> {
        self.counters.decisions.observe(&decision);
        debug!(?decision, "depth update");
        if decision.needs_snapshot() {
            self.resnapshot(Trigger::Resync, deadline)?;
        }
        Ok(())
    }

    fn forward(&mut self, trade: Trade) {
        if let Some(tx) = &self.trades {
            match tx.try_send(trade) {
                Ok(()) => self.counters.trades_forwarded += 1,
                Err(_) => self.counters.trades_dropped += 1,
            }
        }
    }

    /// Fetch, record and apply snapshots until the reconciler stops asking
    /// for one (or fetching gives up).
    fn resnapshot(&mut self, trigger: Trigger, deadline: Instant) -> Result<(), CaptureError> {
        let mut trigger = trigger;
        loop {
            if trigger.counts_as_resync() {
                self.guard.admit(Instant::now())?;
                self.counters.resync_requests += 1;
            }
            let policy: BackoffPolicy = self.config.backoff;
            let fetched = match fetch_with_retry(&mut self.snapshots, policy, self.config.snapshot_attempts, deadline) {
                Ok(fetched) => fetched,
                Err(e) => {
                    self.counters.snapshot_failures += 1;
                    self.counters.snapshot_unavailable = true;
                    error!(?trigger, error = %e, "snapshot unavailable, continuing raw capture unsynced");
                    return Ok(());
                }
            };
            self.recorder.record_snapshot(&fetched)?;
            self.counters.snapshots_recorded += 1;
            let decision = self.reconciler.on_snapshot(fetched.snapshot);
            self.counters.decisions.observe(&decision);
            debug!(?trigger, ?decision, "snapshot");
            if !decision.needs_snapshot() {
                return Ok(());
            }
            trigger = Trigger::Resync;
        }
    }

    fn finish(self, outcome: Result<StopReason, CaptureError>) -> SessionStatus {
        let Session { config, recorder, reconciler, counters, .. } = self;
        let layout = recorder.layout().clone();
        let (mut stop_reason, mut fatal) = match outcome {
            Ok(reason) => (reason, None),
            Err(e) => (StopReason::Fatal, Some(e.to_string())),
        };
        match recorder.close() {
            Ok(stats) => debug!(?stats, "recorder flushed"),
            Err(e) => {
                // the writer's own error is more precise than "writer stopped"
                stop_reason = StopReason::Fatal;
                fatal = Some(CaptureError::Persistence(e).to_string());
            }
        }
        if let Some(reason) = &fatal {
            error!(%reason, "capture session failed");
        }

        let book = reconciler.book();
        let status = SessionStatus {
            session: layout.session.clone(),
            venue: config.venue.to_string(),
            symbol: config.symbol.clone(),
            layout,
            stop_reason,
            final_state: book.state,
            synced: book.state == crate::book::SyncState::Synced,
            last_applied_seq: book.last_applied_seq,
            depth_recorded: counters.depth_recorded,
            trades_recorded: counters.trades_recorded,
            snapshots_recorded: counters.snapshots_recorded,
            disconnects: counters.disconnects,
            ignored_frames: counters.ignored_frames,
            decisions: counters.decisions,
            resync_requests: counters.resync_requests,
            snapshot_failures: counters.snapshot_failures,
            snapshot_unavailable: counters.snapshot_unavailable,
            trades_forwarded: counters.trades_forwarded,
            trades_dropped: counters.trades_dropped,
            fatal,
        };
        info!(
            stop = ?status.stop_reason,
            state = ?status.final_state,
            gaps = status.gaps(),
            recorded = status.envelopes_recorded(),
            applied = status.decisions.applied,
            "capture session finished"
        );
        status
    }
}
