//! Offline replay of a recorded session.
//!
//! Reads the depth, trades and snapshots partitions of one session, merges
//! them by `seq` and feeds a fresh [`Reconciler`] in that order. Because the
//! live session recorded every input before reconciling it, the replay makes
//! the same accept/discard/resync decisions.
use crate::envelope::{DiffEnvelope, ParseError, StreamKind, Trade};
use crate::reconcile::{Decision, DecisionTally, Reconciler};
use crate::record::{RecordError, RecordFrame, SessionLayout, read_frames};
use std::path::PathBuf;
use crate::snapshot::Snapshot;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error("record seq {seq} is not a valid envelope or snapshot: {source}")]
    Payload { seq: u64, source: ParseError },
    #[error("seq {0} appears more than once")]
    DuplicateSeq(u64),
    #[error("{0:?} does not start with a header")]
    MissingHeader(PathBuf),
}

/// One step of a replay, in processing order.
#[derive(Debug, Clone)]
pub enum ReplayStep {
    Depth { seq: u64, decision: Decision },
    Snapshot { seq: u64, decision: Decision },
    Disconnect { seq: u64, decision: Decision },
    Trade { seq: u64, trade: Trade },
}

impl ReplayStep {
    pub fn seq(&self) -> u64 {
        match self {
            ReplayStep::Depth { seq, .. }
            | ReplayStep::Snapshot { seq, .. }
            | ReplayStep::Disconnect { seq, .. }
            | ReplayStep::Trade { seq, .. } => *seq,
        }
    }

    pub fn decision(&self) -> Option<&Decision> {
        match self {
            ReplayStep::Depth { decision, .. }
            | ReplayStep::Snapshot { decision, .. }
            | ReplayStep::Disconnect { decision, .. } => Some(decision),
            ReplayStep::Trade { .. } => None,
        }
    }
}

pub struct Replay {
    pub reconciler: Reconciler,
    pub steps: Vec<ReplayStep>,
    pub decisions: DecisionTally,
}

/// Every payload frame of a session, ordered by `seq`, plus the reconciler
/// settings the live session ran with.
pub struct Recording {
    pub pending_capacity: usize,
    pub frames: Vec<RecordFrame>,
}

pub fn load_session(layout: &SessionLayout) -> Result<Recording, ReplayError> {
    let depth_path = layout.path(StreamKind::Depth);
    let mut pending_capacity = None;
    let mut frames = Vec::new();
    for kind in StreamKind::ALL {
        for frame in read_frames(&layout.path(kind))? {
            match frame {
                RecordFrame::Header(h) if kind == StreamKind::Depth => pending_capacity = Some(h.pending_capacity),
                RecordFrame::Header(_) => {}
                other => frames.push(other),
            }
        }
    }
    let pending_capacity = pending_capacity.ok_or(ReplayError::MissingHeader(depth_path))?;
    frames.sort_by_key(|f| f.seq().unwrap_or_default());
    if let Some(w) = frames.windows(2).find(|w| w[0].seq() == w[1].seq()) {
        return Err(ReplayError::DuplicateSeq(w[0].seq().unwrap_or_default()));
    }
    Ok(Recording { pending_capacity, frames })
}

/// Drive a fresh reconciler through an ordered list of frames.
pub fn replay_frames(frames: &[RecordFrame], pending_capacity: usize) -> Result<Replay, ReplayError> {
    let mut reconciler = Reconciler::new(pending_capacity);
    let mut steps = Vec::with_capacity(frames.len());
    let mut decisions = DecisionTally::default();
    for frame in frames {
        let step = match frame {
            // the live loop does not reconcile these either
            RecordFrame::Header(_) | RecordFrame::Unparsed(_) => continue,
            RecordFrame::Envelope(r) => {
                let envelope =
                    DiffEnvelope::parse(r.raw.get()).map_err(|source| ReplayError::Payload { seq: r.seq, source })?;
                match envelope {
                    DiffEnvelope::DepthUpdate(update) => {
                        ReplayStep::Depth { seq: r.seq, decision: reconciler.on_depth(update) }
                    }
                    DiffEnvelope::Trade(trade) => ReplayStep::Trade { seq: r.seq, trade },
                }
            }
            RecordFrame::Snapshot(r) => {
                let snapshot = Snapshot::parse(r.raw.get(), r.recv_unix_ns)
                    .map_err(|source| ReplayError::Payload { seq: r.seq, source })?;
                ReplayStep::Snapshot { seq: r.seq, decision: reconciler.on_snapshot(snapshot) }
            }
            RecordFrame::Disconnect(m) => ReplayStep::Disconnect { seq: m.seq, decision: reconciler.on_disconnect() },
        };
        if let Some(decision) = step.decision() {
            decisions.observe(decision);
        }
        steps.push(step);
    }
    Ok(Replay { reconciler, steps, decisions })
}

/// Replay a session with the buffer capacity recorded in its header.
pub fn replay_session(layout: &SessionLayout) -> Result<Replay, ReplayError> {
    let recording = load_session(layout)?;
    replay_frames(&recording.frames, recording.pending_capacity)
}
