use crate::book::SyncState;
use crate::reconcile::DecisionTally;
use crate::record::SessionLayout;
use serde::Serialize;

/// Why the session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    DurationElapsed,
    Interrupted,
    StreamEnded,
    Fatal,
}

/// Final report of a capture session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session: String,
    pub venue: String,
    pub symbol: String,
    /// Where the raw partitions of this session were written.
    pub layout: SessionLayout,
    pub stop_reason: StopReason,
    pub final_state: SyncState,
    pub synced: bool,
    pub last_applied_seq: u64,
    pub depth_recorded: u64,
    pub trades_recorded: u64,
    pub snapshots_recorded: u64,
    pub disconnects: u64,
    /// Frames that were not envelopes (acks, malformed payloads); recorded, not reconciled.
    pub ignored_frames: u64,
    pub decisions: DecisionTally,
    /// Snapshot fetches requested by the reconciler (gaps, evictions, stale snapshots, reconnects).
    pub resync_requests: u64,
    pub snapshot_failures: u64,
    /// Set when a snapshot could not be fetched within the retry bound.
    pub snapshot_unavailable: bool,
    pub trades_forwarded: u64,
    pub trades_dropped: u64,
    pub fatal: Option<String>,
}

impl SessionStatus {
    pub fn envelopes_recorded(&self) -> u64 {
        self.depth_recorded + self.trades_recorded
    }

    pub fn gaps(&self) -> u64 {
        self.decisions.gaps
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.is_some()
    }
}
