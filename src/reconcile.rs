//! Snapshot/diff synchronization state machine.
//!
//! The [`Reconciler`] owns the [`LocalBook`] and decides, for every snapshot
//! and depth update, whether to apply, buffer, discard or resync. It is pure
//! and synchronous: all I/O (fetching snapshots, recording) happens in the
//! supervisor, which acts on the returned [`Decision`].
//!
//! ```text
//!            snapshot, buffer covers seq+1
//!   UNSYNCED ───────────────────────────────▶ SYNCED
//!      │  ▲                                     │ ▲
//!      │  │ gap / disconnect                    │ │ contiguous update
//!      │  └─────────────────────────────────────┘ │
//!      │ snapshot, no cover                       │
//!      ▼                                          │
//!   BUFFERING ────────────────────────────────────┘
//!            update covers held.seq+1
//! ```
use crate::book::{LocalBook, SyncState};
use crate::envelope::DepthUpdate;
use crate::snapshot::Snapshot;
use serde::Serialize;
use std::collections::VecDeque;
use tracing::{debug, info, warn};

/// Bounded FIFO of depth updates held while no usable snapshot is installed.
#[derive(Debug, Clone)]
pub struct PendingBuffer {
    items: VecDeque<DepthUpdate>,
    capacity: usize,
}

impl PendingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self { items: VecDeque::new(), capacity: capacity.max(1) }
    }

    /// Append; returns the evicted oldest entry when over capacity.
    pub fn push(&mut self, update: DepthUpdate) -> Option<DepthUpdate> {
        self.items.push_back(update);
        if self.items.len() > self.capacity { self.items.pop_front() } else { None }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &DepthUpdate> {
        self.items.iter()
    }
}

/// Outcome of one reconciler step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    /// Contiguous update applied while SYNCED.
    Applied { last_applied_seq: u64 },
    /// A snapshot was installed and bridged to the stream. `skipped` buffered
    /// updates sat ahead of the bridging one and were dropped.
    Synced { snapshot_seq: u64, bridged: usize, skipped: usize, last_applied_seq: u64 },
    /// Already covered by the book (duplicate or pre-snapshot).
    Stale { first_seq: u64, last_seq: u64 },
    /// Held until a covering snapshot arrives. `snapshot_behind` is set once
    /// per held snapshot when the stream has already moved past it.
    Buffered { pending: usize, snapshot_behind: bool },
    /// Buffer overflowed; the oldest update was dropped.
    Evicted { dropped_first_seq: u64, dropped_last_seq: u64 },
    /// Continuity lost; the book was cleared. Non-zero `bridged`/`skipped`
    /// only when the gap was found while draining the buffer after a snapshot.
    Gap { expected: u64, first_seq: u64, bridged: usize, skipped: usize },
    /// Snapshot kept while waiting for a covering update.
    SnapshotHeld { snapshot_seq: u64, pending: usize, snapshot_behind: bool },
    /// Snapshot received while SYNCED; not used.
    SnapshotIgnored { snapshot_seq: u64, last_applied_seq: u64 },
    /// Stream disconnected; everything dropped.
    Reset,
}

impl Decision {
    /// Whether the supervisor must fetch a fresh snapshot right away.
    pub fn needs_snapshot(&self) -> bool {
        match self {
            Decision::Gap { .. } | Decision::Evicted { .. } => true,
            Decision::Buffered { snapshot_behind, .. } | Decision::SnapshotHeld { snapshot_behind, .. } => {
                *snapshot_behind
            }
            _ => false,
        }
    }
}

/// Decision counters, shared by live sessions and replays so the two can be
/// compared field by field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DecisionTally {
    pub applied: u64,
    pub synced: u64,
    pub stale: u64,
    /// Buffered updates dropped because they preceded the bridging update.
    pub skipped: u64,
    pub buffered: u64,
    pub evicted: u64,
    pub gaps: u64,
    pub snapshots_held: u64,
    pub snapshots_ignored: u64,
    pub resets: u64,
}

impl DecisionTally {
    pub fn observe(&mut self, decision: &Decision) {
        match decision {
            Decision::Applied { .. } => self.applied += 1,
            Decision::Synced { bridged, skipped, .. } => {
                self.synced += 1;
                self.applied += *bridged as u64;
                self.skipped += *skipped as u64;
            }
            Decision::Stale { .. } => self.stale += 1,
            Decision::Buffered { .. } => self.buffered += 1,
            Decision::Evicted { .. } => self.evicted += 1,
            Decision::Gap { bridged, skipped, .. } => {
                self.gaps += 1;
                self.applied += *bridged as u64;
                self.skipped += *skipped as u64;
            }
            Decision::SnapshotHeld { .. } => self.snapshots_held += 1,
            Decision::SnapshotIgnored { .. } => self.snapshots_ignored += 1,
            Decision::Reset => self.resets += 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Reconciler {
    book: LocalBook,
    held: Option<Snapshot>,
    behind_signalled: bool,
    pending: PendingBuffer,
}

impl Reconciler {
    pub fn new(pending_capacity: usize) -> Self {
        Self {
            book: LocalBook::default(),
            held: None,
            behind_signalled: false,
            pending: PendingBuffer::new(pending_capacity),
        }
    }

    pub fn state(&self) -> SyncState {
        self.book.state
    }

    pub fn book(&self) -> &LocalBook {
        &self.book
    }

    pub fn pending(&self) -> &PendingBuffer {
        &self.pending
    }

    pub fn held_sequence(&self) -> Option<u64> {
        self.held.as_ref().map(|s| s.sequence)
    }

    /// Feed a freshly fetched snapshot.
    pub fn on_snapshot(&mut self, snapshot: Snapshot) -> Decision {
        if self.book.state == SyncState::Synced {
            info!(
                snapshot_seq = snapshot.sequence,
                last_applied_seq = self.book.last_applied_seq,
                "snapshot received while synced, ignoring"
            );
            return Decision::SnapshotIgnored {
                snapshot_seq: snapshot.sequence,
                last_applied_seq: self.book.last_applied_seq,
            };
        }

        let seq = snapshot.sequence;
        let target = seq.saturating_add(1);
        let buffered: Vec<DepthUpdate> = self.pending.items.drain(..).filter(|u| u.last_seq > seq).collect();

        match buffered.iter().position(|u| u.covers(target)) {
            Some(idx) => {
                let skipped = idx;
                if skipped > 0 {
                    debug!(skipped, "dropping buffered updates ahead of the bridging one");
                }
                self.install(snapshot);
                let mut bridged = 0usize;
                for update in buffered.into_iter().skip(idx) {
                    match self.apply_synced(update) {
                        Decision::Applied { .. } => bridged += 1,
                        Decision::Gap { expected, first_seq, .. } => {
                            return Decision::Gap { expected, first_seq, bridged, skipped };
                        }
                        _ => {}
                    }
                }
                info!(snapshot_seq = seq, bridged, last_applied_seq = self.book.last_applied_seq, "book synced");
                Decision::Synced { snapshot_seq: seq, bridged, skipped, last_applied_seq: self.book.last_applied_seq }
            }
            None => {
                // everything left starts after seq+1: the stream is ahead of this snapshot
                let snapshot_behind = !buffered.is_empty();
                for update in buffered {
                    self.pending.push(update);
                }
                self.held = Some(snapshot);
                self.behind_signalled = snapshot_behind;
                self.book.state = SyncState::Buffering;
                if snapshot_behind {
                    warn!(snapshot_seq = seq, pending = self.pending.len(), "snapshot is older than buffered stream");
                }
                Decision::SnapshotHeld { snapshot_seq: seq, pending: self.pending.len(), snapshot_behind }
            }
        }
    }

    /// Feed one depth update, in stream order.
    pub fn on_depth(&mut self, update: DepthUpdate) -> Decision {
        match self.book.state {
            SyncState::Synced => self.apply_synced(update),
            SyncState::Unsynced => self.buffer(update, false),
            SyncState::Buffering => {
                let Some(held_seq) = self.held_sequence() else {
                    // unreachable in practice: BUFFERING always holds a snapshot
                    self.book.state = SyncState::Unsynced;
                    return self.buffer(update, false);
                };
                if update.last_seq <= held_seq {
                    return Decision::Stale { first_seq: update.first_seq, last_seq: update.last_seq };
                }
                if update.first_seq <= held_seq.saturating_add(1) {
                    if let Some(snapshot) = self.held.take() {
                        self.install(snapshot);
                    }
                    self.pending.clear();
                    self.book.apply_changes(&update.bid_changes, &update.ask_changes);
                    self.book.last_applied_seq = update.last_seq;
                    info!(snapshot_seq = held_seq, last_applied_seq = update.last_seq, "book synced");
                    return Decision::Synced {
                        snapshot_seq: held_seq,
                        bridged: 1,
                        skipped: 0,
                        last_applied_seq: update.last_seq,
                    };
                }
                let behind = !self.behind_signalled;
                self.behind_signalled = true;
                if behind {
                    warn!(held_seq, first_seq = update.first_seq, "stream moved past held snapshot");
                }
                self.buffer(update, behind)
            }
        }
    }

    /// The stream dropped: forget everything until a new snapshot arrives.
    pub fn on_disconnect(&mut self) -> Decision {
        self.pending.clear();
        self.held = None;
        self.behind_signalled = false;
        self.book.reset();
        Decision::Reset
    }

    fn buffer(&mut self, update: DepthUpdate, snapshot_behind: bool) -> Decision {
        match self.pending.push(update) {
            Some(dropped) => {
                warn!(
                    capacity = self.pending.capacity(),
                    dropped_first_seq = dropped.first_seq,
                    dropped_last_seq = dropped.last_seq,
                    "pending buffer full, evicted oldest update"
                );
                Decision::Evicted { dropped_first_seq: dropped.first_seq, dropped_last_seq: dropped.last_seq }
            }
            None => Decision::Buffered { pending: self.pending.len(), snapshot_behind },
        }
    }

    fn install(&mut self, snapshot: Snapshot) {
        self.book.install(snapshot.bids, snapshot.asks, snapshot.sequence);
        self.book.state = SyncState::Synced;
        self.held = None;
        self.behind_signalled = false;
    }

    fn apply_synced(&mut self, update: DepthUpdate) -> Decision {
        let last = self.book.last_applied_seq;
        if update.last_seq <= last {
            return Decision::Stale { first_seq: update.first_seq, last_seq: update.last_seq };
        }
        let expected = last.saturating_add(1);
        if update.first_seq <= expected {
            self.book.apply_changes(&update.bid_changes, &update.ask_changes);
            self.book.last_applied_seq = update.last_seq;
            return Decision::Applied { last_applied_seq: update.last_seq };
        }
        warn!(expected, first_seq = update.first_seq, "sequence gap, resyncing");
        self.pending.clear();
        self.held = None;
        self.book.reset();
        Decision::Gap { expected, first_seq: update.first_seq, bridged: 0, skipped: 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::{BookSide, Side};
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn snap(seq: u64) -> Snapshot {
        Snapshot {
            sequence: seq,
            bids: BookSide::from_levels(Side::Bid, vec![(d("100.00"), d("1")), (d("99.00"), d("3"))]),
            asks: BookSide::from_levels(Side::Ask, vec![(d("101.00"), d("2"))]),
            captured_at_ns: 0,
        }
    }

    fn upd(first: u64, last: u64, bids: &[(&str, &str)]) -> DepthUpdate {
        DepthUpdate {
            first_seq: first,
            last_seq: last,
            bid_changes: bids.iter().map(|(p, q)| (d(p), d(q))).collect(),
            ask_changes: vec![],
            event_time_ms: 0,
        }
    }

    fn synced_at(seq: u64) -> Reconciler {
        let mut r = Reconciler::new(16);
        r.on_snapshot(snap(seq));
        assert_eq!(r.state(), SyncState::Buffering);
        let dec = r.on_depth(upd(seq + 1, seq + 1, &[]));
        assert!(matches!(dec, Decision::Synced { .. }));
        r
    }

    #[test]
    fn scenario_a_snapshot_then_straddling_update() {
        let mut r = Reconciler::new(16);
        let held = r.on_snapshot(snap(1000));
        assert_eq!(held, Decision::SnapshotHeld { snapshot_seq: 1000, pending: 0, snapshot_behind: false });
        let dec = r.on_depth(upd(990, 1005, &[("100.50", "2.0")]));
        assert_eq!(dec, Decision::Synced { snapshot_seq: 1000, bridged: 1, skipped: 0, last_applied_seq: 1005 });
        assert_eq!(r.state(), SyncState::Synced);
        assert_eq!(r.book().last_applied_seq, 1005);
        assert_eq!(r.book().bids.get(d("100.50")), Some(d("2.0")));
        assert_eq!(r.book().best_bid().unwrap().price, d("100.5"));
    }

    #[test]
    fn scenario_b_zero_quantity_removes_level_and_repeat_is_noop() {
        let mut r = synced_at(10);
        let dec = r.on_depth(upd(12, 12, &[("99.00", "0")]));
        assert!(matches!(dec, Decision::Applied { last_applied_seq: 12 }));
        assert_eq!(r.book().bids.get(d("99")), None);
        let before = r.book().clone();
        let again = r.on_depth(upd(12, 12, &[("99.00", "0")]));
        assert_eq!(again, Decision::Stale { first_seq: 12, last_seq: 12 });
        assert_eq!(r.book(), &before);
    }

    #[test]
    fn scenario_c_updates_before_any_snapshot_are_retained() {
        let mut r = Reconciler::new(16);
        assert_eq!(r.on_depth(upd(500, 510, &[])), Decision::Buffered { pending: 1, snapshot_behind: false });
        assert_eq!(r.on_depth(upd(511, 520, &[])), Decision::Buffered { pending: 2, snapshot_behind: false });
        assert_eq!(r.state(), SyncState::Unsynced);
        assert_eq!(r.pending().len(), 2);
        let dec = r.on_snapshot(snap(505));
        assert_eq!(dec, Decision::Synced { snapshot_seq: 505, bridged: 2, skipped: 0, last_applied_seq: 520 });
        assert!(r.pending().is_empty());
    }

    #[test]
    fn merge_is_deterministic_between_buffered_and_direct_paths() {
        let u1 = upd(95, 101, &[("100.00", "5"), ("98.00", "1")]);
        let u2 = upd(102, 105, &[("98.00", "0"), ("100.50", "2")]);

        let mut buffered = Reconciler::new(16);
        buffered.on_depth(u1.clone());
        buffered.on_depth(u2.clone());
        let dec = buffered.on_snapshot(snap(100));
        assert_eq!(dec, Decision::Synced { snapshot_seq: 100, bridged: 2, skipped: 0, last_applied_seq: 105 });

        let mut direct = Reconciler::new(16);
        direct.on_snapshot(snap(100));
        direct.on_depth(u1);
        direct.on_depth(u2);

        assert_eq!(buffered.book().bids, direct.book().bids);
        assert_eq!(buffered.book().asks, direct.book().asks);
        assert_eq!(buffered.book().last_applied_seq, direct.book().last_applied_seq);
        assert_eq!(buffered.state(), direct.state());
    }

    #[test]
    fn gap_while_synced_resets_once_and_requests_snapshot() {
        let mut r = synced_at(10);
        let dec = r.on_depth(upd(15, 16, &[]));
        assert_eq!(dec, Decision::Gap { expected: 12, first_seq: 15, bridged: 0, skipped: 0 });
        assert!(dec.needs_snapshot());
        assert_eq!(r.state(), SyncState::Unsynced);
        assert!(r.book().bids.is_empty() && r.book().asks.is_empty());
        // further updates are buffered, not more gaps
        let next = r.on_depth(upd(17, 18, &[]));
        assert!(!next.needs_snapshot());
        assert!(matches!(next, Decision::Buffered { pending: 1, .. }));
    }

    #[test]
    fn buffering_discards_pre_snapshot_updates() {
        let mut r = Reconciler::new(16);
        r.on_snapshot(snap(200));
        assert_eq!(r.on_depth(upd(190, 200, &[])), Decision::Stale { first_seq: 190, last_seq: 200 });
        assert_eq!(r.state(), SyncState::Buffering);
    }

    #[test]
    fn buffering_signals_snapshot_behind_once() {
        let mut r = Reconciler::new(16);
        r.on_snapshot(snap(200));
        let first = r.on_depth(upd(250, 260, &[]));
        assert_eq!(first, Decision::Buffered { pending: 1, snapshot_behind: true });
        assert!(first.needs_snapshot());
        let second = r.on_depth(upd(261, 270, &[]));
        assert_eq!(second, Decision::Buffered { pending: 2, snapshot_behind: false });
        // a newer snapshot replaces the held one and bridges from the buffer
        let dec = r.on_snapshot(snap(255));
        assert_eq!(dec, Decision::Synced { snapshot_seq: 255, bridged: 2, skipped: 0, last_applied_seq: 270 });
    }

    #[test]
    fn snapshot_older_than_buffer_is_flagged() {
        let mut r = Reconciler::new(16);
        r.on_depth(upd(300, 310, &[]));
        let dec = r.on_snapshot(snap(100));
        assert_eq!(dec, Decision::SnapshotHeld { snapshot_seq: 100, pending: 1, snapshot_behind: true });
        assert!(dec.needs_snapshot());
    }

    #[test]
    fn overflow_evicts_oldest_and_requests_snapshot() {
        let mut r = Reconciler::new(2);
        r.on_depth(upd(1, 1, &[]));
        r.on_depth(upd(2, 2, &[]));
        let dec = r.on_depth(upd(3, 3, &[]));
        assert_eq!(dec, Decision::Evicted { dropped_first_seq: 1, dropped_last_seq: 1 });
        assert!(dec.needs_snapshot());
        let kept: Vec<u64> = r.pending().iter().map(|u| u.first_seq).collect();
        assert_eq!(kept, vec![2, 3]);
    }

    #[test]
    fn gap_inside_buffer_drain_is_reported() {
        let mut r = Reconciler::new(16);
        r.on_depth(upd(95, 101, &[]));
        r.on_depth(upd(102, 104, &[]));
        r.on_depth(upd(110, 112, &[]));
        let dec = r.on_snapshot(snap(100));
        assert_eq!(dec, Decision::Gap { expected: 105, first_seq: 110, bridged: 2, skipped: 0 });
        assert_eq!(r.state(), SyncState::Unsynced);

        // updates applied before the gap still show up in the tally
        let mut t = DecisionTally::default();
        t.observe(&dec);
        assert_eq!((t.gaps, t.applied), (1, 2));
    }

    #[test]
    fn updates_ahead_of_the_bridging_one_are_counted_as_skipped() {
        let mut r = Reconciler::new(16);
        r.on_depth(upd(105, 106, &[]));
        r.on_depth(upd(101, 102, &[("97.00", "1")]));
        let dec = r.on_snapshot(snap(100));
        assert_eq!(dec, Decision::Synced { snapshot_seq: 100, bridged: 1, skipped: 1, last_applied_seq: 102 });
        assert_eq!(r.book().bids.get(d("97.00")), Some(d("1")));

        let mut t = DecisionTally::default();
        t.observe(&dec);
        assert_eq!((t.synced, t.applied, t.skipped), (1, 1, 1));
    }

    #[test]
    fn sequence_numbers_at_the_top_of_the_range_do_not_overflow() {
        let mut r = Reconciler::new(16);
        r.on_snapshot(snap(u64::MAX - 1));
        let dec = r.on_depth(upd(u64::MAX, u64::MAX, &[]));
        assert!(matches!(dec, Decision::Synced { last_applied_seq: u64::MAX, .. }));
        let again = r.on_depth(upd(u64::MAX, u64::MAX, &[]));
        assert_eq!(again, Decision::Stale { first_seq: u64::MAX, last_seq: u64::MAX });

        let mut held = Reconciler::new(16);
        held.on_snapshot(snap(u64::MAX));
        assert!(matches!(held.on_depth(upd(5, u64::MAX, &[])), Decision::Stale { .. }));
    }

    #[test]
    fn snapshot_while_synced_is_ignored() {
        let mut r = synced_at(10);
        let before = r.book().clone();
        let dec = r.on_snapshot(snap(50));
        assert_eq!(dec, Decision::SnapshotIgnored { snapshot_seq: 50, last_applied_seq: 11 });
        assert_eq!(r.book(), &before);
    }

    #[test]
    fn disconnect_resets_from_any_state() {
        let mut r = synced_at(10);
        r.on_depth(upd(12, 13, &[("1", "1")]));
        assert_eq!(r.on_disconnect(), Decision::Reset);
        assert_eq!(r.state(), SyncState::Unsynced);
        assert!(r.book().bids.is_empty());

        let mut b = Reconciler::new(4);
        b.on_snapshot(snap(5));
        b.on_depth(upd(9, 9, &[]));
        b.on_disconnect();
        assert!(b.pending().is_empty());
        assert_eq!(b.held_sequence(), None);
    }

    #[test]
    fn tally_counts_bridged_updates_as_applied() {
        let mut t = DecisionTally::default();
        t.observe(&Decision::Synced { snapshot_seq: 1, bridged: 3, skipped: 0, last_applied_seq: 9 });
        t.observe(&Decision::Gap { expected: 10, first_seq: 12, bridged: 0, skipped: 0 });
        t.observe(&Decision::Reset);
        assert_eq!((t.synced, t.applied, t.gaps, t.resets), (1, 3, 1, 1));
    }
}
