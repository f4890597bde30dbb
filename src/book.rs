//! Price-level order book model driven by the reconciler.
//!
//! This module defines the aggregated Level-2 representation (`BookSide`,
//! `PriceLevel`, `LocalBook`) plus the helpers used to apply venue changes:
//! - Full side replacement from a snapshot
//! - Per-level upserts, with a zero quantity meaning "delete this level"
//! - O(1) best-level reads through a cached top of book
//!
//! Prices are `rust_decimal::Decimal` so that `100.50` and `100.5` address the
//! same level regardless of how the venue formats them.
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;

/// Which side of the book a level lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Bid,
    Ask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PriceLevel {
    /// Price identity key.
    pub price: Decimal,
    /// Aggregated resting quantity, always strictly positive when stored.
    pub quantity: Decimal,
}

/// One side of the book: price -> quantity, iterated best first.
#[derive(Debug, Clone, PartialEq)]
pub struct BookSide {
    side: Side,
    levels: BTreeMap<Decimal, Decimal>,
    best: Option<PriceLevel>,
}

impl BookSide {
    pub fn new(side: Side) -> Self {
        Self { side, levels: BTreeMap::new(), best: None }
    }

    /// Build a side from raw `(price, qty)` pairs, skipping zero quantities.
    pub fn from_levels<I>(side: Side, levels: I) -> Self
    where
        I: IntoIterator<Item = (Decimal, Decimal)>,
    {
        let mut out = Self::new(side);
        for (price, qty) in levels {
            out.apply(price, qty);
        }
        out
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn get(&self, price: Decimal) -> Option<Decimal> {
        self.levels.get(&price).copied()
    }

    /// Best bid (highest) or best ask (lowest), read from the cache.
    pub fn best(&self) -> Option<PriceLevel> {
        self.best
    }

    fn is_better(&self, a: Decimal, b: Decimal) -> bool {
        match self.side {
            Side::Bid => a > b,
            Side::Ask => a < b,
        }
    }

    fn recompute_best(&mut self) {
        let top = match self.side {
            Side::Bid => self.levels.iter().next_back(),
            Side::Ask => self.levels.iter().next(),
        };
        self.best = top.map(|(p, q)| PriceLevel { price: *p, quantity: *q });
    }

    /// Apply one venue change: zero deletes the level, anything else upserts it.
    pub fn apply(&mut self, price: Decimal, qty: Decimal) {
        if qty.is_zero() {
            self.remove(price);
        } else {
            self.upsert(price, qty);
        }
    }

    pub fn upsert(&mut self, price: Decimal, qty: Decimal) {
        if qty.is_zero() {
            self.remove(price);
            return;
        }
        self.levels.insert(price, qty);
        let replace = match self.best {
            None => true,
            Some(b) => b.price == price || self.is_better(price, b.price),
        };
        if replace {
            self.best = Some(PriceLevel { price, quantity: qty });
        }
    }

    /// Remove a level; returns the quantity it held, `None` if it was absent.
    pub fn remove(&mut self, price: Decimal) -> Option<Decimal> {
        let removed = self.levels.remove(&price);
        if removed.is_some() && self.best.is_some_and(|b| b.price == price) {
            self.recompute_best();
        }
        removed
    }

    pub fn clear(&mut self) {
        self.levels.clear();
        self.best = None;
    }

    /// Levels from best to worst.
    pub fn levels(&self) -> Box<dyn Iterator<Item = PriceLevel> + '_> {
        let it = self.levels.iter().map(|(p, q)| PriceLevel { price: *p, quantity: *q });
        match self.side {
            Side::Bid => Box::new(it.rev()),
            Side::Ask => Box::new(it),
        }
    }

    /// First `n` levels from best to worst.
    pub fn top(&self, n: usize) -> Vec<PriceLevel> {
        self.levels().take(n).collect()
    }
}

/// Synchronization state of the mirror relative to the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncState {
    Unsynced,
    Buffering,
    Synced,
}

/// The live mirror owned by the reconciler.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalBook {
    pub bids: BookSide,
    pub asks: BookSide,
    /// `u` of the last depth update applied, or the snapshot sequence.
    pub last_applied_seq: u64,
    pub state: SyncState,
    /// Incremented on every reset and every snapshot install.
    pub epoch: u64,
}

impl Default for LocalBook {
    fn default() -> Self {
        Self {
            bids: BookSide::new(Side::Bid),
            asks: BookSide::new(Side::Ask),
            last_applied_seq: 0,
            state: SyncState::Unsynced,
            epoch: 0,
        }
    }
}

impl LocalBook {
    /// Apply both change lists of a depth update. Bid and ask lists do not
    /// interact, so their relative order is irrelevant.
    pub fn apply_changes(&mut self, bids: &[(Decimal, Decimal)], asks: &[(Decimal, Decimal)]) {
        for &(price, qty) in bids {
            self.bids.apply(price, qty);
        }
        for &(price, qty) in asks {
            self.asks.apply(price, qty);
        }
    }

    /// Replace both sides with a snapshot's state and start a new epoch.
    pub fn install(&mut self, bids: BookSide, asks: BookSide, sequence: u64) {
        self.bids = bids;
        self.asks = asks;
        self.last_applied_seq = sequence;
        self.epoch += 1;
    }

    /// Drop all levels and fall back to UNSYNCED in a new epoch.
    pub fn reset(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.last_applied_seq = 0;
        self.state = SyncState::Unsynced;
        self.epoch += 1;
    }

    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bids.best()
    }

    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.asks.best()
    }

    /// True when the best bid is at or above the best ask.
    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => b.price >= a.price,
            _ => false,
        }
    }
}
