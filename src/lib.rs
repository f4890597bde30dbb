//! Order-book depth capture library.
//!
//! This crate provides the core types and logic used by the `depth_capture`
//! recorder binary and the `player` tool:
//!
//! - `envelope`: ingress parsing of stream frames into depth updates and trades
//! - `snapshot`: full-state snapshot fetching with bounded retries
//! - `stream`: reconnecting websocket source and its pump thread
//! - `book`: price-level book sides and the live mirror
//! - `reconcile`: the snapshot/diff synchronization state machine
//! - `record`: durable on-disk schema (compressed JSON lines, CRC per payload)
//! - `supervisor`: session lifetime, resnapshot timer, ordered shutdown
//! - `replay`: re-drive a recorded session through the reconciler
//!
//! The binaries in this repository (`src/main.rs` and `src/bin/player.rs`)
//! use these modules to capture a venue feed and to inspect what was written.
pub mod backoff;
pub mod book;
pub mod config;
pub mod envelope;
pub mod reconcile;
pub mod record;
pub mod replay;
pub mod snapshot;
pub mod status;
pub mod stream;
pub mod supervisor;
