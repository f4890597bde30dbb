#![allow(dead_code)]

use depth_capture::backoff::BackoffPolicy;
use depth_capture::config::{SessionConfig, Venue};
use depth_capture::snapshot::{FetchError, FetchedSnapshot, SnapshotSource};
use depth_capture::stream::{EventSource, StreamError};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub fn depth(first: u64, last: u64, bids: &[(&str, &str)], asks: &[(&str, &str)]) -> String {
    let levels = |ls: &[(&str, &str)]| {
        ls.iter().map(|(p, q)| format!(r#"["{p}","{q}"]"#)).collect::<Vec<_>>().join(",")
    };
    format!(
        r#"{{"stream":"btcusdt@depth@100ms","data":{{"e":"depthUpdate","E":1700000000000,"s":"BTCUSDT","U":{first},"u":{last},"b":[{}],"a":[{}]}}}}"#,
        levels(bids),
        levels(asks)
    )
}

pub fn trade(id: u64, price: &str, qty: &str) -> String {
    format!(
        r#"{{"stream":"btcusdt@trade","data":{{"e":"trade","E":1700000000001,"s":"BTCUSDT","t":{id},"p":"{price}","q":"{qty}","T":1700000000001,"m":false}}}}"#
    )
}

pub fn snapshot_body(seq: u64) -> String {
    format!(r#"{{"lastUpdateId":{seq},"bids":[["100.00","1.0"],["99.00","3.0"]],"asks":[["101.00","1.5"]]}}"#)
}

pub fn config(root: &Path) -> SessionConfig {
    let mut cfg = SessionConfig::new(Venue::Binance, "btcusdt", root);
    cfg.duration = Duration::from_secs(30);
    cfg.resnapshot_interval = Duration::from_secs(3600);
    cfg.pending_capacity = 64;
    cfg.snapshot_attempts = 2;
    cfg.reconnect_attempts = 3;
    cfg.backoff = BackoffPolicy {
        base: Duration::from_millis(1),
        max: Duration::from_millis(2),
        multiplier: 2.0,
    };
    cfg.flush_interval = Duration::from_millis(10);
    cfg
}

/// Serves snapshot bodies in order; fails once the script runs out.
pub struct ScriptedSnapshots {
    failures: usize,
    bodies: VecDeque<String>,
    pub calls: Arc<AtomicUsize>,
}

impl ScriptedSnapshots {
    pub fn new(seqs: &[u64]) -> Self {
        Self::failing_first(0, seqs)
    }

    /// The first `failures` fetches answer 503, then the script is served.
    pub fn failing_first(failures: usize, seqs: &[u64]) -> Self {
        Self {
            failures,
            bodies: seqs.iter().map(|s| snapshot_body(*s)).collect(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl SnapshotSource for ScriptedSnapshots {
    fn fetch(&mut self) -> Result<FetchedSnapshot, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failures > 0 {
            self.failures -= 1;
            return Err(FetchError::Status(503));
        }
        let body = self.bodies.pop_front().ok_or(FetchError::Status(503))?;
        Ok(FetchedSnapshot::from_body(body, 0)?)
    }
}

/// Each inner vec is one connection. A connection ends with a disconnect,
/// except the last one, which ends the stream for good.
pub struct ScriptedStream {
    connections: VecDeque<Vec<String>>,
    current: VecDeque<String>,
}

impl ScriptedStream {
    pub fn new(connections: Vec<Vec<String>>) -> Self {
        Self { connections: connections.into(), current: VecDeque::new() }
    }
}

impl EventSource for ScriptedStream {
    fn connect(&mut self) -> Result<(), StreamError> {
        let next = self.connections.pop_front().ok_or(StreamError::Finished)?;
        self.current = next.into();
        Ok(())
    }

    fn next_message(&mut self) -> Result<Option<String>, StreamError> {
        match self.current.pop_front() {
            Some(text) => Ok(Some(text)),
            None if self.connections.is_empty() => Err(StreamError::Finished),
            None => Ok(None),
        }
    }
}

pub const ACK: &str = r#"{"result":null,"id":1}"#;

/// Never ends: plays `frames`, then emits a subscription ack every few
/// milliseconds.
#[derive(Default)]
pub struct IdleStream {
    frames: VecDeque<String>,
}

impl IdleStream {
    pub fn after(frames: Vec<String>) -> Self {
        Self { frames: frames.into() }
    }
}

impl EventSource for IdleStream {
    fn connect(&mut self) -> Result<(), StreamError> {
        Ok(())
    }

    fn next_message(&mut self) -> Result<Option<String>, StreamError> {
        if let Some(text) = self.frames.pop_front() {
            return Ok(Some(text));
        }
        std::thread::sleep(Duration::from_millis(5));
        Ok(Some(ACK.to_string()))
    }
}
