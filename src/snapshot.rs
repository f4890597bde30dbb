//! Full-state snapshot fetching.
//!
//! A [`SnapshotSource`] answers "what is the whole book right now" together
//! with the venue's sequence marker. [`RestSnapshotSource`] implements it on
//! top of the venue's depth endpoint; [`fetch_with_retry`] wraps any source
//! with capped exponential backoff bounded by the session deadline.
use crate::backoff::{Backoff, BackoffPolicy};
use crate::book::{BookSide, Side};
use crate::config::Venue;
use crate::envelope::{ParseError, parse_levels};
use serde::Deserialize;
use serde_json::value::RawValue;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("venue answered with status {0}")]
    Status(u16),
    #[error("malformed snapshot: {0}")]
    Decode(#[from] ParseError),
    #[error("snapshot source unavailable: {0}")]
    Unavailable(String),
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: Box<FetchError> },
}

/// Immutable full book state at `sequence`.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub sequence: u64,
    pub bids: BookSide,
    pub asks: BookSide,
    pub captured_at_ns: u64,
}

impl Snapshot {
    /// Parse the venue's depth response (`lastUpdateId`, `bids`, `asks`).
    pub fn parse(text: &str, captured_at_ns: u64) -> Result<Self, ParseError> {
        let wire: WireSnapshot = serde_json::from_str(text)?;
        Ok(Self {
            sequence: wire.last_update_id,
            bids: BookSide::from_levels(Side::Bid, parse_levels(&wire.bids)?),
            asks: BookSide::from_levels(Side::Ask, parse_levels(&wire.asks)?),
            captured_at_ns,
        })
    }
}

#[derive(Deserialize)]
struct WireSnapshot {
    #[serde(rename = "lastUpdateId")]
    last_update_id: u64,
    #[serde(default)]
    bids: Vec<Vec<String>>,
    #[serde(default)]
    asks: Vec<Vec<String>>,
}

/// A snapshot plus the verbatim response body it was parsed from.
#[derive(Debug, Clone)]
pub struct FetchedSnapshot {
    pub raw: Box<RawValue>,
    pub snapshot: Snapshot,
}

impl FetchedSnapshot {
    pub fn from_body(body: String, captured_at_ns: u64) -> Result<Self, ParseError> {
        let snapshot = Snapshot::parse(&body, captured_at_ns)?;
        let raw = RawValue::from_string(body)?;
        Ok(Self { raw, snapshot })
    }
}

pub trait SnapshotSource {
    fn fetch(&mut self) -> Result<FetchedSnapshot, FetchError>;
}

pub(crate) fn now_unix_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Depth snapshots over the venue's REST API.
pub struct RestSnapshotSource {
    client: reqwest::blocking::Client,
    url: String,
    symbol: String,
    limit: u32,
}

impl RestSnapshotSource {
    pub fn new(venue: Venue, symbol: &str, limit: u32, timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: format!("{}/api/v3/depth", venue.rest_base()),
            symbol: symbol.to_uppercase(),
            limit,
        })
    }
}

impl SnapshotSource for RestSnapshotSource {
    fn fetch(&mut self) -> Result<FetchedSnapshot, FetchError> {
        let limit = self.limit.to_string();
        let resp = self
            .client
            .get(&self.url)
            .query(&[("symbol", self.symbol.as_str()), ("limit", limit.as_str())])
            .send()?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        let body = resp.text()?;
        Ok(FetchedSnapshot::from_body(body, now_unix_ns())?)
    }
}

/// Fetch with capped exponential backoff. Gives up after `max_attempts`
/// tries, or earlier when the next sleep would overrun `deadline`.
pub fn fetch_with_retry<S: SnapshotSource + ?Sized>(
    source: &mut S,
    policy: BackoffPolicy,
    max_attempts: u32,
    deadline: Instant,
) -> Result<FetchedSnapshot, FetchError> {
    let mut backoff = Backoff::new(policy);
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match source.fetch() {
            Ok(fetched) => {
                debug!(attempts, sequence = fetched.snapshot.sequence, "snapshot fetched");
                return Ok(fetched);
            }
            Err(e) => {
                let delay = backoff.next_delay();
                if attempts >= max_attempts.max(1) || Instant::now() + delay >= deadline {
                    return Err(FetchError::Exhausted { attempts, last: Box::new(e) });
                }
                warn!(attempts, error = %e, delay_ms = delay.as_millis() as u64, "snapshot fetch failed, retrying");
                std::thread::sleep(delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::collections::VecDeque;
    use std::str::FromStr;

    struct Scripted(VecDeque<Result<FetchedSnapshot, FetchError>>, u32);

    impl SnapshotSource for Scripted {
        fn fetch(&mut self) -> Result<FetchedSnapshot, FetchError> {
            self.1 += 1;
            self.0.pop_front().unwrap_or(Err(FetchError::Unavailable("empty".into())))
        }
    }

    fn fast() -> BackoffPolicy {
        BackoffPolicy { base: Duration::from_millis(1), max: Duration::from_millis(2), multiplier: 2.0 }
    }

    fn body(seq: u64) -> String {
        format!(r#"{{"lastUpdateId":{seq},"bids":[["100.0","1.5"],["99.0","0"]],"asks":[["101.0","2"]]}}"#)
    }

    #[test]
    fn parses_depth_body() {
        let f = FetchedSnapshot::from_body(body(1000), 9).unwrap();
        assert_eq!(f.snapshot.sequence, 1000);
        assert_eq!(f.snapshot.bids.len(), 1);
        assert_eq!(f.snapshot.asks.best().unwrap().price, Decimal::from_str("101").unwrap());
        assert_eq!(f.snapshot.captured_at_ns, 9);
        assert_eq!(f.raw.get(), body(1000));
    }

    #[test]
    fn missing_sequence_is_decode_error() {
        assert!(FetchedSnapshot::from_body(r#"{"bids":[],"asks":[]}"#.into(), 0).is_err());
    }

    #[test]
    fn retries_until_success() {
        let mut src = Scripted(
            VecDeque::from(vec![
                Err(FetchError::Status(503)),
                Err(FetchError::Status(429)),
                Ok(FetchedSnapshot::from_body(body(7), 0).unwrap()),
            ]),
            0,
        );
        let got = fetch_with_retry(&mut src, fast(), 5, Instant::now() + Duration::from_secs(5)).unwrap();
        assert_eq!(got.snapshot.sequence, 7);
        assert_eq!(src.1, 3);
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let mut src = Scripted(VecDeque::new(), 0);
        let err = fetch_with_retry(&mut src, fast(), 3, Instant::now() + Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, FetchError::Exhausted { attempts: 3, .. }));
        assert_eq!(src.1, 3);
    }

    #[test]
    fn stops_at_deadline() {
        let mut src = Scripted(VecDeque::new(), 0);
        let err = fetch_with_retry(&mut src, fast(), 100, Instant::now()).unwrap_err();
        assert!(matches!(err, FetchError::Exhausted { attempts: 1, .. }));
    }
}
