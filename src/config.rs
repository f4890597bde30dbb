//! Session configuration and venue endpoints.
//!
//! Everything here is checked by [`SessionConfig::validate`] before the
//! supervisor opens a file or a socket.
use crate::backoff::BackoffPolicy;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("unsupported venue {0:?} (expected binance or binanceus)")]
    UnknownVenue(String),
    #[error("invalid symbol {0:?}")]
    InvalidSymbol(String),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Venue {
    Binance,
    BinanceUs,
}

impl Venue {
    pub fn rest_base(self) -> &'static str {
        match self {
            Venue::Binance => "https://api.binance.com",
            Venue::BinanceUs => "https://api.binance.us",
        }
    }

    pub fn ws_base(self) -> &'static str {
        match self {
            Venue::Binance => "wss://stream.binance.com:9443/stream",
            Venue::BinanceUs => "wss://stream.binance.us:9443/stream",
        }
    }

    /// Combined depth (100ms) + trade stream for one symbol.
    pub fn stream_url(self, symbol: &str) -> String {
        let s = symbol.to_lowercase();
        format!("{}?streams={s}@depth@100ms/{s}@trade", self.ws_base())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Venue::Binance => "binance",
            Venue::BinanceUs => "binanceus",
        }
    }
}

impl fmt::Display for Venue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Venue {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "binance" => Ok(Venue::Binance),
            "binanceus" | "binance-us" | "binance_us" => Ok(Venue::BinanceUs),
            _ => Err(ConfigError::UnknownVenue(s.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub venue: Venue,
    /// Upper-cased by `validate`.
    pub symbol: String,
    pub duration: Duration,
    pub resnapshot_interval: Duration,
    pub raw_dir: PathBuf,
    /// Depth levels requested per snapshot.
    pub snapshot_limit: u32,
    pub pending_capacity: usize,
    pub max_resyncs_per_minute: u32,
    pub snapshot_attempts: u32,
    /// Consecutive failed connects before the stream is declared dead.
    pub reconnect_attempts: u32,
    pub backoff: BackoffPolicy,
    /// Bounded queue between the stream pump and the control loop.
    pub stream_queue: usize,
    /// Bounded queue between the control loop and the recorder thread.
    pub writer_queue: usize,
    pub flush_interval: Duration,
}

impl SessionConfig {
    pub fn new(venue: Venue, symbol: impl Into<String>, raw_dir: impl Into<PathBuf>) -> Self {
        Self {
            venue,
            symbol: symbol.into(),
            duration: Duration::from_secs(60 * 60),
            resnapshot_interval: Duration::from_secs(600),
            raw_dir: raw_dir.into(),
            snapshot_limit: 1000,
            pending_capacity: 1000,
            max_resyncs_per_minute: 10,
            snapshot_attempts: 5,
            reconnect_attempts: 8,
            backoff: BackoffPolicy::default(),
            stream_queue: 8192,
            writer_queue: 8192,
            flush_interval: Duration::from_secs(1),
        }
    }

    pub fn validate(mut self) -> Result<Self, ConfigError> {
        let symbol = self.symbol.trim().to_uppercase();
        if symbol.is_empty() || symbol.len() > 20 || !symbol.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ConfigError::InvalidSymbol(self.symbol));
        }
        self.symbol = symbol;
        let checks: [(bool, &'static str); 9] = [
            (self.duration.is_zero(), "session duration"),
            (self.resnapshot_interval.is_zero(), "resnapshot interval"),
            (self.snapshot_limit == 0, "snapshot limit"),
            (self.pending_capacity == 0, "pending capacity"),
            (self.max_resyncs_per_minute == 0, "max resyncs per minute"),
            (self.snapshot_attempts == 0, "snapshot attempts"),
            (self.reconnect_attempts == 0, "reconnect attempts"),
            (self.stream_queue == 0 || self.writer_queue == 0, "queue capacity"),
            (self.flush_interval.is_zero(), "flush interval"),
        ];
        if let Some((_, name)) = checks.iter().find(|(bad, _)| *bad) {
            return Err(ConfigError::Zero(name));
        }
        Ok(self)
    }
}
