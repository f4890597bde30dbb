//! Ingress parsing of venue stream frames into a fixed tagged envelope.
//!
//! Frames arrive either wrapped by the combined-stream endpoint
//! (`{"stream": "...", "data": {...}}`) or bare. The payload's `e` field picks
//! the variant. Anything that is not a depth update or a trade print is
//! rejected with [`ParseError::UnsupportedEvent`] and never reaches the
//! reconciler.
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_json::value::RawValue;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported event type {0:?}")]
    UnsupportedEvent(String),
    #[error("invalid decimal {0:?}")]
    Decimal(String),
    #[error("negative quantity {0}")]
    NegativeQuantity(Decimal),
    #[error("inverted sequence range: first_seq {first} > last_seq {last}")]
    InvertedRange { first: u64, last: u64 },
}

/// Aggressor side of a trade print.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DepthUpdate {
    /// `U`: first update id covered by this envelope.
    pub first_seq: u64,
    /// `u`: last update id covered by this envelope.
    pub last_seq: u64,
    pub bid_changes: Vec<(Decimal, Decimal)>,
    pub ask_changes: Vec<(Decimal, Decimal)>,
    pub event_time_ms: u64,
}

impl DepthUpdate {
    /// Whether `[first_seq, last_seq]` contains `seq`.
    pub fn covers(&self, seq: u64) -> bool {
        self.first_seq <= seq && seq <= self.last_seq
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trade {
    pub trade_id: u64,
    pub price: Decimal,
    pub qty: Decimal,
    pub side: TradeSide,
    pub ts_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DiffEnvelope {
    DepthUpdate(DepthUpdate),
    Trade(Trade),
}

/// Partition a record belongs to on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Depth,
    Trades,
    Snapshots,
}

impl StreamKind {
    pub const ALL: [StreamKind; 3] = [StreamKind::Depth, StreamKind::Trades, StreamKind::Snapshots];

    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Depth => "depth",
            StreamKind::Trades => "trades",
            StreamKind::Snapshots => "snapshots",
        }
    }
}

impl DiffEnvelope {
    pub fn kind(&self) -> StreamKind {
        match self {
            DiffEnvelope::DepthUpdate(_) => StreamKind::Depth,
            DiffEnvelope::Trade(_) => StreamKind::Trades,
        }
    }

    /// Parse one stream payload (wrapped or bare).
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let mut value: Value = serde_json::from_str(text)?;
        let payload = match value.get_mut("data") {
            Some(inner) if inner.is_object() => inner.take(),
            _ => value,
        };
        let kind = payload.get("e").and_then(Value::as_str).unwrap_or_default().to_string();
        match kind.as_str() {
            "depthUpdate" => {
                let w: WireDepth = serde_json::from_value(payload)?;
                if w.first > w.last {
                    return Err(ParseError::InvertedRange { first: w.first, last: w.last });
                }
                Ok(DiffEnvelope::DepthUpdate(DepthUpdate {
                    first_seq: w.first,
                    last_seq: w.last,
                    bid_changes: parse_levels(&w.bids)?,
                    ask_changes: parse_levels(&w.asks)?,
                    event_time_ms: w.event_time,
                }))
            }
            "trade" => {
                let w: WireTrade = serde_json::from_value(payload)?;
                let qty = parse_decimal(&w.qty)?;
                if qty.is_sign_negative() && !qty.is_zero() {
                    return Err(ParseError::NegativeQuantity(qty));
                }
                Ok(DiffEnvelope::Trade(Trade {
                    trade_id: w.id,
                    price: parse_decimal(&w.price)?,
                    qty,
                    // buyer is maker => the seller crossed the spread
                    side: if w.buyer_is_maker { TradeSide::Sell } else { TradeSide::Buy },
                    ts_ms: w.trade_time,
                }))
            }
            _ => Err(ParseError::UnsupportedEvent(kind)),
        }
    }
}

#[derive(Deserialize)]
struct WireDepth {
    #[serde(rename = "E", default)]
    event_time: u64,
    #[serde(rename = "U")]
    first: u64,
    #[serde(rename = "u")]
    last: u64,
    #[serde(rename = "b", default)]
    bids: Vec<Vec<String>>,
    #[serde(rename = "a", default)]
    asks: Vec<Vec<String>>,
}

#[derive(Deserialize)]
struct WireTrade {
    #[serde(rename = "t")]
    id: u64,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "q")]
    qty: String,
    #[serde(rename = "T", default)]
    trade_time: u64,
    #[serde(rename = "m", default)]
    buyer_is_maker: bool,
}

pub(crate) fn parse_decimal(s: &str) -> Result<Decimal, ParseError> {
    Decimal::from_str(s.trim()).map_err(|_| ParseError::Decimal(s.to_string()))
}

/// Parse `[[price, qty, ...], ...]`; extra trailing fields are ignored.
pub(crate) fn parse_levels(raw: &[Vec<String>]) -> Result<Vec<(Decimal, Decimal)>, ParseError> {
    let mut out = Vec::with_capacity(raw.len());
    for level in raw {
        let (Some(p), Some(q)) = (level.first(), level.get(1)) else {
            return Err(ParseError::Decimal(format!("{level:?}")));
        };
        let qty = parse_decimal(q)?;
        if qty.is_sign_negative() && !qty.is_zero() {
            return Err(ParseError::NegativeQuantity(qty));
        }
        out.push((parse_decimal(p)?, qty));
    }
    Ok(out)
}

/// A frame as received from the stream: the verbatim payload plus its parse.
#[derive(Debug, Clone)]
pub struct Received {
    pub recv_unix_ns: u64,
    pub raw: Box<RawValue>,
    pub envelope: DiffEnvelope,
}

impl Received {
    /// Parse once at ingress. The raw text is kept byte for byte; on failure
    /// it is handed back so the caller can still record it.
    pub fn ingest(text: String, recv_unix_ns: u64) -> Result<Self, Rejected> {
        let envelope = match DiffEnvelope::parse(&text) {
            Ok(envelope) => envelope,
            Err(error) => return Err(Rejected { text, error }),
        };
        // parse() accepted it, so this is valid JSON
        match RawValue::from_string(text) {
            Ok(raw) => Ok(Self { recv_unix_ns, raw, envelope }),
            Err(e) => Err(Rejected { text: String::new(), error: e.into() }),
        }
    }
}

/// A frame that did not parse into a [`DiffEnvelope`], with its original text.
#[derive(Debug)]
pub struct Rejected {
    pub text: String,
    pub error: ParseError,
}

impl StreamKind {
    /// Partition for a frame that could not be parsed: trades when the
    /// stream name or event type says so, depth otherwise.
    pub fn for_unparsed(text: &str) -> StreamKind {
        let Ok(value) = serde_json::from_str::<Value>(text) else {
            return StreamKind::Depth;
        };
        let stream = value.get("stream").and_then(Value::as_str).unwrap_or_default();
        let event = value
            .get("data")
            .unwrap_or(&value)
            .get("e")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if event == "trade" || stream.ends_with("@trade") {
            StreamKind::Trades
        } else {
            StreamKind::Depth
        }
    }
}
