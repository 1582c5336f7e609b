//! Normalized records produced by the conversion pipeline.
//!
//! Everything here is immutable once built. A file's `Instrument` is shared by
//! every trade decoded from that file through an `Arc`, so trades stay cheap to
//! clone while the partitioner and dispatcher move them around.

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

// =============================================================================
// Data Kind
// =============================================================================

/// Kind of source data selected for a conversion run.
///
/// A run converts exactly one kind; files of the other kind are skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    /// Full order log (`*.OrdLog.qsh`), converted through an order-book reconstructor.
    OrderLog,
    /// Executed deals with aggressor side (`*.Deals.qsh`).
    Deals,
}

impl DataKind {
    /// Marker that must appear in the file stem for a file to belong to this kind.
    pub fn file_marker(&self) -> &'static str {
        match self {
            Self::OrderLog => "OrdLog",
            Self::Deals => "Deals",
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OrderLog => write!(f, "order_log"),
            Self::Deals => write!(f, "deals"),
        }
    }
}

// =============================================================================
// Instrument
// =============================================================================

/// Derivative class inferred from the ticker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstrumentKind {
    Futures,
    Options,
}

impl InstrumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Futures => "FUTURES",
            Self::Options => "OPTIONS",
        }
    }
}

/// Normalized tradable instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instrument {
    /// Vendor instrument id.
    pub id: i64,
    /// Ticker symbol; also the storage key.
    pub symbol: String,
    /// Display name (`AUX-NAME` or `NAME`).
    pub name: String,
    pub kind: InstrumentKind,
    /// Minimum price increment. Raw vendor prices are multiples of it.
    pub tick_size: Decimal,
}

// =============================================================================
// Trade
// =============================================================================

/// Which party initiated a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggressorSide {
    Buy,
    Sell,
    Unknown,
}

impl AggressorSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "BUY" => Self::Buy,
            "SELL" => Self::Sell,
            _ => Self::Unknown,
        }
    }
}

/// A normalized trade tick.
#[derive(Debug, Clone, PartialEq)]
pub struct Trade {
    pub id: i64,
    /// Price in instrument units (raw price already multiplied by the tick size).
    pub price: Decimal,
    pub volume: i64,
    pub time: NaiveDateTime,
    pub instrument: Arc<Instrument>,
    pub aggressor: AggressorSide,
}

impl Trade {
    /// Calendar date the trade belongs to.
    #[inline]
    pub fn date(&self) -> NaiveDate {
        self.time.date()
    }
}

// =============================================================================
// Order Log
// =============================================================================

/// Semantic state of an order-log event. Several states may apply at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OrderLogState {
    /// Non-system record (or part of the start-of-session snapshot).
    NonSystem,
    Add,
    Fill,
    Buy,
    Sell,
}

/// Normalized order-log event fed into the order-book reconstructor.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderLogRecord {
    pub states: BTreeSet<OrderLogState>,
    pub time: NaiveDateTime,
    pub order_id: i64,
    pub price: i64,
    /// Requested volume.
    pub volume: i64,
    /// Volume still resting after this event.
    pub volume_rest: i64,
    /// Linked trade id, present when the event is a fill.
    pub trade_id: Option<i64>,
    /// Linked trade price, present when the event is a fill.
    pub trade_price: Option<i64>,
}

impl OrderLogRecord {
    #[inline]
    pub fn has(&self, state: OrderLogState) -> bool {
        self.states.contains(&state)
    }
}

// =============================================================================
// Candle
// =============================================================================

/// OHLCV aggregate over one timeframe bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Bucket open time.
    pub open_time: NaiveDateTime,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: i64,
    pub trade_count: u32,
}
