//! Vendor reader contract.
//!
//! The binary qsh format is decoded by an external reader. The converter only
//! relies on the surface described here: a file opens into a reader with a
//! fixed set of sub-streams, each `read` step pushes zero or more raw events to
//! the supplied handler, and `current_date_time` reaches
//! [`END_OF_STREAM`] once the file is exhausted.

use anyhow::Result;
use chrono::NaiveDateTime;
use std::collections::VecDeque;
use std::path::Path;

/// Sentinel returned by [`QshReader::current_date_time`] at end of stream.
pub const END_OF_STREAM: NaiveDateTime = NaiveDateTime::MAX;

// =============================================================================
// Order-log flag bits
// =============================================================================

pub const OL_NON_ZERO_REPL_ACT: u32 = 1 << 0;
pub const OL_SESSION_ID_CHANGED: u32 = 1 << 1;
pub const OL_ADD: u32 = 1 << 2;
pub const OL_FILL: u32 = 1 << 3;
pub const OL_BUY: u32 = 1 << 4;
pub const OL_SELL: u32 = 1 << 5;
pub const OL_SNAPSHOT: u32 = 1 << 6;
pub const OL_QUOTE: u32 = 1 << 7;
pub const OL_COUNTER: u32 = 1 << 8;
pub const OL_NON_SYSTEM: u32 = 1 << 9;
pub const OL_END_OF_TRANSACTION: u32 = 1 << 10;
pub const OL_FILL_OR_KILL: u32 = 1 << 11;
pub const OL_MOVED: u32 = 1 << 12;
pub const OL_CANCELED: u32 = 1 << 13;
pub const OL_CANCELED_GROUP: u32 = 1 << 14;
pub const OL_CROSS_TRADE: u32 = 1 << 15;

/// Raw order-log flag bitmask as stored in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OrdLogFlags(pub u32);

impl OrdLogFlags {
    #[inline]
    pub fn contains(&self, bit: u32) -> bool {
        self.0 & bit == bit
    }
}

// =============================================================================
// Raw events
// =============================================================================

/// Security descriptor attached to a sub-stream.
#[derive(Debug, Clone, PartialEq)]
pub struct SecurityDescriptor {
    pub id: i64,
    pub ticker: String,
    /// Auxiliary code (board / class); may be empty.
    pub aux_code: String,
    pub cname: String,
    /// Price step as stored by the vendor.
    pub step: f64,
}

/// Raw deal direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DealType {
    Unknown,
    Buy,
    Sell,
}

/// Raw executed deal. `price` is in ticks.
#[derive(Debug, Clone, PartialEq)]
pub struct DealEntry {
    pub id: i64,
    pub time: NaiveDateTime,
    pub price: i64,
    pub volume: i64,
    pub deal_type: DealType,
}

/// Raw order-log entry. Prices are in ticks.
#[derive(Debug, Clone, PartialEq)]
pub struct OrdLogEntry {
    pub flags: OrdLogFlags,
    pub time: NaiveDateTime,
    pub order_id: i64,
    pub price: i64,
    pub amount: i64,
    pub amount_rest: i64,
    pub deal_id: i64,
    pub deal_price: i64,
}

/// Capability of a sub-stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    OrderLog,
    Deals,
    /// Quotes, auxiliary info, messages; ignored by the converter.
    Other,
}

/// Sub-stream header.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamDescriptor {
    pub kind: StreamKind,
    pub security: SecurityDescriptor,
}

/// Raw event payload.
#[derive(Debug, Clone, PartialEq)]
pub enum RawEvent {
    Deal(DealEntry),
    OrdLog(OrdLogEntry),
    Other,
}

/// Event pushed by a reader step, tagged with the sub-stream it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub stream: usize,
    pub event: RawEvent,
}

// =============================================================================
// Traits
// =============================================================================

/// An opened qsh file.
///
/// Events are pushed in file order, which is chronological per file.
pub trait QshReader {
    /// Sub-stream headers, indexed by stream number.
    fn streams(&self) -> &[StreamDescriptor];

    /// Timestamp of the next frame, or [`END_OF_STREAM`] once the file is exhausted.
    fn current_date_time(&self) -> NaiveDateTime;

    /// Decode the next frame and push its events to `handler`.
    fn read(&mut self, handler: &mut dyn FnMut(StreamEvent)) -> Result<()>;

    /// Number of sub-streams.
    fn stream_count(&self) -> usize {
        self.streams().len()
    }

    /// Index of the first sub-stream with the given capability.
    fn find_stream(&self, kind: StreamKind) -> Option<usize> {
        self.streams().iter().position(|s| s.kind == kind)
    }
}

/// Opens qsh files. Shared by all workers of a run.
pub trait ReaderFactory: Send + Sync {
    type Reader: QshReader;

    fn open(&self, path: &Path) -> Result<Self::Reader>;
}

/// Read `reader` until the end-of-stream sentinel, forwarding every event.
///
/// The first error returned by `handler` stops the read; events pushed later in
/// the same frame are dropped.
pub fn read_to_end<R, H>(reader: &mut R, mut handler: H) -> Result<()>
where
    R: QshReader + ?Sized,
    H: FnMut(StreamEvent) -> Result<()>,
{
    let mut failure: Option<anyhow::Error> = None;

    while reader.current_date_time() != END_OF_STREAM {
        reader.read(&mut |event| {
            if failure.is_none() {
                if let Err(e) = handler(event) {
                    failure = Some(e);
                }
            }
        })?;

        if let Some(e) = failure.take() {
            return Err(e);
        }
    }
    Ok(())
}

// =============================================================================
// In-memory reader
// =============================================================================

/// Reader replaying pre-decoded frames, one frame per `read` step.
///
/// Used for replaying data already decoded elsewhere and for tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryReader {
    streams: Vec<StreamDescriptor>,
    frames: VecDeque<(NaiveDateTime, Vec<StreamEvent>)>,
}

impl MemoryReader {
    pub fn new(streams: Vec<StreamDescriptor>) -> Self {
        Self {
            streams,
            frames: VecDeque::new(),
        }
    }

    /// Append a frame. Frames must be pushed in chronological order.
    pub fn push_frame(&mut self, time: NaiveDateTime, events: Vec<StreamEvent>) {
        self.frames.push_back((time, events));
    }

    /// Append a frame holding a single event.
    pub fn push_event(&mut self, time: NaiveDateTime, stream: usize, event: RawEvent) {
        self.push_frame(time, vec![StreamEvent { stream, event }]);
    }
}

impl QshReader for MemoryReader {
    fn streams(&self) -> &[StreamDescriptor] {
        &self.streams
    }

    fn current_date_time(&self) -> NaiveDateTime {
        self.frames.front().map(|(t, _)| *t).unwrap_or(END_OF_STREAM)
    }

    fn read(&mut self, handler: &mut dyn FnMut(StreamEvent)) -> Result<()> {
        if let Some((_, events)) = self.frames.pop_front() {
            for event in events {
                handler(event);
            }
        }
        Ok(())
    }
}
