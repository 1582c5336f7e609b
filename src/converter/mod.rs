//! qsh history conversion pipeline.
//!
//! ```text
//!   discover_files / convert_files
//!            │
//!            ▼
//!   make_batches ──► batch N ──► rayon worker per file
//!                                   │
//!                                   ▼
//!                     ReaderFactory::open (external decoder)
//!                                   │
//!                   ┌───────────────┴────────────────┐
//!                   ▼                                ▼
//!              read_deals                      read_order_log
//!            (direct mapping)          (OrderBookReconstructor::add)
//!                   └───────────────┬────────────────┘
//!                                   ▼
//!                            DayPartitioner
//!                                   │
//!                                   ▼
//!                          AggregateDispatcher
//!                    (TradeStorage + CandleBuilder)
//!                                   │
//!                                   ▼
//!                            ProgressTracker
//! ```
//!
//! The decoder and the order-book reconstructor are plugged in through
//! [`ReaderFactory`] and [`ReconstructorFactory`]. Storage defaults to
//! [`SqliteStorage`], candles to [`TimeBucketCandles`].

pub mod candles;
pub mod config;
pub mod decoder;
pub mod dispatch;
pub mod instrument;
pub mod partition;
pub mod progress;
pub mod scheduler;
pub mod storage;
pub mod transform;
pub mod types;

pub use candles::{TimeBucketCandleBuilder, TimeBucketCandles, MAX_TIMEFRAME_SECS};
pub use config::{ConverterConfig, DEFAULT_BATCH_SIZE};
pub use decoder::{
    DealEntry, DealType, MemoryReader, OrdLogEntry, OrdLogFlags, QshReader, RawEvent,
    ReaderFactory, SecurityDescriptor, StreamDescriptor, StreamEvent, StreamKind, END_OF_STREAM,
};
pub use dispatch::{
    AggregateDispatcher, CandleBuilder, CandleBuilderFactory, DayOutput, DispatchStats,
    TradeStorage,
};
pub use instrument::map_instrument;
pub use partition::{DayPartition, DayPartitioner};
pub use progress::{ConvertObserver, ProgressTracker, ProgressUpdate, TracingObserver};
pub use scheduler::{discover_files, filter_kind, make_batches, ConversionSummary, Converter};
pub use storage::{SqliteStorage, StoredTrade};
pub use transform::{OrderBookReconstructor, ReconstructorFactory};
pub use types::{
    AggressorSide, Candle, DataKind, Instrument, InstrumentKind, OrderLogRecord, OrderLogState,
    Trade,
};
