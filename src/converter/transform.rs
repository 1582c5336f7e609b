//! Record transformation: raw qsh events → normalized trades.
//!
//! Two variants, selected by the run's [`DataKind`]:
//!
//! - **Deals**: each raw deal maps directly onto a [`Trade`].
//! - **Order log**: each raw entry becomes an [`OrderLogRecord`] fed into an
//!   external [`OrderBookReconstructor`]; the trades it emits are pushed into
//!   the [`DayPartitioner`] from inside the `add` call, interleaved with reads.
//!
//! Both variants read the file to exhaustion before anything is persisted, so
//! a failing file leaves nothing behind.

use anyhow::{anyhow, Context, Result};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use super::decoder::{
    read_to_end, DealEntry, DealType, OrdLogEntry, OrdLogFlags, QshReader, RawEvent,
    ReaderFactory, StreamKind, OL_ADD, OL_BUY, OL_FILL, OL_NON_SYSTEM, OL_SELL, OL_SNAPSHOT,
};
use super::instrument::map_instrument;
use super::partition::{DayPartition, DayPartitioner};
use super::types::{AggressorSide, DataKind, Instrument, OrderLogRecord, OrderLogState, Trade};

// =============================================================================
// Reconstructor contract
// =============================================================================

/// Order-book reconstruction from order-log deltas.
///
/// `add` must invoke `on_trade` synchronously for every trade the record
/// completes, in emission order. Buffered trades may surface on later calls.
/// Resources are released on drop.
pub trait OrderBookReconstructor {
    fn add(&mut self, record: OrderLogRecord, on_trade: &mut dyn FnMut(Trade)) -> Result<()>;
}

/// Creates one reconstructor per (instrument, file).
pub trait ReconstructorFactory: Send + Sync {
    type Reconstructor: OrderBookReconstructor;

    fn create(&self, instrument: Arc<Instrument>) -> Result<Self::Reconstructor>;
}

// =============================================================================
// Field mapping
// =============================================================================

/// Decompose a raw flag bitmask into semantic order-log states.
pub fn map_order_log_flags(flags: OrdLogFlags) -> BTreeSet<OrderLogState> {
    let mut states = BTreeSet::new();

    if flags.contains(OL_NON_SYSTEM) || flags.contains(OL_SNAPSHOT) {
        states.insert(OrderLogState::NonSystem);
    }
    if flags.contains(OL_ADD) {
        states.insert(OrderLogState::Add);
    }
    if flags.contains(OL_FILL) {
        states.insert(OrderLogState::Fill);
    }
    if flags.contains(OL_BUY) {
        states.insert(OrderLogState::Buy);
    }
    if flags.contains(OL_SELL) {
        states.insert(OrderLogState::Sell);
    }

    states
}

/// Map a raw order-log entry. Trade id and price are linked only on fills.
pub fn map_order_log(entry: &OrdLogEntry) -> OrderLogRecord {
    let is_fill = entry.flags.contains(OL_FILL);

    OrderLogRecord {
        states: map_order_log_flags(entry.flags),
        time: entry.time,
        order_id: entry.order_id,
        price: entry.price,
        volume: entry.amount,
        volume_rest: entry.amount_rest,
        trade_id: is_fill.then_some(entry.deal_id),
        trade_price: is_fill.then_some(entry.deal_price),
    }
}

pub fn map_deal_type(deal_type: DealType) -> AggressorSide {
    match deal_type {
        DealType::Buy => AggressorSide::Buy,
        DealType::Sell => AggressorSide::Sell,
        DealType::Unknown => AggressorSide::Unknown,
    }
}

/// Map a raw deal, scaling its tick price by the instrument's tick size.
pub fn map_deal(deal: &DealEntry, instrument: &Arc<Instrument>) -> Result<Trade> {
    let price = rust_decimal::Decimal::from(deal.price)
        .checked_mul(instrument.tick_size)
        .ok_or_else(|| anyhow!("price overflow for deal {}: {} ticks", deal.id, deal.price))?;

    Ok(Trade {
        id: deal.id,
        price,
        volume: deal.volume,
        time: deal.time,
        instrument: Arc::clone(instrument),
        aggressor: map_deal_type(deal.deal_type),
    })
}

// =============================================================================
// Readers
// =============================================================================

/// Convert the deals stream of an opened file into day partitions.
///
/// A file without a deals stream yields one empty partition.
pub fn read_deals<R: QshReader + ?Sized>(reader: &mut R) -> Result<DayPartitioner> {
    let mut partitioner = DayPartitioner::new();

    let Some(index) = reader.find_stream(StreamKind::Deals) else {
        debug!("No deals stream");
        return Ok(partitioner);
    };

    let instrument = Arc::new(map_instrument(&reader.streams()[index].security)?);

    read_to_end(reader, |event| {
        if event.stream != index {
            return Ok(());
        }
        if let RawEvent::Deal(deal) = event.event {
            partitioner.push(map_deal(&deal, &instrument)?);
        }
        Ok(())
    })?;

    Ok(partitioner)
}

/// Convert the order-log stream of an opened file into day partitions.
///
/// The reconstructor lives exactly as long as this call and is dropped on
/// every exit path. A file without an order-log stream yields one empty
/// partition.
pub fn read_order_log<R, F>(reader: &mut R, reconstructors: &F) -> Result<DayPartitioner>
where
    R: QshReader + ?Sized,
    F: ReconstructorFactory + ?Sized,
{
    let mut partitioner = DayPartitioner::new();

    let Some(index) = reader.find_stream(StreamKind::OrderLog) else {
        debug!("No order-log stream");
        return Ok(partitioner);
    };

    let instrument = Arc::new(map_instrument(&reader.streams()[index].security)?);
    let mut reconstructor = reconstructors
        .create(Arc::clone(&instrument))
        .with_context(|| format!("Failed to create reconstructor for {}", instrument.symbol))?;

    read_to_end(reader, |event| {
        if event.stream != index {
            return Ok(());
        }
        if let RawEvent::OrdLog(entry) = event.event {
            reconstructor.add(map_order_log(&entry), &mut |trade| partitioner.push(trade))?;
        }
        Ok(())
    })?;

    drop(reconstructor);
    Ok(partitioner)
}

/// Open one file and transform it according to `kind`.
pub fn transform_file<F, B>(
    path: &Path,
    kind: DataKind,
    readers: &F,
    reconstructors: &B,
) -> Result<Vec<DayPartition>>
where
    F: ReaderFactory + ?Sized,
    B: ReconstructorFactory + ?Sized,
{
    let mut reader = readers
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let partitioner = match kind {
        DataKind::Deals => read_deals(&mut reader),
        DataKind::OrderLog => read_order_log(&mut reader, reconstructors),
    }
    .with_context(|| format!("Failed to read {}", path.display()))?;

    debug!(
        path = %path.display(),
        days = partitioner.len(),
        trades = partitioner.trade_count(),
        "File transformed"
    );

    Ok(partitioner.into_partitions())
}
