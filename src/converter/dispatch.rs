//! Aggregate dispatch: persists day partitions and their derived candles.

use anyhow::{Context, Result};
use std::time::Duration;
use tracing::debug;

use super::partition::DayPartition;
use super::types::{Candle, Instrument, Trade};

// =============================================================================
// Contracts
// =============================================================================

/// Everything one file persists for a single day.
#[derive(Debug)]
pub struct DayOutput<'a> {
    pub instrument: &'a Instrument,
    pub trades: &'a [Trade],
    /// Candle series per timeframe; empty for single-trade days.
    pub candles: Vec<(Duration, Vec<Candle>)>,
}

/// Durable storage for converted data. Shared by all workers of a run.
pub trait TradeStorage: Send + Sync {
    /// Persist a day's trades for `instrument`.
    fn save_trades(&self, trades: &[Trade], instrument: &Instrument) -> Result<()>;

    /// Persist candles built over `timeframe` for `instrument`.
    fn save_candles(
        &self,
        candles: &[Candle],
        timeframe: Duration,
        instrument: &Instrument,
    ) -> Result<()>;

    /// Persist every day of one file.
    ///
    /// The default writes day by day. Backends that can roll back override it
    /// so that an error leaves none of the file's rows behind.
    fn save_days(&self, days: &[DayOutput<'_>]) -> Result<()> {
        for day in days {
            self.save_trades(day.trades, day.instrument)?;
            for (timeframe, candles) in &day.candles {
                self.save_candles(candles, *timeframe, day.instrument)?;
            }
        }
        Ok(())
    }
}

/// Builds candles for one timeframe. Resources are released on drop.
pub trait CandleBuilder {
    fn build(&mut self, trades: &[Trade]) -> Result<Vec<Candle>>;
}

/// Creates a candle builder bound to a timeframe.
pub trait CandleBuilderFactory: Send + Sync {
    type Builder: CandleBuilder;

    fn create(&self, timeframe: Duration) -> Result<Self::Builder>;
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Counts of what one file's dispatch persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub days_saved: usize,
    pub trades_saved: usize,
    pub candle_series_saved: usize,
}

/// Persists partitions through a storage backend and a candle builder factory.
pub struct AggregateDispatcher<'a, S: ?Sized, C: ?Sized> {
    storage: &'a S,
    candles: &'a C,
    timeframes: &'a [Duration],
}

impl<'a, S, C> AggregateDispatcher<'a, S, C>
where
    S: TradeStorage + ?Sized,
    C: CandleBuilderFactory + ?Sized,
{
    pub fn new(storage: &'a S, candles: &'a C, timeframes: &'a [Duration]) -> Self {
        Self {
            storage,
            candles,
            timeframes,
        }
    }

    /// Persist every partition in one storage call, then clear them.
    ///
    /// All candle series are built before anything is written, so a failing
    /// builder leaves storage untouched. Empty partitions are skipped.
    /// Single-trade days keep their raw trade but are not used for candles.
    pub fn dispatch(&self, partitions: &mut [DayPartition]) -> Result<DispatchStats> {
        let mut stats = DispatchStats::default();

        {
            let mut days = Vec::with_capacity(partitions.len());
            for partition in partitions.iter() {
                let Some(first) = partition.first() else {
                    continue;
                };
                let instrument: &Instrument = &first.instrument;
                let date = first.date();

                let mut candles = Vec::new();
                if partition.len() > 1 {
                    for &timeframe in self.timeframes {
                        let series = {
                            let mut builder = self.candles.create(timeframe)?;
                            builder.build(partition)?
                        };
                        candles.push((timeframe, series));
                    }
                }

                debug!(
                    symbol = %instrument.symbol,
                    %date,
                    trades = partition.len(),
                    candle_series = candles.len(),
                    "Day prepared"
                );
                stats.days_saved += 1;
                stats.trades_saved += partition.len();
                stats.candle_series_saved += candles.len();

                days.push(DayOutput {
                    instrument,
                    trades: partition,
                    candles,
                });
            }

            if let Some(first) = days.first() {
                let symbol = &first.instrument.symbol;
                self.storage.save_days(&days).with_context(|| {
                    format!("Failed to save {} days for {}", days.len(), symbol)
                })?;
            }
        }

        for partition in partitions.iter_mut() {
            partition.clear();
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converter::types::{AggressorSide, InstrumentKind};
    use chrono::NaiveDate;
    use parking_lot::Mutex;
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct RecordingStorage {
        trade_saves: Mutex<Vec<usize>>,
        candle_saves: Mutex<Vec<(u64, usize)>>,
    }

    impl TradeStorage for RecordingStorage {
        fn save_trades(&self, trades: &[Trade], _instrument: &Instrument) -> Result<()> {
            self.trade_saves.lock().push(trades.len());
            Ok(())
        }

        fn save_candles(
            &self,
            candles: &[Candle],
            timeframe: Duration,
            _instrument: &Instrument,
        ) -> Result<()> {
            self.candle_saves.lock().push((timeframe.as_secs(), candles.len()));
            Ok(())
        }
    }

    struct CountingBuilder {
        live: Arc<AtomicUsize>,
    }

    impl CandleBuilder for CountingBuilder {
        fn build(&mut self, trades: &[Trade]) -> Result<Vec<Candle>> {
            // Only one builder may be alive at a time.
            assert_eq!(self.live.load(Ordering::SeqCst), 1);
            let t = &trades[0];
            Ok(vec![Candle {
                open_time: t.time,
                open: t.price,
                high: t.price,
                low: t.price,
                close: t.price,
                volume: trades.iter().map(|t| t.volume).sum(),
                trade_count: trades.len() as u32,
            }])
        }
    }

    impl Drop for CountingBuilder {
        fn drop(&mut self) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct CountingFactory {
        created: AtomicUsize,
        live: Arc<AtomicUsize>,
    }

    impl CandleBuilderFactory for CountingFactory {
        type Builder = CountingBuilder;

        fn create(&self, _timeframe: Duration) -> Result<CountingBuilder> {
            self.created.fetch_add(1, Ordering::SeqCst);
            self.live.fetch_add(1, Ordering::SeqCst);
            Ok(CountingBuilder {
                live: Arc::clone(&self.live),
            })
        }
    }

    fn partition(day: u32, n: usize) -> DayPartition {
        let inst = Arc::new(Instrument {
            id: 1,
            symbol: "GZM4".to_string(),
            name: "GAZR-6.24".to_string(),
            kind: InstrumentKind::Futures,
            tick_size: Decimal::ONE,
        });
        (0..n)
            .map(|i| Trade {
                id: i as i64,
                price: Decimal::from(150 + i as i64),
                volume: 2,
                time: NaiveDate::from_ymd_opt(2024, 6, day)
                    .unwrap()
                    .and_hms_opt(10, i as u32, 0)
                    .unwrap(),
                instrument: Arc::clone(&inst),
                aggressor: AggressorSide::Buy,
            })
            .collect()
    }

    const MINUTE: Duration = Duration::from_secs(60);
    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_single_trade_day_saved_raw_without_candles() {
        let storage = RecordingStorage::default();
        let factory = CountingFactory::default();
        let timeframes = [MINUTE, HOUR];
        let dispatcher = AggregateDispatcher::new(&storage, &factory, &timeframes);

        let mut parts = vec![partition(3, 1)];
        let stats = dispatcher.dispatch(&mut parts).unwrap();

        assert_eq!(*storage.trade_saves.lock(), vec![1]);
        assert!(storage.candle_saves.lock().is_empty());
        assert_eq!(factory.created.load(Ordering::SeqCst), 0);
        assert_eq!(stats.days_saved, 1);
        assert_eq!(stats.candle_series_saved, 0);
    }

    #[test]
    fn test_candles_per_timeframe_with_scoped_builders() {
        let storage = RecordingStorage::default();
        let factory = CountingFactory::default();
        let timeframes = [MINUTE, HOUR];
        let dispatcher = AggregateDispatcher::new(&storage, &factory, &timeframes);

        let mut parts = vec![partition(3, 4), partition(4, 2)];
        let stats = dispatcher.dispatch(&mut parts).unwrap();

        assert_eq!(*storage.trade_saves.lock(), vec![4, 2]);
        assert_eq!(
            *storage.candle_saves.lock(),
            vec![(60, 1), (3600, 1), (60, 1), (3600, 1)]
        );
        assert_eq!(factory.created.load(Ordering::SeqCst), 4);
        assert_eq!(factory.live.load(Ordering::SeqCst), 0);
        assert_eq!(
            stats,
            DispatchStats {
                days_saved: 2,
                trades_saved: 6,
                candle_series_saved: 4,
            }
        );
        assert!(parts.iter().all(|p| p.is_empty()));
    }

    #[test]
    fn test_empty_partition_and_no_timeframes() {
        let storage = RecordingStorage::default();
        let factory = CountingFactory::default();
        let dispatcher = AggregateDispatcher::new(&storage, &factory, &[]);

        let mut parts = vec![Vec::new(), partition(5, 3)];
        let stats = dispatcher.dispatch(&mut parts).unwrap();

        assert_eq!(*storage.trade_saves.lock(), vec![3]);
        assert!(storage.candle_saves.lock().is_empty());
        assert_eq!(factory.created.load(Ordering::SeqCst), 0);
        assert_eq!(stats.days_saved, 1);
    }

    struct RejectingFactory {
        rejected: Duration,
    }

    impl CandleBuilderFactory for RejectingFactory {
        type Builder = CountingBuilder;

        fn create(&self, timeframe: Duration) -> Result<CountingBuilder> {
            anyhow::ensure!(timeframe != self.rejected, "unsupported timeframe {:?}", timeframe);
            Ok(CountingBuilder {
                live: Arc::new(AtomicUsize::new(1)),
            })
        }
    }

    #[test]
    fn test_builder_failure_saves_nothing() {
        let storage = RecordingStorage::default();
        let factory = RejectingFactory { rejected: HOUR };
        let timeframes = [MINUTE, HOUR];
        let dispatcher = AggregateDispatcher::new(&storage, &factory, &timeframes);

        // First day would succeed on its own; the second day's hourly builder fails.
        let mut parts = vec![partition(3, 1), partition(4, 3)];
        assert!(dispatcher.dispatch(&mut parts).is_err());

        assert!(storage.trade_saves.lock().is_empty());
        assert!(storage.candle_saves.lock().is_empty());
        assert_eq!(parts[1].len(), 3);
    }
}
