//! Default time-bucket candle builder.
//!
//! Buckets are aligned to midnight of the trade's day, so a day partition never
//! produces a candle straddling two dates. Empty buckets are not emitted.

use anyhow::{ensure, Result};
use chrono::{Duration as ChronoDuration, NaiveDateTime, NaiveTime, Timelike};
use std::time::Duration;

use super::dispatch::{CandleBuilder, CandleBuilderFactory};
use super::types::{Candle, Trade};

/// Longest supported timeframe: one calendar day.
pub const MAX_TIMEFRAME_SECS: u64 = 86_400;

/// Factory for [`TimeBucketCandleBuilder`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeBucketCandles;

impl CandleBuilderFactory for TimeBucketCandles {
    type Builder = TimeBucketCandleBuilder;

    fn create(&self, timeframe: Duration) -> Result<TimeBucketCandleBuilder> {
        TimeBucketCandleBuilder::new(timeframe)
    }
}

/// Aggregates trades into fixed-duration OHLCV candles.
#[derive(Debug, Clone)]
pub struct TimeBucketCandleBuilder {
    timeframe_secs: i64,
}

impl TimeBucketCandleBuilder {
    pub fn new(timeframe: Duration) -> Result<Self> {
        let secs = timeframe.as_secs();
        ensure!(secs > 0, "timeframe must be at least one second: {:?}", timeframe);
        ensure!(
            secs <= MAX_TIMEFRAME_SECS,
            "timeframe longer than a day: {:?}",
            timeframe
        );
        Ok(Self {
            timeframe_secs: secs as i64,
        })
    }

    /// Start of the bucket containing `time`.
    pub fn bucket_start(&self, time: NaiveDateTime) -> NaiveDateTime {
        let since_midnight = time.num_seconds_from_midnight() as i64;
        let offset = since_midnight - since_midnight % self.timeframe_secs;
        time.date().and_time(NaiveTime::default()) + ChronoDuration::seconds(offset)
    }
}

impl CandleBuilder for TimeBucketCandleBuilder {
    fn build(&mut self, trades: &[Trade]) -> Result<Vec<Candle>> {
        let mut candles: Vec<Candle> = Vec::new();

        for trade in trades {
            let open_time = self.bucket_start(trade.time);

            if let Some(c) = candles.last_mut().filter(|c| c.open_time == open_time) {
                c.high = c.high.max(trade.price);
                c.low = c.low.min(trade.price);
                c.close = trade.price;
                c.volume += trade.volume;
                c.trade_count += 1;
                continue;
            }

            candles.push(Candle {
                open_time,
                open: trade.price,
                high: trade.price,
                low: trade.price,
                close: trade.price,
                volume: trade.volume,
                trade_count: 1,
            });
        }

        Ok(candles)
    }
}
