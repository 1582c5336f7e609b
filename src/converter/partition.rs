//! Day partitioning of a chronological trade stream.
//!
//! Single pass, no look-ahead. A new partition starts only when an incoming
//! trade is dated strictly later than the last trade of the current one, so the
//! input must already be time-ordered. Out-of-order input never fails; it just
//! keeps landing in the current partition until a later date shows up.

use super::types::Trade;

/// Trades sharing one calendar date, in arrival order.
pub type DayPartition = Vec<Trade>;

/// Accumulates trades into per-day partitions.
#[derive(Debug)]
pub struct DayPartitioner {
    partitions: Vec<DayPartition>,
}

impl Default for DayPartitioner {
    fn default() -> Self {
        Self::new()
    }
}

impl DayPartitioner {
    /// Start with one empty partition.
    pub fn new() -> Self {
        Self {
            partitions: vec![Vec::new()],
        }
    }

    /// Append a trade, opening a new partition on a date change.
    pub fn push(&mut self, trade: Trade) {
        let last_date = self
            .partitions
            .last()
            .and_then(|p| p.last())
            .map(|t| t.date());

        if matches!(last_date, Some(d) if trade.date() > d) {
            self.partitions.push(Vec::new());
        }

        // Never empty: constructed with one partition and only ever grows.
        if let Some(current) = self.partitions.last_mut() {
            current.push(trade);
        }
    }

    /// Number of partitions so far (at least one).
    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    /// Total trades across all partitions.
    pub fn trade_count(&self) -> usize {
        self.partitions.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.trade_count() == 0
    }

    pub fn partitions(&self) -> &[DayPartition] {
        &self.partitions
    }

    pub fn into_partitions(self) -> Vec<DayPartition> {
        self.partitions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converter::types::{AggressorSide, Instrument, InstrumentKind};
    use chrono::{NaiveDate, NaiveDateTime};
    use rust_decimal::Decimal;
    use std::sync::Arc;

    fn instrument() -> Arc<Instrument> {
        Arc::new(Instrument {
            id: 1,
            symbol: "SiZ4".to_string(),
            name: "Si".to_string(),
            kind: InstrumentKind::Futures,
            tick_size: Decimal::ONE,
        })
    }

    fn at(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    fn trade(id: i64, time: NaiveDateTime) -> Trade {
        Trade {
            id,
            price: Decimal::from(100),
            volume: 1,
            time,
            instrument: instrument(),
            aggressor: AggressorSide::Unknown,
        }
    }

    fn ids(partitions: &[DayPartition]) -> Vec<Vec<i64>> {
        partitions
            .iter()
            .map(|p| p.iter().map(|t| t.id).collect())
            .collect()
    }

    #[test]
    fn test_starts_with_one_empty_partition() {
        let p = DayPartitioner::new();
        assert_eq!(p.len(), 1);
        assert!(p.is_empty());
        assert!(p.partitions()[0].is_empty());
    }

    #[test]
    fn test_splits_on_date_change() {
        let mut p = DayPartitioner::new();
        p.push(trade(1, at(1, 10)));
        p.push(trade(2, at(1, 23)));
        p.push(trade(3, at(2, 0)));
        p.push(trade(4, at(4, 12)));
        p.push(trade(5, at(4, 13)));

        assert_eq!(ids(p.partitions()), vec![vec![1, 2], vec![3], vec![4, 5]]);
    }

    #[test]
    fn test_partitions_are_date_disjoint_and_preserve_order() {
        let mut p = DayPartitioner::new();
        let times = [at(1, 9), at(1, 18), at(2, 9), at(2, 10), at(3, 9), at(5, 1), at(5, 2)];
        for (i, t) in times.iter().enumerate() {
            p.push(trade(i as i64, *t));
        }

        let parts = p.into_partitions();
        for part in &parts {
            let d = part[0].date();
            assert!(part.iter().all(|t| t.date() == d));
        }
        for pair in parts.windows(2) {
            assert!(pair[0][0].date() < pair[1][0].date());
        }

        let flat: Vec<i64> = parts.iter().flatten().map(|t| t.id).collect();
        assert_eq!(flat, (0..times.len() as i64).collect::<Vec<_>>());
    }

    #[test]
    fn test_out_of_order_input_stays_in_current_partition() {
        let mut p = DayPartitioner::new();
        p.push(trade(1, at(2, 10)));
        p.push(trade(2, at(1, 10)));
        p.push(trade(3, at(2, 11)));
        p.push(trade(4, at(3, 9)));

        // Trade 2 is earlier than the partition's last date; no split.
        // Trade 3 compares against trade 2's date and opens a new partition.
        assert_eq!(ids(p.partitions()), vec![vec![1, 2], vec![3], vec![4]]);
        assert_eq!(p.trade_count(), 4);
    }
}
