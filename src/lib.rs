//! qsh converter library
//!
//! Converts vendor qsh market-data history (order logs or deals) into
//! day-partitioned trades and optional timeframe candles.

pub mod converter;

pub use converter::*;
