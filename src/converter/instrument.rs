//! Security descriptor → normalized instrument.

use anyhow::{anyhow, Result};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;

use super::decoder::SecurityDescriptor;
use super::types::{Instrument, InstrumentKind};

/// Ticker suffixes classified as options; everything else is a future.
const OPTION_SUFFIXES: &[&str] = &["TOM", "TOD"];

/// Convert a vendor step into an exact decimal tick size.
///
/// Uses the shortest decimal that round-trips the float, so a step stored as
/// `0.01` becomes exactly `0.01` rather than its binary expansion.
pub fn tick_size_from_step(step: f64) -> Result<Decimal> {
    if !step.is_finite() || step <= 0.0 {
        return Err(anyhow!("invalid price step: {}", step));
    }
    Decimal::from_f64(step)
        .map(|d| d.normalize())
        .ok_or_else(|| anyhow!("price step out of decimal range: {}", step))
}

/// Build the normalized instrument for a file's security.
pub fn map_instrument(security: &SecurityDescriptor) -> Result<Instrument> {
    let kind = if OPTION_SUFFIXES.iter().any(|s| security.ticker.ends_with(s)) {
        InstrumentKind::Options
    } else {
        InstrumentKind::Futures
    };

    let name = if security.aux_code.is_empty() {
        security.cname.clone()
    } else {
        format!("{}-{}", security.aux_code, security.cname)
    };

    Ok(Instrument {
        id: security.id,
        symbol: security.ticker.clone(),
        name,
        kind,
        tick_size: tick_size_from_step(security.step)?,
    })
}
