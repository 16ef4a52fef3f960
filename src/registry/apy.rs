//! Conversions from external APY representations into basis points.
//!
//! Protocol data sources disagree on units: some report a percentage, some a
//! fraction, lending markets report a rate that compounds daily. Convert once
//! at the gateway boundary and keep basis points everywhere else.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, MathematicalOps};

use crate::error::{HarvestError, Result};

const DAYS_PER_YEAR: u64 = 365;

/// `7.5` (%) -> 750 bps
pub fn from_percent(percent: Decimal) -> Result<u32> {
    to_bps(percent * Decimal::ONE_HUNDRED)
}

/// `0.075` -> 750 bps
pub fn from_fraction(fraction: Decimal) -> Result<u32> {
    to_bps(fraction * Decimal::from(10_000u32))
}

/// Annual rate compounded daily: `(1 + rate / 365)^365 - 1`
pub fn from_daily_compounded_rate(annual_rate: Decimal) -> Result<u32> {
    if annual_rate.is_sign_negative() {
        return Err(negative(annual_rate));
    }
    let daily = annual_rate / Decimal::from(DAYS_PER_YEAR);
    let apy = (Decimal::ONE + daily)
        .checked_powu(DAYS_PER_YEAR)
        .ok_or_else(|| HarvestError::Validation(format!("APY overflow for rate {annual_rate}")))?
        - Decimal::ONE;
    from_fraction(apy)
}

/// Basis points back to a display percentage
pub fn to_percent(apy_bps: u32) -> Decimal {
    Decimal::from(apy_bps) / Decimal::ONE_HUNDRED
}

fn to_bps(value: Decimal) -> Result<u32> {
    if value.is_sign_negative() && !value.is_zero() {
        return Err(negative(value));
    }
    value
        .round()
        .to_u32()
        .ok_or_else(|| HarvestError::Validation(format!("APY out of range: {value} bps")))
}

fn negative(value: Decimal) -> HarvestError {
    HarvestError::Validation(format!("APY cannot be negative: {value}"))
}
