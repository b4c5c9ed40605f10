//! Money Conversion Module
//!
//! Conversion between the custody provider's smallest-unit integers
//! (satoshi, wei, micro-USDT) and the whole-unit `Decimal` amounts that
//! obligations and trades are expressed in, plus the tolerance comparison
//! used by reconciliation.
//!
//! ## Representation
//! - Provider amounts are integers in the asset's smallest unit
//! - Obligation amounts are `Decimal` whole units
//! - The scale factor is `10^decimals` (see `Asset::decimals`)
//!
//! No conversion silently truncates: an amount with more fractional digits
//! than the asset supports is rejected.

use rust_decimal::prelude::*;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Money conversion errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MoneyError {
    #[error("Precision overflow: provided {provided} decimals, max allowed {max}")]
    PrecisionOverflow { provided: u32, max: u32 },

    #[error("Amount must be positive")]
    InvalidAmount,

    #[error("Amount too large, would overflow")]
    Overflow,

    #[error("Invalid format: {0}")]
    InvalidFormat(String),
}

/// Received amount outside the accepted tolerance band.
///
/// `delta` is signed: negative means the deposit came in short.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Amount mismatch: expected {expected}, received {received} (delta {delta})")]
pub struct AmountMismatch {
    pub expected: Decimal,
    pub received: Decimal,
    pub delta: Decimal,
}

// ============================================================================
// Smallest unit -> whole unit
// ============================================================================

/// Convert a smallest-unit integer amount into whole units.
///
/// # Example
/// ```rust
/// use escrow_hub::money::to_whole_units;
/// use rust_decimal::Decimal;
///
/// let btc = to_whole_units(Decimal::from(990_000), 8).unwrap();
/// assert_eq!(btc.to_string(), "0.0099");
/// ```
pub fn to_whole_units(base_units: Decimal, decimals: u32) -> Result<Decimal, MoneyError> {
    if base_units.is_sign_negative() {
        return Err(MoneyError::InvalidAmount);
    }
    if !base_units.fract().is_zero() {
        return Err(MoneyError::InvalidFormat(format!(
            "smallest-unit amount must be an integer, got {}",
            base_units
        )));
    }

    let mantissa = base_units.trunc().mantissa();
    Decimal::try_from_i128_with_scale(mantissa, decimals)
        .map(|d| d.normalize())
        .map_err(|_| MoneyError::Overflow)
}

// ============================================================================
// Whole unit -> smallest unit
// ============================================================================

/// Convert a whole-unit amount into the provider's smallest unit.
///
/// # Errors
/// * `InvalidAmount` - zero or negative
/// * `PrecisionOverflow` - more fractional digits than the asset supports
/// * `Overflow` - result does not fit
pub fn to_base_units(amount: Decimal, decimals: u32) -> Result<u128, MoneyError> {
    if amount <= Decimal::ZERO {
        return Err(MoneyError::InvalidAmount);
    }

    let normalized = amount.normalize();
    if normalized.scale() > decimals {
        return Err(MoneyError::PrecisionOverflow {
            provided: normalized.scale(),
            max: decimals,
        });
    }

    let factor = 10u64
        .checked_pow(decimals)
        .map(Decimal::from)
        .ok_or(MoneyError::Overflow)?;

    normalized
        .checked_mul(factor)
        .and_then(|scaled| scaled.to_u128())
        .ok_or(MoneyError::Overflow)
}

/// Parse a client-supplied whole-unit amount string.
pub fn parse_amount(amount_str: &str) -> Result<Decimal, MoneyError> {
    let trimmed = amount_str.trim();
    if trimmed.is_empty() {
        return Err(MoneyError::InvalidFormat("empty string".into()));
    }
    let amount = Decimal::from_str(trimmed)
        .map_err(|_| MoneyError::InvalidFormat(format!("not a decimal: {}", trimmed)))?;
    if amount <= Decimal::ZERO {
        return Err(MoneyError::InvalidAmount);
    }
    Ok(amount)
}

// ============================================================================
// Tolerance matching
// ============================================================================

/// Accept `received` iff `|received - expected| <= tolerance * expected`.
///
/// The boundary is inclusive: a deposit exactly `tolerance` away is
/// accepted.
pub fn check_tolerance(
    expected: Decimal,
    received: Decimal,
    tolerance: Decimal,
) -> Result<(), AmountMismatch> {
    let delta = received - expected;
    let allowed = (tolerance * expected).abs();

    if expected > Decimal::ZERO && delta.abs() <= allowed {
        Ok(())
    } else {
        Err(AmountMismatch {
            expected,
            received,
            delta,
        })
    }
}
