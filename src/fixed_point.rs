//! # Fixed-Point Settlement Math
//!
//! The protocol expresses payout coefficients and fee shares as integers
//! scaled by `SCALE = 10^18`. All settlement math runs on a 256-bit signed
//! integer, so a `u128` coefficient times a `u64` wager never overflows and
//! negative results (player loses) are representable. No floating point.
//!
//! ## Rounding
//!
//! Division truncates toward zero. A losing delta of -1.5 units therefore
//! rounds to -1, never to -2.

use std::fmt;
use std::str::FromStr;

use ethnum::I256;

use crate::error::{PipelineError, PipelineResult};

/// Arbitrary-precision amount used for deltas and running totals.
pub type Amount = I256;

const DECIMAL_PLACES: u32 = 18;

/// 10^18
pub const SCALE: u128 = 10u128.pow(DECIMAL_PLACES);

/// A fixed-point number with 18 decimals over `I256`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct FixedPoint(I256);

impl FixedPoint {
    pub const ZERO: Self = Self(I256::ZERO);

    pub fn one() -> Self {
        Self(I256::from(SCALE))
    }

    /// Wraps an already-scaled protocol value.
    pub fn from_raw(raw: u128) -> Self {
        Self(I256::from(raw))
    }

    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        self.0.checked_add(rhs.0).map(Self)
    }

    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        self.0.checked_sub(rhs.0).map(Self)
    }

    /// `self * amount / SCALE`, truncating toward zero.
    pub fn checked_mul_amount(self, amount: Amount) -> Option<Amount> {
        self.0
            .checked_mul(amount)?
            .checked_div(I256::from(SCALE))
    }

    pub fn is_negative(self) -> bool {
        self.0 < I256::ZERO
    }
}

impl fmt::Debug for FixedPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FixedPoint({})", self)
    }
}

impl fmt::Display for FixedPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scale = I256::from(SCALE);
        let sign = if self.is_negative() { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let scale_u = scale.unsigned_abs();
        write!(
            f,
            "{}{}.{:0width$}",
            sign,
            abs / scale_u,
            abs % scale_u,
            width = DECIMAL_PLACES as usize
        )
    }
}

/// Settlement delta for a resolved trial:
/// `(k - SCALE) * multiplier / SCALE`.
///
/// Positive means the player is paid out, negative means the player lost.
pub fn settlement_delta(k: u128, multiplier: u64) -> PipelineResult<Amount> {
    let coefficient = FixedPoint::from_raw(k)
        .checked_sub(FixedPoint::one())
        .ok_or(PipelineError::Arithmetic("settlement coefficient"))?;
    coefficient
        .checked_mul_amount(Amount::from(multiplier))
        .ok_or(PipelineError::Arithmetic("settlement delta"))
}

/// `amount * share / SCALE`, for fee splits.
pub fn apply_share(amount: u64, share: u128) -> PipelineResult<Amount> {
    FixedPoint::from_raw(share)
        .checked_mul_amount(Amount::from(amount))
        .ok_or(PipelineError::Arithmetic("fee share"))
}

pub fn checked_add(a: Amount, b: Amount, what: &'static str) -> PipelineResult<Amount> {
    a.checked_add(b).ok_or(PipelineError::Arithmetic(what))
}

/// Parses an amount column stored as decimal text.
pub fn parse_amount(column: &'static str, value: &str) -> PipelineResult<Amount> {
    I256::from_str(value).map_err(|_| PipelineError::CorruptValue {
        column,
        value: value.to_string(),
    })
}
