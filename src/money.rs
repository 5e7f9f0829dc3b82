//! Fixed-point money and basis-point rates
//!
//! All ledger amounts are integer minor units (cents) so that accrual,
//! commission and pool arithmetic never drifts through floating point.
//! Rates are basis points: 1250 bps = 12.5%.

use std::fmt;

use serde::{Deserialize, Deserializer};

use crate::error::EngineError;

/// Amount in minor units (1.00 = 100)
pub type Amount = i64;

/// Minor units per whole currency unit
pub const AMOUNT_SCALE: i64 = 100;

/// Basis points in 100%
pub const BPS_DENOMINATOR: i64 = 10_000;

/// A rate expressed in basis points
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Bps(pub u32);

impl Bps {
    /// Apply the rate to an amount, rounding toward zero
    pub fn apply(self, amount: Amount) -> Amount {
        // i128 intermediate: amount * bps cannot overflow for any i64 amount
        ((amount as i128 * self.0 as i128) / BPS_DENOMINATOR as i128) as Amount
    }

    pub fn validate(self, name: &str) -> Result<(), EngineError> {
        if self.0 as i64 > BPS_DENOMINATOR {
            return Err(EngineError::InvalidInput(format!(
                "{} must be at most {} bps, got {}",
                name, BPS_DENOMINATOR, self.0
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Bps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}bps", self.0)
    }
}

/// Format minor units as a decimal string ("1250" -> "12.50")
pub fn format_amount(amount: Amount) -> String {
    let sign = if amount < 0 { "-" } else { "" };
    let abs = amount.unsigned_abs();
    format!(
        "{}{}.{:02}",
        sign,
        abs / AMOUNT_SCALE as u64,
        abs % AMOUNT_SCALE as u64
    )
}

/// Parse a decimal string into minor units ("100", "100.5", "100.50")
pub fn parse_amount(input: &str) -> Result<Amount, EngineError> {
    let s = input.trim();
    let invalid = || EngineError::InvalidInput(format!("Invalid amount: {:?}", input));

    let (negative, s) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };

    let (whole, frac) = match s.split_once('.') {
        Some((w, f)) => (w, f),
        None => (s, ""),
    };

    if whole.is_empty() || frac.len() > 2 {
        return Err(invalid());
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }

    let whole: i64 = whole.parse().map_err(|_| invalid())?;
    let frac_units: i64 = match frac.len() {
        0 => 0,
        1 => frac.parse::<i64>().map_err(|_| invalid())? * 10,
        _ => frac.parse().map_err(|_| invalid())?,
    };

    let value = whole
        .checked_mul(AMOUNT_SCALE)
        .and_then(|v| v.checked_add(frac_units))
        .ok_or_else(invalid)?;

    Ok(if negative { -value } else { value })
}

/// Accept minor units (`10000`) or a decimal string (`"100.00"`)
pub fn deserialize_amount<'de, D>(deserializer: D) -> Result<Amount, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Minor(i64),
        Decimal(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Minor(units) => Ok(units),
        Raw::Decimal(text) => parse_amount(&text).map_err(serde::de::Error::custom),
    }
}
