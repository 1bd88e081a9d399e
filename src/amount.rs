//! Fixed-point USDC amounts
//!
//! All ledger and chain comparisons happen on integer amounts in the token's
//! smallest unit (6 decimals). Floating point never touches a balance check.

use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Smallest units per whole USDC (6 decimals).
pub const UNITS_PER_USDC: i64 = 1_000_000;

/// Circle transfers settle in USD with 2 decimal places.
const UNITS_PER_CENT: i64 = 10_000;

/// Escrow fee in basis points (3%).
pub const DEFAULT_FEE_BPS: u32 = 300;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AmountError {
    #[error("invalid amount: {0}")]
    Invalid(String),
    #[error("amount out of range")]
    Overflow,
}

/// A USDC amount held as integer units of 10^-6. Serializes as its canonical
/// 6-decimal string so JSON consumers never see float drift.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Usdc(i64);

impl Serialize for Usdc {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Usdc {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Usdc::parse(&raw).map_err(D::Error::custom)
    }
}

impl Usdc {
    pub const ZERO: Usdc = Usdc(0);

    pub fn from_units(units: i64) -> Self {
        Usdc(units)
    }

    pub fn units(&self) -> i64 {
        self.0
    }

    /// Parse a decimal string ("1030.000000", "300.01", "42") into units.
    /// At most 6 fractional digits are accepted; this is exact, never a float.
    pub fn parse(s: &str) -> Result<Self, AmountError> {
        let s = s.trim();
        let (negative, s) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };

        let (whole, fraction) = match s.split_once('.') {
            Some((w, f)) => (w, f),
            None => (s, ""),
        };

        if whole.is_empty() && fraction.is_empty() {
            return Err(AmountError::Invalid(s.to_string()));
        }

        if fraction.len() > 6 {
            return Err(AmountError::Invalid(format!(
                "more than 6 decimal places: {s}"
            )));
        }

        if !whole.chars().all(|c| c.is_ascii_digit())
            || !fraction.chars().all(|c| c.is_ascii_digit())
        {
            return Err(AmountError::Invalid(s.to_string()));
        }

        let whole_units: i64 = if whole.is_empty() {
            0
        } else {
            whole
                .parse::<i64>()
                .map_err(|_| AmountError::Overflow)?
                .checked_mul(UNITS_PER_USDC)
                .ok_or(AmountError::Overflow)?
        };

        let mut frac = fraction.to_string();
        while frac.len() < 6 {
            frac.push('0');
        }
        let frac_units: i64 = if frac.is_empty() { 0 } else { frac.parse().unwrap_or(0) };

        let units = whole_units
            .checked_add(frac_units)
            .ok_or(AmountError::Overflow)?;

        Ok(Usdc(if negative { -units } else { units }))
    }

    /// Escrow total = prize + prize * fee_bps / 10_000, in integer units.
    pub fn with_fee(&self, fee_bps: u32) -> Result<Self, AmountError> {
        let fee = (self.0 as i128)
            .checked_mul(fee_bps as i128)
            .ok_or(AmountError::Overflow)?
            / 10_000;
        let total = (self.0 as i128)
            .checked_add(fee)
            .ok_or(AmountError::Overflow)?;
        i64::try_from(total).map(Usdc).map_err(|_| AmountError::Overflow)
    }

    /// Round down to the Circle transfer precision (2 decimal places).
    pub fn floor_to_cents(&self) -> Self {
        Usdc((self.0 / UNITS_PER_CENT) * UNITS_PER_CENT)
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    pub fn checked_sub(&self, other: Usdc) -> Option<Usdc> {
        self.0.checked_sub(other.0).map(Usdc)
    }

    /// The on-chain token also carries 6 decimals, so chain words compare
    /// against the same unit count.
    pub fn token_units(&self) -> Option<u128> {
        u128::try_from(self.0).ok()
    }

    /// Format as USD with 2 decimals for the transfer API ("300.00").
    pub fn as_usd2_string(&self) -> String {
        let cents = self.0 / UNITS_PER_CENT;
        format!("{}.{:02}", cents / 100, (cents % 100).abs())
    }
}

impl fmt::Display for Usdc {
    /// Canonical 6-decimal rendering, matching the ledger's numeric scale.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(
            f,
            "{}{}.{:06}",
            sign,
            abs / UNITS_PER_USDC as u64,
            abs % UNITS_PER_USDC as u64
        )
    }
}

/// Canonicalize a JSON-number amount from a request body. The float is
/// rendered at 6 decimals and re-parsed, so everything downstream is integer.
pub fn canonicalize_request_amount(amount: f64) -> Result<Usdc, AmountError> {
    if !amount.is_finite() || amount <= 0.0 {
        return Err(AmountError::Invalid(format!("{amount}")));
    }
    Usdc::parse(&format!("{amount:.6}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_format() {
        assert_eq!(Usdc::parse("1000").unwrap().units(), 1_000_000_000);
        assert_eq!(Usdc::parse("1000.000000").unwrap().units(), 1_000_000_000);
        assert_eq!(Usdc::parse("300.01").unwrap().units(), 300_010_000);
        assert_eq!(Usdc::parse("0.000001").unwrap().units(), 1);
        assert_eq!(Usdc::from_units(1_030_000_000).to_string(), "1030.000000");
        assert_eq!(Usdc::from_units(1).to_string(), "0.000001");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Usdc::parse("").is_err());
        assert!(Usdc::parse(".").is_err());
        assert!(Usdc::parse("1.2345678").is_err());
        assert!(Usdc::parse("12a.00").is_err());
        assert!(Usdc::parse("1e6").is_err());
    }

    #[test]
    fn test_escrow_fee_300_bps() {
        // 1000.000000 prize at 300 bps must be exactly 1030.000000
        let prize = Usdc::parse("1000.000000").unwrap();
        let escrow = prize.with_fee(DEFAULT_FEE_BPS).unwrap();
        assert_eq!(escrow, Usdc::parse("1030.000000").unwrap());
        assert_eq!(escrow.to_string(), "1030.000000");
    }

    #[test]
    fn test_fee_truncates_no_drift() {
        // 0.000001 * 300 / 10000 truncates to zero fee
        let prize = Usdc::from_units(1);
        assert_eq!(prize.with_fee(DEFAULT_FEE_BPS).unwrap().units(), 1);

        let prize = Usdc::parse("33.333333").unwrap();
        // fee = 33_333_333 * 300 / 10_000 = 999_999 (floor)
        assert_eq!(
            prize.with_fee(DEFAULT_FEE_BPS).unwrap().units(),
            33_333_333 + 999_999
        );
    }

    #[test]
    fn test_floor_to_cents() {
        assert_eq!(
            Usdc::parse("300.009999").unwrap().floor_to_cents(),
            Usdc::parse("300.00").unwrap()
        );
        assert_eq!(
            Usdc::parse("300.00").unwrap().floor_to_cents(),
            Usdc::parse("300.00").unwrap()
        );
        assert_eq!(Usdc::from_units(9_999).floor_to_cents(), Usdc::ZERO);
    }

    #[test]
    fn test_usd2_rendering() {
        assert_eq!(Usdc::parse("300.00").unwrap().as_usd2_string(), "300.00");
        assert_eq!(Usdc::parse("1030.5").unwrap().as_usd2_string(), "1030.50");
        assert_eq!(Usdc::parse("0.01").unwrap().as_usd2_string(), "0.01");
    }

    #[test]
    fn test_canonicalize_request_amount() {
        assert_eq!(
            canonicalize_request_amount(300.0).unwrap(),
            Usdc::parse("300.000000").unwrap()
        );
        assert!(canonicalize_request_amount(0.0).is_err());
        assert!(canonicalize_request_amount(-1.0).is_err());
        assert!(canonicalize_request_amount(f64::NAN).is_err());
        assert!(canonicalize_request_amount(f64::INFINITY).is_err());
    }

    #[test]
    fn test_withdrawal_scenario() {
        // earned 500 internal, withdrawn 200 external -> 300 available
        let earned = Usdc::parse("500.000000").unwrap();
        let withdrawn = Usdc::parse("200.000000").unwrap();
        let available = earned.checked_sub(withdrawn).unwrap();
        assert_eq!(available, Usdc::parse("300.000000").unwrap());

        // 300.01 floors to 300.01 and exceeds the balance
        let too_much = canonicalize_request_amount(300.01).unwrap().floor_to_cents();
        assert!(too_much > available);

        // 300.00 floors to 300.00 and is allowed
        let exact = canonicalize_request_amount(300.00).unwrap().floor_to_cents();
        assert!(exact <= available);
        assert_eq!(exact.as_usd2_string(), "300.00");
    }
}
