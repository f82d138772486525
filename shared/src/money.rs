//! Exact decimal money. No binary float appears anywhere in amounts —
//! every monetary value is a `rust_decimal::Decimal`, serialized as a
//! decimal string so round-trips are lossless.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Tolerance for monetary equality checks (0.01 in the major unit).
///
/// Kept as a runtime value rather than a constant so zero-decimal
/// currencies (JPY, KRW) can supply a tighter tolerance — see
/// `EngineConfig::money_tolerance` and spec.md §9 Open Questions.
pub const DEFAULT_MONEY_TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CurrencyError {
    #[error("currency code must be exactly 3 uppercase ASCII letters, got {0:?}")]
    InvalidFormat(String),
}

/// An ISO-4217 currency code, e.g. `EGP`, `USD`. Validated at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency([u8; 3]);

impl Currency {
    pub fn new(code: &str) -> Result<Self, CurrencyError> {
        let bytes = code.as_bytes();
        if bytes.len() != 3 || !bytes.iter().all(|b| b.is_ascii_uppercase()) {
            return Err(CurrencyError::InvalidFormat(code.to_string()));
        }
        Ok(Self([bytes[0], bytes[1], bytes[2]]))
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).expect("Currency bytes are always ASCII uppercase")
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Currency {
    type Err = CurrencyError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Currency {
    type Error = CurrencyError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<Currency> for String {
    fn from(value: Currency) -> Self {
        value.as_str().to_string()
    }
}

/// Exact decimal amount tagged with a currency. Equality is value-equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    amount: Decimal,
    currency: Currency,
}

impl Money {
    /// Construct a `Money`, rejecting negative amounts.
    ///
    /// Use [`Money::signed`] for `FinancialLine` amounts, which may
    /// legitimately be negative (fees, promos).
    pub fn new(amount: Decimal, currency: Currency) -> Result<Self, MoneyError> {
        if amount.is_sign_negative() {
            return Err(MoneyError::Negative(amount));
        }
        Ok(Self { amount, currency })
    }

    /// Construct a `Money` without a non-negativity check, for signed
    /// financial-line amounts (fees/promos are negative by convention).
    pub fn signed(amount: Decimal, currency: Currency) -> Self {
        Self { amount, currency }
    }

    pub fn zero(currency: Currency) -> Self {
        Self { amount: Decimal::ZERO, currency }
    }

    pub fn amount(&self) -> Decimal {
        self.amount
    }

    pub fn currency(&self) -> Currency {
        self.currency
    }

    pub fn is_zero(&self) -> bool {
        self.amount.is_zero()
    }

    /// Add two amounts of the same currency.
    pub fn checked_add(&self, other: &Money) -> Result<Money, MoneyError> {
        if self.currency != other.currency {
            return Err(MoneyError::CurrencyMismatch(self.currency, other.currency));
        }
        Ok(Money::signed(self.amount + other.amount, self.currency))
    }

    /// Absolute difference between two same-currency amounts.
    pub fn abs_diff(&self, other: &Money) -> Result<Decimal, MoneyError> {
        if self.currency != other.currency {
            return Err(MoneyError::CurrencyMismatch(self.currency, other.currency));
        }
        Ok((self.amount - other.amount).abs())
    }

    /// True if `self` and `other` are equal within `tolerance` (same currency required).
    pub fn approx_eq(&self, other: &Money, tolerance: Decimal) -> bool {
        self.currency == other.currency && (self.amount - other.amount).abs() <= tolerance
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MoneyError {
    #[error("money amount must be non-negative, got {0}")]
    Negative(Decimal),
    #[error("currency mismatch: {0} vs {1}")]
    CurrencyMismatch(Currency, Currency),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn currency_rejects_bad_codes() {
        assert!(Currency::new("EGP").is_ok());
        assert!(Currency::new("egp").is_err());
        assert!(Currency::new("EG").is_err());
        assert!(Currency::new("EGPX").is_err());
    }

    #[test]
    fn money_rejects_negative() {
        let egp = Currency::new("EGP").unwrap();
        assert!(Money::new(dec!(-1.00), egp).is_err());
        assert!(Money::new(dec!(1.00), egp).is_ok());
    }

    #[test]
    fn approx_eq_honors_tolerance() {
        let egp = Currency::new("EGP").unwrap();
        let a = Money::signed(dec!(100.00), egp);
        let b = Money::signed(dec!(100.004), egp);
        assert!(a.approx_eq(&b, dec!(0.01)));
        let c = Money::signed(dec!(100.02), egp);
        assert!(!a.approx_eq(&c, dec!(0.01)));
    }

    #[test]
    fn serde_round_trips_as_decimal_string() {
        let egp = Currency::new("EGP").unwrap();
        let m = Money::signed(dec!(198.83), egp);
        let json = serde_json::to_string(&m).unwrap();
        assert!(json.contains("\"198.83\""), "expected decimal string in {json}");
        let back: Money = serde_json::from_str(&json).unwrap();
        assert_eq!(m, back);
    }
}
