//! Monetary values with exact two-decimal arithmetic.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// ISO-4217 currencies accepted by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Currency {
    /// United States dollar.
    USD,
    /// Euro.
    EUR,
    /// Pound sterling.
    GBP,
    /// Indian rupee.
    INR,
    /// Singapore dollar.
    SGD,
    /// Australian dollar.
    AUD,
    /// Japanese yen.
    JPY,
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code = match self {
            Currency::USD => "USD",
            Currency::EUR => "EUR",
            Currency::GBP => "GBP",
            Currency::INR => "INR",
            Currency::SGD => "SGD",
            Currency::AUD => "AUD",
            Currency::JPY => "JPY",
        };
        write!(f, "{}", code)
    }
}

/// Errors raised by [`Money`] construction and arithmetic.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MoneyError {
    /// Amount was negative.
    #[error("amount must not be negative: {0}")]
    Negative(Decimal),

    /// Arithmetic across two different currencies.
    #[error("currency mismatch: {left} vs {right}")]
    CurrencyMismatch {
        /// Currency of the left operand.
        left: Currency,
        /// Currency of the right operand.
        right: Currency,
    },

    /// Subtraction would produce a negative amount.
    #[error("insufficient amount: {minuend} - {subtrahend}")]
    Underflow {
        /// The amount being subtracted from.
        minuend: Decimal,
        /// The amount being subtracted.
        subtrahend: Decimal,
    },

    /// Input could not be represented as a decimal (NaN, infinity).
    #[error("amount is not a finite number")]
    NotFinite,
}

/// A non-negative monetary amount in a single currency.
///
/// Amounts are normalized to two decimal places on construction. All
/// arithmetic is exact and rejects cross-currency operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    amount: Decimal,
    currency: Currency,
}

impl Money {
    /// Create a new amount, normalizing to two decimal places.
    pub fn new(amount: Decimal, currency: Currency) -> Result<Self, MoneyError> {
        if amount.is_sign_negative() && !amount.is_zero() {
            return Err(MoneyError::Negative(amount));
        }
        Ok(Self {
            amount: amount.round_dp(2).normalize(),
            currency,
        })
    }

    /// Create an amount from a float, rejecting NaN and infinities.
    pub fn from_f64(amount: f64, currency: Currency) -> Result<Self, MoneyError> {
        let decimal = Decimal::try_from(amount).map_err(|_| MoneyError::NotFinite)?;
        Self::new(decimal, currency)
    }

    /// A zero amount in the given currency.
    pub fn zero(currency: Currency) -> Self {
        Self {
            amount: Decimal::ZERO,
            currency,
        }
    }

    /// The decimal amount.
    pub fn amount(&self) -> Decimal {
        self.amount
    }

    /// The currency.
    pub fn currency(&self) -> Currency {
        self.currency
    }

    /// Whether the amount is exactly zero.
    pub fn is_zero(&self) -> bool {
        self.amount.is_zero()
    }

    /// Add two amounts of the same currency.
    pub fn add(&self, other: &Money) -> Result<Money, MoneyError> {
        self.ensure_same_currency(other)?;
        Money::new(self.amount + other.amount, self.currency)
    }

    /// Subtract another amount of the same currency; rejects underflow.
    pub fn subtract(&self, other: &Money) -> Result<Money, MoneyError> {
        self.ensure_same_currency(other)?;
        if other.amount > self.amount {
            return Err(MoneyError::Underflow {
                minuend: self.amount,
                subtrahend: other.amount,
            });
        }
        Money::new(self.amount - other.amount, self.currency)
    }

    fn ensure_same_currency(&self, other: &Money) -> Result<(), MoneyError> {
        if self.currency != other.currency {
            return Err(MoneyError::CurrencyMismatch {
                left: self.currency,
                right: other.currency,
            });
        }
        Ok(())
    }
}

impl std::fmt::Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.amount.round_dp(2), self.currency)
    }
}
