//! Core data types shared across the trading engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Validation errors for candle data
#[derive(Debug, Error)]
pub enum CandleValidationError {
    #[error("high ({high}) must be >= low ({low})")]
    HighLessThanLow { high: f64, low: f64 },

    #[error("high ({high}) must be >= max(open={open}, close={close})")]
    HighBelowBody { high: f64, open: f64, close: f64 },

    #[error("low ({low}) must be <= min(open={open}, close={close})")]
    LowAboveBody { low: f64, open: f64, close: f64 },

    #[error("volume ({0}) must be >= 0")]
    NegativeVolume(f64),

    #[error("prices must be positive: open={open}, high={high}, low={low}, close={close}")]
    NonPositivePrice {
        open: f64,
        high: f64,
        low: f64,
        close: f64,
    },
}

/// OHLCV candlestick
///
/// Immutable once produced by the data loader; the engine only ever reads
/// candles, it never patches them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub datetime: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Create a new candle with validation
    pub fn new(
        datetime: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Result<Self, CandleValidationError> {
        let candle = Self {
            datetime,
            open,
            high,
            low,
            close,
            volume,
        };
        candle.validate()?;
        Ok(candle)
    }

    /// Create a candle without validation (trusted sources, synthetic test data)
    pub fn new_unchecked(
        datetime: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Self {
        Self {
            datetime,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Validate the candle geometry
    pub fn validate(&self) -> Result<(), CandleValidationError> {
        if self.open <= 0.0 || self.high <= 0.0 || self.low <= 0.0 || self.close <= 0.0 {
            return Err(CandleValidationError::NonPositivePrice {
                open: self.open,
                high: self.high,
                low: self.low,
                close: self.close,
            });
        }

        if self.high < self.low {
            return Err(CandleValidationError::HighLessThanLow {
                high: self.high,
                low: self.low,
            });
        }

        if self.high < self.open.max(self.close) {
            return Err(CandleValidationError::HighBelowBody {
                high: self.high,
                open: self.open,
                close: self.close,
            });
        }

        if self.low > self.open.min(self.close) {
            return Err(CandleValidationError::LowAboveBody {
                low: self.low,
                open: self.open,
                close: self.close,
            });
        }

        if self.volume < 0.0 {
            return Err(CandleValidationError::NegativeVolume(self.volume));
        }

        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Typical price used by VWAP
    pub fn typical_price(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }
}

/// Trading pair symbol using Arc<str> for cheap cloning
///
/// Symbols travel with every order, position, and trade; Arc<str> keeps those
/// clones allocation-free.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(#[serde(with = "arc_str_serde")] std::sync::Arc<str>);

mod arc_str_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::sync::Arc;

    pub fn serialize<S>(value: &Arc<str>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(value)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Arc<str>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Arc::from(s.as_str()))
    }
}

impl Symbol {
    pub fn new(s: impl AsRef<str>) -> Self {
        Symbol(std::sync::Arc::from(s.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

/// Trade id, unique within a run
pub type TradeId = u64;

/// Completed (round-trip) trade record
///
/// Created exactly once when a position slice is closed; immutable and
/// append-only in the backtest ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: TradeId,
    pub symbol: Symbol,
    pub side: Side,
    pub entry_price: Money,
    pub exit_price: Money,
    pub quantity: Money,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub pnl: Money,
    pub commission: Money,
    pub net_pnl: Money,
    /// Why the position slice was closed ("stop", "signal", "end_of_run", ...)
    pub exit_reason: String,
}

impl Trade {
    /// Return percentage of the round trip
    pub fn return_pct(&self) -> f64 {
        if self.entry_price.is_zero() {
            return 0.0;
        }
        let pct = match self.side {
            Side::Buy => (self.exit_price - self.entry_price) / self.entry_price,
            Side::Sell => (self.entry_price - self.exit_price) / self.entry_price,
        };
        pct.to_f64() * 100.0
    }
}

/// One point on the equity curve
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    pub equity: f64,
}

/// Summary statistics for a completed run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_return: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub calmar_ratio: f64,
    pub max_drawdown: f64,
    pub win_rate: f64,
    /// Gross profit / gross loss; infinity when there are no losses
    pub profit_factor: f64,
    /// (win rate x avg win) - (loss rate x avg loss), per trade
    pub expectancy: f64,
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub max_consecutive_wins: usize,
    pub max_consecutive_losses: usize,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    pub total_commission: f64,
}

/// Engine-level error taxonomy
///
/// Warm-up shortfalls and risk rejections are recovered locally and never
/// surface here; these variants are the ones that abort a run (or a symbol).
#[derive(Debug, Error)]
pub enum EngineError {
    /// Missing or out-of-range configuration; fatal at startup
    #[error("configuration error: {0}")]
    Config(String),

    /// Inconsistent order/position state; fatal for the symbol's run
    #[error("fill simulation error for {symbol}: {reason}")]
    FillSimulation { symbol: Symbol, reason: String },

    /// Run was cooperatively cancelled; partial results are discarded
    #[error("backtest cancelled")]
    Cancelled,

    /// Data loading or validation failure
    #[error("data error: {0}")]
    Data(String),
}

// ============================================================================
// Money - precise decimal arithmetic for monetary values
// ============================================================================

use rust_decimal::Decimal;
use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub, SubAssign};

/// Decimal wrapper used for all monetary values in the OMS: prices,
/// quantities, PnL, commissions.
///
/// f64 drifts (`0.1 + 0.2 != 0.3`); over thousands of simulated fills the
/// ledger would stop reconciling. Indicator math stays in f64 and converts at
/// the OMS boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(#[serde(with = "rust_decimal::serde::str")] Decimal);

impl Money {
    pub const ZERO: Money = Money(Decimal::ZERO);
    pub const ONE: Money = Money(Decimal::ONE);

    /// Create from f64; NaN and infinities collapse to zero
    pub fn from_f64(value: f64) -> Self {
        Money(Decimal::try_from(value).unwrap_or(Decimal::ZERO))
    }

    pub fn from_i64(value: i64) -> Self {
        Money(Decimal::from(value))
    }

    pub fn to_f64(self) -> f64 {
        use rust_decimal::prelude::ToPrimitive;
        self.0.to_f64().unwrap_or(0.0)
    }

    pub fn abs(self) -> Self {
        Money(self.0.abs())
    }

    pub fn is_zero(self) -> bool {
        self.0.is_zero()
    }

    pub fn is_positive(self) -> bool {
        self.0.is_sign_positive() && !self.0.is_zero()
    }

    pub fn is_negative(self) -> bool {
        self.0.is_sign_negative() && !self.0.is_zero()
    }

    pub fn max(self, other: Self) -> Self {
        Money(self.0.max(other.0))
    }

    pub fn min(self, other: Self) -> Self {
        Money(self.0.min(other.0))
    }

    pub fn inner(self) -> Decimal {
        self.0
    }
}

impl From<Decimal> for Money {
    fn from(value: Decimal) -> Self {
        Money(value)
    }
}

impl Default for Money {
    fn default() -> Self {
        Self::ZERO
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PartialOrd for Money {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Money {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl Add for Money {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Money(self.0 + rhs.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Sub for Money {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Money(self.0 - rhs.0)
    }
}

impl SubAssign for Money {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

impl Mul for Money {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self::Output {
        Money(self.0 * rhs.0)
    }
}

impl Div for Money {
    type Output = Self;
    fn div(self, rhs: Self) -> Self::Output {
        if rhs.0.is_zero() {
            Money::ZERO
        } else {
            Money(self.0 / rhs.0)
        }
    }
}

impl Neg for Money {
    type Output = Self;
    fn neg(self) -> Self::Output {
        Money(-self.0)
    }
}

impl std::iter::Sum for Money {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Money::ZERO, |acc, x| acc + x)
    }
}

impl<'a> std::iter::Sum<&'a Money> for Money {
    fn sum<I: Iterator<Item = &'a Self>>(iter: I) -> Self {
        iter.fold(Money::ZERO, |acc, x| acc + *x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rust_decimal_macros::dec;

    #[test]
    fn money_addition_is_exact() {
        let a = Money::from_f64(0.1);
        let b = Money::from_f64(0.2);
        assert_eq!(a + b, Money::from(dec!(0.3)));
    }

    #[test]
    fn money_div_by_zero_is_zero() {
        assert_eq!(Money::from_f64(42.0) / Money::ZERO, Money::ZERO);
    }

    #[test]
    fn candle_validation_rejects_bad_geometry() {
        let dt = Utc::now();
        // high below the body
        assert!(Candle::new(dt, 100.0, 99.0, 95.0, 98.0, 1.0).is_err());
        // low above the body
        assert!(Candle::new(dt, 100.0, 105.0, 101.0, 102.0, 1.0).is_err());
        // negative volume
        assert!(Candle::new(dt, 100.0, 105.0, 95.0, 102.0, -1.0).is_err());
        // valid
        assert!(Candle::new(dt, 100.0, 105.0, 95.0, 102.0, 1.0).is_ok());
    }

    #[test]
    fn trade_return_pct_accounts_for_side() {
        let t = Trade {
            id: 1,
            symbol: Symbol::new("BTCUSDT"),
            side: Side::Sell,
            entry_price: Money::from_f64(100.0),
            exit_price: Money::from_f64(90.0),
            quantity: Money::ONE,
            entry_time: Utc::now(),
            exit_time: Utc::now(),
            pnl: Money::from_f64(10.0),
            commission: Money::ZERO,
            net_pnl: Money::from_f64(10.0),
            exit_reason: "signal".into(),
        };
        assert_relative_eq!(t.return_pct(), 10.0, epsilon = 1e-9);
    }

    #[test]
    fn symbol_is_cheap_to_clone_and_displays() {
        let s = Symbol::new("ETHUSDT");
        let s2 = s.clone();
        assert_eq!(s, s2);
        assert_eq!(format!("{s}"), "ETHUSDT");
    }
}
