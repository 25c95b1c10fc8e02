//! Core OMS types
//!
//! Orders, fills, and positions. All monetary values use `Money` so the
//! simulated ledger reconciles exactly across thousands of fills.

use crate::{Money, Side, Symbol};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

pub type OrderId = u64;
pub type FillId = u64;

static ORDER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);
static FILL_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Next order id (process-wide, lock-free)
pub fn next_order_id() -> OrderId {
    ORDER_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Next fill id; fill ids are what the trade ledger dedupes on
pub fn next_fill_id() -> FillId {
    FILL_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Order type - determines fill logic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    /// Fills immediately at the current bar close plus slippage
    Market,

    /// Buy fills when the bar trades at or below the limit price,
    /// sell when at or above
    Limit,

    /// Converts to a market fill (with slippage) once the stop price trades
    Stop,
}

/// Order state machine: Pending -> Open -> {PartiallyFilled ->} Filled,
/// or Cancelled/Rejected from any live state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    Pending,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

/// A resting or completed order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub limit_price: Option<Money>,
    pub stop_price: Option<Money>,
    pub quantity: Money,
    pub filled_quantity: Money,
    pub remaining_quantity: Money,
    pub average_fill_price: Money,
    pub state: OrderState,
    /// Reject instead of filling as taker (grid orders want the maker fee)
    pub maker_only: bool,
    /// Only ever shrinks an existing position; never opens or flips one
    pub reduce_only: bool,
    /// Protective stop recorded on the position opened by this order
    pub protective_stop: Option<Money>,
    /// Marks pyramiding add-ons so the position book can count them
    pub is_addon: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub client_id: Option<String>,
    pub created_bar_idx: Option<usize>,
}

impl Order {
    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            OrderState::Pending | OrderState::Open | OrderState::PartiallyFilled
        )
    }

    pub fn is_complete(&self) -> bool {
        matches!(
            self.state,
            OrderState::Filled | OrderState::Cancelled | OrderState::Rejected
        )
    }
}

/// Individual fill event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub id: FillId,
    pub order_id: OrderId,
    pub price: Money,
    pub quantity: Money,
    pub timestamp: DateTime<Utc>,
    pub commission: Money,
    pub is_maker: bool,
}

/// Net position for one symbol, exclusively owned by that symbol's engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: Symbol,
    pub side: Side,
    pub average_entry_price: Money,
    pub quantity: Money,
    /// Protective stop maintained by the owning strategy
    pub stop_price: Option<Money>,
    /// Entry-to-stop distance per unit at open; the R unit for pyramiding
    /// and profit locking
    pub initial_risk_per_unit: Money,
    /// Pyramiding add-ons applied so far
    pub addon_count: u8,
    pub realized_pnl: Money,
    pub first_entry_time: DateTime<Utc>,
    pub last_update_time: DateTime<Utc>,
}

impl Position {
    pub fn from_fill(fill: &Fill, symbol: Symbol, side: Side, protective_stop: Option<Money>) -> Self {
        let initial_risk_per_unit = protective_stop
            .map(|stop| (fill.price - stop).abs())
            .unwrap_or(Money::ZERO);
        Self {
            symbol,
            side,
            average_entry_price: fill.price,
            quantity: fill.quantity,
            stop_price: protective_stop,
            initial_risk_per_unit,
            addon_count: 0,
            realized_pnl: Money::ZERO,
            first_entry_time: fill.timestamp,
            last_update_time: fill.timestamp,
        }
    }

    pub fn unrealized_pnl(&self, current_price: f64) -> f64 {
        let price = Money::from_f64(current_price);
        let pnl = match self.side {
            Side::Buy => (price - self.average_entry_price) * self.quantity,
            Side::Sell => (self.average_entry_price - price) * self.quantity,
        };
        pnl.to_f64()
    }

    pub fn current_value(&self, current_price: f64) -> f64 {
        (self.quantity * Money::from_f64(current_price)).to_f64()
    }

    /// Open profit in initial-risk units; 0 when no stop was recorded
    pub fn r_multiple(&self, current_price: f64) -> f64 {
        if self.initial_risk_per_unit.is_zero() {
            return 0.0;
        }
        let price = Money::from_f64(current_price);
        let favorable = match self.side {
            Side::Buy => price - self.average_entry_price,
            Side::Sell => self.average_entry_price - price,
        };
        (favorable / self.initial_risk_per_unit).to_f64()
    }

    /// The bar crossed the protective stop
    pub fn stop_hit(&self, bar_high: f64, bar_low: f64) -> bool {
        let Some(stop) = self.stop_price else {
            return false;
        };
        match self.side {
            Side::Buy => Money::from_f64(bar_low) <= stop,
            Side::Sell => Money::from_f64(bar_high) >= stop,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn fill(price: f64, qty: f64) -> Fill {
        Fill {
            id: next_fill_id(),
            order_id: next_order_id(),
            price: Money::from_f64(price),
            quantity: Money::from_f64(qty),
            timestamp: Utc::now(),
            commission: Money::ZERO,
            is_maker: false,
        }
    }

    #[test]
    fn ids_are_monotonic() {
        let a = next_order_id();
        let b = next_order_id();
        assert!(b > a);
        let c = next_fill_id();
        let d = next_fill_id();
        assert!(d > c);
    }

    #[test]
    fn position_r_multiple_uses_initial_risk() {
        let f = fill(100.0, 2.0);
        let pos = Position::from_fill(&f, Symbol::new("BTCUSDT"), Side::Buy, Some(Money::from_f64(95.0)));
        assert_eq!(pos.initial_risk_per_unit, Money::from_f64(5.0));
        assert_relative_eq!(pos.r_multiple(110.0), 2.0, epsilon = 1e-9);
        assert_relative_eq!(pos.r_multiple(95.0), -1.0, epsilon = 1e-9);
    }

    #[test]
    fn short_position_pnl_inverts() {
        let f = fill(100.0, 1.0);
        let pos = Position::from_fill(&f, Symbol::new("BTCUSDT"), Side::Sell, None);
        assert_relative_eq!(pos.unrealized_pnl(90.0), 10.0, epsilon = 1e-9);
        assert_relative_eq!(pos.unrealized_pnl(110.0), -10.0, epsilon = 1e-9);
    }

    #[test]
    fn stop_hit_respects_side() {
        let f = fill(100.0, 1.0);
        let mut long = Position::from_fill(&f, Symbol::new("X"), Side::Buy, Some(Money::from_f64(95.0)));
        assert!(long.stop_hit(101.0, 94.0));
        assert!(!long.stop_hit(101.0, 96.0));

        long.side = Side::Sell;
        long.stop_price = Some(Money::from_f64(105.0));
        assert!(long.stop_hit(106.0, 99.0));
        assert!(!long.stop_hit(104.0, 99.0));
    }
}
