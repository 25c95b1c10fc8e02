//! Position and trade ledger
//!
//! Tracks one net position per symbol and converts closing fills into trade
//! records. Fills are deduplicated by id, so replaying the same fill event is
//! a no-op rather than a double-count.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use super::types::{Fill, FillId, Order, Position};
use crate::types::EngineError;
use crate::{Money, Side, Symbol, Trade, TradeId};

#[derive(Debug, Default)]
pub struct PositionBook {
    positions: HashMap<Symbol, Position>,
    processed_fills: HashSet<FillId>,
    next_trade_id: TradeId,
    /// Cumulative commission across all fills, open and closed
    total_commission: Money,
}

impl PositionBook {
    pub fn new() -> Self {
        Self {
            positions: HashMap::new(),
            processed_fills: HashSet::new(),
            next_trade_id: 1,
            total_commission: Money::ZERO,
        }
    }

    pub fn position(&self, symbol: &Symbol) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn position_mut(&mut self, symbol: &Symbol) -> Option<&mut Position> {
        self.positions.get_mut(symbol)
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn has_position(&self, symbol: &Symbol) -> bool {
        self.positions.contains_key(symbol)
    }

    pub fn total_commission(&self) -> Money {
        self.total_commission
    }

    /// Sum of unrealized PnL over open positions, using the supplied marks
    pub fn unrealized_pnl(&self, marks: &HashMap<Symbol, f64>) -> f64 {
        self.positions
            .values()
            .filter_map(|p| marks.get(&p.symbol).map(|price| p.unrealized_pnl(*price)))
            .sum()
    }

    /// Apply a fill to the book. Returns the trades closed by this fill
    /// (empty for opens and add-ons, and for replayed fill ids).
    pub fn apply_fill(&mut self, order: &Order, fill: &Fill) -> Result<Vec<Trade>, EngineError> {
        if !self.processed_fills.insert(fill.id) {
            warn!(fill_id = fill.id, "duplicate fill ignored");
            return Ok(Vec::new());
        }
        self.total_commission = self.total_commission + fill.commission;

        let symbol = order.symbol.clone();
        let Some(position) = self.positions.get_mut(&symbol) else {
            if order.reduce_only {
                return Err(EngineError::FillSimulation {
                    symbol: symbol.clone(),
                    reason: format!(
                        "reduce-only fill {} for order {} with no open position",
                        fill.id, order.id
                    ),
                });
            }
            let position =
                Position::from_fill(fill, symbol.clone(), order.side, order.protective_stop);
            debug!(
                symbol = %symbol,
                side = ?order.side,
                price = %fill.price,
                qty = %fill.quantity,
                "position opened"
            );
            self.positions.insert(symbol, position);
            return Ok(Vec::new());
        };

        if order.side == position.side {
            // Scaling in: weighted-average entry, stop untouched
            let prior_notional = position.average_entry_price * position.quantity;
            position.quantity = position.quantity + fill.quantity;
            position.average_entry_price =
                (prior_notional + fill.price * fill.quantity) / position.quantity;
            if order.is_addon {
                position.addon_count = position.addon_count.saturating_add(1);
            }
            position.last_update_time = fill.timestamp;
            return Ok(Vec::new());
        }

        // Opposite side: close (part of) the position
        if fill.quantity > position.quantity {
            return Err(EngineError::FillSimulation {
                symbol: symbol.clone(),
                reason: format!(
                    "closing fill {} for {} units exceeds open quantity {}",
                    fill.id, fill.quantity, position.quantity
                ),
            });
        }

        let exit_reason = order.client_id.clone().unwrap_or_else(|| "signal".into());
        let pnl = match position.side {
            Side::Buy => (fill.price - position.average_entry_price) * fill.quantity,
            Side::Sell => (position.average_entry_price - fill.price) * fill.quantity,
        };
        let trade = Trade {
            id: self.next_trade_id,
            symbol: symbol.clone(),
            side: position.side,
            entry_price: position.average_entry_price,
            exit_price: fill.price,
            quantity: fill.quantity,
            entry_time: position.first_entry_time,
            exit_time: fill.timestamp,
            pnl,
            commission: fill.commission,
            net_pnl: pnl - fill.commission,
            exit_reason,
        };
        self.next_trade_id += 1;

        position.realized_pnl = position.realized_pnl + trade.net_pnl;
        position.quantity = position.quantity - fill.quantity;
        position.last_update_time = fill.timestamp;

        if position.quantity.is_zero() {
            self.positions.remove(&symbol);
            debug!(symbol = %symbol, pnl = %trade.net_pnl, "position closed");
        }

        Ok(vec![trade])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oms::intent::OrderRequest;
    use crate::oms::types::next_fill_id;
    use chrono::Utc;

    fn sym() -> Symbol {
        Symbol::new("BTCUSDT")
    }

    fn order(side: Side, qty: f64) -> Order {
        OrderRequest::market(sym(), side, Money::from_f64(qty), "test").into_order(Utc::now(), 0)
    }

    fn fill_for(order: &Order, price: f64, qty: f64) -> Fill {
        Fill {
            id: next_fill_id(),
            order_id: order.id,
            price: Money::from_f64(price),
            quantity: Money::from_f64(qty),
            timestamp: Utc::now(),
            commission: Money::from_f64(0.1),
            is_maker: false,
        }
    }

    #[test]
    fn open_add_close_lifecycle() {
        let mut book = PositionBook::new();
        let open = order(Side::Buy, 1.0);
        let f1 = fill_for(&open, 100.0, 1.0);
        assert!(book.apply_fill(&open, &f1).unwrap().is_empty());

        // Add at a higher price: averaged entry
        let add = order(Side::Buy, 1.0);
        let f2 = fill_for(&add, 110.0, 1.0);
        assert!(book.apply_fill(&add, &f2).unwrap().is_empty());
        let pos = book.position(&sym()).unwrap();
        assert_eq!(pos.average_entry_price, Money::from_f64(105.0));
        assert_eq!(pos.quantity, Money::from_f64(2.0));

        // Full close
        let close = order(Side::Sell, 2.0);
        let f3 = fill_for(&close, 120.0, 2.0);
        let trades = book.apply_fill(&close, &f3).unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].pnl, Money::from_f64(30.0));
        assert!(!book.has_position(&sym()));
    }

    #[test]
    fn partial_close_keeps_entry_price() {
        let mut book = PositionBook::new();
        let open = order(Side::Sell, 3.0);
        let f1 = fill_for(&open, 100.0, 3.0);
        book.apply_fill(&open, &f1).unwrap();

        let cover = order(Side::Buy, 1.0);
        let f2 = fill_for(&cover, 90.0, 1.0);
        let trades = book.apply_fill(&cover, &f2).unwrap();
        assert_eq!(trades[0].pnl, Money::from_f64(10.0));

        let pos = book.position(&sym()).unwrap();
        assert_eq!(pos.quantity, Money::from_f64(2.0));
        assert_eq!(pos.average_entry_price, Money::from_f64(100.0));
    }

    #[test]
    fn duplicate_fill_is_ignored() {
        let mut book = PositionBook::new();
        let open = order(Side::Buy, 1.0);
        let f1 = fill_for(&open, 100.0, 1.0);
        book.apply_fill(&open, &f1).unwrap();
        book.apply_fill(&open, &f1).unwrap();
        assert_eq!(book.position(&sym()).unwrap().quantity, Money::from_f64(1.0));
    }

    #[test]
    fn over_close_is_a_simulation_error() {
        let mut book = PositionBook::new();
        let open = order(Side::Buy, 1.0);
        let f1 = fill_for(&open, 100.0, 1.0);
        book.apply_fill(&open, &f1).unwrap();

        let close = order(Side::Sell, 2.0);
        let f2 = fill_for(&close, 100.0, 2.0);
        assert!(matches!(
            book.apply_fill(&close, &f2),
            Err(EngineError::FillSimulation { .. })
        ));
    }

    #[test]
    fn reduce_only_without_position_fails() {
        let mut book = PositionBook::new();
        let close =
            OrderRequest::market(sym(), Side::Sell, Money::from_f64(1.0), "stop").reduce_only()
                .into_order(Utc::now(), 0);
        let f = fill_for(&close, 100.0, 1.0);
        assert!(book.apply_fill(&close, &f).is_err());
    }

    #[test]
    fn amount_conservation_over_random_walk() {
        // Sum of per-slice trade quantities equals total opened quantity
        let mut book = PositionBook::new();
        let open = order(Side::Buy, 5.0);
        let f = fill_for(&open, 100.0, 5.0);
        book.apply_fill(&open, &f).unwrap();

        let mut closed = Money::ZERO;
        for qty in [1.0, 2.0, 1.5, 0.5] {
            let close = order(Side::Sell, qty);
            let cf = fill_for(&close, 101.0, qty);
            for trade in book.apply_fill(&close, &cf).unwrap() {
                closed = closed + trade.quantity;
            }
        }
        assert_eq!(closed, Money::from_f64(5.0));
        assert!(!book.has_position(&sym()));
    }
}
