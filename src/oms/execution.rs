//! Fill simulation
//!
//! One fill check per order per bar. Market orders take the bar close plus
//! slippage; resting limits fill at their own price (maker) when the bar
//! range reaches them; stops trigger on a range touch and pay taker fees
//! plus slippage like the market orders they become.

use chrono::{DateTime, Utc};
use tracing::debug;

use super::types::{next_fill_id, Fill, Order, OrderState, OrderType};
use crate::config::ExecutionConfig;
use crate::{Candle, Money, Side};

/// Price and liquidity role a fill would execute at
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FillQuote {
    pub price: Money,
    pub is_maker: bool,
}

#[derive(Debug, Clone)]
pub struct ExecutionEngine {
    maker_fee: Money,
    taker_fee: Money,
    slippage: Money,
}

impl ExecutionEngine {
    pub fn new(config: &ExecutionConfig) -> Self {
        Self {
            maker_fee: Money::from_f64(config.maker_fee),
            taker_fee: Money::from_f64(config.taker_fee),
            slippage: Money::from_f64(config.slippage),
        }
    }

    /// Would a fresh maker-only limit cross the book immediately?
    /// Crossing makers are rejected at submission, not filled as takers.
    pub fn maker_limit_would_cross(&self, order: &Order, current_close: f64) -> bool {
        let Some(limit) = order.limit_price else {
            return false;
        };
        let close = Money::from_f64(current_close);
        match order.side {
            Side::Buy => limit >= close,
            Side::Sell => limit <= close,
        }
    }

    /// Check whether `order` fills against this bar. Returns the quote only;
    /// the caller decides quantity and applies the fill.
    pub fn check_fill(&self, order: &Order, candle: &Candle) -> Option<FillQuote> {
        if !order.is_active() {
            return None;
        }

        let high = Money::from_f64(candle.high);
        let low = Money::from_f64(candle.low);
        let close = Money::from_f64(candle.close);

        match order.order_type {
            OrderType::Market => {
                let price = match order.side {
                    Side::Buy => close * (Money::ONE + self.slippage),
                    Side::Sell => close * (Money::ONE - self.slippage),
                };
                Some(FillQuote {
                    price,
                    is_maker: false,
                })
            }
            OrderType::Limit => {
                let limit = order.limit_price?;
                let touched = match order.side {
                    Side::Buy => low <= limit,
                    Side::Sell => high >= limit,
                };
                touched.then_some(FillQuote {
                    price: limit,
                    is_maker: true,
                })
            }
            OrderType::Stop => {
                let stop = order.stop_price?;
                let triggered = match order.side {
                    // Buy stop sits above the market, sell stop below
                    Side::Buy => high >= stop,
                    Side::Sell => low <= stop,
                };
                if !triggered {
                    return None;
                }
                let price = match order.side {
                    Side::Buy => stop * (Money::ONE + self.slippage),
                    Side::Sell => stop * (Money::ONE - self.slippage),
                };
                Some(FillQuote {
                    price,
                    is_maker: false,
                })
            }
        }
    }

    /// Apply a quote to the order for `quantity` units, mutating its state
    /// machine and returning the fill event.
    pub fn execute_fill(
        &self,
        order: &mut Order,
        quote: FillQuote,
        quantity: Money,
        timestamp: DateTime<Utc>,
    ) -> Fill {
        let fee_rate = if quote.is_maker {
            self.maker_fee
        } else {
            self.taker_fee
        };
        let commission = quote.price * quantity * fee_rate;

        let prior_notional = order.average_fill_price * order.filled_quantity;
        order.filled_quantity = order.filled_quantity + quantity;
        order.remaining_quantity = (order.quantity - order.filled_quantity).max(Money::ZERO);
        order.average_fill_price =
            (prior_notional + quote.price * quantity) / order.filled_quantity;
        order.state = if order.remaining_quantity.is_zero() {
            OrderState::Filled
        } else {
            OrderState::PartiallyFilled
        };
        order.updated_at = timestamp;

        debug!(
            order_id = order.id,
            symbol = %order.symbol,
            side = ?order.side,
            price = %quote.price,
            qty = %quantity,
            maker = quote.is_maker,
            "fill"
        );

        Fill {
            id: next_fill_id(),
            order_id: order.id,
            price: quote.price,
            quantity,
            timestamp,
            commission,
            is_maker: quote.is_maker,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oms::intent::OrderRequest;
    use crate::Symbol;

    fn engine() -> ExecutionEngine {
        ExecutionEngine::new(&ExecutionConfig {
            maker_fee: 0.0004,
            taker_fee: 0.001,
            slippage: 0.001,
        })
    }

    fn bar(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle::new_unchecked(Utc::now(), open, high, low, close, 1000.0)
    }

    fn order(req: OrderRequest) -> Order {
        req.into_order(Utc::now(), 0)
    }

    #[test]
    fn market_buy_pays_slippage_above_close() {
        let eng = engine();
        let o = order(OrderRequest::market(
            Symbol::new("X"),
            Side::Buy,
            Money::from_f64(1.0),
            "t",
        ));
        let quote = eng.check_fill(&o, &bar(100.0, 101.0, 99.0, 100.0)).unwrap();
        assert_eq!(quote.price, Money::from_f64(100.1));
        assert!(!quote.is_maker);
    }

    #[test]
    fn market_sell_pays_slippage_below_close() {
        let eng = engine();
        let o = order(OrderRequest::market(
            Symbol::new("X"),
            Side::Sell,
            Money::from_f64(1.0),
            "t",
        ));
        let quote = eng.check_fill(&o, &bar(100.0, 101.0, 99.0, 100.0)).unwrap();
        assert_eq!(quote.price, Money::from_f64(99.9));
    }

    #[test]
    fn limit_buy_fills_only_when_bar_reaches_it() {
        let eng = engine();
        let o = order(OrderRequest::limit(
            Symbol::new("X"),
            Side::Buy,
            Money::from_f64(1.0),
            Money::from_f64(98.0),
            "t",
        ));
        assert!(eng.check_fill(&o, &bar(100.0, 101.0, 99.0, 100.0)).is_none());
        let quote = eng.check_fill(&o, &bar(100.0, 101.0, 97.5, 100.0)).unwrap();
        assert_eq!(quote.price, Money::from_f64(98.0));
        assert!(quote.is_maker);
    }

    #[test]
    fn stop_sell_triggers_on_low_and_slips() {
        let eng = engine();
        let o = order(OrderRequest::stop(
            Symbol::new("X"),
            Side::Sell,
            Money::from_f64(1.0),
            Money::from_f64(95.0),
            "t",
        ));
        assert!(eng.check_fill(&o, &bar(100.0, 101.0, 96.0, 100.0)).is_none());
        let quote = eng.check_fill(&o, &bar(96.0, 97.0, 94.0, 95.5)).unwrap();
        assert_eq!(quote.price, Money::from_f64(95.0) * Money::from_f64(0.999));
        assert!(!quote.is_maker);
    }

    #[test]
    fn crossing_maker_limit_is_detected() {
        let eng = engine();
        let o = order(
            OrderRequest::limit(
                Symbol::new("X"),
                Side::Buy,
                Money::from_f64(1.0),
                Money::from_f64(101.0),
                "t",
            )
            .maker_only(),
        );
        assert!(eng.maker_limit_would_cross(&o, 100.0));
        assert!(!eng.maker_limit_would_cross(&o, 102.0));
    }

    #[test]
    fn partial_fill_updates_state_and_average() {
        let eng = engine();
        let mut o = order(OrderRequest::limit(
            Symbol::new("X"),
            Side::Buy,
            Money::from_f64(2.0),
            Money::from_f64(98.0),
            "t",
        ));
        let quote = FillQuote {
            price: Money::from_f64(98.0),
            is_maker: true,
        };
        let f1 = eng.execute_fill(&mut o, quote, Money::from_f64(1.0), Utc::now());
        assert_eq!(o.state, OrderState::PartiallyFilled);
        assert_eq!(o.remaining_quantity, Money::from_f64(1.0));
        assert_eq!(f1.commission, Money::from_f64(98.0 * 0.0004));

        eng.execute_fill(&mut o, quote, Money::from_f64(1.0), Utc::now());
        assert_eq!(o.state, OrderState::Filled);
        assert_eq!(o.average_fill_price, Money::from_f64(98.0));
        assert!(o.remaining_quantity.is_zero());
    }
}
