//! Risk management gate
//!
//! Every order intent passes through `RiskManager::approve` before it can
//! reach the order book. Exits are never blocked; entries are checked in a
//! fixed order: per-trade risk cap, daily-loss kill-switch, position-size
//! ceiling, black-swan conversion. Rejections carry a reason and are logged,
//! never silently dropped.

use chrono::{DateTime, NaiveDate, Utc};
use tracing::{info, warn};

use crate::config::RiskConfig;
use crate::oms::{OrderRequest, Position};
use crate::Money;

/// Outcome of the risk gate for one intent
#[derive(Debug, Clone)]
pub enum Verdict {
    /// Intent passes unchanged
    Approved(OrderRequest),
    /// Black-swan path: the entry was replaced with a position reduction
    Converted(OrderRequest),
    /// Intent dropped; the reason goes to the log and the run report
    Rejected { reason: String },
}

/// Account snapshot the gate evaluates an intent against
#[derive(Debug, Clone, Copy)]
pub struct AccountView<'a> {
    pub equity: f64,
    pub position: Option<&'a Position>,
    pub reference_price: f64,
    /// Absolute bar-over-bar gap fraction from the indicator engine
    pub gap_pct: f64,
}

#[derive(Debug, Clone)]
pub struct RiskManager {
    config: RiskConfig,
    current_day: Option<NaiveDate>,
    day_start_equity: f64,
    halted: bool,
}

impl RiskManager {
    pub fn new(config: RiskConfig) -> Self {
        Self {
            config,
            current_day: None,
            day_start_equity: 0.0,
            halted: false,
        }
    }

    /// Roll the daily-loss window and re-evaluate the kill-switch.
    /// Called once per bar before any intents are gated.
    pub fn on_bar(&mut self, timestamp: DateTime<Utc>, equity: f64) {
        let day = timestamp.date_naive();
        if self.current_day != Some(day) {
            if self.halted {
                info!(%day, "daily-loss halt lifted at UTC day boundary");
            }
            self.current_day = Some(day);
            self.day_start_equity = equity;
            self.halted = false;
        }

        if !self.halted && self.day_start_equity > 0.0 {
            let day_loss = (self.day_start_equity - equity) / self.day_start_equity;
            if day_loss >= self.config.max_daily_loss {
                warn!(
                    day_loss_pct = day_loss * 100.0,
                    limit_pct = self.config.max_daily_loss * 100.0,
                    "daily loss limit breached, new entries halted until next UTC day"
                );
                self.halted = true;
            }
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Gate one intent. Reduce-only intents always pass.
    pub fn approve(&self, request: OrderRequest, account: &AccountView) -> Verdict {
        if request.reduce_only {
            return Verdict::Approved(request);
        }

        // (a) per-trade risk cap
        let risk = request.risk_amount(account.reference_price);
        let cap = account.equity * self.config.max_risk_per_trade;
        let tolerance = account.equity * 1e-6;
        if risk > cap + tolerance {
            return self.reject(format!(
                "per-trade risk {risk:.2} exceeds cap {cap:.2} ({:.2}% of equity)",
                self.config.max_risk_per_trade * 100.0
            ));
        }

        // (b) daily-loss kill-switch
        if self.halted {
            return self.reject("daily loss limit reached, entries halted".into());
        }

        // (c) position-size ceiling
        let existing_value = account
            .position
            .filter(|p| p.side == request.side)
            .map(|p| p.current_value(account.reference_price))
            .unwrap_or(0.0);
        let projected = existing_value + request.notional(account.reference_price);
        let ceiling = account.equity * self.config.max_position_pct;
        if projected > ceiling + tolerance {
            return self.reject(format!(
                "projected position value {projected:.2} exceeds ceiling {ceiling:.2}"
            ));
        }

        // (d) black-swan gap: entries become reductions, never new exposure
        if account.gap_pct >= self.config.black_swan_gap_pct {
            return match account.position {
                Some(position) => {
                    let reduce_qty =
                        position.quantity * Money::from_f64(self.config.black_swan_reduction);
                    warn!(
                        symbol = %request.symbol,
                        gap_pct = account.gap_pct * 100.0,
                        "black-swan gap, entry converted to position reduction"
                    );
                    Verdict::Converted(
                        OrderRequest::market(
                            request.symbol,
                            position.side.opposite(),
                            reduce_qty,
                            "black_swan_reduction",
                        )
                        .reduce_only(),
                    )
                }
                None => self.reject(format!(
                    "black-swan gap {:.1}%, no new exposure",
                    account.gap_pct * 100.0
                )),
            };
        }

        Verdict::Approved(request)
    }

    fn reject(&self, reason: String) -> Verdict {
        warn!(reason = %reason, "order intent rejected");
        Verdict::Rejected { reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oms::types::{next_fill_id, next_order_id, Fill};
    use crate::{Side, Symbol};

    fn manager() -> RiskManager {
        RiskManager::new(RiskConfig::default())
    }

    fn account(equity: f64) -> AccountView<'static> {
        AccountView {
            equity,
            position: None,
            reference_price: 100.0,
            gap_pct: 0.0,
        }
    }

    fn entry(qty: f64, stop: f64) -> OrderRequest {
        OrderRequest::market(Symbol::new("BTCUSDT"), Side::Buy, Money::from_f64(qty), "entry")
            .with_protective_stop(Money::from_f64(stop))
    }

    fn open_position(qty: f64, price: f64) -> Position {
        let fill = Fill {
            id: next_fill_id(),
            order_id: next_order_id(),
            price: Money::from_f64(price),
            quantity: Money::from_f64(qty),
            timestamp: Utc::now(),
            commission: Money::ZERO,
            is_maker: false,
        };
        Position::from_fill(&fill, Symbol::new("BTCUSDT"), Side::Buy, None)
    }

    #[test]
    fn risk_cap_rejects_oversized_entries() {
        let rm = manager();
        // 4 units, stop 5 away: risk 20 on 10_000 equity (0.2%) passes
        match rm.approve(entry(4.0, 95.0), &account(10_000.0)) {
            Verdict::Approved(_) => {}
            other => panic!("expected approval, got {other:?}"),
        }
        // 100 units, stop 5 away: risk 500 exceeds the 2% cap of 200
        assert!(matches!(
            rm.approve(entry(100.0, 95.0), &account(10_000.0)),
            Verdict::Rejected { .. }
        ));
    }

    #[test]
    fn daily_loss_halt_blocks_entries_until_next_day() {
        let mut rm = manager();
        let day1 = "2024-03-01T00:00:00Z".parse().unwrap();
        rm.on_bar(day1, 10_000.0);
        rm.on_bar(day1 + chrono::Duration::hours(5), 9_400.0);
        assert!(rm.is_halted());
        assert!(matches!(
            rm.approve(entry(1.0, 95.0), &account(9_400.0)),
            Verdict::Rejected { .. }
        ));

        // Exits still pass while halted
        let exit = OrderRequest::market(
            Symbol::new("BTCUSDT"),
            Side::Sell,
            Money::from_f64(1.0),
            "stop",
        )
        .reduce_only();
        assert!(matches!(rm.approve(exit, &account(9_400.0)), Verdict::Approved(_)));

        // Next UTC day resets the switch
        rm.on_bar(day1 + chrono::Duration::days(1), 9_400.0);
        assert!(!rm.is_halted());
    }

    #[test]
    fn position_ceiling_counts_existing_same_side_exposure() {
        let rm = manager();
        let pos = open_position(30.0, 100.0); // value 3000 at ref price
        let view = AccountView {
            equity: 10_000.0,
            position: Some(&pos),
            reference_price: 100.0,
            gap_pct: 0.0,
        };
        // 1 more unit (100) stays under the 3500 ceiling
        assert!(matches!(rm.approve(entry(1.0, 99.0), &view), Verdict::Approved(_)));
        // 10 more units (1000) would breach it
        let big = OrderRequest::market(
            Symbol::new("BTCUSDT"),
            Side::Buy,
            Money::from_f64(10.0),
            "entry",
        )
        .with_protective_stop(Money::from_f64(99.0));
        assert!(matches!(rm.approve(big, &view), Verdict::Rejected { .. }));
    }

    #[test]
    fn black_swan_converts_entries_into_reductions() {
        let rm = manager();
        let pos = open_position(10.0, 100.0);
        let view = AccountView {
            equity: 10_000.0,
            position: Some(&pos),
            reference_price: 100.0,
            gap_pct: 0.20,
        };
        match rm.approve(entry(1.0, 99.0), &view) {
            Verdict::Converted(reduction) => {
                assert!(reduction.reduce_only);
                assert_eq!(reduction.side, Side::Sell);
                assert_eq!(reduction.quantity, Money::from_f64(5.0));
            }
            other => panic!("expected conversion, got {other:?}"),
        }

        // No position to reduce: the entry is simply rejected
        let flat = AccountView {
            equity: 10_000.0,
            position: None,
            reference_price: 100.0,
            gap_pct: 0.20,
        };
        assert!(matches!(rm.approve(entry(1.0, 99.0), &flat), Verdict::Rejected { .. }));
    }
}
