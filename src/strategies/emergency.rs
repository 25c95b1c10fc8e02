//! Emergency de-risking strategy
//!
//! Routed to whenever the regime filter reports Emergency. Sheds half of any
//! open position at market exactly once per emergency episode, tightens the
//! trailing stop to half the normal distance, and never opens anything.

use tracing::warn;

use super::{Strategy, StrategyContext};
use crate::config::{RiskConfig, TrendConfig};
use crate::indicators::IndicatorSnapshot;
use crate::oms::{OrderRequest, Position};
use crate::regime::RegimeLabel;
use crate::{Money, Side};

pub struct EmergencyStrategy {
    reduction: f64,
    trail_atr: f64,
    reduced_this_episode: bool,
}

impl EmergencyStrategy {
    pub fn new(risk: &RiskConfig, trend: &TrendConfig) -> Self {
        Self {
            reduction: risk.black_swan_reduction,
            // Half the normal trail: give back less in a crash
            trail_atr: trend.trailing_stop_atr / 2.0,
            reduced_this_episode: false,
        }
    }
}

impl Strategy for EmergencyStrategy {
    fn name(&self) -> &'static str {
        "emergency"
    }

    fn generate_orders(&mut self, ctx: &StrategyContext) -> Vec<OrderRequest> {
        let Some(position) = ctx.position else {
            return Vec::new();
        };
        if self.reduced_this_episode {
            return Vec::new();
        }
        self.reduced_this_episode = true;

        let reduce_qty = position.quantity * Money::from_f64(self.reduction);
        warn!(
            symbol = %ctx.symbol,
            qty = %reduce_qty,
            "emergency regime, shedding position"
        );
        vec![OrderRequest::market(
            ctx.symbol.clone(),
            position.side.opposite(),
            reduce_qty,
            "emergency_derisk",
        )
        .reduce_only()]
    }

    fn update_stop(&self, position: &Position, snap: &IndicatorSnapshot) -> Option<Money> {
        let distance = snap.atr * self.trail_atr;
        let stop = match position.side {
            Side::Buy => snap.close - distance,
            Side::Sell => snap.close + distance,
        };
        (stop > 0.0).then(|| Money::from_f64(stop))
    }

    /// Resting grid orders have no business surviving a crash bar
    fn wants_cancel_resting(&self, _ctx: &StrategyContext) -> bool {
        true
    }

    fn on_regime_change(&mut self, regime: RegimeLabel) {
        if regime == RegimeLabel::Emergency {
            self.reduced_this_episode = false;
        }
    }
}
