//! Trading strategies
//!
//! Each strategy is a pure intent generator: it reads the bar context and
//! returns `OrderRequest`s, never touching the order book or positions
//! directly. The `StrategyBook` owns one instance of each variant and routes
//! every bar to exactly one of them based on the regime label.

pub mod emergency;
pub mod grid;
pub mod trend_follow;

pub use emergency::EmergencyStrategy;
pub use grid::GridStrategy;
pub use trend_follow::TrendFollowStrategy;

use crate::indicators::IndicatorSnapshot;
use crate::oms::{Order, OrderRequest, Position};
use crate::regime::RegimeLabel;
use crate::{Candle, Money, Symbol};

/// Everything a strategy may look at for one bar
#[derive(Debug)]
pub struct StrategyContext<'a> {
    pub symbol: &'a Symbol,
    pub candle: &'a Candle,
    pub snapshot: &'a IndicatorSnapshot,
    pub regime: RegimeLabel,
    pub position: Option<&'a Position>,
    /// Active (unfilled, uncancelled) orders resting in the book
    pub open_orders: &'a [Order],
    /// Account equity available for sizing
    pub equity: f64,
    /// Capital slice this symbol may deploy (equals equity in single-symbol runs)
    pub allocated_capital: f64,
}

pub trait Strategy: Send {
    fn name(&self) -> &'static str;

    /// Produce order intents for this bar. Side-effect free with respect to
    /// positions and the order book.
    fn generate_orders(&mut self, ctx: &StrategyContext) -> Vec<OrderRequest>;

    /// Propose a new protective stop for the open position. The engine
    /// ratchets: stops only ever tighten, never loosen.
    fn update_stop(&self, _position: &Position, _snap: &IndicatorSnapshot) -> Option<Money> {
        None
    }

    /// Ask the engine to cancel all resting orders before placing new ones
    fn wants_cancel_resting(&self, _ctx: &StrategyContext) -> bool {
        false
    }

    /// Notification that the routed regime changed since the previous bar
    fn on_regime_change(&mut self, _regime: RegimeLabel) {}
}

/// Which variant handles a given regime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    Trend,
    Grid,
    Emergency,
}

/// Route a regime label to a strategy. Ordinary trends go to the trend
/// follower only when ADX confirms strength; otherwise the grid trades them
/// as a drifting range.
pub fn route(regime: RegimeLabel, adx: f64, adx_threshold: f64) -> StrategyKind {
    match regime {
        RegimeLabel::Emergency => StrategyKind::Emergency,
        RegimeLabel::StrongUptrend | RegimeLabel::StrongDowntrend => StrategyKind::Trend,
        RegimeLabel::Uptrend | RegimeLabel::Downtrend => {
            if adx > adx_threshold {
                StrategyKind::Trend
            } else {
                StrategyKind::Grid
            }
        }
        RegimeLabel::WeakUptrend | RegimeLabel::WeakDowntrend | RegimeLabel::Range => {
            StrategyKind::Grid
        }
    }
}

/// Owns one instance of each strategy variant for a single symbol
pub struct StrategyBook {
    trend: TrendFollowStrategy,
    grid: GridStrategy,
    emergency: EmergencyStrategy,
    adx_threshold: f64,
    last_kind: Option<StrategyKind>,
}

impl StrategyBook {
    pub fn new(
        trend: TrendFollowStrategy,
        grid: GridStrategy,
        emergency: EmergencyStrategy,
        adx_threshold: f64,
    ) -> Self {
        Self {
            trend,
            grid,
            emergency,
            adx_threshold,
            last_kind: None,
        }
    }

    /// Select the strategy for this bar. Returns the strategy and whether the
    /// routing changed since the previous bar (the engine cancels resting
    /// orders on a switch).
    pub fn select(&mut self, regime: RegimeLabel, adx: f64) -> (&mut dyn Strategy, bool) {
        let kind = route(regime, adx, self.adx_threshold);
        let switched = self.last_kind.is_some_and(|prev| prev != kind);
        self.last_kind = Some(kind);

        let strategy: &mut dyn Strategy = match kind {
            StrategyKind::Trend => &mut self.trend,
            StrategyKind::Grid => &mut self.grid,
            StrategyKind::Emergency => &mut self.emergency,
        };
        if switched {
            strategy.on_regime_change(regime);
        }
        (strategy, switched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emergency_always_routes_to_emergency() {
        assert_eq!(
            route(RegimeLabel::Emergency, 80.0, 25.0),
            StrategyKind::Emergency
        );
    }

    #[test]
    fn ordinary_trend_tiebreak_uses_adx() {
        assert_eq!(route(RegimeLabel::Uptrend, 30.0, 25.0), StrategyKind::Trend);
        assert_eq!(route(RegimeLabel::Uptrend, 20.0, 25.0), StrategyKind::Grid);
        assert_eq!(route(RegimeLabel::Downtrend, 26.0, 25.0), StrategyKind::Trend);
    }

    #[test]
    fn weak_and_range_go_to_grid() {
        assert_eq!(route(RegimeLabel::Range, 40.0, 25.0), StrategyKind::Grid);
        assert_eq!(route(RegimeLabel::WeakUptrend, 40.0, 25.0), StrategyKind::Grid);
        assert_eq!(route(RegimeLabel::WeakDowntrend, 10.0, 25.0), StrategyKind::Grid);
    }

    #[test]
    fn strong_trends_always_trend_follow() {
        assert_eq!(route(RegimeLabel::StrongUptrend, 5.0, 25.0), StrategyKind::Trend);
        assert_eq!(
            route(RegimeLabel::StrongDowntrend, 5.0, 25.0),
            StrategyKind::Trend
        );
    }
}
