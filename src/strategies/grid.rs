//! Mean-reversion grid strategy
//!
//! Builds a ladder of maker-only limit orders across a narrowed Donchian
//! range: buys below the current price, sells above. Level spacing is ATR
//! driven, so quiet markets get a denser grid than volatile ones. When price
//! escapes the range the grid flattens the stranded side at market; when the
//! net position grows lopsided relative to grid capital a partial hedge is
//! issued.

use tracing::debug;

use super::{Strategy, StrategyContext};
use crate::config::{GridConfig, RiskConfig};
use crate::oms::{OrderRequest, OrderType};
use crate::{Money, Side};

pub struct GridStrategy {
    config: GridConfig,
    max_risk_per_trade: f64,
}

/// Grid geometry derived from one snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct GridLayout {
    pub bottom: f64,
    pub top: f64,
    pub levels: Vec<f64>,
}

impl GridStrategy {
    pub fn new(config: GridConfig, risk: &RiskConfig) -> Self {
        Self {
            config,
            max_risk_per_trade: risk.max_risk_per_trade,
        }
    }

    /// Compute the grid from the narrowed trading range and ATR spacing.
    /// Returns None while the range or ATR is degenerate.
    pub fn layout(&self, range_high: f64, range_low: f64, atr: f64) -> Option<GridLayout> {
        if atr <= 0.0 || range_high <= range_low {
            return None;
        }
        let center = (range_high + range_low) / 2.0;
        let width = (range_high - range_low) * self.config.range_narrowing;
        if width <= 0.0 {
            return None;
        }
        let bottom = center - width / 2.0;
        let top = center + width / 2.0;

        let spacing = atr * self.config.grid_atr_multiplier;
        let raw_levels = (width / spacing).ceil() as usize;
        let count = raw_levels.clamp(self.config.min_levels, self.config.max_levels);

        // Levels evenly spread across the narrowed range, bounds included
        let step = width / (count - 1) as f64;
        let levels = (0..count).map(|i| bottom + step * i as f64).collect();

        Some(GridLayout { bottom, top, levels })
    }

    fn escape_orders(&self, ctx: &StrategyContext, layout: &GridLayout) -> Vec<OrderRequest> {
        let close = ctx.snapshot.close;
        let Some(position) = ctx.position else {
            return Vec::new();
        };

        let escaped_up = close > layout.top * (1.0 + self.config.escape_pct);
        let escaped_down = close < layout.bottom * (1.0 - self.config.escape_pct);

        // Price ran away from the side we are holding: flatten at market
        let stranded = (escaped_up && position.side == Side::Sell)
            || (escaped_down && position.side == Side::Buy);
        if !stranded {
            return Vec::new();
        }

        debug!(
            symbol = %ctx.symbol,
            close,
            top = layout.top,
            bottom = layout.bottom,
            "grid escape, flattening"
        );
        vec![OrderRequest::market(
            ctx.symbol.clone(),
            position.side.opposite(),
            position.quantity,
            "grid_escape",
        )
        .reduce_only()]
    }

    fn hedge_order(&self, ctx: &StrategyContext) -> Option<OrderRequest> {
        let position = ctx.position?;
        let grid_capital = ctx.allocated_capital * self.config.capital_usage_pct;
        if grid_capital <= 0.0 {
            return None;
        }
        let exposure = position.current_value(ctx.snapshot.close);
        if exposure / grid_capital <= self.config.imbalance_threshold {
            return None;
        }

        let hedge_qty = position.quantity * Money::from_f64(self.config.hedge_fraction);
        let offset = Money::from_f64(self.config.min_spread_pct);
        let close = Money::from_f64(ctx.snapshot.close);
        // Offsetting limit parks just past the current price on the exit side
        let limit = match position.side {
            Side::Buy => close * (Money::ONE + offset),
            Side::Sell => close * (Money::ONE - offset),
        };

        Some(
            OrderRequest::limit(
                ctx.symbol.clone(),
                position.side.opposite(),
                hedge_qty,
                limit,
                "grid_imbalance_hedge",
            )
            .maker_only()
            .reduce_only(),
        )
    }

    fn ladder_orders(&self, ctx: &StrategyContext, layout: &GridLayout) -> Vec<OrderRequest> {
        let close = ctx.snapshot.close;
        let grid_capital = ctx.allocated_capital * self.config.capital_usage_pct;
        let count = layout.levels.len();
        if count == 0 || grid_capital <= 0.0 {
            return Vec::new();
        }
        // Ladder orders carry no protective stop, so the risk gate prices
        // their full notional as risk; each level must fit the per-trade cap
        let capital_per_level =
            (grid_capital / count as f64).min(ctx.equity * self.max_risk_per_trade);
        let spacing = (layout.top - layout.bottom) / (count - 1).max(1) as f64;

        let mut orders = Vec::new();
        for &level in &layout.levels {
            // One resting order per level; skip levels already covered
            let covered = ctx.open_orders.iter().any(|o| {
                o.is_active()
                    && o.order_type == OrderType::Limit
                    && o.limit_price
                        .is_some_and(|p| (p.to_f64() - level).abs() < spacing / 2.0)
            });
            if covered {
                continue;
            }

            let (side, price) = if level < close {
                (Side::Buy, level * (1.0 - self.config.min_spread_pct))
            } else if level > close {
                (Side::Sell, level * (1.0 + self.config.min_spread_pct))
            } else {
                continue;
            };
            let quantity = capital_per_level / price;
            if quantity <= 0.0 || price <= 0.0 {
                continue;
            }

            orders.push(
                OrderRequest::limit(
                    ctx.symbol.clone(),
                    side,
                    Money::from_f64(quantity),
                    Money::from_f64(price),
                    format!("grid_level_{level:.2}"),
                )
                .maker_only(),
            );
        }
        orders
    }
}

impl Strategy for GridStrategy {
    fn name(&self) -> &'static str {
        "grid"
    }

    fn generate_orders(&mut self, ctx: &StrategyContext) -> Vec<OrderRequest> {
        let snap = ctx.snapshot;
        let Some(layout) = self.layout(snap.range_high, snap.range_low, snap.atr) else {
            return Vec::new();
        };

        let escapes = self.escape_orders(ctx, &layout);
        if !escapes.is_empty() {
            return escapes;
        }

        let mut orders = Vec::new();
        if let Some(hedge) = self.hedge_order(ctx) {
            orders.push(hedge);
        }
        orders.extend(self.ladder_orders(ctx, &layout));
        orders
    }

    /// A fresh escape tears down the resting ladder before re-quoting
    fn wants_cancel_resting(&self, ctx: &StrategyContext) -> bool {
        let snap = ctx.snapshot;
        let Some(layout) = self.layout(snap.range_high, snap.range_low, snap.atr) else {
            return false;
        };
        let close = snap.close;
        close > layout.top * (1.0 + self.config.escape_pct)
            || close < layout.bottom * (1.0 - self.config.escape_pct)
    }
}
