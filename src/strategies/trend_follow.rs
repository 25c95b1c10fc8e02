//! Trend-following strategy
//!
//! Enters on a Donchian breakout confirmed by ADX strength or a SAR flip,
//! sizes the position off the ATR stop distance, pyramids into winners every
//! 1R of favorable movement, and manages the stop through breakeven, profit
//! locking and an ATR trail. All exits flow through the protective stop or an
//! explicit reversal close; the strategy never averages down.

use tracing::debug;

use super::{Strategy, StrategyContext};
use crate::config::{RiskConfig, TrendConfig};
use crate::indicators::IndicatorSnapshot;
use crate::oms::{OrderRequest, Position};
use crate::{Money, Side};

pub struct TrendFollowStrategy {
    config: TrendConfig,
    max_risk_per_trade: f64,
    max_position_pct: f64,
    adx_threshold: f64,
}

impl TrendFollowStrategy {
    pub fn new(config: TrendConfig, risk: &RiskConfig, adx_threshold: f64) -> Self {
        Self {
            config,
            max_risk_per_trade: risk.max_risk_per_trade,
            max_position_pct: risk.max_position_pct,
            adx_threshold,
        }
    }

    fn entry_signal(&self, snap: &IndicatorSnapshot) -> Option<Side> {
        let breakout_up = snap.close > snap.donchian_high;
        let breakout_down = snap.close < snap.donchian_low;
        if !breakout_up && !breakout_down {
            return None;
        }

        let adx_confirms = snap.adx > self.adx_threshold;
        let sar_confirms_up = snap.sar_flipped && snap.sar_trend_up;
        let sar_confirms_down = snap.sar_flipped && !snap.sar_trend_up;

        if breakout_up && (adx_confirms || sar_confirms_up) {
            Some(Side::Buy)
        } else if breakout_down && (adx_confirms || sar_confirms_down) {
            Some(Side::Sell)
        } else {
            None
        }
    }

    fn entry_order(&self, ctx: &StrategyContext, side: Side) -> Option<OrderRequest> {
        let snap = ctx.snapshot;
        let stop_distance = snap.atr * self.config.initial_stop_atr;
        if stop_distance <= 0.0 {
            return None;
        }

        let risk_amount = ctx.equity * self.max_risk_per_trade;
        let mut quantity = risk_amount / stop_distance;
        // A tight stop can imply a notional past the exposure ceiling; size
        // down to the ceiling rather than get the whole entry rejected
        let max_quantity = ctx.equity * self.max_position_pct / snap.close;
        quantity = quantity.min(max_quantity);
        if quantity <= 0.0 {
            return None;
        }

        let stop = match side {
            Side::Buy => snap.close - stop_distance,
            Side::Sell => snap.close + stop_distance,
        };
        if stop <= 0.0 {
            return None;
        }

        debug!(
            symbol = %ctx.symbol,
            ?side,
            close = snap.close,
            stop,
            qty = quantity,
            "trend breakout entry"
        );

        Some(
            OrderRequest::market(
                ctx.symbol.clone(),
                side,
                Money::from_f64(quantity),
                "trend_breakout",
            )
            .with_protective_stop(Money::from_f64(stop)),
        )
    }

    fn pyramid_order(&self, ctx: &StrategyContext, position: &Position) -> Option<OrderRequest> {
        if position.addon_count >= self.config.max_pyramids {
            return None;
        }
        let r = position.r_multiple(ctx.snapshot.close);
        let next_rung = (position.addon_count as f64 + 1.0) * self.config.pyramid_step_r;
        if r < next_rung {
            return None;
        }

        let stop_distance = ctx.snapshot.atr * self.config.initial_stop_atr;
        if stop_distance <= 0.0 {
            return None;
        }
        let risk_amount = ctx.equity * self.max_risk_per_trade * self.config.pyramid_risk_fraction;
        let quantity = risk_amount / stop_distance;
        if quantity <= 0.0 {
            return None;
        }

        // The position's stop already covers the add-on; the stop here only
        // lets the risk gate price the incremental risk instead of the full
        // add-on notional
        let stop = match position.side {
            Side::Buy => ctx.snapshot.close - stop_distance,
            Side::Sell => ctx.snapshot.close + stop_distance,
        };
        if stop <= 0.0 {
            return None;
        }

        debug!(
            symbol = %ctx.symbol,
            r_multiple = r,
            addon = position.addon_count + 1,
            "pyramiding into winner"
        );

        Some(
            OrderRequest::market(
                ctx.symbol.clone(),
                position.side,
                Money::from_f64(quantity),
                "trend_pyramid",
            )
            .with_protective_stop(Money::from_f64(stop))
            .as_addon(),
        )
    }

    fn reversal_close(&self, ctx: &StrategyContext, position: &Position) -> Option<OrderRequest> {
        let snap = ctx.snapshot;
        let against_long = position.side == Side::Buy
            && (ctx.regime.is_downtrend() || (snap.sar_flipped && !snap.sar_trend_up));
        let against_short = position.side == Side::Sell
            && (ctx.regime.is_uptrend() || (snap.sar_flipped && snap.sar_trend_up));
        if !(against_long || against_short) {
            return None;
        }

        Some(
            OrderRequest::market(
                ctx.symbol.clone(),
                position.side.opposite(),
                position.quantity,
                "trend_reversal",
            )
            .reduce_only(),
        )
    }
}

impl Strategy for TrendFollowStrategy {
    fn name(&self) -> &'static str {
        "trend_follow"
    }

    fn generate_orders(&mut self, ctx: &StrategyContext) -> Vec<OrderRequest> {
        match ctx.position {
            Some(position) => {
                if let Some(close) = self.reversal_close(ctx, position) {
                    return vec![close];
                }
                self.pyramid_order(ctx, position).into_iter().collect()
            }
            None => self
                .entry_signal(ctx.snapshot)
                .and_then(|side| self.entry_order(ctx, side))
                .into_iter()
                .collect(),
        }
    }

    /// Stop ladder: trail at ATR distance, jump to breakeven at 2R, lock a
    /// fraction of open profit at 3R. The strongest (tightest) rung wins.
    fn update_stop(&self, position: &Position, snap: &IndicatorSnapshot) -> Option<Money> {
        let price = snap.close;
        let entry = position.average_entry_price.to_f64();
        let r = position.r_multiple(price);
        let trail_distance = snap.atr * self.config.trailing_stop_atr;

        let mut candidates = vec![match position.side {
            Side::Buy => price - trail_distance,
            Side::Sell => price + trail_distance,
        }];

        if r >= self.config.breakeven_r {
            candidates.push(entry);
        }
        if r >= self.config.lock_profit_r {
            let locked = (price - entry) * self.config.lock_profit_fraction;
            candidates.push(entry + locked);
        }

        let best = match position.side {
            Side::Buy => candidates.into_iter().fold(f64::MIN, f64::max),
            Side::Sell => candidates.into_iter().fold(f64::MAX, f64::min),
        };
        (best > 0.0).then(|| Money::from_f64(best))
    }
}
