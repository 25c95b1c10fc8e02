//! Backtest engine
//!
//! `SymbolEngine` drives one symbol through the full per-bar pipeline:
//! indicators → regime → fills → strategy → risk gate → order book → equity.
//! The bar step is split into `begin_bar` (propose) and `commit_bar`
//! (execute) so the portfolio orchestrator can run its own gate between the
//! two. `BacktestRunner` feeds bars in batches, checks cancellation at batch
//! boundaries, force-closes at the end of data and computes summary metrics.
//!
//! Accounting is margin-style: entries do not consume cash, realized PnL and
//! commissions settle into cash, and equity = cash + unrealized PnL. Exposure
//! ceilings are the risk gate's job, not the ledger's.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::data::bars_per_year;
use crate::indicators::{IndicatorEngine, IndicatorSnapshot};
use crate::oms::{
    ExecutionEngine, Order, OrderRequest, OrderState, OrderType, PositionBook,
};
use crate::regime::{RegimeFilter, RegimeLabel};
use crate::risk::{AccountView, RiskManager, Verdict};
use crate::strategies::{
    EmergencyStrategy, GridStrategy, StrategyBook, StrategyContext, TrendFollowStrategy,
};
use crate::types::EngineError;
use crate::{Candle, EquityPoint, Money, PerformanceMetrics, Side, Symbol, Trade};

// ============================================================================
// Per-symbol engine
// ============================================================================

pub struct SymbolEngine {
    symbol: Symbol,
    indicators: IndicatorEngine,
    regime_filter: RegimeFilter,
    strategies: StrategyBook,
    risk: RiskManager,
    execution: ExecutionEngine,
    book: PositionBook,
    open_orders: Vec<Order>,

    cash: f64,
    allocated_capital: f64,
    trades: Vec<Trade>,
    equity_curve: Vec<EquityPoint>,
    rejection_count: usize,
    bar_idx: usize,
    equity_sample_interval: usize,

    // Set by begin_bar, consumed by commit_bar
    last_snapshot: Option<IndicatorSnapshot>,
    last_regime: RegimeLabel,
}

impl SymbolEngine {
    pub fn new(symbol: Symbol, config: &Config, allocated_capital: f64) -> Self {
        let trend = TrendFollowStrategy::new(
            config.trend.clone(),
            &config.risk,
            config.regime.adx_threshold,
        );
        let grid = GridStrategy::new(config.grid.clone(), &config.risk);
        let emergency = EmergencyStrategy::new(&config.risk, &config.trend);

        Self {
            symbol,
            indicators: IndicatorEngine::new(&config.indicators, config.grid.range_period),
            regime_filter: RegimeFilter::new(config.regime.clone()),
            strategies: StrategyBook::new(trend, grid, emergency, config.regime.adx_threshold),
            risk: RiskManager::new(config.risk.clone()),
            execution: ExecutionEngine::new(&config.execution),
            book: PositionBook::new(),
            open_orders: Vec::new(),
            cash: allocated_capital,
            allocated_capital,
            trades: Vec::new(),
            equity_curve: Vec::new(),
            rejection_count: 0,
            bar_idx: 0,
            equity_sample_interval: config.backtest.equity_sample_interval.max(1),
            last_snapshot: None,
            last_regime: RegimeLabel::Range,
        }
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn equity(&self, mark_price: f64) -> f64 {
        let unrealized = self
            .book
            .position(&self.symbol)
            .map(|p| p.unrealized_pnl(mark_price))
            .unwrap_or(0.0);
        self.cash + unrealized
    }

    pub fn position_value(&self, mark_price: f64) -> f64 {
        self.book
            .position(&self.symbol)
            .map(|p| p.current_value(mark_price))
            .unwrap_or(0.0)
    }

    pub fn rejections(&self) -> usize {
        self.rejection_count
    }

    /// Orders resting in the book, waiting for a bar to trade through them
    pub fn open_orders(&self) -> &[Order] {
        &self.open_orders
    }

    /// First half of the bar step: update indicators and regime, run fills
    /// against the new bar, and collect risk-approved order intents. Nothing
    /// is submitted yet.
    pub fn begin_bar(&mut self, candle: &Candle) -> Result<Vec<OrderRequest>, EngineError> {
        let snapshot = self.indicators.update(candle);
        let regime = self.regime_filter.observe(&snapshot);

        self.risk.on_bar(candle.datetime, self.equity(candle.close));

        // Fills first: the protective stop, then resting limit/stop orders
        self.check_protective_stop(candle)?;
        self.fill_resting_orders(candle)?;

        let equity = self.equity(candle.close);
        let (strategy, switched) = self.strategies.select(regime, snapshot.adx);
        let cancel_resting = switched || {
            let ctx = StrategyContext {
                symbol: &self.symbol,
                candle,
                snapshot: &snapshot,
                regime,
                position: self.book.position(&self.symbol),
                open_orders: &self.open_orders,
                equity,
                allocated_capital: self.allocated_capital,
            };
            strategy.wants_cancel_resting(&ctx)
        };
        if cancel_resting && !self.open_orders.is_empty() {
            debug!(
                symbol = %self.symbol,
                count = self.open_orders.len(),
                "cancelling resting orders"
            );
            for order in &mut self.open_orders {
                order.state = OrderState::Cancelled;
            }
            self.open_orders.clear();
        }

        let ctx = StrategyContext {
            symbol: &self.symbol,
            candle,
            snapshot: &snapshot,
            regime,
            position: self.book.position(&self.symbol),
            open_orders: &self.open_orders,
            equity,
            allocated_capital: self.allocated_capital,
        };
        let requests = strategy.generate_orders(&ctx);

        let view = AccountView {
            equity,
            position: self.book.position(&self.symbol),
            reference_price: candle.close,
            gap_pct: snapshot.gap_pct,
        };
        let mut approved = Vec::with_capacity(requests.len());
        for request in requests {
            match self.risk.approve(request, &view) {
                Verdict::Approved(r) | Verdict::Converted(r) => approved.push(r),
                Verdict::Rejected { .. } => self.rejection_count += 1,
            }
        }

        self.last_snapshot = Some(snapshot);
        self.last_regime = regime;
        Ok(approved)
    }

    /// Second half of the bar step: submit the (possibly portfolio-filtered)
    /// intents, apply stop management, and record the equity point.
    pub fn commit_bar(
        &mut self,
        candle: &Candle,
        approved: Vec<OrderRequest>,
    ) -> Result<(), EngineError> {
        for request in approved {
            self.submit(request, candle)?;
        }

        self.apply_stop_update(candle);

        if self.bar_idx % self.equity_sample_interval == 0 {
            self.equity_curve.push(EquityPoint {
                timestamp: candle.datetime,
                equity: self.equity(candle.close),
            });
        }
        self.bar_idx += 1;
        Ok(())
    }

    /// Convenience for single-symbol runs with no portfolio gate
    pub fn process_bar(&mut self, candle: &Candle) -> Result<(), EngineError> {
        let approved = self.begin_bar(candle)?;
        self.commit_bar(candle, approved)
    }

    fn submit(&mut self, request: OrderRequest, candle: &Candle) -> Result<(), EngineError> {
        let mut order = request.into_order(candle.datetime, self.bar_idx);

        if order.maker_only
            && order.order_type == OrderType::Limit
            && self.execution.maker_limit_would_cross(&order, candle.close)
        {
            debug!(
                symbol = %self.symbol,
                limit = ?order.limit_price,
                close = candle.close,
                "maker-only limit would cross, rejected"
            );
            order.state = OrderState::Rejected;
            self.rejection_count += 1;
            return Ok(());
        }

        match order.order_type {
            OrderType::Market => {
                if let Some(quote) = self.execution.check_fill(&order, candle) {
                    let quantity = self.fillable_quantity(&order);
                    if quantity.is_zero() {
                        order.state = OrderState::Cancelled;
                        return Ok(());
                    }
                    let fill =
                        self.execution
                            .execute_fill(&mut order, quote, quantity, candle.datetime);
                    self.settle(&order, &fill)?;
                }
                Ok(())
            }
            OrderType::Limit | OrderType::Stop => {
                order.state = OrderState::Open;
                self.open_orders.push(order);
                Ok(())
            }
        }
    }

    /// The protective stop behaves like a resting stop order owned by the
    /// position itself.
    fn check_protective_stop(&mut self, candle: &Candle) -> Result<(), EngineError> {
        let Some(position) = self.book.position(&self.symbol) else {
            return Ok(());
        };
        if !position.stop_hit(candle.high, candle.low) {
            return Ok(());
        }
        let Some(stop) = position.stop_price else {
            return Ok(());
        };

        let mut order = OrderRequest::stop(
            self.symbol.clone(),
            position.side.opposite(),
            position.quantity,
            stop,
            "protective_stop",
        )
        .reduce_only()
        .into_order(candle.datetime, self.bar_idx);

        if let Some(quote) = self.execution.check_fill(&order, candle) {
            let quantity = order.remaining_quantity;
            let fill = self
                .execution
                .execute_fill(&mut order, quote, quantity, candle.datetime);
            self.settle(&order, &fill)?;
        }
        Ok(())
    }

    fn fill_resting_orders(&mut self, candle: &Candle) -> Result<(), EngineError> {
        let mut pending = std::mem::take(&mut self.open_orders);
        for mut order in pending.drain(..) {
            let Some(quote) = self.execution.check_fill(&order, candle) else {
                self.open_orders.push(order);
                continue;
            };
            let quantity = self.fillable_quantity(&order);
            if quantity.is_zero() {
                // Reduce-only order outlived the position it was reducing
                order.state = OrderState::Cancelled;
                continue;
            }
            let fill = self
                .execution
                .execute_fill(&mut order, quote, quantity, candle.datetime);
            self.settle(&order, &fill)?;
            if order.is_active() {
                self.open_orders.push(order);
            }
        }
        Ok(())
    }

    /// Clamp reduce-only orders to what is actually open
    fn fillable_quantity(&self, order: &Order) -> Money {
        if !order.reduce_only {
            return order.remaining_quantity;
        }
        match self.book.position(&self.symbol) {
            Some(p) if p.side == order.side.opposite() => order.remaining_quantity.min(p.quantity),
            _ => Money::ZERO,
        }
    }

    fn settle(&mut self, order: &Order, fill: &crate::oms::Fill) -> Result<(), EngineError> {
        let trades = self.book.apply_fill(order, fill)?;
        if trades.is_empty() {
            // Opening or scaling fill: only the commission touches cash now
            self.cash -= fill.commission.to_f64();
        } else {
            for trade in &trades {
                self.cash += trade.net_pnl.to_f64();
            }
            self.trades.extend(trades);
        }
        Ok(())
    }

    /// Stops only ratchet in the position's favor
    fn apply_stop_update(&mut self, _candle: &Candle) {
        let Some(snapshot) = self.last_snapshot.as_ref() else {
            return;
        };
        let (strategy, _) = self.strategies.select(self.last_regime, snapshot.adx);
        let Some(position) = self.book.position(&self.symbol) else {
            return;
        };
        let Some(proposed) = strategy.update_stop(position, snapshot) else {
            return;
        };

        let side = position.side;
        let current = position.stop_price;
        let tighter = match (current, side) {
            (None, _) => true,
            (Some(stop), Side::Buy) => proposed > stop,
            (Some(stop), Side::Sell) => proposed < stop,
        };
        if tighter {
            if let Some(position) = self.book.position_mut(&self.symbol) {
                position.stop_price = Some(proposed);
            }
        }
    }

    /// Force-close at the last bar and seal the equity curve
    pub fn finish(&mut self, last_candle: &Candle) -> Result<(), EngineError> {
        for order in &mut self.open_orders {
            order.state = OrderState::Cancelled;
        }
        self.open_orders.clear();

        if let Some(position) = self.book.position(&self.symbol) {
            let request = OrderRequest::market(
                self.symbol.clone(),
                position.side.opposite(),
                position.quantity,
                "end_of_run",
            )
            .reduce_only();
            self.submit(request, last_candle)?;
        }

        self.equity_curve.push(EquityPoint {
            timestamp: last_candle.datetime,
            equity: self.equity(last_candle.close),
        });
        Ok(())
    }

    pub fn into_result(
        self,
        timeframe: &str,
        initial_balance: f64,
    ) -> Result<SymbolResult, EngineError> {
        let bars_py = bars_per_year(timeframe)?;
        let metrics = compute_metrics(
            initial_balance,
            &self.trades,
            &self.equity_curve,
            bars_py / self.equity_sample_interval as f64,
            self.book.total_commission().to_f64(),
        );
        let final_equity = self
            .equity_curve
            .last()
            .map(|p| p.equity)
            .unwrap_or(initial_balance);
        Ok(SymbolResult {
            symbol: self.symbol,
            metrics,
            trades: self.trades,
            equity_curve: self.equity_curve,
            final_equity,
            rejected_intents: self.rejection_count,
        })
    }
}

// ============================================================================
// Runner
// ============================================================================

/// Completed run for one symbol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolResult {
    pub symbol: Symbol,
    pub metrics: PerformanceMetrics,
    pub trades: Vec<Trade>,
    pub equity_curve: Vec<EquityPoint>,
    pub final_equity: f64,
    pub rejected_intents: usize,
}

pub struct BacktestRunner {
    config: Config,
    cancel: Arc<AtomicBool>,
    quiet: bool,
}

impl BacktestRunner {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            cancel: Arc::new(AtomicBool::new(false)),
            quiet: false,
        }
    }

    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    /// Cooperative cancellation handle; checked at batch boundaries only
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Run every symbol independently (full balance each, no portfolio gate)
    pub fn run(
        &self,
        data: &HashMap<Symbol, Vec<Candle>>,
    ) -> Result<Vec<SymbolResult>, EngineError> {
        let total_bars: u64 = data.values().map(|c| c.len() as u64).sum();
        let progress = self.progress_bar(total_bars);

        let mut entries: Vec<(&Symbol, &Vec<Candle>)> = data.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));

        let results: Result<Vec<SymbolResult>, EngineError> = entries
            .into_par_iter()
            .map(|(symbol, candles)| self.run_symbol(symbol.clone(), candles, &progress))
            .collect();
        progress.finish_and_clear();
        results
    }

    /// Drive one symbol through its whole series in memory-bounded batches
    pub fn run_symbol(
        &self,
        symbol: Symbol,
        candles: &[Candle],
        progress: &ProgressBar,
    ) -> Result<SymbolResult, EngineError> {
        let initial_balance = self.config.trading.initial_balance;
        let mut engine = SymbolEngine::new(symbol.clone(), &self.config, initial_balance);

        let batch_size = self.config.backtest.batch_size.max(1);
        for batch in candles.chunks(batch_size) {
            if self.cancel.load(Ordering::Relaxed) {
                warn!(symbol = %symbol, "run cancelled, discarding partial results");
                return Err(EngineError::Cancelled);
            }
            for candle in batch {
                engine.process_bar(candle)?;
            }
            progress.inc(batch.len() as u64);
        }

        if let Some(last) = candles.last() {
            engine.finish(last)?;
        }

        let result = engine.into_result(&self.config.trading.timeframe, initial_balance)?;
        info!(
            symbol = %symbol,
            trades = result.trades.len(),
            return_pct = result.metrics.total_return,
            sharpe = result.metrics.sharpe_ratio,
            "symbol run complete"
        );
        Ok(result)
    }

    fn progress_bar(&self, total: u64) -> ProgressBar {
        if self.quiet {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(total);
        pb.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} bars ({eta})",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        pb
    }
}

// ============================================================================
// Metrics
// ============================================================================

/// Summary statistics from the full trade list and equity curve.
/// `points_per_year` is bars-per-year adjusted for the equity sample interval.
pub fn compute_metrics(
    initial_balance: f64,
    trades: &[Trade],
    equity_curve: &[EquityPoint],
    points_per_year: f64,
    total_commission: f64,
) -> PerformanceMetrics {
    let mut metrics = PerformanceMetrics {
        total_commission,
        ..Default::default()
    };

    let final_equity = equity_curve
        .last()
        .map(|p| p.equity)
        .unwrap_or(initial_balance);
    if initial_balance > 0.0 {
        metrics.total_return = (final_equity - initial_balance) / initial_balance * 100.0;
    }

    // Per-point simple returns
    let returns: Vec<f64> = equity_curve
        .windows(2)
        .filter(|w| w[0].equity > 0.0)
        .map(|w| (w[1].equity - w[0].equity) / w[0].equity)
        .collect();

    if returns.len() >= 2 {
        let mean = (&returns).mean();
        let std_dev = (&returns).std_dev();
        if std_dev > 0.0 {
            metrics.sharpe_ratio = mean / std_dev * points_per_year.sqrt();
        }

        let downside: Vec<f64> = returns.iter().map(|r| r.min(0.0).powi(2)).collect();
        let downside_dev = (&downside).mean().sqrt();
        if downside_dev > 0.0 {
            metrics.sortino_ratio = mean / downside_dev * points_per_year.sqrt();
        }
    }

    metrics.max_drawdown = max_drawdown(equity_curve) * 100.0;

    // Calmar: CAGR over max drawdown
    if !equity_curve.is_empty() && initial_balance > 0.0 && final_equity > 0.0 {
        let years = equity_curve.len() as f64 / points_per_year;
        if years > 0.0 && metrics.max_drawdown > 0.0 {
            let cagr = (final_equity / initial_balance).powf(1.0 / years) - 1.0;
            metrics.calmar_ratio = cagr * 100.0 / metrics.max_drawdown;
        }
    }

    trade_statistics(trades, &mut metrics);
    metrics
}

/// Worst peak-to-trough equity ratio, as a fraction
pub fn max_drawdown(equity_curve: &[EquityPoint]) -> f64 {
    let mut peak = f64::MIN;
    let mut worst = 0.0_f64;
    for point in equity_curve {
        peak = peak.max(point.equity);
        if peak > 0.0 {
            worst = worst.max((peak - point.equity) / peak);
        }
    }
    worst
}

fn trade_statistics(trades: &[Trade], metrics: &mut PerformanceMetrics) {
    metrics.total_trades = trades.len();
    if trades.is_empty() {
        return;
    }

    let mut gross_profit = 0.0;
    let mut gross_loss = 0.0;
    let mut consecutive_wins = 0usize;
    let mut consecutive_losses = 0usize;

    for trade in trades {
        let pnl = trade.net_pnl.to_f64();
        if pnl > 0.0 {
            metrics.winning_trades += 1;
            gross_profit += pnl;
            metrics.largest_win = metrics.largest_win.max(pnl);
            consecutive_wins += 1;
            consecutive_losses = 0;
        } else {
            metrics.losing_trades += 1;
            gross_loss += -pnl;
            metrics.largest_loss = metrics.largest_loss.max(-pnl);
            consecutive_losses += 1;
            consecutive_wins = 0;
        }
        metrics.max_consecutive_wins = metrics.max_consecutive_wins.max(consecutive_wins);
        metrics.max_consecutive_losses = metrics.max_consecutive_losses.max(consecutive_losses);
    }

    let total = trades.len() as f64;
    let win_rate = metrics.winning_trades as f64 / total;
    metrics.win_rate = win_rate * 100.0;

    metrics.profit_factor = if gross_loss > 0.0 {
        gross_profit / gross_loss
    } else if gross_profit > 0.0 {
        f64::INFINITY
    } else {
        0.0
    };

    if metrics.winning_trades > 0 {
        metrics.avg_win = gross_profit / metrics.winning_trades as f64;
    }
    if metrics.losing_trades > 0 {
        metrics.avg_loss = gross_loss / metrics.losing_trades as f64;
    }
    metrics.expectancy = win_rate * metrics.avg_win - (1.0 - win_rate) * metrics.avg_loss;
}

// ============================================================================
// Report
// ============================================================================

/// Serialized run report; written only after a run reaches a consistent
/// final state, never for partial or cancelled runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestReport {
    pub generated_at: DateTime<Utc>,
    pub timeframe: String,
    pub initial_balance: f64,
    pub results: Vec<SymbolResult>,
}

impl BacktestReport {
    pub fn new(config: &Config, results: Vec<SymbolResult>) -> Self {
        Self {
            generated_at: Utc::now(),
            timeframe: config.trading.timeframe.clone(),
            initial_balance: config.trading.initial_balance,
            results,
        }
    }

    pub fn save(&self, results_dir: impl AsRef<Path>) -> anyhow::Result<std::path::PathBuf> {
        let dir = results_dir.as_ref();
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create results dir {}", dir.display()))?;
        let filename = format!(
            "backtest_{}_{}.json",
            self.timeframe,
            self.generated_at.format("%Y%m%d_%H%M%S")
        );
        let path = dir.join(filename);
        let json = serde_json::to_string_pretty(self).context("Failed to serialize report")?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write report {}", path.display()))?;
        info!(path = %path.display(), "report written");
        Ok(path)
    }
}
