//! Multi-symbol portfolio orchestration
//!
//! One independent `SymbolEngine` per symbol, stepped through a synchronized
//! timestamp sequence. Engines run their propose/execute halves in parallel;
//! the portfolio gate runs between them as a barrier, enforcing a
//! portfolio-wide exposure limit and suppressing simultaneous same-direction
//! entries on highly correlated pairs. Correlations, allocation weights and
//! VaR are refreshed on a fixed simulated-time interval, not every bar.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use itertools::Itertools;
use ordered_float::OrderedFloat;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use tracing::{debug, info, warn};

use crate::backtest::{compute_metrics, SymbolEngine, SymbolResult};
use crate::config::{AllocationMode, Config};
use crate::data::bars_per_year;
use crate::oms::OrderRequest;
use crate::types::EngineError;
use crate::{Candle, EquityPoint, PerformanceMetrics, Symbol};

const VAR_CONFIDENCE: f64 = 0.95;

// ============================================================================
// Allocation
// ============================================================================

/// Compute per-symbol allocation weights. Always sums to 1.0.
pub fn compute_weights(
    mode: &AllocationMode,
    symbols: &[Symbol],
    daily_returns: &HashMap<Symbol, VecDeque<f64>>,
) -> Result<HashMap<Symbol, f64>, EngineError> {
    if symbols.is_empty() {
        return Err(EngineError::Config("no symbols to allocate".into()));
    }

    match mode {
        AllocationMode::EqualWeight => {
            let w = 1.0 / symbols.len() as f64;
            Ok(symbols.iter().map(|s| (s.clone(), w)).collect())
        }
        AllocationMode::InverseVolatility => {
            let mut inverse: HashMap<Symbol, f64> = HashMap::new();
            for symbol in symbols {
                let vol = daily_returns
                    .get(symbol)
                    .filter(|r| r.len() >= 2)
                    .map(|r| r.iter().copied().std_dev())
                    .unwrap_or(0.0);
                // Symbols without enough history (or zero vol) fall back to
                // the mean inverse-vol of the rest, applied below
                inverse.insert(symbol.clone(), if vol > 0.0 { 1.0 / vol } else { 0.0 });
            }
            let known: Vec<f64> = inverse.values().copied().filter(|v| *v > 0.0).collect();
            if known.is_empty() {
                let w = 1.0 / symbols.len() as f64;
                return Ok(symbols.iter().map(|s| (s.clone(), w)).collect());
            }
            let fallback = known.iter().sum::<f64>() / known.len() as f64;
            for value in inverse.values_mut() {
                if *value == 0.0 {
                    *value = fallback;
                }
            }
            let total: f64 = inverse.values().sum();
            Ok(inverse.into_iter().map(|(s, v)| (s, v / total)).collect())
        }
        AllocationMode::Custom(weights) => {
            let mut out = HashMap::new();
            for symbol in symbols {
                let w = weights.get(symbol.as_str()).copied().ok_or_else(|| {
                    EngineError::Config(format!("custom allocation missing weight for {symbol}"))
                })?;
                out.insert(symbol.clone(), w);
            }
            let sum: f64 = out.values().sum();
            if (sum - 1.0).abs() > 1e-6 {
                return Err(EngineError::Config(format!(
                    "custom allocation weights sum to {sum}, expected 1.0"
                )));
            }
            Ok(out)
        }
    }
}

// ============================================================================
// Correlation and VaR
// ============================================================================

/// Pearson correlation of two equally long return series
pub fn pearson_correlation(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n < 2 {
        return 0.0;
    }
    let a = &a[..n];
    let b = &b[..n];
    let mean_a = a.iter().copied().mean();
    let mean_b = b.iter().copied().mean();

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for i in 0..n {
        let da = a[i] - mean_a;
        let db = b[i] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    let denom = (var_a * var_b).sqrt();
    if denom == 0.0 {
        0.0
    } else {
        cov / denom
    }
}

/// Historical VaR at the configured confidence: the loss (in currency) not
/// exceeded on `confidence` of observed days. Zero without enough history.
pub fn historical_var(daily_returns: &[f64], equity: f64, confidence: f64) -> f64 {
    if daily_returns.len() < 2 || equity <= 0.0 {
        return 0.0;
    }
    let mut sorted = daily_returns.to_vec();
    sorted.sort_by(|x, y| x.partial_cmp(y).unwrap_or(std::cmp::Ordering::Equal));
    // The tail holds ceil((1 - c) * n) observations; its worst member is
    // the quantile, so 20 observations at 95% pick the single worst day
    let tail = ((1.0 - confidence) * sorted.len() as f64).ceil() as usize;
    let idx = tail.saturating_sub(1).min(sorted.len() - 1);
    (-sorted[idx] * equity).max(0.0)
}

/// Periodically recomputed portfolio aggregates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioState {
    pub equity: f64,
    pub weights: HashMap<Symbol, f64>,
    /// Pairwise Pearson correlations over daily returns, keyed by the
    /// lexicographically ordered pair
    pub correlations: HashMap<String, f64>,
    pub var_95: f64,
}

fn pair_key(a: &Symbol, b: &Symbol) -> String {
    if a.as_str() <= b.as_str() {
        format!("{a}/{b}")
    } else {
        format!("{b}/{a}")
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioResult {
    pub symbol_results: Vec<SymbolResult>,
    pub equity_curve: Vec<EquityPoint>,
    pub metrics: PerformanceMetrics,
    pub final_state: PortfolioState,
    /// Intents dropped by the portfolio-level gate (not per-symbol risk)
    pub suppressed_intents: usize,
}

pub struct PortfolioRunner {
    config: Config,
    cancel: Arc<AtomicBool>,
    quiet: bool,
}

/// Per-symbol rolling state the orchestrator tracks between refreshes.
/// Daily returns are price returns: correlation and volatility weighting
/// describe the instruments, not the strategies trading them.
struct SymbolTrack {
    last_price: f64,
    prev_day_price: f64,
    daily_returns: VecDeque<f64>,
}

impl PortfolioRunner {
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

    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn run(&self, data: &HashMap<Symbol, Vec<Candle>>) -> Result<PortfolioResult, EngineError> {
        let symbols: Vec<Symbol> = data.keys().cloned().sorted().collect();
        if symbols.is_empty() {
            return Err(EngineError::Data("no symbols to run".into()));
        }

        let mut weights = compute_weights(&self.config.portfolio.allocation, &symbols, &HashMap::new())?;
        let initial_total = self.config.trading.initial_balance;

        // Per-symbol candle lookup by timestamp, plus the synchronized
        // timestamp sequence (union across symbols, ascending)
        let mut by_time: Vec<HashMap<DateTime<Utc>, &Candle>> = Vec::with_capacity(symbols.len());
        let mut timeline: BTreeSet<DateTime<Utc>> = BTreeSet::new();
        for symbol in &symbols {
            let series = &data[symbol];
            timeline.extend(series.iter().map(|c| c.datetime));
            by_time.push(series.iter().map(|c| (c.datetime, c)).collect());
        }
        let timeline: Vec<DateTime<Utc>> = timeline.into_iter().collect();

        let initial_allocations: Vec<f64> = symbols
            .iter()
            .map(|symbol| initial_total * weights[symbol])
            .collect();
        let mut engines: Vec<SymbolEngine> = symbols
            .iter()
            .zip(&initial_allocations)
            .map(|(symbol, &allocated)| SymbolEngine::new(symbol.clone(), &self.config, allocated))
            .collect();

        let mut tracks: Vec<SymbolTrack> = symbols
            .iter()
            .map(|symbol| {
                let first_close = data[symbol].first().map(|c| c.close).unwrap_or(0.0);
                SymbolTrack {
                    last_price: first_close,
                    prev_day_price: first_close,
                    daily_returns: VecDeque::new(),
                }
            })
            .collect();

        let mut portfolio_curve: Vec<EquityPoint> = Vec::new();
        let mut portfolio_daily: VecDeque<f64> = VecDeque::new();
        let mut prev_day: Option<NaiveDate> = None;
        let mut prev_day_total = initial_total;
        let mut last_refresh: Option<DateTime<Utc>> = None;
        let mut correlations: HashMap<String, f64> = HashMap::new();
        let mut var_95 = 0.0;
        let mut suppressed = 0usize;

        let progress = self.progress_bar(timeline.len() as u64);
        let batch_size = self.config.backtest.batch_size.max(1);
        let window = self.config.portfolio.return_window_days;

        for batch in timeline.chunks(batch_size) {
            if self.cancel.load(Ordering::Relaxed) {
                warn!("portfolio run cancelled, discarding partial results");
                return Err(EngineError::Cancelled);
            }

            for &ts in batch {
                let bars: Vec<Option<&Candle>> =
                    by_time.iter().map(|m| m.get(&ts).copied()).collect();

                // Propose in parallel
                let proposals: Vec<Option<Vec<OrderRequest>>> = engines
                    .par_iter_mut()
                    .zip(bars.par_iter())
                    .map(|(engine, bar)| match *bar {
                        Some(candle) => engine.begin_bar(candle).map(Some),
                        None => Ok(None),
                    })
                    .collect::<Result<_, EngineError>>()?;

                for (track, bar) in tracks.iter_mut().zip(&bars) {
                    if let Some(candle) = bar {
                        track.last_price = candle.close;
                    }
                }

                // Barrier: the gate sees every symbol at the same timestamp
                let gated = self.gate(
                    &symbols,
                    &engines,
                    &tracks,
                    &weights,
                    &correlations,
                    proposals,
                    &mut suppressed,
                );

                // Execute in parallel
                engines
                    .par_iter_mut()
                    .zip(bars.par_iter())
                    .zip(gated.into_par_iter())
                    .map(|((engine, bar), approved)| match (*bar, approved) {
                        (Some(candle), Some(orders)) => engine.commit_bar(candle, orders),
                        _ => Ok(()),
                    })
                    .collect::<Result<(), EngineError>>()?;

                let total: f64 = engines
                    .iter()
                    .zip(&tracks)
                    .map(|(engine, track)| engine.equity(track.last_price))
                    .sum();
                portfolio_curve.push(EquityPoint {
                    timestamp: ts,
                    equity: total,
                });

                // Day roll: record daily returns for correlation and VaR
                let day = ts.date_naive();
                if prev_day.is_some_and(|d| d != day) {
                    for track in tracks.iter_mut() {
                        if track.prev_day_price > 0.0 {
                            track
                                .daily_returns
                                .push_back(track.last_price / track.prev_day_price - 1.0);
                            if track.daily_returns.len() > window {
                                track.daily_returns.pop_front();
                            }
                        }
                        track.prev_day_price = track.last_price;
                    }
                    if prev_day_total > 0.0 {
                        portfolio_daily.push_back(total / prev_day_total - 1.0);
                        if portfolio_daily.len() > window {
                            portfolio_daily.pop_front();
                        }
                    }
                    prev_day_total = total;
                }
                prev_day = Some(day);

                // Periodic refresh of weights, correlations and VaR
                let due = last_refresh.map_or(true, |t| {
                    (ts - t).num_hours() >= self.config.portfolio.rebalance_interval_hours
                });
                if due {
                    last_refresh = Some(ts);
                    let returns_map: HashMap<Symbol, VecDeque<f64>> = symbols
                        .iter()
                        .cloned()
                        .zip(tracks.iter().map(|t| t.daily_returns.clone()))
                        .collect();
                    weights =
                        compute_weights(&self.config.portfolio.allocation, &symbols, &returns_map)?;
                    correlations = self.correlation_matrix(&symbols, &tracks);
                    let returns: Vec<f64> = portfolio_daily.iter().copied().collect();
                    var_95 = historical_var(&returns, total, VAR_CONFIDENCE);
                    debug!(equity = total, var_95, "portfolio state refreshed");
                }
            }
            progress.inc(batch.len() as u64);
        }
        progress.finish_and_clear();

        // Force-close every engine at its own final bar
        for (engine, symbol) in engines.iter_mut().zip(&symbols) {
            if let Some(last) = data[symbol].last() {
                engine.finish(last)?;
            }
        }

        let final_equity: f64 = engines
            .iter()
            .zip(&tracks)
            .map(|(engine, track)| engine.equity(track.last_price))
            .sum();
        let final_state = PortfolioState {
            equity: final_equity,
            weights,
            correlations,
            var_95,
        };

        let timeframe = self.config.trading.timeframe.clone();
        let mut symbol_results = Vec::with_capacity(engines.len());
        for (engine, &allocated) in engines.into_iter().zip(&initial_allocations) {
            symbol_results.push(engine.into_result(&timeframe, allocated)?);
        }

        let mut all_trades: Vec<_> = symbol_results
            .iter()
            .flat_map(|r| r.trades.iter().cloned())
            .collect();
        all_trades.sort_by_key(|t| t.exit_time);
        let total_commission: f64 = symbol_results
            .iter()
            .map(|r| r.metrics.total_commission)
            .sum();
        let metrics = compute_metrics(
            initial_total,
            &all_trades,
            &portfolio_curve,
            bars_per_year(&timeframe)?,
            total_commission,
        );

        info!(
            symbols = symbols.len(),
            final_equity,
            return_pct = metrics.total_return,
            suppressed,
            "portfolio run complete"
        );

        Ok(PortfolioResult {
            symbol_results,
            equity_curve: portfolio_curve,
            metrics,
            final_state,
            suppressed_intents: suppressed,
        })
    }

    /// Portfolio-level gate between propose and execute. Drops entries that
    /// would breach the portfolio exposure limit, then resolves correlated
    /// simultaneous same-direction entries in favor of the heavier weight.
    #[allow(clippy::too_many_arguments)]
    fn gate(
        &self,
        symbols: &[Symbol],
        engines: &[SymbolEngine],
        tracks: &[SymbolTrack],
        weights: &HashMap<Symbol, f64>,
        correlations: &HashMap<String, f64>,
        proposals: Vec<Option<Vec<OrderRequest>>>,
        suppressed: &mut usize,
    ) -> Vec<Option<Vec<OrderRequest>>> {
        let portfolio_equity: f64 = engines
            .iter()
            .zip(tracks)
            .map(|(engine, track)| engine.equity(track.last_price))
            .sum();
        let mut total_exposure: f64 = engines
            .iter()
            .zip(tracks)
            .map(|(engine, track)| engine.position_value(track.last_price))
            .sum();

        // Which symbols are proposing a new entry this bar, and on which side
        let mut entry_sides: HashMap<usize, crate::Side> = HashMap::new();
        for (idx, proposal) in proposals.iter().enumerate() {
            if let Some(orders) = proposal {
                if let Some(entry) = orders.iter().find(|o| !o.reduce_only) {
                    entry_sides.insert(idx, entry.side);
                }
            }
        }

        // Correlated simultaneous entries: keep the heavier allocation
        let mut dropped_symbols: Vec<usize> = Vec::new();
        for (i, j) in (0..symbols.len()).tuple_combinations() {
            let (Some(side_i), Some(side_j)) = (entry_sides.get(&i), entry_sides.get(&j)) else {
                continue;
            };
            if side_i != side_j {
                continue;
            }
            let corr = correlations
                .get(&pair_key(&symbols[i], &symbols[j]))
                .copied()
                .unwrap_or(0.0);
            if corr <= self.config.portfolio.correlation_limit {
                continue;
            }
            let weight = |idx: usize| OrderedFloat(weights.get(&symbols[idx]).copied().unwrap_or(0.0));
            let loser = if weight(i) >= weight(j) { j } else { i };
            debug!(
                kept = %symbols[if loser == i { j } else { i }],
                dropped = %symbols[loser],
                corr,
                "correlated same-direction entries, suppressing lighter symbol"
            );
            dropped_symbols.push(loser);
        }

        proposals
            .into_iter()
            .enumerate()
            .map(|(idx, proposal)| {
                let orders = proposal?;
                let mark = tracks[idx].last_price;
                let mut kept = Vec::with_capacity(orders.len());
                for order in orders {
                    if order.reduce_only {
                        kept.push(order);
                        continue;
                    }
                    if dropped_symbols.contains(&idx) {
                        *suppressed += 1;
                        continue;
                    }
                    let notional = order.notional(mark);
                    if portfolio_equity > 0.0
                        && (total_exposure + notional) / portfolio_equity
                            > self.config.portfolio.portfolio_risk_limit
                    {
                        debug!(
                            symbol = %symbols[idx],
                            notional,
                            total_exposure,
                            "portfolio exposure limit, entry suppressed"
                        );
                        *suppressed += 1;
                        continue;
                    }
                    total_exposure += notional;
                    kept.push(order);
                }
                Some(kept)
            })
            .collect()
    }

    fn correlation_matrix(
        &self,
        symbols: &[Symbol],
        tracks: &[SymbolTrack],
    ) -> HashMap<String, f64> {
        let mut matrix = HashMap::new();
        for (i, j) in (0..symbols.len()).tuple_combinations() {
            let a: Vec<f64> = tracks[i].daily_returns.iter().copied().collect();
            let b: Vec<f64> = tracks[j].daily_returns.iter().copied().collect();
            matrix.insert(
                pair_key(&symbols[i], &symbols[j]),
                pearson_correlation(&a, &b),
            );
        }
        matrix
    }

    fn progress_bar(&self, total: u64) -> ProgressBar {
        if self.quiet {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(total);
        pb.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.magenta/blue}] {pos}/{len} steps ({eta})",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        pb
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sym(s: &str) -> Symbol {
        Symbol::new(s)
    }

    #[test]
    fn equal_weights_sum_to_one() {
        let symbols = vec![sym("A"), sym("B"), sym("C")];
        let weights =
            compute_weights(&AllocationMode::EqualWeight, &symbols, &HashMap::new()).unwrap();
        let total: f64 = weights.values().sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-12);
        assert_relative_eq!(weights[&sym("A")], 1.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn inverse_volatility_favors_the_quiet_symbol() {
        let symbols = vec![sym("CALM"), sym("WILD")];
        let mut returns = HashMap::new();
        returns.insert(sym("CALM"), VecDeque::from(vec![0.001, -0.001, 0.002, -0.002]));
        returns.insert(sym("WILD"), VecDeque::from(vec![0.05, -0.06, 0.07, -0.05]));
        let weights =
            compute_weights(&AllocationMode::InverseVolatility, &symbols, &returns).unwrap();
        assert!(weights[&sym("CALM")] > weights[&sym("WILD")]);
        let total: f64 = weights.values().sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn custom_weights_must_sum_to_one() {
        let symbols = vec![sym("A"), sym("B")];
        let mut good = HashMap::new();
        good.insert("A".to_string(), 0.7);
        good.insert("B".to_string(), 0.3);
        assert!(compute_weights(&AllocationMode::Custom(good), &symbols, &HashMap::new()).is_ok());

        let mut bad = HashMap::new();
        bad.insert("A".to_string(), 0.7);
        bad.insert("B".to_string(), 0.7);
        assert!(matches!(
            compute_weights(&AllocationMode::Custom(bad), &symbols, &HashMap::new()),
            Err(EngineError::Config(_))
        ));

        let mut missing = HashMap::new();
        missing.insert("A".to_string(), 1.0);
        assert!(
            compute_weights(&AllocationMode::Custom(missing), &symbols, &HashMap::new()).is_err()
        );
    }

    #[test]
    fn pearson_of_identical_series_is_one() {
        let series = vec![0.01, -0.02, 0.03, 0.005, -0.01];
        assert_relative_eq!(pearson_correlation(&series, &series), 1.0, epsilon = 1e-12);

        let inverted: Vec<f64> = series.iter().map(|r| -r).collect();
        assert_relative_eq!(pearson_correlation(&series, &inverted), -1.0, epsilon = 1e-12);
    }

    #[test]
    fn pearson_handles_degenerate_input() {
        assert_eq!(pearson_correlation(&[0.01], &[0.02]), 0.0);
        let flat = vec![0.0; 10];
        let noisy = vec![0.01, -0.01, 0.02, -0.02, 0.01, -0.01, 0.02, -0.02, 0.01, -0.01];
        assert_eq!(pearson_correlation(&flat, &noisy), 0.0);
    }

    #[test]
    fn var_is_the_tail_loss() {
        // 20 days: one -5% day, rest +/-1%
        let mut returns = vec![0.01, -0.01].repeat(9);
        returns.push(-0.05);
        returns.push(0.01);
        let var = historical_var(&returns, 10_000.0, 0.95);
        // 5% tail of 20 observations lands on the worst day
        assert_relative_eq!(var, 500.0, epsilon = 1e-9);

        // 100 observations: the 5% tail holds five days, the quantile is
        // the mildest of them
        let mut wide = vec![0.001; 95];
        wide.extend([-0.05, -0.04, -0.03, -0.02, -0.015]);
        assert_relative_eq!(
            historical_var(&wide, 10_000.0, 0.95),
            150.0,
            epsilon = 1e-9
        );

        assert_eq!(historical_var(&[], 10_000.0, 0.95), 0.0);
        assert_eq!(historical_var(&returns, 0.0, 0.95), 0.0);
    }

    #[test]
    fn pair_key_is_order_independent() {
        assert_eq!(pair_key(&sym("BTC"), &sym("ETH")), pair_key(&sym("ETH"), &sym("BTC")));
    }
}
