//! Integration tests for the regime trading engine
//!
//! End-to-end scenarios driving synthetic bar series through the full
//! pipeline: indicators, regime classification, strategy routing, risk gate,
//! fill simulation and portfolio orchestration.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use regime_trader::backtest::SymbolEngine;
use regime_trader::config::Config;
use regime_trader::indicators::IndicatorEngine;
use regime_trader::portfolio::PortfolioRunner;
use regime_trader::regime::{classify, RegimeLabel};
use regime_trader::strategies::{GridStrategy, Strategy, StrategyContext};
use regime_trader::{Candle, Side, Symbol};

// =============================================================================
// Test utilities
// =============================================================================

fn start_time() -> DateTime<Utc> {
    "2024-01-01T00:00:00Z".parse().unwrap()
}

fn bar(i: usize, open: f64, high: f64, low: f64, close: f64) -> Candle {
    Candle::new_unchecked(
        start_time() + Duration::hours(i as i64),
        open,
        high,
        low,
        close,
        1_000.0,
    )
}

/// Strictly monotonic uptrend: close compounds by `step_pct` per bar
fn uptrend_candles(count: usize, base_price: f64, step_pct: f64) -> Vec<Candle> {
    let mut candles = Vec::with_capacity(count);
    let mut price = base_price;
    for i in 0..count {
        let open = price;
        price *= 1.0 + step_pct;
        let close = price;
        candles.push(bar(i, open, close * 1.002, open * 0.998, close));
    }
    candles
}

/// Oscillation inside a fixed band around `center`, +/- band_pct
fn oscillating_candles(count: usize, center: f64, band_pct: f64) -> Vec<Candle> {
    (0..count)
        .map(|i| {
            let phase = (i as f64 * 0.7).sin();
            let close = center * (1.0 + band_pct * phase);
            let open = center * (1.0 + band_pct * ((i as f64 - 1.0) * 0.7).sin());
            let high = close.max(open) * 1.004;
            let low = close.min(open) * 0.996;
            bar(i, open, high, low, close)
        })
        .collect()
}

/// Alternating ramps: `block` bars up, then `block` bars down, repeated
fn zigzag_candles(blocks: usize, block: usize, base_price: f64, step_pct: f64) -> Vec<Candle> {
    let mut candles = Vec::with_capacity(blocks * block);
    let mut price = base_price;
    let mut i = 0;
    for b in 0..blocks {
        let direction = if b % 2 == 0 { 1.0 } else { -1.0 };
        for _ in 0..block {
            let open = price;
            price *= 1.0 + direction * step_pct;
            let close = price;
            let high = close.max(open) * 1.003;
            let low = close.min(open) * 0.997;
            candles.push(bar(i, open, high, low, close));
            i += 1;
        }
    }
    candles
}

// =============================================================================
// Scenario A: monotonic uptrend -> one long trend position, never short
// =============================================================================

#[test]
fn uptrend_produces_long_trades_and_no_shorts() {
    let config = Config::default();
    let candles = uptrend_candles(200, 100.0, 0.005);
    let symbol = Symbol::new("BTCUSDT");

    let mut engine = SymbolEngine::new(symbol, &config, 10_000.0);
    for candle in &candles {
        engine.process_bar(candle).unwrap();
    }
    engine.finish(candles.last().unwrap()).unwrap();

    let result = engine.into_result("1h", 10_000.0).unwrap();
    assert!(
        !result.trades.is_empty(),
        "trend follower should have traded the uptrend"
    );
    assert!(
        result.trades.iter().all(|t| t.side == Side::Buy),
        "no short positions in a monotonic uptrend"
    );

    // The long entry happens shortly after warm-up
    let warmup = config.indicators.warmup_bars();
    let entry_deadline = start_time() + Duration::hours((warmup + 30) as i64);
    let first_entry = result.trades.iter().map(|t| t.entry_time).min().unwrap();
    assert!(
        first_entry <= entry_deadline,
        "entry at {first_entry} later than {entry_deadline}"
    );

    // Riding a 0.5%/bar trend should not lose money
    assert!(result.final_equity > 10_000.0);
}

// =============================================================================
// Scenario B: range-bound series -> grid with 3..10 levels, both sides quoted
// =============================================================================

#[test]
fn range_bound_market_builds_a_two_sided_grid() {
    let config = Config::default();
    let candles = oscillating_candles(100, 100.0, 0.02);
    let symbol = Symbol::new("ETHUSDT");

    // Drive indicators to a post-warm-up snapshot of the oscillation
    let mut indicators = IndicatorEngine::new(&config.indicators, config.grid.range_period);
    let mut last_snapshot = None;
    for candle in &candles {
        last_snapshot = Some(indicators.update(candle));
    }
    let snapshot = last_snapshot.unwrap();
    assert!(snapshot.ready);

    let regime = classify(&snapshot, &config.regime);
    assert!(
        regime != RegimeLabel::StrongUptrend && regime != RegimeLabel::StrongDowntrend,
        "oscillation must not classify as a strong trend, got {regime}"
    );

    let mut grid = GridStrategy::new(config.grid.clone(), &config.risk);
    let layout = grid
        .layout(snapshot.range_high, snapshot.range_low, snapshot.atr)
        .expect("oscillating range should produce a grid");
    assert!(layout.levels.len() >= 3 && layout.levels.len() <= 10);

    let last_candle = candles.last().unwrap();
    let ctx = StrategyContext {
        symbol: &symbol,
        candle: last_candle,
        snapshot: &snapshot,
        regime: RegimeLabel::Range,
        position: None,
        open_orders: &[],
        equity: 10_000.0,
        allocated_capital: 10_000.0,
    };
    let orders = grid.generate_orders(&ctx);
    assert!(orders.iter().any(|o| o.side == Side::Buy));
    assert!(orders.iter().any(|o| o.side == Side::Sell));
    assert!(orders.iter().all(|o| o.maker_only));
}

// =============================================================================
// Scenario C: 20% gap down -> Emergency classification and 50% reduction
// =============================================================================

#[test]
fn gap_down_classifies_emergency_and_halves_positions() {
    let config = Config::default();
    let mut candles = uptrend_candles(60, 100.0, 0.004);
    let last_close = candles.last().unwrap().close;
    let crash_close = last_close * 0.8;
    let n = candles.len();
    candles.push(bar(
        n,
        crash_close * 1.01,
        crash_close * 1.02,
        crash_close * 0.99,
        crash_close,
    ));

    let mut indicators = IndicatorEngine::new(&config.indicators, config.grid.range_period);
    let mut snapshot = None;
    for candle in &candles {
        snapshot = Some(indicators.update(candle));
    }
    let crash_snapshot = snapshot.unwrap();

    assert!(crash_snapshot.gap_pct >= config.regime.emergency_gap_pct);
    assert_eq!(
        classify(&crash_snapshot, &config.regime),
        RegimeLabel::Emergency
    );

    // The full engine on the same series sheds exposure on the crash bar:
    // either the protective stop or the emergency reduction closes out
    let symbol = Symbol::new("BTCUSDT");
    let mut engine = SymbolEngine::new(symbol, &config, 10_000.0);
    for candle in &candles {
        engine.process_bar(candle).unwrap();
    }
    engine.finish(candles.last().unwrap()).unwrap();

    let result = engine.into_result("1h", 10_000.0).unwrap();
    let crash_exits: Vec<_> = result
        .trades
        .iter()
        .filter(|t| {
            t.exit_reason == "protective_stop"
                || t.exit_reason == "emergency_derisk"
                || t.exit_reason == "black_swan_reduction"
        })
        .collect();
    assert!(
        !crash_exits.is_empty(),
        "crash bar must force a defensive exit, got {:?}",
        result
            .trades
            .iter()
            .map(|t| t.exit_reason.clone())
            .collect::<Vec<_>>()
    );
}

// =============================================================================
// Scenario D: 1% risk cap bounds every trade's loss
// =============================================================================

#[test]
fn per_trade_losses_respect_the_risk_cap() {
    let mut config = Config::default();
    config.risk.max_risk_per_trade = 0.01;
    config.trend.max_pyramids = 0;
    let initial_balance = 10_000.0;

    let candles = zigzag_candles(6, 40, 100.0, 0.008);
    let symbol = Symbol::new("BTCUSDT");

    let mut engine = SymbolEngine::new(symbol, &config, initial_balance);
    for candle in &candles {
        engine.process_bar(candle).unwrap();
    }
    engine.finish(candles.last().unwrap()).unwrap();
    let result = engine.into_result("1h", initial_balance).unwrap();

    // Allow slippage and commission on top of the 1% = 100 risk budget
    let loss_ceiling = initial_balance * 0.01 * 1.15;
    for trade in &result.trades {
        let loss = -trade.net_pnl.to_f64();
        assert!(
            loss <= loss_ceiling,
            "trade {} lost {loss:.2}, exceeding {loss_ceiling:.2} (exit: {})",
            trade.id,
            trade.exit_reason
        );
    }

    // Trade ids are globally unique across the run
    let mut ids: Vec<_> = result.trades.iter().map(|t| t.id).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), result.trades.len());
}

// =============================================================================
// Scenario E: perfectly correlated symbols -> one entry suppressed
// =============================================================================

#[test]
fn correlated_symbols_suppress_the_duplicate_entry() {
    let mut config = Config::default();
    config.trading.symbols = vec!["AAAUSDT".to_string(), "BBBUSDT".to_string()];
    config.portfolio.correlation_limit = 0.8;
    config.portfolio.rebalance_interval_hours = 24;

    // Five days of oscillation to build correlation history, then a strong
    // breakout so both trend followers fire on the same timestamp
    let mut candles = oscillating_candles(120, 100.0, 0.01);
    let mut price = candles.last().unwrap().close;
    let offset = candles.len();
    for i in 0..60 {
        let open = price;
        price *= 1.012;
        candles.push(bar(offset + i, open, price * 1.002, open * 0.998, price));
    }

    let mut data = HashMap::new();
    data.insert(Symbol::new("AAAUSDT"), candles.clone());
    data.insert(Symbol::new("BBBUSDT"), candles);

    let runner = PortfolioRunner::new(config).quiet(true);
    let result = runner.run(&data).unwrap();

    let corr = result
        .final_state
        .correlations
        .get("AAAUSDT/BBBUSDT")
        .copied()
        .unwrap();
    assert!(
        corr > 0.99,
        "identical series must be near-perfectly correlated, got {corr}"
    );
    assert!(
        result.suppressed_intents > 0,
        "duplicate same-direction entry should have been suppressed"
    );
}

// =============================================================================
// Properties: equity accounting stays consistent end to end
// =============================================================================

#[test]
fn final_equity_reconciles_with_trade_pnl() {
    let config = Config::default();
    let candles = zigzag_candles(4, 50, 100.0, 0.006);
    let symbol = Symbol::new("BTCUSDT");

    let mut engine = SymbolEngine::new(symbol, &config, 10_000.0);
    for candle in &candles {
        engine.process_bar(candle).unwrap();
    }
    engine.finish(candles.last().unwrap()).unwrap();
    let result = engine.into_result("1h", 10_000.0).unwrap();

    // After the forced close there is no open position: final equity must be
    // the initial balance plus net trade PnL minus open-side commissions
    let net_pnl: f64 = result.trades.iter().map(|t| t.net_pnl.to_f64()).sum();
    let closing_commission: f64 = result.trades.iter().map(|t| t.commission.to_f64()).sum();
    let entry_commission = result.metrics.total_commission - closing_commission;
    let expected = 10_000.0 + net_pnl - entry_commission;
    approx::assert_abs_diff_eq!(result.final_equity, expected, epsilon = 1.0);
}

#[test]
fn cancelled_portfolio_run_returns_no_partial_results() {
    let mut config = Config::default();
    config.trading.symbols = vec!["AAAUSDT".to_string(), "BBBUSDT".to_string()];

    let candles = oscillating_candles(50, 100.0, 0.01);
    let mut data = HashMap::new();
    data.insert(Symbol::new("AAAUSDT"), candles.clone());
    data.insert(Symbol::new("BBBUSDT"), candles);

    let runner = PortfolioRunner::new(config).quiet(true);
    runner
        .cancel_handle()
        .store(true, std::sync::atomic::Ordering::Relaxed);
    assert!(runner.run(&data).is_err());
}
