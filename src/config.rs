//! Configuration management
//!
//! Layered typed configuration: compiled-in defaults, then a JSON file, then
//! environment-variable overrides. Components receive the typed sections at
//! construction time; nothing looks parameters up by string path at runtime.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::types::EngineError;
use crate::Symbol;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub trading: TradingConfig,
    pub indicators: IndicatorConfig,
    pub regime: RegimeConfig,
    pub trend: TrendConfig,
    pub grid: GridConfig,
    pub execution: ExecutionConfig,
    pub risk: RiskConfig,
    pub backtest: BacktestConfig,
    pub portfolio: PortfolioConfig,
}

impl Config {
    /// Load configuration from a JSON file, then apply environment overrides
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
        let mut config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Environment overrides for the values most often tweaked per run
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_f64("RT_INITIAL_BALANCE") {
            self.trading.initial_balance = v;
        }
        if let Some(v) = env_f64("RT_RISK_PER_TRADE") {
            self.risk.max_risk_per_trade = v;
        }
        if let Some(v) = env_f64("RT_MAX_DAILY_LOSS") {
            self.risk.max_daily_loss = v;
        }
        if let Ok(dir) = std::env::var("RT_DATA_DIR") {
            self.backtest.data_dir = dir;
        }
    }

    /// Reject missing or out-of-range risk-critical parameters.
    ///
    /// Risk caps are never silently defaulted away: a zero or negative
    /// risk-per-trade is a configuration mistake, not a request for zero risk.
    pub fn validate(&self) -> Result<(), EngineError> {
        let fail = |msg: String| Err(EngineError::Config(msg));

        if self.trading.initial_balance <= 0.0 {
            return fail(format!(
                "trading.initial_balance must be > 0 (got {})",
                self.trading.initial_balance
            ));
        }
        if !(0.0..=0.1).contains(&self.risk.max_risk_per_trade) || self.risk.max_risk_per_trade == 0.0 {
            return fail(format!(
                "risk.max_risk_per_trade must be in (0, 0.1] (got {})",
                self.risk.max_risk_per_trade
            ));
        }
        if !(0.0..=1.0).contains(&self.risk.max_daily_loss) || self.risk.max_daily_loss == 0.0 {
            return fail(format!(
                "risk.max_daily_loss must be in (0, 1] (got {})",
                self.risk.max_daily_loss
            ));
        }
        if !(0.0..=1.0).contains(&self.risk.max_position_pct) || self.risk.max_position_pct == 0.0 {
            return fail(format!(
                "risk.max_position_pct must be in (0, 1] (got {})",
                self.risk.max_position_pct
            ));
        }
        if self.indicators.ema_short_period >= self.indicators.ema_long_period {
            return fail(format!(
                "indicators.ema_short_period ({}) must be < ema_long_period ({})",
                self.indicators.ema_short_period, self.indicators.ema_long_period
            ));
        }
        if self.backtest.batch_size == 0 {
            return fail("backtest.batch_size must be > 0".to_string());
        }
        if self.portfolio.correlation_limit <= 0.0 || self.portfolio.correlation_limit > 1.0 {
            return fail(format!(
                "portfolio.correlation_limit must be in (0, 1] (got {})",
                self.portfolio.correlation_limit
            ));
        }
        Ok(())
    }
}

fn env_f64(key: &str) -> Option<f64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Symbols, timeframe, starting balance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    pub symbols: Vec<String>,
    /// Timeframe label ("1h", "4h", "1d"); drives Sharpe annualization
    pub timeframe: String,
    pub initial_balance: f64,
}

impl Default for TradingConfig {
    fn default() -> Self {
        TradingConfig {
            symbols: vec!["BTCUSDT".to_string()],
            timeframe: "1h".to_string(),
            initial_balance: 10_000.0,
        }
    }
}

impl TradingConfig {
    pub fn symbols(&self) -> Vec<Symbol> {
        self.symbols.iter().map(Symbol::new).collect()
    }
}

/// Indicator periods and the ATR fallback policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndicatorConfig {
    pub ema_short_period: usize,
    pub ema_long_period: usize,
    pub atr_period: usize,
    pub adx_period: usize,
    pub donchian_period: usize,
    pub vwap_window: usize,
    /// Bars used for the EMA slope estimate
    pub slope_lookback: usize,
    /// Extra bars required beyond the longest period before snapshots are live
    pub warmup_margin: usize,
    pub sar_af_start: f64,
    pub sar_af_step: f64,
    pub sar_af_max: f64,
    /// ATR below close * min_atr_fraction is considered degenerate
    pub min_atr_fraction: f64,
    /// Substitute ATR as a fraction of close when degenerate.
    /// Empirically tuned on the markets this shipped for; recalibrate before
    /// trusting it on a new market.
    pub default_atr_pct: f64,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        IndicatorConfig {
            ema_short_period: 9,
            ema_long_period: 21,
            atr_period: 14,
            adx_period: 14,
            donchian_period: 20,
            vwap_window: 24,
            slope_lookback: 5,
            warmup_margin: 5,
            sar_af_start: 0.02,
            sar_af_step: 0.02,
            sar_af_max: 0.2,
            min_atr_fraction: 0.001,
            default_atr_pct: 0.02,
        }
    }
}

impl IndicatorConfig {
    /// Bars required before snapshots carry live values
    pub fn warmup_bars(&self) -> usize {
        self.ema_long_period
            .max(self.atr_period)
            .max(self.adx_period * 2)
            .max(self.donchian_period)
            + self.warmup_margin
    }
}

/// Regime classification thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeConfig {
    /// Bar-over-bar close gap that flags an emergency (fraction)
    pub emergency_gap_pct: f64,
    /// Consecutive calm bars required to leave Emergency
    pub emergency_recovery_bars: usize,
    /// EMA slope (fraction per bar) for a strong trend
    pub strong_slope: f64,
    /// EMA slope for an ordinary trend
    pub trend_slope: f64,
    /// EMA slope below which direction is considered noise
    pub weak_slope: f64,
    pub adx_threshold: f64,
    /// ADX for an ordinary (non-strong) trend
    pub adx_moderate: f64,
    /// ATR% ceiling for the range regime
    pub range_atr_pct: f64,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        RegimeConfig {
            emergency_gap_pct: 0.15,
            emergency_recovery_bars: 3,
            strong_slope: 0.003,
            trend_slope: 0.0015,
            weak_slope: 0.0005,
            adx_threshold: 25.0,
            adx_moderate: 18.0,
            range_atr_pct: 6.0,
        }
    }
}

/// Trend-following strategy parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrendConfig {
    /// Initial stop distance in ATRs
    pub initial_stop_atr: f64,
    /// Trailing stop distance in ATRs
    pub trailing_stop_atr: f64,
    /// R multiple at which the stop moves to breakeven
    pub breakeven_r: f64,
    /// R multiple at which 50% of open profit is locked in
    pub lock_profit_r: f64,
    /// Fraction of open profit locked once lock_profit_r is reached
    pub lock_profit_fraction: f64,
    /// Add-on size as a fraction of the initial risk unit
    pub pyramid_risk_fraction: f64,
    /// Favorable movement (in R) between add-ons
    pub pyramid_step_r: f64,
    pub max_pyramids: u8,
}

impl Default for TrendConfig {
    fn default() -> Self {
        TrendConfig {
            initial_stop_atr: 1.5,
            trailing_stop_atr: 2.0,
            breakeven_r: 2.0,
            lock_profit_r: 3.0,
            lock_profit_fraction: 0.5,
            pyramid_risk_fraction: 0.5,
            pyramid_step_r: 1.0,
            max_pyramids: 2,
        }
    }
}

/// Mean-reversion grid strategy parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// Donchian period used for the trading range
    pub range_period: usize,
    /// Range narrowing factor applied to the Donchian width
    pub range_narrowing: f64,
    /// Grid spacing multiplier on ATR
    pub grid_atr_multiplier: f64,
    pub min_levels: usize,
    pub max_levels: usize,
    /// Limit-order offset from each grid level (fraction)
    pub min_spread_pct: f64,
    /// Price excursion beyond the range bound that triggers the escape
    pub escape_pct: f64,
    /// Long/short imbalance fraction that triggers the hedge
    pub imbalance_threshold: f64,
    /// Fraction of the imbalance hedged
    pub hedge_fraction: f64,
    /// Fraction of equity deployed across the grid
    pub capital_usage_pct: f64,
}

impl Default for GridConfig {
    fn default() -> Self {
        GridConfig {
            range_period: 30,
            range_narrowing: 0.9,
            grid_atr_multiplier: 0.6,
            min_levels: 3,
            max_levels: 10,
            min_spread_pct: 0.003,
            escape_pct: 0.02,
            imbalance_threshold: 0.15,
            hedge_fraction: 0.5,
            capital_usage_pct: 0.35,
        }
    }
}

/// Fill simulation costs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub maker_fee: f64,
    pub taker_fee: f64,
    pub slippage: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        ExecutionConfig {
            maker_fee: 0.0004,
            taker_fee: 0.001,
            slippage: 0.001,
        }
    }
}

/// Risk gate limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Per-trade risk cap as a fraction of balance
    pub max_risk_per_trade: f64,
    /// Daily realized loss (fraction of balance) that halts new entries
    pub max_daily_loss: f64,
    /// Total position value ceiling as a fraction of balance
    pub max_position_pct: f64,
    /// Price gap that triggers black-swan de-risking
    pub black_swan_gap_pct: f64,
    /// Fraction of each position shed on a black-swan conversion
    pub black_swan_reduction: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        RiskConfig {
            max_risk_per_trade: 0.02,
            max_daily_loss: 0.05,
            max_position_pct: 0.35,
            black_swan_gap_pct: 0.15,
            black_swan_reduction: 0.5,
        }
    }
}

/// Backtest runner settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    pub data_dir: String,
    pub results_dir: String,
    /// Bars per batch; cancellation is checked at batch boundaries
    pub batch_size: usize,
    /// Record one equity point every N bars
    pub equity_sample_interval: usize,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        BacktestConfig {
            data_dir: "data".to_string(),
            results_dir: "results".to_string(),
            batch_size: 5_000,
            equity_sample_interval: 1,
            start_date: None,
            end_date: None,
        }
    }
}

/// Capital allocation mode across symbols
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationMode {
    EqualWeight,
    InverseVolatility,
    /// Explicit weights keyed by symbol; must sum to 1.0
    Custom(std::collections::HashMap<String, f64>),
}

/// Multi-symbol orchestration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortfolioConfig {
    pub allocation: AllocationMode,
    /// Hours of simulated time between correlation/weight refreshes
    pub rebalance_interval_hours: i64,
    /// Rolling correlation beyond which same-direction entries are suppressed
    pub correlation_limit: f64,
    /// Portfolio position value / portfolio equity ceiling
    pub portfolio_risk_limit: f64,
    /// Daily return observations kept for correlation and VaR
    pub return_window_days: usize,
}

impl Default for PortfolioConfig {
    fn default() -> Self {
        PortfolioConfig {
            allocation: AllocationMode::EqualWeight,
            rebalance_interval_hours: 24,
            correlation_limit: 0.8,
            portfolio_risk_limit: 0.5,
            return_window_days: 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_risk_per_trade_is_rejected() {
        let mut config = Config::default();
        config.risk.max_risk_per_trade = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn inverted_ema_periods_are_rejected() {
        let mut config = Config::default();
        config.indicators.ema_short_period = 50;
        config.indicators.ema_long_period = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let json = r#"{ "trading": { "symbols": ["ETHUSDT"], "timeframe": "4h" } }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.trading.symbols, vec!["ETHUSDT"]);
        assert_eq!(config.trading.timeframe, "4h");
        assert_eq!(config.risk.max_risk_per_trade, 0.02);
        assert_eq!(config.backtest.batch_size, 5_000);
    }

    #[test]
    fn warmup_covers_longest_period() {
        let ind = IndicatorConfig::default();
        assert!(ind.warmup_bars() >= ind.ema_long_period + ind.warmup_margin);
        assert!(ind.warmup_bars() >= ind.adx_period * 2);
    }
}
