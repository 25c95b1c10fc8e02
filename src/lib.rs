//! Regime-adaptive trading engine
//!
//! A backtesting engine for regime-switching crypto strategies: an
//! incremental indicator pipeline feeds a market-regime classifier, which
//! routes each bar to a trend-following, grid, or emergency strategy. Order
//! intents pass a risk gate before being simulated against historical bars,
//! and a portfolio orchestrator runs many symbols with a shared exposure
//! budget.

pub mod backtest;
pub mod config;
pub mod data;
pub mod indicators;
pub mod oms;
pub mod portfolio;
pub mod regime;
pub mod risk;
pub mod strategies;
pub mod types;

pub use config::Config;
pub use types::{
    Candle, EngineError, EquityPoint, Money, PerformanceMetrics, Side, Symbol, Trade, TradeId,
};
