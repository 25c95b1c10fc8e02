//! Backtest command implementation

use anyhow::Result;
use tracing::info;

use regime_trader::backtest::{BacktestReport, BacktestRunner, SymbolResult};
use regime_trader::data;

use super::Overrides;

pub fn run(config_path: Option<String>, overrides: Overrides, quiet: bool) -> Result<()> {
    info!("Starting backtest");
    let config = super::load_config(config_path.as_deref(), overrides)?;

    info!("Loading data from: {}", config.backtest.data_dir);
    let symbols = config.trading.symbols();
    let data = data::load_multi_symbol(
        &config.backtest.data_dir,
        &symbols,
        &config.trading.timeframe,
        config.backtest.start_date.as_deref(),
        config.backtest.end_date.as_deref(),
    )?;
    info!("Loaded data for {} symbols", data.len());

    let results_dir = config.backtest.results_dir.clone();
    let runner = BacktestRunner::new(config.clone()).quiet(quiet);
    let results = runner.run(&data)?;

    for result in &results {
        print_summary(result);
    }

    let report = BacktestReport::new(&config, results);
    let path = report.save(&results_dir)?;
    println!("\nReport written to {}", path.display());
    Ok(())
}

fn print_summary(result: &SymbolResult) {
    let m = &result.metrics;
    println!("\n========== {} ==========", result.symbol);
    println!("Final equity:       {:>12.2}", result.final_equity);
    println!("Total return:       {:>11.2}%", m.total_return);
    println!("Sharpe ratio:       {:>12.2}", m.sharpe_ratio);
    println!("Sortino ratio:      {:>12.2}", m.sortino_ratio);
    println!("Calmar ratio:       {:>12.2}", m.calmar_ratio);
    println!("Max drawdown:       {:>11.2}%", m.max_drawdown);
    println!(
        "Trades:             {:>12} ({} wins / {} losses)",
        m.total_trades, m.winning_trades, m.losing_trades
    );
    println!("Win rate:           {:>11.2}%", m.win_rate);
    if m.profit_factor.is_finite() {
        println!("Profit factor:      {:>12.2}", m.profit_factor);
    } else {
        println!("Profit factor:      {:>12}", "inf");
    }
    println!("Expectancy:         {:>12.2}", m.expectancy);
    println!("Commission paid:    {:>12.2}", m.total_commission);
    println!("Rejected intents:   {:>12}", result.rejected_intents);
}
