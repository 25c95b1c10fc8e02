//! Portfolio command implementation

use anyhow::{Context, Result};
use tracing::info;

use regime_trader::data;
use regime_trader::portfolio::{PortfolioResult, PortfolioRunner};

use super::Overrides;

pub fn run(config_path: Option<String>, overrides: Overrides, quiet: bool) -> Result<()> {
    info!("Starting portfolio backtest");
    let config = super::load_config(config_path.as_deref(), overrides)?;

    if config.trading.symbols.len() < 2 {
        anyhow::bail!("portfolio mode needs at least two symbols (--symbols A,B)");
    }

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
    let runner = PortfolioRunner::new(config).quiet(quiet);
    let result = runner.run(&data)?;

    print_summary(&result);
    let path = save_report(&result, &results_dir)?;
    println!("\nReport written to {}", path.display());
    Ok(())
}

fn save_report(result: &PortfolioResult, results_dir: &str) -> Result<std::path::PathBuf> {
    std::fs::create_dir_all(results_dir)
        .with_context(|| format!("Failed to create results dir {results_dir}"))?;
    let filename = format!(
        "portfolio_{}.json",
        chrono::Utc::now().format("%Y%m%d_%H%M%S")
    );
    let path = std::path::Path::new(results_dir).join(filename);
    let json = serde_json::to_string_pretty(result).context("Failed to serialize report")?;
    std::fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

fn print_summary(result: &PortfolioResult) {
    let m = &result.metrics;
    println!("\n========== Portfolio ==========");
    println!("Final equity:       {:>12.2}", result.final_state.equity);
    println!("Total return:       {:>11.2}%", m.total_return);
    println!("Sharpe ratio:       {:>12.2}", m.sharpe_ratio);
    println!("Max drawdown:       {:>11.2}%", m.max_drawdown);
    println!("Total trades:       {:>12}", m.total_trades);
    println!("VaR (95%):          {:>12.2}", result.final_state.var_95);
    println!("Suppressed intents: {:>12}", result.suppressed_intents);

    println!("\nAllocation weights:");
    let mut weights: Vec<_> = result.final_state.weights.iter().collect();
    weights.sort_by(|a, b| a.0.cmp(b.0));
    for (symbol, weight) in weights {
        println!("  {symbol:<12} {:.2}%", weight * 100.0);
    }

    if !result.final_state.correlations.is_empty() {
        println!("\nPairwise correlations:");
        let mut pairs: Vec<_> = result.final_state.correlations.iter().collect();
        pairs.sort_by(|a, b| a.0.cmp(b.0));
        for (pair, corr) in pairs {
            println!("  {pair:<24} {corr:+.3}");
        }
    }

    println!("\nPer-symbol results:");
    for symbol_result in &result.symbol_results {
        println!(
            "  {:<12} return {:>8.2}%  trades {:>4}  sharpe {:>6.2}",
            symbol_result.symbol.to_string(),
            symbol_result.metrics.total_return,
            symbol_result.metrics.total_trades,
            symbol_result.metrics.sharpe_ratio
        );
    }
}
