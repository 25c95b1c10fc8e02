//! CLI command implementations

pub mod backtest;
pub mod portfolio;

use regime_trader::Config;
use tracing::info;

/// Shared CLI overrides applied on top of the config file
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub symbols: Option<String>,
    pub timeframe: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub initial_balance: Option<f64>,
    pub slippage: Option<f64>,
    pub commission_rate: Option<f64>,
    pub batch_size: Option<usize>,
}

impl Overrides {
    pub fn apply(self, config: &mut Config) {
        if let Some(symbols) = self.symbols {
            config.trading.symbols = symbols
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            info!("Symbols override: {:?}", config.trading.symbols);
        }
        if let Some(timeframe) = self.timeframe {
            info!("Timeframe override: {timeframe}");
            config.trading.timeframe = timeframe;
        }
        if let Some(start) = self.start_date {
            info!("Start date override: {start}");
            config.backtest.start_date = Some(start);
        }
        if let Some(end) = self.end_date {
            info!("End date override: {end}");
            config.backtest.end_date = Some(end);
        }
        if let Some(balance) = self.initial_balance {
            info!("Initial balance override: {balance:.2}");
            config.trading.initial_balance = balance;
        }
        if let Some(slippage) = self.slippage {
            info!("Slippage override: {slippage}");
            config.execution.slippage = slippage;
        }
        if let Some(rate) = self.commission_rate {
            info!("Commission rate override: {rate}");
            config.execution.taker_fee = rate;
        }
        if let Some(batch) = self.batch_size {
            config.backtest.batch_size = batch;
        }
    }
}

/// Load the config file (or defaults), apply CLI overrides, validate
pub fn load_config(config_path: Option<&str>, overrides: Overrides) -> anyhow::Result<Config> {
    let mut config = match config_path {
        Some(path) => {
            let config = Config::from_file(path)?;
            info!("Loaded configuration from: {path}");
            config
        }
        None => {
            let mut config = Config::default();
            config.apply_env_overrides();
            config
        }
    };
    overrides.apply(&mut config);
    config.validate()?;
    Ok(config)
}
