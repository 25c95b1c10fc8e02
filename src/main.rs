//! Regime trader - main entry point
//!
//! Two subcommands:
//! - backtest: run each symbol independently on its full balance
//! - portfolio: run all symbols under a shared allocation and risk budget

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

use commands::Overrides;

#[derive(Parser, Debug)]
#[command(name = "regime-trader")]
#[command(about = "Regime-switching strategy backtester", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Path to configuration file (JSON)
    #[arg(short, long)]
    config: Option<String>,

    /// Symbols to trade, comma-separated (e.g. "BTCUSDT,ETHUSDT")
    #[arg(short, long)]
    symbols: Option<String>,

    /// Timeframe label (1m/5m/15m/30m/1h/2h/4h/6h/8h/12h/1d)
    #[arg(short, long)]
    timeframe: Option<String>,

    /// Start date (YYYY-MM-DD, inclusive)
    #[arg(long)]
    start_date: Option<String>,

    /// End date (YYYY-MM-DD, inclusive)
    #[arg(long)]
    end_date: Option<String>,

    /// Initial account balance
    #[arg(long)]
    initial_balance: Option<f64>,

    /// Slippage fraction applied to taker fills
    #[arg(long)]
    slippage: Option<f64>,

    /// Taker commission rate
    #[arg(long)]
    commission_rate: Option<f64>,

    /// Bars per batch (cancellation checkpoint granularity)
    #[arg(long)]
    batch_size: Option<usize>,

    /// Suppress the progress bar and console log output
    #[arg(short, long)]
    quiet: bool,
}

impl RunArgs {
    fn overrides(&self) -> Overrides {
        Overrides {
            symbols: self.symbols.clone(),
            timeframe: self.timeframe.clone(),
            start_date: self.start_date.clone(),
            end_date: self.end_date.clone(),
            initial_balance: self.initial_balance,
            slippage: self.slippage,
            commission_rate: self.commission_rate,
            batch_size: self.batch_size,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run independent per-symbol backtests
    Backtest(RunArgs),

    /// Run a multi-symbol portfolio backtest
    Portfolio(RunArgs),
}

fn setup_logging(verbose: bool, command_name: &str, file_only: bool) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    let level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    if file_only {
        // Keep the console clean for the progress bar
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_appender)
            .with_target(true)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .init();
    } else {
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_appender)
            .with_target(true)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(false);

        let console_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(true);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();

        tracing::info!("Log file: {}", log_path.display());
    }

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let (command_name, quiet) = match &cli.command {
        Commands::Backtest(args) => ("backtest", args.quiet),
        Commands::Portfolio(args) => ("portfolio", args.quiet),
    };
    // Quiet runs still keep the log file
    setup_logging(cli.verbose, command_name, quiet)?;

    match cli.command {
        Commands::Backtest(args) => {
            commands::backtest::run(args.config.clone(), args.overrides(), args.quiet)
        }
        Commands::Portfolio(args) => {
            commands::portfolio::run(args.config.clone(), args.overrides(), args.quiet)
        }
    }
}
