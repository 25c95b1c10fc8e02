//! Historical data loading
//!
//! Loads OHLCV bars from CSV files, validates candle geometry and timestamp
//! ordering, and resolves timeframe labels. The loaded series is read-only to
//! the engines; the loader never interpolates missing bars.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

use crate::types::EngineError;
use crate::{Candle, Symbol};

/// Hours per timeframe label; the Sharpe annualization factor derives from it
pub fn timeframe_hours(timeframe: &str) -> Result<f64, EngineError> {
    match timeframe {
        "1m" => Ok(1.0 / 60.0),
        "5m" => Ok(5.0 / 60.0),
        "15m" => Ok(0.25),
        "30m" => Ok(0.5),
        "1h" => Ok(1.0),
        "2h" => Ok(2.0),
        "4h" => Ok(4.0),
        "6h" => Ok(6.0),
        "8h" => Ok(8.0),
        "12h" => Ok(12.0),
        "1d" => Ok(24.0),
        other => Err(EngineError::Config(format!(
            "unknown timeframe '{other}' (expected 1m/5m/15m/30m/1h/2h/4h/6h/8h/12h/1d)"
        ))),
    }
}

/// Bars per year for the given timeframe (crypto trades around the clock)
pub fn bars_per_year(timeframe: &str) -> Result<f64, EngineError> {
    Ok(365.0 * 24.0 / timeframe_hours(timeframe)?)
}

/// Load OHLCV bars from a CSV file: datetime,open,high,low,close,volume
pub fn load_csv(path: impl AsRef<Path>) -> Result<Vec<Candle>> {
    let mut reader = csv::Reader::from_path(path.as_ref()).context("Failed to open CSV file")?;

    let mut candles = Vec::new();

    for (row_idx, result) in reader.records().enumerate() {
        let record = result.with_context(|| format!("Failed to read row {}", row_idx + 1))?;

        let dt_str = record.get(0).context("Missing datetime column")?;
        let datetime = parse_datetime(dt_str)
            .with_context(|| format!("Failed to parse datetime: {dt_str}"))?;

        let field = |idx: usize, name: &str| -> Result<f64> {
            record
                .get(idx)
                .with_context(|| format!("Missing {name} column"))?
                .parse()
                .with_context(|| format!("Failed to parse {name} at row {}", row_idx + 1))
        };

        candles.push(Candle {
            datetime,
            open: field(1, "open")?,
            high: field(2, "high")?,
            low: field(3, "low")?,
            close: field(4, "close")?,
            volume: field(5, "volume")?,
        });
    }

    Ok(candles)
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = s.parse::<DateTime<Utc>>() {
        return Ok(dt);
    }
    // Epoch milliseconds
    if let Ok(ms) = s.parse::<i64>() {
        if let Some(dt) = DateTime::from_timestamp_millis(ms) {
            return Ok(dt);
        }
    }
    // Naive datetime, assume UTC
    let ndt = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")?;
    Ok(DateTime::<Utc>::from_naive_utc_and_offset(ndt, Utc))
}

/// Validate a full series: candle geometry plus strictly increasing timestamps
pub fn validate_series(symbol: &Symbol, candles: &[Candle]) -> Result<(), EngineError> {
    for (i, candle) in candles.iter().enumerate() {
        candle.validate().map_err(|e| {
            EngineError::Data(format!("{symbol} bar {i} ({}): {e}", candle.datetime))
        })?;
        if i > 0 && candle.datetime <= candles[i - 1].datetime {
            return Err(EngineError::Data(format!(
                "{symbol} timestamps not strictly increasing at bar {i} ({})",
                candle.datetime
            )));
        }
    }
    Ok(())
}

/// Keep only bars inside [start, end] (inclusive, whole days, UTC)
pub fn filter_date_range(
    candles: Vec<Candle>,
    start: Option<&str>,
    end: Option<&str>,
) -> Result<Vec<Candle>> {
    let start_dt = start
        .map(parse_date_floor)
        .transpose()
        .context("Invalid start date (expected YYYY-MM-DD)")?;
    let end_dt = end
        .map(parse_date_ceil)
        .transpose()
        .context("Invalid end date (expected YYYY-MM-DD)")?;

    Ok(candles
        .into_iter()
        .filter(|c| {
            start_dt.map(|s| c.datetime >= s).unwrap_or(true)
                && end_dt.map(|e| c.datetime <= e).unwrap_or(true)
        })
        .collect())
}

fn parse_date_floor(s: &str) -> Result<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")?;
    Ok(DateTime::from_naive_utc_and_offset(
        date.and_hms_opt(0, 0, 0).expect("valid midnight"),
        Utc,
    ))
}

fn parse_date_ceil(s: &str) -> Result<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")?;
    Ok(DateTime::from_naive_utc_and_offset(
        date.and_hms_opt(23, 59, 59).expect("valid end of day"),
        Utc,
    ))
}

/// Load and validate bars for multiple symbols from `{symbol}_{timeframe}.csv`
pub fn load_multi_symbol(
    data_dir: impl AsRef<Path>,
    symbols: &[Symbol],
    timeframe: &str,
    start: Option<&str>,
    end: Option<&str>,
) -> Result<HashMap<Symbol, Vec<Candle>>> {
    let mut data = HashMap::new();

    for symbol in symbols {
        let filename = format!("{}_{}.csv", symbol.as_str(), timeframe);
        let path = data_dir.as_ref().join(&filename);

        if !path.exists() {
            warn!("Data file not found: {}", path.display());
            continue;
        }

        let candles = load_csv(&path).with_context(|| format!("Failed to load data for {symbol}"))?;
        let candles = filter_date_range(candles, start, end)?;
        validate_series(symbol, &candles)?;

        info!("Loaded {} candles for {}", candles.len(), symbol);
        data.insert(symbol.clone(), candles);
    }

    if data.is_empty() {
        anyhow::bail!("No data loaded for any symbol");
    }

    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn bar(minute: i64, close: f64) -> Candle {
        let dt = DateTime::from_timestamp(1_700_000_000 + minute * 60, 0).unwrap();
        Candle::new_unchecked(dt, close, close + 1.0, close - 1.0, close, 100.0)
    }

    #[test]
    fn timeframe_hours_known_labels() {
        assert_eq!(timeframe_hours("1h").unwrap(), 1.0);
        assert_eq!(timeframe_hours("1d").unwrap(), 24.0);
        assert!(timeframe_hours("3w").is_err());
    }

    #[test]
    fn bars_per_year_is_continuous_market() {
        assert_eq!(bars_per_year("1h").unwrap(), 8760.0);
        assert_eq!(bars_per_year("1d").unwrap(), 365.0);
    }

    #[test]
    fn validate_series_rejects_unordered_timestamps() {
        let symbol = Symbol::new("BTCUSDT");
        let ordered = vec![bar(0, 100.0), bar(1, 101.0)];
        assert!(validate_series(&symbol, &ordered).is_ok());

        let mut unordered = ordered.clone();
        unordered[1].datetime = unordered[0].datetime - Duration::minutes(1);
        assert!(validate_series(&symbol, &unordered).is_err());

        let mut duplicated = ordered;
        duplicated[1].datetime = duplicated[0].datetime;
        assert!(validate_series(&symbol, &duplicated).is_err());
    }

    #[test]
    fn date_filter_is_inclusive() {
        let candles: Vec<Candle> = (0..48).map(|i| bar(i * 60, 100.0)).collect();
        let first_day = candles[0].datetime.format("%Y-%m-%d").to_string();
        let kept = filter_date_range(candles, Some(&first_day), Some(&first_day)).unwrap();
        assert!(!kept.is_empty());
        assert!(kept.len() < 48);
    }
}
