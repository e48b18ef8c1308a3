use crate::config::EngineRuntimeSettings;
use crate::data_context::{load_price_file, normalize_ticker, MarketData};
use crate::engine::run_backtest;
use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::models::{BacktestMetrics, Candle, ParameterSet};
use crate::strategy::catalog;
use anyhow::{anyhow, Result};
use chrono::{Months, NaiveDate};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Source of daily bars for a ticker; implementations return bars sorted by date.
pub trait PriceHistoryProvider {
    fn price_history(&self, ticker: &str) -> Result<Vec<Candle>>;
}

/// Reads `<dir>/<TICKER>.json` (or the lower-case file name).
pub struct JsonDirectoryProvider {
    dir: PathBuf,
}

impl JsonDirectoryProvider {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }
}

impl PriceHistoryProvider for JsonDirectoryProvider {
    fn price_history(&self, ticker: &str) -> Result<Vec<Candle>> {
        let ticker = normalize_ticker(ticker);
        let candidates = [
            self.dir.join(format!("{}.json", ticker)),
            self.dir.join(format!("{}.json", ticker.to_lowercase())),
        ];
        let path = candidates
            .iter()
            .find(|path| path.is_file())
            .ok_or_else(|| anyhow!("No price file for {} in {}", ticker, self.dir.display()))?;
        let mut candles = load_price_file(path)?;
        candles.sort_by_key(|candle| candle.date);
        Ok(candles)
    }
}

impl PriceHistoryProvider for MarketData {
    fn price_history(&self, ticker: &str) -> Result<Vec<Candle>> {
        self.candles(ticker)
            .map(|candles| candles.to_vec())
            .ok_or_else(|| anyhow!("No price history for {}", normalize_ticker(ticker)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BatchPeriod {
    #[serde(rename = "1y")]
    #[default]
    OneYear,
    #[serde(rename = "3y")]
    ThreeYears,
    #[serde(rename = "5y")]
    FiveYears,
    #[serde(rename = "10y")]
    TenYears,
}

impl BatchPeriod {
    pub fn parse(value: &str) -> EngineResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "1y" => Ok(BatchPeriod::OneYear),
            "3y" => Ok(BatchPeriod::ThreeYears),
            "5y" => Ok(BatchPeriod::FiveYears),
            "10y" => Ok(BatchPeriod::TenYears),
            other => Err(EngineError::validation(format!(
                "period must be one of 1y, 3y, 5y, 10y (value: {})",
                other
            ))),
        }
    }

    pub fn years(self) -> u32 {
        match self {
            BatchPeriod::OneYear => 1,
            BatchPeriod::ThreeYears => 3,
            BatchPeriod::FiveYears => 5,
            BatchPeriod::TenYears => 10,
        }
    }

    /// First date inside the period ending at `latest`.
    pub fn start_date(self, latest: NaiveDate) -> NaiveDate {
        latest
            .checked_sub_months(Months::new(12 * self.years()))
            .unwrap_or(NaiveDate::MIN)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyBacktestSummary {
    pub strategy_id: String,
    pub strategy_name: String,
    pub parameters: ParameterSet,
    pub metrics: BacktestMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickerBatchResult {
    pub ticker: String,
    pub bars: usize,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub results: Vec<StrategyBacktestSummary>,
    /// Strategies that ran but produced fewer trades than the filter.
    pub filtered_strategies: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchFailure {
    pub ticker: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy_id: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchBacktestResult {
    pub period: BatchPeriod,
    pub min_trades: usize,
    pub tickers: Vec<TickerBatchResult>,
    pub failures: Vec<BatchFailure>,
}

pub struct BatchBacktester<'a, P: PriceHistoryProvider + ?Sized> {
    provider: &'a P,
    max_tickers: usize,
    min_history_bars: usize,
}

impl<'a, P: PriceHistoryProvider + ?Sized> BatchBacktester<'a, P> {
    pub fn new(provider: &'a P, settings: &EngineRuntimeSettings) -> Self {
        Self {
            provider,
            max_tickers: settings.batch_max_tickers,
            min_history_bars: settings.batch_min_history_bars,
        }
    }

    /// Runs every catalog strategy with default parameters on each ticker.
    /// Failures are recorded per ticker/strategy; the call only fails when nothing ran.
    pub fn run(
        &self,
        tickers: &[String],
        period: BatchPeriod,
        min_trades: usize,
    ) -> EngineResult<BatchBacktestResult> {
        let tickers = self.normalized_tickers(tickers)?;
        info!(
            "Batch backtest of {} ticker(s) over {}y with minTrades {}",
            tickers.len(),
            period.years(),
            min_trades
        );

        let mut output = BatchBacktestResult {
            period,
            min_trades,
            tickers: Vec::new(),
            failures: Vec::new(),
        };
        let mut completed_runs = 0usize;

        for ticker in tickers {
            let candles = match self.load_period(&ticker, period) {
                Ok(candles) => candles,
                Err(err) => {
                    warn!("Skipping {}: {}", ticker, err);
                    output.failures.push(BatchFailure {
                        ticker,
                        strategy_id: None,
                        kind: err.kind(),
                        message: err.to_string(),
                    });
                    continue;
                }
            };

            let mut ticker_result = TickerBatchResult {
                ticker: ticker.clone(),
                bars: candles.len(),
                start_date: candles[0].date,
                end_date: candles[candles.len() - 1].date,
                results: Vec::new(),
                filtered_strategies: 0,
            };

            for template in catalog() {
                match run_backtest(&template.id, &candles, &ParameterSet::new()) {
                    Ok(run) => {
                        completed_runs += 1;
                        if run.metrics.total_trades < min_trades {
                            ticker_result.filtered_strategies += 1;
                            continue;
                        }
                        ticker_result.results.push(StrategyBacktestSummary {
                            strategy_id: template.id.clone(),
                            strategy_name: template.name.clone(),
                            parameters: run.parameters,
                            metrics: run.metrics,
                        });
                    }
                    Err(err) => {
                        warn!("{} failed on {}: {}", template.id, ticker, err);
                        output.failures.push(BatchFailure {
                            ticker: ticker.clone(),
                            strategy_id: Some(template.id.clone()),
                            kind: err.kind(),
                            message: err.to_string(),
                        });
                    }
                }
            }
            output.tickers.push(ticker_result);
        }

        if completed_runs == 0 {
            let detail = output
                .failures
                .iter()
                .map(|failure| format!("{}: {}", failure.ticker, failure.message))
                .collect::<Vec<_>>()
                .join("; ");
            let all_insufficient = output
                .failures
                .iter()
                .all(|failure| failure.kind == ErrorKind::InsufficientData);
            let message = format!("No ticker could be backtested ({})", detail);
            return Err(if all_insufficient {
                EngineError::insufficient_data(message)
            } else {
                EngineError::calculation(message)
            });
        }
        Ok(output)
    }

    fn normalized_tickers(&self, tickers: &[String]) -> EngineResult<Vec<String>> {
        let mut normalized: Vec<String> = Vec::new();
        for ticker in tickers.iter().map(|t| normalize_ticker(t)) {
            if !ticker.is_empty() && !normalized.contains(&ticker) {
                normalized.push(ticker);
            }
        }
        if normalized.is_empty() {
            return Err(EngineError::validation("At least one ticker is required"));
        }
        if normalized.len() > self.max_tickers {
            return Err(EngineError::validation(format!(
                "At most {} tickers per batch (got {})",
                self.max_tickers,
                normalized.len()
            )));
        }
        Ok(normalized)
    }

    fn load_period(&self, ticker: &str, period: BatchPeriod) -> EngineResult<Vec<Candle>> {
        let history = self
            .provider
            .price_history(ticker)
            .map_err(|err| EngineError::insufficient_data(format!("{:#}", err)))?;
        let Some(latest) = history.last().map(|candle| candle.date) else {
            return Err(EngineError::insufficient_data(format!(
                "No price history for {}",
                ticker
            )));
        };
        let start = period.start_date(latest);
        let candles: Vec<Candle> = history
            .into_iter()
            .filter(|candle| candle.date >= start)
            .collect();
        if candles.len() < self.min_history_bars {
            return Err(EngineError::insufficient_data(format!(
                "{} has {} bars in the last {}y; {} required",
                ticker,
                candles.len(),
                period.years(),
                self.min_history_bars
            )));
        }
        Ok(candles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{init_logging, wavy_series};

    fn market() -> MarketData {
        let mut data = MarketData::new();
        data.insert("AAA", wavy_series(300, 100.0)).unwrap();
        data.insert("SHORT", wavy_series(50, 40.0)).unwrap();
        data
    }

    fn tickers(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn failing_tickers_do_not_abort_the_batch() {
        init_logging();
        let data = market();
        let settings = EngineRuntimeSettings::default();
        let result = BatchBacktester::new(&data, &settings)
            .run(&tickers(&["aaa", "short", "missing"]), BatchPeriod::FiveYears, 0)
            .unwrap();

        assert_eq!(result.tickers.len(), 1);
        let aaa = &result.tickers[0];
        assert_eq!(aaa.ticker, "AAA");
        assert_eq!(aaa.bars, 300);
        assert_eq!(aaa.results.len(), catalog().len());

        let failed: Vec<&str> = result.failures.iter().map(|f| f.ticker.as_str()).collect();
        assert_eq!(failed, vec!["SHORT", "MISSING"]);
        assert!(result
            .failures
            .iter()
            .all(|f| f.kind == ErrorKind::InsufficientData));
    }

    #[test]
    fn min_trades_filter_drops_quiet_strategies() {
        let data = market();
        let settings = EngineRuntimeSettings::default();
        let result = BatchBacktester::new(&data, &settings)
            .run(&tickers(&["AAA"]), BatchPeriod::OneYear, 2)
            .unwrap();
        let aaa = &result.tickers[0];
        assert!(aaa.results.iter().all(|r| r.metrics.total_trades >= 2));
        assert!(!aaa.results.iter().any(|r| r.strategy_id == "buy_and_hold"));
        assert_eq!(aaa.results.len() + aaa.filtered_strategies, catalog().len());
    }

    #[test]
    fn period_trims_history_from_the_latest_bar() {
        let latest = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        assert_eq!(
            BatchPeriod::ThreeYears.start_date(latest),
            NaiveDate::from_ymd_opt(2021, 2, 28).unwrap()
        );
        assert_eq!(BatchPeriod::parse("10Y").unwrap(), BatchPeriod::TenYears);
        assert!(BatchPeriod::parse("2y").is_err());
    }

    #[test]
    fn ticker_list_is_validated() {
        let data = market();
        let settings = EngineRuntimeSettings::default();
        let batch = BatchBacktester::new(&data, &settings);
        assert!(matches!(
            batch.run(&[], BatchPeriod::OneYear, 0),
            Err(EngineError::Validation(_))
        ));
        let many = tickers(&["A", "B", "C", "D", "E", "F"]);
        assert!(matches!(
            batch.run(&many, BatchPeriod::OneYear, 0),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            batch.run(&tickers(&["SHORT"]), BatchPeriod::OneYear, 0),
            Err(EngineError::InsufficientData(_))
        ));
    }
}
