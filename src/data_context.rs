use crate::models::Candle;
use crate::optimizer_status::OptimizerStatus;
use anyhow::{anyhow, Context, Result};
use chrono::prelude::*;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

const MARKET_DATA_SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct MarketDataSnapshot {
    version: u32,
    generated_at: DateTime<Utc>,
    series: BTreeMap<String, Vec<Candle>>,
}

/// Accepted shapes of a JSON price file.
#[derive(Deserialize)]
#[serde(untagged)]
enum PriceFile {
    Bars(Vec<Candle>),
    Wrapped { candles: Vec<Candle> },
}

/// Daily bars keyed by upper-case ticker, each series sorted by date.
#[derive(Debug, Clone, Default)]
pub struct MarketData {
    series: BTreeMap<String, Vec<Candle>>,
    generated_at: Option<DateTime<Utc>>,
}

impl MarketData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<S: AsRef<str>>(&mut self, ticker: S, mut candles: Vec<Candle>) -> Result<()> {
        let ticker = normalize_ticker(ticker.as_ref());
        if ticker.is_empty() {
            return Err(anyhow!("Ticker symbol must not be empty"));
        }
        candles.sort_by_key(|candle| candle.date);
        if let Some(pair) = candles.windows(2).find(|pair| pair[0].date == pair[1].date) {
            return Err(anyhow!(
                "Duplicate bar for {} on {}",
                ticker,
                pair[0].date
            ));
        }
        self.series.insert(ticker, candles);
        Ok(())
    }

    /// Loads every `*.json` file in `dir`; the file stem names the ticker.
    pub fn load_json_directory<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let entries = fs::read_dir(dir)
            .with_context(|| format!("Failed to read price directory {}", dir.display()))?;

        let mut data = Self::new();
        for entry in entries {
            let path = entry
                .with_context(|| format!("Failed to list {}", dir.display()))?
                .path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let Some(ticker) = path.file_stem().and_then(|stem| stem.to_str()) else {
                warn!("Skipping price file with unreadable name: {}", path.display());
                continue;
            };
            let ticker = ticker.to_string();
            let candles = load_price_file(&path)?;
            data.insert(&ticker, candles)?;
        }
        info!(
            "Loaded {} price series from {}",
            data.series.len(),
            dir.display()
        );
        Ok(data)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P, status: &OptimizerStatus) -> Result<Self> {
        let path = path.as_ref();
        status.set_phase(format!(
            "Loading market data snapshot from {}",
            path.display()
        ));
        let file = File::open(path).with_context(|| {
            format!("Failed to open market data snapshot at {}", path.display())
        })?;
        let snapshot: MarketDataSnapshot = bincode::deserialize_from(BufReader::new(file))
            .context("Snapshot decode failed")?;

        if snapshot.version != MARKET_DATA_SNAPSHOT_VERSION {
            return Err(anyhow!(
                "Market data snapshot version mismatch (found {}, expected {})",
                snapshot.version,
                MARKET_DATA_SNAPSHOT_VERSION
            ));
        }

        status.set_phase("Reconstructing market data snapshot");
        let mut data = Self::new();
        for (ticker, candles) in snapshot.series {
            data.insert(&ticker, candles)
                .with_context(|| format!("Invalid series for {} in snapshot", ticker))?;
        }
        data.generated_at = Some(snapshot.generated_at);
        Ok(data)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create snapshot directory {}", parent.display())
                })?;
            }
        }

        let file = File::create(path).with_context(|| {
            format!(
                "Unable to create market data snapshot at {}",
                path.display()
            )
        })?;
        let mut writer = BufWriter::new(file);
        let snapshot = MarketDataSnapshot {
            version: MARKET_DATA_SNAPSHOT_VERSION,
            generated_at: Utc::now(),
            series: self.series.clone(),
        };
        bincode::serialize_into(&mut writer, &snapshot)
            .context("Failed to serialize market data snapshot")?;
        writer
            .flush()
            .context("Failed to flush market data snapshot to disk")?;
        Ok(())
    }

    pub fn has_data(&self) -> bool {
        self.series.values().any(|candles| !candles.is_empty())
    }

    pub fn tickers(&self) -> Vec<String> {
        self.series.keys().cloned().collect()
    }

    pub fn candles(&self, ticker: &str) -> Option<&[Candle]> {
        self.series
            .get(&normalize_ticker(ticker))
            .map(|candles| candles.as_slice())
    }

    pub fn generated_at(&self) -> Option<DateTime<Utc>> {
        self.generated_at
    }
}

pub fn normalize_ticker(ticker: &str) -> String {
    ticker.trim().to_uppercase()
}

/// Reads one JSON price file: either a bare array of bars or `{"candles": [...]}`.
pub fn load_price_file<P: AsRef<Path>>(path: P) -> Result<Vec<Candle>> {
    let path = path.as_ref();
    let file = File::open(path)
        .with_context(|| format!("Failed to open price file {}", path.display()))?;
    let parsed: PriceFile = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("Failed to parse price file {}", path.display()))?;
    Ok(match parsed {
        PriceFile::Bars(candles) => candles,
        PriceFile::Wrapped { candles } => candles,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::candles_from_closes;
    use std::path::PathBuf;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "stratlab-{}-{}-{}",
            name,
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn snapshot_survives_a_save_and_load() {
        let dir = scratch_dir("snapshot");
        let mut data = MarketData::new();
        data.insert("spy", candles_from_closes(&[100.0, 101.0, 102.5]))
            .unwrap();
        data.insert("QQQ", candles_from_closes(&[50.0, 49.0])).unwrap();

        let path = dir.join("nested").join("market.bin");
        data.save_to_file(&path).unwrap();
        let status = OptimizerStatus::new();
        let loaded = MarketData::load_from_file(&path, &status).unwrap();

        assert_eq!(loaded.tickers(), vec!["QQQ".to_string(), "SPY".to_string()]);
        assert_eq!(loaded.candles("spy"), data.candles("SPY"));
        assert!(loaded.generated_at().is_some());
        assert_eq!(status.snapshot().phase, "Reconstructing market data snapshot");
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn snapshot_with_other_version_is_rejected() {
        let dir = scratch_dir("version");
        let path = dir.join("old.bin");
        let snapshot = MarketDataSnapshot {
            version: MARKET_DATA_SNAPSHOT_VERSION + 1,
            generated_at: Utc::now(),
            series: BTreeMap::new(),
        };
        bincode::serialize_into(File::create(&path).unwrap(), &snapshot).unwrap();

        let err = MarketData::load_from_file(&path, &OptimizerStatus::new()).unwrap_err();
        assert!(err.to_string().contains("version mismatch"));
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn json_directory_accepts_both_file_shapes() {
        let dir = scratch_dir("json");
        let bars = candles_from_closes(&[10.0, 11.0, 12.0]);
        fs::write(dir.join("aapl.json"), serde_json::to_string(&bars).unwrap()).unwrap();
        let wrapped = serde_json::json!({ "candles": bars[..2].to_vec() });
        fs::write(dir.join("msft.json"), wrapped.to_string()).unwrap();
        fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let data = MarketData::load_json_directory(&dir).unwrap();
        assert_eq!(data.tickers(), vec!["AAPL".to_string(), "MSFT".to_string()]);
        assert_eq!(data.candles("msft").map(|c| c.len()), Some(2));
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn duplicate_dates_are_refused() {
        let mut bars = candles_from_closes(&[10.0, 11.0]);
        bars[1].date = bars[0].date;
        let mut data = MarketData::new();
        assert!(data.insert("dup", bars).is_err());
        assert!(!data.has_data());
    }
}
