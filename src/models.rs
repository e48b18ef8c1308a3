use crate::error::{EngineError, EngineResult};
use anyhow::anyhow;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Parameter name to numeric value, ordered so signatures and output are stable.
pub type ParameterSet = BTreeMap<String, f64>;

/// Serializes non-finite floats as `"Infinity"`, `"-Infinity"` or `"NaN"`.
pub mod sentinel_f64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub const POSITIVE_INFINITY: &str = "Infinity";
    pub const NEGATIVE_INFINITY: &str = "-Infinity";
    pub const NOT_A_NUMBER: &str = "NaN";

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawValue {
        Number(f64),
        Text(String),
    }

    pub fn serialize<S>(value: &f64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if value.is_nan() {
            serializer.serialize_str(NOT_A_NUMBER)
        } else if value.is_infinite() {
            if value.is_sign_positive() {
                serializer.serialize_str(POSITIVE_INFINITY)
            } else {
                serializer.serialize_str(NEGATIVE_INFINITY)
            }
        } else {
            serializer.serialize_f64(*value)
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<f64, D::Error>
    where
        D: Deserializer<'de>,
    {
        match RawValue::deserialize(deserializer)? {
            RawValue::Number(value) => Ok(value),
            RawValue::Text(text) => parse_token(&text).ok_or_else(|| {
                serde::de::Error::custom(format!("invalid numeric value '{}'", text))
            }),
        }
    }

    fn parse_token(text: &str) -> Option<f64> {
        match text.trim() {
            POSITIVE_INFINITY => Some(f64::INFINITY),
            NEGATIVE_INFINITY => Some(f64::NEG_INFINITY),
            NOT_A_NUMBER => Some(f64::NAN),
            other => other.parse::<f64>().ok(),
        }
    }
}

/// `Option<f64>` flavour of [`sentinel_f64`].
pub mod sentinel_f64_option {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<f64>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(inner) => super::sentinel_f64::serialize(inner, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Wrapped(#[serde(with = "super::sentinel_f64")] f64);

        Option::<Wrapped>::deserialize(deserializer).map(|value| value.map(|w| w.0))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candle {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: f64,
    #[serde(default, alias = "adjClose")]
    pub adjusted_close: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

impl SignalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalAction::Buy => "buy",
            SignalAction::Sell => "sell",
            SignalAction::Hold => "hold",
        }
    }
}

impl FromStr for SignalAction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "buy" => Ok(SignalAction::Buy),
            "sell" => Ok(SignalAction::Sell),
            "hold" => Ok(SignalAction::Hold),
            other => Err(anyhow!("Unknown signal action '{}'", other)),
        }
    }
}

/// What a strategy decides for the current (last visible) bar.
#[derive(Debug, Clone)]
pub struct StrategySignal {
    pub action: SignalAction,
    pub confidence: f64,
    pub indicators: BTreeMap<String, f64>,
}

impl StrategySignal {
    pub fn with_indicator(mut self, name: &str, value: f64) -> Self {
        if value.is_finite() {
            self.indicators.insert(name.to_string(), value);
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    pub date: NaiveDate,
    #[serde(rename = "type")]
    pub action: SignalAction,
    pub price: f64,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "sentinel_f64_option"
    )]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub indicators: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeDirection {
    Long,
    Short,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Signal,
    EndOfData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub entry_date: NaiveDate,
    pub entry_price: f64,
    pub exit_date: NaiveDate,
    pub exit_price: f64,
    #[serde(rename = "type")]
    pub direction: TradeDirection,
    pub quantity: f64,
    pub profit_percent: f64,
    pub profit_amount: f64,
    pub holding_days: i64,
    pub exit_reason: ExitReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EquityPoint {
    pub date: NaiveDate,
    pub equity: f64,
    pub drawdown_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestMetrics {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub total_return_percent: f64,
    pub annualized_return_percent: f64,
    pub max_drawdown_percent: f64,
    #[serde(with = "sentinel_f64")]
    pub sharpe_ratio: f64,
    #[serde(with = "sentinel_f64")]
    pub calmar_ratio: f64,
    #[serde(with = "sentinel_f64")]
    pub profit_factor: f64,
    pub avg_trade_return_percent: f64,
    pub best_trade_percent: f64,
    pub worst_trade_percent: f64,
    pub avg_holding_days: f64,
    pub final_equity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestRun {
    pub strategy_id: String,
    pub parameters: ParameterSet,
    pub initial_capital: f64,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub signals: Vec<Signal>,
    pub trades: Vec<Trade>,
    pub equity: Vec<EquityPoint>,
    pub metrics: BacktestMetrics,
}

/// Inclusive `[min, max]` sweep walked in `step` increments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterRange {
    pub name: String,
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

impl ParameterRange {
    pub fn new(name: &str, min: f64, max: f64, step: f64) -> Self {
        Self {
            name: name.to_string(),
            min,
            max,
            step,
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.name.trim().is_empty() {
            return Err(EngineError::validation("Parameter range name is required"));
        }
        if !self.min.is_finite() || !self.max.is_finite() || !self.step.is_finite() {
            return Err(EngineError::validation(format!(
                "Parameter range `{}` must have finite bounds and step",
                self.name
            )));
        }
        if self.step <= 0.0 {
            return Err(EngineError::validation(format!(
                "Parameter range `{}` step must be > 0 (value: {})",
                self.name, self.step
            )));
        }
        if self.max < self.min {
            return Err(EngineError::validation(format!(
                "Parameter range `{}` max ({}) must be >= min ({})",
                self.name, self.max, self.min
            )));
        }
        let steps = self.step_count();
        if !steps.is_finite() || steps >= u64::MAX as f64 {
            return Err(EngineError::validation(format!(
                "Parameter range `{}` has too many values ({} to {} by {})",
                self.name, self.min, self.max, self.step
            )));
        }
        Ok(())
    }

    fn step_count(&self) -> f64 {
        ((self.max - self.min) / self.step + 1e-9).floor()
    }

    /// `floor((max - min) / step) + 1`, tolerant of floating point noise.
    /// Saturates at `u64::MAX` for ranges that fail `validate`.
    pub fn value_count(&self) -> u64 {
        (self.step_count() as u64).saturating_add(1)
    }

    pub fn value_at(&self, index: u64) -> f64 {
        let raw = self.min + index as f64 * self.step;
        let rounded = (raw * 1e10).round() / 1e10;
        rounded.min(self.max)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyTemplate {
    pub id: String,
    pub name: String,
    pub description: String,
    pub category: String,
    pub parameters: Vec<StrategyParameter>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyParameter {
    pub name: String,
    pub min: f64,
    pub max: f64,
    pub step: f64,
    pub default: f64,
    pub description: String,
}

impl StrategyTemplate {
    pub fn default_parameters(&self) -> ParameterSet {
        self.parameters
            .iter()
            .map(|param| (param.name.clone(), param.default))
            .collect()
    }

    pub fn default_ranges(&self) -> Vec<ParameterRange> {
        self.parameters
            .iter()
            .map(|param| ParameterRange::new(&param.name, param.min, param.max, param.step))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize)]
    struct Ratio {
        #[serde(with = "sentinel_f64")]
        value: f64,
    }

    #[test]
    fn non_finite_values_round_trip_through_sentinels() {
        let json = serde_json::to_string(&Ratio {
            value: f64::INFINITY,
        })
        .unwrap();
        assert_eq!(json, r#"{"value":"Infinity"}"#);

        let nan: Ratio = serde_json::from_str(r#"{"value":"NaN"}"#).unwrap();
        assert!(nan.value.is_nan());

        let plain: Ratio = serde_json::from_str(r#"{"value":3}"#).unwrap();
        assert_eq!(plain.value, 3.0);

        assert!(serde_json::from_str::<Ratio>(r#"{"value":"lots"}"#).is_err());
    }

    #[test]
    fn unbounded_parameter_ranges_are_rejected() {
        let wide = ParameterRange::new("fastPeriod", 0.0, 1e30, 1.0);
        assert!(matches!(wide.validate(), Err(EngineError::Validation(_))));
        assert_eq!(wide.value_count(), u64::MAX);

        let fine = ParameterRange::new("threshold", 0.0, 1.0, 1e-300);
        assert!(fine.validate().is_err());

        let ok = ParameterRange::new("period", 1.0, 1e6, 1.0);
        assert!(ok.validate().is_ok());
        assert_eq!(ok.value_count(), 1_000_000);
    }

    #[test]
    fn parameter_range_counts_inclusive_steps() {
        let range = ParameterRange::new("period", 10.0, 30.0, 5.0);
        assert_eq!(range.value_count(), 5);
        assert_eq!(range.value_at(4), 30.0);

        let fractional = ParameterRange::new("z", 0.1, 0.3, 0.1);
        assert_eq!(fractional.value_count(), 3);
        assert!((fractional.value_at(2) - 0.3).abs() < 1e-12);

        let uneven = ParameterRange::new("x", 0.0, 10.0, 3.0);
        assert_eq!(uneven.value_count(), 4);
    }

    #[test]
    fn parameter_range_rejects_bad_steps() {
        assert!(ParameterRange::new("p", 1.0, 5.0, 0.0).validate().is_err());
        assert!(ParameterRange::new("p", 5.0, 1.0, 1.0).validate().is_err());
        assert!(ParameterRange::new("", 1.0, 5.0, 1.0).validate().is_err());
        assert!(ParameterRange::new("p", 1.0, 5.0, 1.0).validate().is_ok());
    }

    #[test]
    fn candle_accepts_adj_close_alias() {
        let candle: Candle = serde_json::from_str(
            r#"{"date":"2024-01-02","open":1,"high":2,"low":0.5,"close":1.5,"volume":100,"adjClose":1.4}"#,
        )
        .unwrap();
        assert_eq!(candle.adjusted_close, Some(1.4));
        assert_eq!(candle.date, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
    }
}
