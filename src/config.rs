use crate::error::{EngineError, EngineResult};
use crate::models::ParameterSet;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const DEFAULT_INITIAL_CAPITAL: f64 = 100_000.0;

/// Names of the parameters consumed by the engine itself rather than a strategy.
pub const ENGINE_PARAMETER_NAMES: [&str; 5] = [
    "initialCapital",
    "tradeSizeRatio",
    "allowShortSelling",
    "commissionRate",
    "slippageRate",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Objective {
    WinRate,
    TotalReturn,
    AnnualizedReturn,
    SharpeRatio,
    ProfitFactor,
}

impl Objective {
    pub fn parse(raw: &str) -> EngineResult<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "win_rate" | "winrate" => Ok(Self::WinRate),
            "total_return" | "return" => Ok(Self::TotalReturn),
            "annualized_return" | "cagr" => Ok(Self::AnnualizedReturn),
            "sharpe" | "sharpe_ratio" => Ok(Self::SharpeRatio),
            "profit_factor" => Ok(Self::ProfitFactor),
            other => Err(EngineError::validation(format!(
                "Objective must be one of win_rate, total_return, annualized_return, sharpe_ratio, profit_factor (value: {})",
                other
            ))),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::WinRate => "win rate",
            Self::TotalReturn => "total return",
            Self::AnnualizedReturn => "annualized return",
            Self::SharpeRatio => "Sharpe ratio",
            Self::ProfitFactor => "profit factor",
        }
    }
}

impl Default for Objective {
    fn default() -> Self {
        Self::SharpeRatio
    }
}

/// Per-run engine configuration, read from the same parameter map the strategy sees.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub initial_capital: f64,
    pub trade_size_ratio: f64,
    pub allow_short_selling: bool,
    pub commission_rate: f64,
    pub slippage_rate: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            initial_capital: DEFAULT_INITIAL_CAPITAL,
            trade_size_ratio: 1.0,
            allow_short_selling: false,
            commission_rate: 0.0,
            slippage_rate: 0.0,
        }
    }
}

impl EngineConfig {
    pub fn from_parameters(parameters: &ParameterSet) -> EngineResult<Self> {
        use crate::param_utils::*;

        let config = Self {
            initial_capital: get_param(parameters, "initialCapital", DEFAULT_INITIAL_CAPITAL),
            trade_size_ratio: clamp_f64(
                get_param(parameters, "tradeSizeRatio", 1.0),
                1.0,
                f64::MIN_POSITIVE,
                1.0,
            ),
            allow_short_selling: coerce_binary_param(
                get_param(parameters, "allowShortSelling", 0.0),
                0.0,
            ) >= 0.5,
            commission_rate: get_param(parameters, "commissionRate", 0.0),
            slippage_rate: get_param(parameters, "slippageRate", 0.0),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if !self.initial_capital.is_finite() || self.initial_capital <= 0.0 {
            return Err(EngineError::validation(format!(
                "initialCapital must be a positive number (value: {})",
                self.initial_capital
            )));
        }
        for (name, value) in [
            ("commissionRate", self.commission_rate),
            ("slippageRate", self.slippage_rate),
        ] {
            if !value.is_finite() || !(0.0..0.5).contains(&value) {
                return Err(EngineError::validation(format!(
                    "{} must be within [0, 0.5) (value: {})",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

/// Process-wide limits and defaults, read once at startup.
#[derive(Debug, Clone)]
pub struct EngineRuntimeSettings {
    pub grid_max_combinations: usize,
    pub grid_max_combinations_cap: usize,
    pub walk_forward_min_bars: usize,
    pub walk_forward_max_combinations: usize,
    pub walk_forward_max_windows: usize,
    pub monte_carlo_max_simulations: usize,
    pub batch_max_tickers: usize,
    pub batch_min_history_bars: usize,
    pub worker_threads: usize,
}

impl Default for EngineRuntimeSettings {
    fn default() -> Self {
        Self {
            grid_max_combinations: 5_000,
            grid_max_combinations_cap: 50_000,
            walk_forward_min_bars: 100,
            walk_forward_max_combinations: 1_000,
            walk_forward_max_windows: 20,
            monte_carlo_max_simulations: 100_000,
            batch_max_tickers: 5,
            batch_min_history_bars: 200,
            worker_threads: num_cpus::get().max(1),
        }
    }
}

impl EngineRuntimeSettings {
    pub fn from_env() -> Result<Self> {
        let settings: HashMap<String, String> = std::env::vars().collect();
        Self::from_settings_map(&settings)
    }

    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        let defaults = Self::default();
        let grid_max_combinations = optional_setting_usize(
            settings,
            "GRID_MAX_COMBINATIONS",
            defaults.grid_max_combinations,
            1,
        )?;
        let grid_max_combinations_cap = optional_setting_usize(
            settings,
            "GRID_MAX_COMBINATIONS_CAP",
            defaults.grid_max_combinations_cap,
            1,
        )?;
        let walk_forward_min_bars = optional_setting_usize(
            settings,
            "WALK_FORWARD_MIN_BARS",
            defaults.walk_forward_min_bars,
            2,
        )?;
        let walk_forward_max_combinations = optional_setting_usize(
            settings,
            "WALK_FORWARD_MAX_COMBINATIONS",
            defaults.walk_forward_max_combinations,
            1,
        )?;
        let walk_forward_max_windows = optional_setting_usize(
            settings,
            "WALK_FORWARD_MAX_WINDOWS",
            defaults.walk_forward_max_windows,
            1,
        )?;
        let monte_carlo_max_simulations = optional_setting_usize(
            settings,
            "MONTE_CARLO_MAX_SIMULATIONS",
            defaults.monte_carlo_max_simulations,
            1,
        )?;
        let batch_max_tickers =
            optional_setting_usize(settings, "BATCH_MAX_TICKERS", defaults.batch_max_tickers, 1)?;
        let batch_min_history_bars = optional_setting_usize(
            settings,
            "BATCH_MIN_HISTORY_BARS",
            defaults.batch_min_history_bars,
            1,
        )?;
        let worker_threads = optional_setting_usize(
            settings,
            "OPTIMIZER_WORKER_THREADS",
            defaults.worker_threads,
            1,
        )?;

        if grid_max_combinations > grid_max_combinations_cap {
            return Err(anyhow!(
                "GRID_MAX_COMBINATIONS ({}) must be <= GRID_MAX_COMBINATIONS_CAP ({})",
                grid_max_combinations,
                grid_max_combinations_cap
            ));
        }

        Ok(Self {
            grid_max_combinations,
            grid_max_combinations_cap,
            walk_forward_min_bars,
            walk_forward_max_combinations,
            walk_forward_max_windows,
            monte_carlo_max_simulations,
            batch_max_tickers,
            batch_min_history_bars,
            worker_threads,
        })
    }
}

fn optional_setting<'a>(settings: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    settings
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn optional_setting_usize(
    settings: &HashMap<String, String>,
    key: &str,
    default: usize,
    min: usize,
) -> Result<usize> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(default);
    };
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if value.fract() != 0.0 {
        return Err(anyhow!(
            "Setting {} must be an integer (value: {})",
            key,
            raw
        ));
    }
    if value < min as f64 {
        return Err(anyhow!(
            "Setting {} must be >= {} (value: {})",
            key,
            min,
            raw
        ));
    }
    Ok(value as usize)
}
