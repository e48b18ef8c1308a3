use crate::error::{EngineError, EngineResult};
use crate::models::Trade;
use log::info;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use statrs::statistics::{Data, OrderStatistics, Statistics};

pub const DEFAULT_INITIAL_CAPITAL: f64 = 1_000_000.0;
pub const DEFAULT_SIMULATIONS: usize = 1_000;
pub const DEFAULT_CONFIDENCE_LEVEL: f64 = 0.95;
/// Drawdown at or beyond this percentage counts as ruin.
const RUIN_DRAWDOWN_PERCENT: f64 = 50.0;

/// One realised trade as seen by the resampler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeSample {
    pub profit_percent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profit_amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holding_days: Option<i64>,
}

impl From<&Trade> for TradeSample {
    fn from(trade: &Trade) -> Self {
        Self {
            profit_percent: trade.profit_percent,
            profit_amount: Some(trade.profit_amount),
            holding_days: Some(trade.holding_days),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResamplingMethod {
    #[default]
    Shuffle,
    Bootstrap,
}

#[derive(Debug, Clone)]
pub struct MonteCarloConfig {
    pub initial_capital: f64,
    pub simulations: usize,
    pub confidence_level: f64,
    pub method: ResamplingMethod,
    pub seed: Option<u64>,
    pub compound: bool,
    pub max_simulations: usize,
}

impl Default for MonteCarloConfig {
    fn default() -> Self {
        Self {
            initial_capital: DEFAULT_INITIAL_CAPITAL,
            simulations: DEFAULT_SIMULATIONS,
            confidence_level: DEFAULT_CONFIDENCE_LEVEL,
            method: ResamplingMethod::Shuffle,
            seed: None,
            compound: false,
            max_simulations: 100_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionSummary {
    pub mean: f64,
    pub median: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    /// Two-tailed percentile band implied by the confidence level.
    pub lower_bound: f64,
    pub upper_bound: f64,
    /// Normal-theory confidence interval of the mean.
    pub mean_ci_lower: f64,
    pub mean_ci_upper: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Percentiles {
    pub p5: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p95: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorstCase {
    pub final_equity: f64,
    pub total_return_percent: f64,
    pub max_drawdown_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonteCarloResult {
    pub method: ResamplingMethod,
    pub simulations: usize,
    pub trade_count: usize,
    pub initial_capital: f64,
    pub confidence_level: f64,
    pub compound: bool,
    pub seed: u64,
    pub final_equity: DistributionSummary,
    pub final_equity_percentiles: Percentiles,
    pub max_drawdown_percent: DistributionSummary,
    pub max_drawdown_percentiles: Percentiles,
    pub worst_case: WorstCase,
    pub best_case_final_equity: f64,
    pub probability_of_loss: f64,
    pub probability_of_ruin: f64,
}

#[derive(Debug, Clone, Copy)]
struct TrialOutcome {
    final_equity: f64,
    max_drawdown_percent: f64,
}

pub struct MonteCarloSimulator {
    config: MonteCarloConfig,
}

impl MonteCarloSimulator {
    pub fn new(config: MonteCarloConfig) -> Self {
        Self { config }
    }

    fn validate(&self, trades: &[TradeSample]) -> EngineResult<()> {
        let config = &self.config;
        if config.simulations < 1 {
            return Err(EngineError::validation("simulations must be >= 1"));
        }
        if config.simulations > config.max_simulations {
            return Err(EngineError::validation(format!(
                "simulations must be <= {} (value: {})",
                config.max_simulations, config.simulations
            )));
        }
        if !config.initial_capital.is_finite() || config.initial_capital <= 0.0 {
            return Err(EngineError::validation(format!(
                "initialCapital must be a positive number (value: {})",
                config.initial_capital
            )));
        }
        if !(config.confidence_level > 0.0 && config.confidence_level < 1.0) {
            return Err(EngineError::validation(format!(
                "confidenceLevel must be within (0, 1) (value: {})",
                config.confidence_level
            )));
        }
        if trades.is_empty() {
            return Err(EngineError::validation("At least one trade is required"));
        }
        if let Some(index) = trades.iter().position(|t| !t.profit_percent.is_finite()) {
            return Err(EngineError::validation(format!(
                "Trade {} has a non-finite profitPercent",
                index
            )));
        }
        Ok(())
    }

    pub fn simulate(&self, trades: &[TradeSample]) -> EngineResult<MonteCarloResult> {
        self.validate(trades)?;
        let config = &self.config;
        let seed = config.seed.unwrap_or_else(rand::random::<u64>);
        let returns: Vec<f64> = trades.iter().map(|t| t.profit_percent).collect();

        info!(
            "Monte Carlo ({:?}): {} trials over {} trades",
            config.method,
            config.simulations,
            returns.len()
        );

        // Each trial owns an RNG derived from (seed, trial) so results do not
        // depend on how rayon schedules the work.
        let outcomes: Vec<TrialOutcome> = (0..config.simulations)
            .into_par_iter()
            .map(|trial| {
                let mut rng = StdRng::seed_from_u64(trial_seed(seed, trial as u64));
                let sequence = self.sample_sequence(&returns, &mut rng);
                self.replay(&sequence)
            })
            .collect();

        let finals: Vec<f64> = outcomes.iter().map(|o| o.final_equity).collect();
        let drawdowns: Vec<f64> = outcomes.iter().map(|o| o.max_drawdown_percent).collect();

        let worst = outcomes
            .iter()
            .copied()
            .min_by(|a, b| {
                a.final_equity
                    .total_cmp(&b.final_equity)
                    .then(b.max_drawdown_percent.total_cmp(&a.max_drawdown_percent))
            })
            .ok_or_else(|| EngineError::calculation("No Monte Carlo trials completed"))?;
        let trial_count = outcomes.len() as f64;
        let losses = finals
            .iter()
            .filter(|&&value| value < config.initial_capital)
            .count();
        let ruined = drawdowns
            .iter()
            .filter(|&&value| value >= RUIN_DRAWDOWN_PERCENT)
            .count();

        Ok(MonteCarloResult {
            method: config.method,
            simulations: config.simulations,
            trade_count: trades.len(),
            initial_capital: config.initial_capital,
            confidence_level: config.confidence_level,
            compound: config.compound,
            seed,
            final_equity: summarize(&finals, config.confidence_level)?,
            final_equity_percentiles: percentiles(&finals),
            max_drawdown_percent: summarize(&drawdowns, config.confidence_level)?,
            max_drawdown_percentiles: percentiles(&drawdowns),
            worst_case: WorstCase {
                final_equity: worst.final_equity,
                total_return_percent: (worst.final_equity / config.initial_capital - 1.0) * 100.0,
                max_drawdown_percent: drawdowns.iter().copied().fold(0.0, f64::max),
            },
            best_case_final_equity: finals.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            probability_of_loss: losses as f64 / trial_count,
            probability_of_ruin: ruined as f64 / trial_count,
        })
    }

    fn sample_sequence(&self, returns: &[f64], rng: &mut StdRng) -> Vec<f64> {
        match self.config.method {
            ResamplingMethod::Shuffle => {
                let mut shuffled = returns.to_vec();
                shuffled.shuffle(rng);
                shuffled
            }
            ResamplingMethod::Bootstrap => (0..returns.len())
                .map(|_| returns[rng.gen_range(0..returns.len())])
                .collect(),
        }
    }

    fn replay(&self, sequence: &[f64]) -> TrialOutcome {
        let capital = self.config.initial_capital;
        let mut equity = capital;
        let mut peak = capital;
        let mut max_drawdown_percent = 0.0f64;

        for &profit_percent in sequence {
            if self.config.compound {
                equity = (equity * (1.0 + profit_percent / 100.0)).max(0.0);
            } else {
                equity += capital * profit_percent / 100.0;
            }
            peak = peak.max(equity);
            if peak > 0.0 {
                let drawdown = ((peak - equity) / peak * 100.0).clamp(0.0, 100.0);
                max_drawdown_percent = max_drawdown_percent.max(drawdown);
            }
        }

        TrialOutcome {
            final_equity: equity,
            max_drawdown_percent,
        }
    }
}

fn trial_seed(seed: u64, trial: u64) -> u64 {
    seed ^ trial.wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

fn summarize(values: &[f64], confidence_level: f64) -> EngineResult<DistributionSummary> {
    let mut data = Data::new(values.to_vec());
    let mean = values.iter().mean();
    let std_dev = if values.len() > 1 {
        values.iter().std_dev()
    } else {
        0.0
    };
    let tail = (1.0 - confidence_level) / 2.0;
    let standard_normal = Normal::new(0.0, 1.0)
        .map_err(|err| EngineError::calculation(format!("normal distribution: {}", err)))?;
    let z = standard_normal.inverse_cdf(1.0 - tail);
    let half_width = z * std_dev / (values.len() as f64).sqrt();

    Ok(DistributionSummary {
        mean,
        median: data.quantile(0.5),
        std_dev,
        min: values.iter().copied().fold(f64::INFINITY, f64::min),
        max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        lower_bound: data.quantile(tail),
        upper_bound: data.quantile(1.0 - tail),
        mean_ci_lower: mean - half_width,
        mean_ci_upper: mean + half_width,
    })
}

fn percentiles(values: &[f64]) -> Percentiles {
    let mut data = Data::new(values.to_vec());
    Percentiles {
        p5: data.quantile(0.05),
        p25: data.quantile(0.25),
        p50: data.quantile(0.5),
        p75: data.quantile(0.75),
        p95: data.quantile(0.95),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples(percents: &[f64]) -> Vec<TradeSample> {
        percents
            .iter()
            .map(|&profit_percent| TradeSample {
                profit_percent,
                profit_amount: None,
                holding_days: None,
            })
            .collect()
    }

    fn config(simulations: usize, method: ResamplingMethod, seed: u64) -> MonteCarloConfig {
        MonteCarloConfig {
            simulations,
            method,
            seed: Some(seed),
            ..MonteCarloConfig::default()
        }
    }

    #[test]
    fn symmetric_trades_average_back_to_initial_capital() {
        let trades = samples(&[10.0, 10.0, 10.0, 10.0, 10.0, -10.0, -10.0, -10.0, -10.0, -10.0]);
        let result = MonteCarloSimulator::new(config(1_000, ResamplingMethod::Shuffle, 7))
            .simulate(&trades)
            .unwrap();
        let capital = result.initial_capital;
        assert!((result.final_equity.mean - capital).abs() < 1e-6 * capital);
        assert_eq!(result.probability_of_loss, 0.0);
        assert!(result.max_drawdown_percent.max > 0.0);
    }

    #[test]
    fn seeded_runs_are_bit_reproducible() {
        let trades = samples(&[4.0, -2.5, 7.0, -6.0, 1.5, 3.0, -1.0]);
        let run = || {
            MonteCarloSimulator::new(config(500, ResamplingMethod::Bootstrap, 42))
                .simulate(&trades)
                .unwrap()
        };
        let a = run();
        let b = run();
        assert_eq!(a.final_equity, b.final_equity);
        assert_eq!(a.max_drawdown_percentiles, b.max_drawdown_percentiles);
        assert_eq!(a.seed, 42);
    }

    #[test]
    fn more_trials_narrow_the_mean_interval() {
        let trades = samples(&[4.0, -2.5, 7.0, -6.0, 1.5, 3.0, -1.0, -4.0, 9.0]);
        let width = |simulations| {
            let result = MonteCarloSimulator::new(config(
                simulations,
                ResamplingMethod::Bootstrap,
                11,
            ))
            .simulate(&trades)
            .unwrap();
            result.final_equity.mean_ci_upper - result.final_equity.mean_ci_lower
        };
        assert!(width(10_000) < width(100));
    }

    #[test]
    fn percentile_band_brackets_the_median() {
        let trades = samples(&[5.0, -3.0, 2.0, -8.0, 6.0]);
        let result = MonteCarloSimulator::new(config(2_000, ResamplingMethod::Bootstrap, 3))
            .simulate(&trades)
            .unwrap();
        let summary = &result.final_equity;
        assert!(summary.lower_bound <= summary.median);
        assert!(summary.median <= summary.upper_bound);
        assert!(summary.min <= summary.lower_bound && summary.upper_bound <= summary.max);
        assert_eq!(result.worst_case.final_equity, summary.min);
        assert!(result.probability_of_loss > 0.0 && result.probability_of_loss < 1.0);
    }

    #[test]
    fn compounding_multiplies_equity() {
        let trades = samples(&[10.0, 10.0]);
        let mut cfg = config(10, ResamplingMethod::Shuffle, 1);
        cfg.compound = true;
        cfg.initial_capital = 100.0;
        let result = MonteCarloSimulator::new(cfg).simulate(&trades).unwrap();
        assert!((result.final_equity.mean - 121.0).abs() < 1e-9);
    }

    #[test]
    fn invalid_requests_are_rejected() {
        let trades = samples(&[1.0]);
        let mut cfg = config(0, ResamplingMethod::Shuffle, 1);
        assert!(MonteCarloSimulator::new(cfg.clone()).simulate(&trades).is_err());
        cfg.simulations = 10;
        assert!(MonteCarloSimulator::new(cfg.clone()).simulate(&[]).is_err());
        cfg.confidence_level = 1.0;
        assert!(MonteCarloSimulator::new(cfg).simulate(&trades).is_err());
    }
}
