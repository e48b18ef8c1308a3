use crate::config::{EngineRuntimeSettings, Objective};
use crate::engine::{run_backtest_from, validate_candles};
use crate::error::{EngineError, EngineResult};
use crate::models::*;
use crate::optimizer::{objective_score, GridSearchOptimizer, GridSearchOptions};
use crate::optimizer_status::OptimizerStatus;
use crate::param_utils::parameter_signature;
use crate::strategy::{create_strategy, find_template};
use chrono::NaiveDate;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const LOW_RISK_THRESHOLD: f64 = 0.25;
const MODERATE_RISK_THRESHOLD: f64 = 0.5;
const STABILITY_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct WalkForwardConfig {
    pub window_count: usize,
    pub train_ratio: f64,
    pub anchored_start: bool,
    pub objective: Objective,
    pub max_combinations: usize,
    pub worker_threads: usize,
}

impl WalkForwardConfig {
    pub fn from_settings(settings: &EngineRuntimeSettings) -> Self {
        Self {
            window_count: 5,
            train_ratio: 0.7,
            anchored_start: false,
            objective: Objective::default(),
            max_combinations: settings.walk_forward_max_combinations,
            worker_threads: settings.worker_threads,
        }
    }
}

/// Half-open bar index ranges of one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPlan {
    pub train_start: usize,
    pub train_end: usize,
    pub test_start: usize,
    pub test_end: usize,
}

/// Lays out `window_count` equal, contiguous test slices tiling the tail of `bar_count`
/// bars. Each test slice is preceded by its train slice; leftover head bars are unused.
pub fn plan_windows(
    bar_count: usize,
    window_count: usize,
    train_ratio: f64,
    anchored_start: bool,
) -> Vec<WindowPlan> {
    if window_count == 0 || !(0.0..1.0).contains(&train_ratio) {
        return Vec::new();
    }
    let n = bar_count as f64;
    let k = window_count as f64;
    let r = train_ratio;
    let test_len = (n * (1.0 - r) / (k * (1.0 - r) + r) + 1e-9).floor() as usize;
    let train_len = (test_len as f64 * r / (1.0 - r) + 1e-9).floor() as usize;
    let used = train_len + window_count * test_len;
    if test_len == 0 || used > bar_count {
        return Vec::new();
    }
    let offset = bar_count - used;

    (0..window_count)
        .map(|i| {
            let test_start = offset + train_len + i * test_len;
            WindowPlan {
                train_start: if anchored_start { 0 } else { test_start - train_len },
                train_end: test_start,
                test_start,
                test_end: test_start + test_len,
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowStatus {
    Completed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverfitRisk {
    Low,
    Moderate,
    High,
}

impl OverfitRisk {
    pub fn from_score(score: f64) -> Self {
        if score < LOW_RISK_THRESHOLD {
            OverfitRisk::Low
        } else if score < MODERATE_RISK_THRESHOLD {
            OverfitRisk::Moderate
        } else {
            OverfitRisk::High
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalkForwardWindow {
    pub index: usize,
    pub status: WindowStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    pub train_start: NaiveDate,
    pub train_end: NaiveDate,
    pub test_start: NaiveDate,
    pub test_end: NaiveDate,
    pub train_bars: usize,
    pub test_bars: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_parameters: Option<ParameterSet>,
    #[serde(default, with = "sentinel_f64_option")]
    pub in_sample_objective: Option<f64>,
    #[serde(default, with = "sentinel_f64_option")]
    pub out_of_sample_objective: Option<f64>,
    #[serde(default, with = "sentinel_f64_option")]
    pub degradation: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_sample_metrics: Option<BacktestMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub out_of_sample_metrics: Option<BacktestMetrics>,
    #[serde(default)]
    pub out_of_sample_trades: Vec<Trade>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalkForwardResult {
    pub strategy_id: String,
    pub objective: Objective,
    pub window_count: usize,
    pub train_ratio: f64,
    pub anchored_start: bool,
    pub windows: Vec<WalkForwardWindow>,
    pub completed_windows: usize,
    pub skipped_windows: usize,
    pub overfit_score: f64,
    pub overfit_risk: OverfitRisk,
    pub parameter_stability: f64,
    #[serde(with = "sentinel_f64")]
    pub walk_forward_efficiency: f64,
    pub recommendation: String,
}

/// Normalised drop from in-sample to out-of-sample, clamped to `[0, 1]`.
pub fn degradation(in_sample: f64, out_of_sample: f64) -> f64 {
    if !in_sample.is_finite() || !out_of_sample.is_finite() || in_sample.abs() < 1e-9 {
        return if out_of_sample >= in_sample { 0.0 } else { 1.0 };
    }
    ((in_sample - out_of_sample) / in_sample.abs()).clamp(0.0, 1.0)
}

/// Share of windows whose best parameters equal the most frequent set.
pub fn parameter_stability(parameter_sets: &[&ParameterSet]) -> f64 {
    if parameter_sets.is_empty() {
        return 0.0;
    }
    let mut counts: HashMap<String, usize> = HashMap::new();
    for params in parameter_sets {
        *counts.entry(parameter_signature(params)).or_insert(0) += 1;
    }
    let modal = counts.values().copied().max().unwrap_or(0);
    modal as f64 / parameter_sets.len() as f64
}

pub fn recommendation(risk: OverfitRisk, stability: f64, skipped: usize) -> String {
    let mut text = match risk {
        OverfitRisk::Low => {
            "Low overfit risk: out-of-sample performance holds up against training.".to_string()
        }
        OverfitRisk::Moderate => "Moderate overfit risk: expect weaker live results than in-sample; validate on more data before relying on these parameters.".to_string(),
        OverfitRisk::High => "High overfit risk: out-of-sample results degrade sharply from training. Reduce parameter granularity or lengthen the training window.".to_string(),
    };
    if stability < STABILITY_THRESHOLD {
        text.push_str(" Parameters unstable across windows; reduce parameter granularity.");
    }
    if skipped > 0 {
        text.push_str(&format!(" {} window(s) skipped.", skipped));
    }
    text
}

pub struct WalkForwardOptimizer {
    config: WalkForwardConfig,
    status: OptimizerStatus,
}

impl WalkForwardOptimizer {
    pub fn new(config: WalkForwardConfig) -> Self {
        Self {
            config,
            status: OptimizerStatus::new(),
        }
    }

    pub fn status(&self) -> &OptimizerStatus {
        &self.status
    }

    pub fn run(
        &self,
        strategy_id: &str,
        candles: &[Candle],
        ranges: &[ParameterRange],
        base_parameters: &ParameterSet,
    ) -> EngineResult<WalkForwardResult> {
        let template = find_template(strategy_id)?;
        validate_candles(candles)?;
        let config = &self.config;
        if !(0.1..=0.95).contains(&config.train_ratio) {
            return Err(EngineError::validation(format!(
                "trainRatio must be within [0.1, 0.95] (value: {})",
                config.train_ratio
            )));
        }
        if config.window_count == 0 {
            return Err(EngineError::validation("windowCount must be >= 1"));
        }

        let warmup = create_strategy(strategy_id, &template.default_parameters())?
            .min_data_points()
            .max(1);
        let plans = plan_windows(
            candles.len(),
            config.window_count,
            config.train_ratio,
            config.anchored_start,
        );
        if plans.is_empty() {
            return Err(EngineError::insufficient_data(format!(
                "{} bars cannot be split into {} walk-forward windows",
                candles.len(),
                config.window_count
            )));
        }

        info!(
            "Walk-forward {}: {} windows over {} bars ({})",
            strategy_id,
            plans.len(),
            candles.len(),
            if config.anchored_start { "anchored" } else { "rolling" }
        );

        let mut windows = Vec::with_capacity(plans.len());
        for (index, plan) in plans.iter().enumerate() {
            self.status.set_phase(format!(
                "Walk-forward window {}/{}",
                index + 1,
                plans.len()
            ));
            let mut window = empty_window(index, plan, candles);
            match self.evaluate_window(strategy_id, candles, plan, ranges, base_parameters, warmup)
            {
                Ok(evaluated) => window = evaluated.into_window(window),
                Err(reason) => {
                    warn!("Skipping walk-forward window {}: {}", index + 1, reason);
                    self.status.set_note(format!("window {} skipped", index + 1));
                    window.skip_reason = Some(reason);
                }
            }
            windows.push(window);
        }

        let completed: Vec<&WalkForwardWindow> = windows
            .iter()
            .filter(|w| w.status == WindowStatus::Completed)
            .collect();
        let skipped = windows.len() - completed.len();
        if completed.is_empty() {
            return Err(EngineError::insufficient_data(format!(
                "All {} walk-forward windows were skipped",
                windows.len()
            )));
        }

        let degradations: Vec<f64> = completed.iter().filter_map(|w| w.degradation).collect();
        let overfit_score = degradations.iter().sum::<f64>() / degradations.len().max(1) as f64;
        let overfit_risk = OverfitRisk::from_score(overfit_score);
        let best_sets: Vec<&ParameterSet> = completed
            .iter()
            .filter_map(|w| w.best_parameters.as_ref())
            .collect();
        let stability = parameter_stability(&best_sets);
        let walk_forward_efficiency = efficiency(&completed);

        info!(
            "Walk-forward {} finished: {} completed, {} skipped, overfit {:.3} ({:?})",
            strategy_id,
            completed.len(),
            skipped,
            overfit_score,
            overfit_risk
        );

        Ok(WalkForwardResult {
            strategy_id: strategy_id.to_string(),
            objective: config.objective,
            window_count: config.window_count,
            train_ratio: config.train_ratio,
            anchored_start: config.anchored_start,
            completed_windows: completed.len(),
            skipped_windows: skipped,
            overfit_score,
            overfit_risk,
            parameter_stability: stability,
            walk_forward_efficiency,
            recommendation: recommendation(overfit_risk, stability, skipped),
            windows,
        })
    }

    fn evaluate_window(
        &self,
        strategy_id: &str,
        candles: &[Candle],
        plan: &WindowPlan,
        ranges: &[ParameterRange],
        base_parameters: &ParameterSet,
        warmup: usize,
    ) -> Result<EvaluatedWindow, String> {
        let train_bars = plan.train_end - plan.train_start;
        let test_bars = plan.test_end - plan.test_start;
        if train_bars < warmup + 2 {
            return Err(format!(
                "train slice has {} bars; {} required",
                train_bars,
                warmup + 2
            ));
        }
        if test_bars < 2 {
            return Err(format!("test slice has {} bars; 2 required", test_bars));
        }

        let grid = GridSearchOptimizer::with_status(
            GridSearchOptions {
                max_combinations: self.config.max_combinations,
                worker_threads: self.config.worker_threads,
                show_progress: false,
            },
            self.status.clone(),
        );
        let train = &candles[plan.train_start..plan.train_end];
        let search = grid
            .search(
                strategy_id,
                train,
                ranges,
                self.config.objective,
                base_parameters,
            )
            .map_err(|err| format!("grid search failed: {}", err))?;

        let in_sample = search.best_objective();
        let test_run = run_backtest_from(
            strategy_id,
            &candles[plan.train_start..plan.test_end],
            &search.best_parameters,
            plan.test_start - plan.train_start,
        )
        .map_err(|err| format!("out-of-sample run failed: {}", err))?;
        let out_of_sample = objective_score(&test_run.metrics, self.config.objective);

        Ok(EvaluatedWindow {
            best_parameters: search.best_parameters,
            in_sample_metrics: search.best_metrics,
            in_sample,
            out_of_sample,
            out_of_sample_metrics: test_run.metrics,
            out_of_sample_trades: test_run.trades,
        })
    }
}

struct EvaluatedWindow {
    best_parameters: ParameterSet,
    in_sample: f64,
    in_sample_metrics: BacktestMetrics,
    out_of_sample: f64,
    out_of_sample_metrics: BacktestMetrics,
    out_of_sample_trades: Vec<Trade>,
}

impl EvaluatedWindow {
    fn into_window(self, mut window: WalkForwardWindow) -> WalkForwardWindow {
        window.status = WindowStatus::Completed;
        window.degradation = Some(degradation(self.in_sample, self.out_of_sample));
        window.in_sample_objective = Some(self.in_sample);
        window.out_of_sample_objective = Some(self.out_of_sample);
        window.best_parameters = Some(self.best_parameters);
        window.in_sample_metrics = Some(self.in_sample_metrics);
        window.out_of_sample_metrics = Some(self.out_of_sample_metrics);
        window.out_of_sample_trades = self.out_of_sample_trades;
        window
    }
}

fn empty_window(index: usize, plan: &WindowPlan, candles: &[Candle]) -> WalkForwardWindow {
    WalkForwardWindow {
        index,
        status: WindowStatus::Skipped,
        skip_reason: None,
        train_start: candles[plan.train_start].date,
        train_end: candles[plan.train_end - 1].date,
        test_start: candles[plan.test_start].date,
        test_end: candles[plan.test_end - 1].date,
        train_bars: plan.train_end - plan.train_start,
        test_bars: plan.test_end - plan.test_start,
        best_parameters: None,
        in_sample_objective: None,
        out_of_sample_objective: None,
        degradation: None,
        in_sample_metrics: None,
        out_of_sample_metrics: None,
        out_of_sample_trades: Vec::new(),
    }
}

/// Mean out-of-sample objective over mean in-sample objective.
fn efficiency(completed: &[&WalkForwardWindow]) -> f64 {
    let pairs: Vec<(f64, f64)> = completed
        .iter()
        .filter_map(|w| w.in_sample_objective.zip(w.out_of_sample_objective))
        .filter(|(is, oos)| is.is_finite() && oos.is_finite())
        .collect();
    if pairs.is_empty() {
        return f64::NAN;
    }
    let count = pairs.len() as f64;
    let mean_is = pairs.iter().map(|(is, _)| is).sum::<f64>() / count;
    let mean_oos = pairs.iter().map(|(_, oos)| oos).sum::<f64>() / count;
    if mean_is.abs() < 1e-9 {
        return f64::NAN;
    }
    mean_oos / mean_is
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{init_logging, wavy_series};

    fn config(window_count: usize, anchored_start: bool) -> WalkForwardConfig {
        WalkForwardConfig {
            window_count,
            train_ratio: 0.7,
            anchored_start,
            objective: Objective::TotalReturn,
            max_combinations: 20,
            worker_threads: 2,
        }
    }

    #[test]
    fn rolling_plan_tiles_the_tail() {
        let plans = plan_windows(300, 5, 0.7, false);
        assert_eq!(plans.len(), 5);
        assert_eq!(plans[0].test_end - plans[0].test_start, 40);
        assert_eq!(plans[0].train_end - plans[0].train_start, 93);
        assert_eq!(plans[4].test_end, 300);
        for pair in plans.windows(2) {
            assert_eq!(pair[0].test_end, pair[1].test_start);
            assert_eq!(
                pair[0].train_end - pair[0].train_start,
                pair[1].train_end - pair[1].train_start
            );
        }
    }

    #[test]
    fn anchored_plan_grows_from_origin() {
        let plans = plan_windows(300, 4, 0.6, true);
        assert_eq!(plans.len(), 4);
        for plan in &plans {
            assert_eq!(plan.train_start, 0);
            assert_eq!(plan.train_end, plan.test_start);
        }
        assert!(plans[3].train_end > plans[0].train_end);
        assert_eq!(plans[3].test_end, 300);
    }

    #[test]
    fn degradation_handles_edge_cases() {
        assert_eq!(degradation(10.0, 5.0), 0.5);
        assert_eq!(degradation(10.0, 12.0), 0.0);
        assert_eq!(degradation(10.0, -30.0), 1.0);
        assert_eq!(degradation(0.0, 0.0), 0.0);
        assert_eq!(degradation(0.0, -1.0), 1.0);
        assert_eq!(degradation(-2.0, -3.0), 0.5);
        assert_eq!(degradation(f64::INFINITY, 2.0), 1.0);
    }

    #[test]
    fn stability_is_modal_share() {
        let a: ParameterSet = [("p".to_string(), 1.0)].into_iter().collect();
        let b: ParameterSet = [("p".to_string(), 2.0)].into_iter().collect();
        assert_eq!(parameter_stability(&[&a, &a, &b, &a]), 0.75);
        assert_eq!(parameter_stability(&[]), 0.0);
        assert!(recommendation(OverfitRisk::Low, 0.25, 0).contains("unstable"));
        assert!(recommendation(OverfitRisk::High, 1.0, 2).contains("2 window(s) skipped"));
    }

    #[test]
    fn runs_every_window_with_non_overlapping_tests() {
        init_logging();
        let candles = wavy_series(400, 100.0);
        let ranges = vec![
            ParameterRange::new("fastPeriod", 5.0, 15.0, 5.0),
            ParameterRange::new("slowPeriod", 20.0, 40.0, 10.0),
        ];
        let result = WalkForwardOptimizer::new(config(4, false))
            .run("sma_crossover", &candles, &ranges, &ParameterSet::new())
            .unwrap();
        assert_eq!(result.windows.len(), 4);
        assert_eq!(result.completed_windows + result.skipped_windows, 4);
        for pair in result.windows.windows(2) {
            assert!(pair[0].test_end < pair[1].test_start);
        }
        for window in &result.windows {
            assert!(window.train_end < window.test_start);
            if let Some(metrics) = &window.out_of_sample_metrics {
                for trade in &window.out_of_sample_trades {
                    assert!(trade.entry_date >= window.test_start);
                }
                assert!(metrics.total_trades == window.out_of_sample_trades.len());
            }
        }
        assert!((0.0..=1.0).contains(&result.overfit_score));
        assert_eq!(result.overfit_risk, OverfitRisk::from_score(result.overfit_score));
        assert!(!result.recommendation.is_empty());
    }

    #[test]
    fn anchored_run_expands_train_slices_from_the_first_bar() {
        init_logging();
        let candles = wavy_series(400, 100.0);
        let ranges = vec![
            ParameterRange::new("fastPeriod", 5.0, 15.0, 5.0),
            ParameterRange::new("slowPeriod", 20.0, 40.0, 10.0),
        ];
        let result = WalkForwardOptimizer::new(config(4, true))
            .run("sma_crossover", &candles, &ranges, &ParameterSet::new())
            .unwrap();
        assert_eq!(result.windows.len(), 4);
        assert!(result
            .windows
            .iter()
            .any(|window| window.status == WindowStatus::Completed));
        for window in &result.windows {
            assert_eq!(window.train_start, candles[0].date);
            assert!(window.train_end < window.test_start);
            assert_eq!(window.test_bars, 63);
        }
        for pair in result.windows.windows(2) {
            assert_eq!(pair[1].train_bars, pair[0].train_bars + 63);
            assert!(pair[0].test_end < pair[1].test_start);
        }
        assert_eq!(result.windows[0].train_bars, 148);
        assert_eq!(result.windows[3].test_end, candles[399].date);
        assert!((0.0..=1.0).contains(&result.overfit_score));
    }

    #[test]
    fn too_short_windows_are_skipped_or_reported() {
        // 100 bars in 5 windows leaves 30-bar train slices, short of the 30-bar SMA warm-up.
        let candles = wavy_series(100, 100.0);
        let err = WalkForwardOptimizer::new(config(5, false))
            .run("sma_crossover", &candles, &[], &ParameterSet::new())
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InsufficientData);
    }

    #[test]
    fn rejects_out_of_range_train_ratio() {
        let candles = wavy_series(200, 100.0);
        let mut cfg = config(3, false);
        cfg.train_ratio = 0.99;
        let err = WalkForwardOptimizer::new(cfg)
            .run("rsi", &candles, &[], &ParameterSet::new())
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ValidationError);
    }
}
