use crate::config::{EngineRuntimeSettings, Objective};
use crate::engine::{run_backtest, validate_candles};
use crate::error::{EngineError, EngineResult};
use crate::models::*;
use crate::optimizer_status::OptimizerStatus;
use crate::param_utils::merge_with_defaults;
use crate::strategy::{find_template, resolve_parameters};
use crossbeam_channel::{bounded, Receiver, Sender};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::thread;

pub const STRIDE_SAMPLING_POLICY: &str = "stride";
pub const EXHAUSTIVE_POLICY: &str = "exhaustive";

/// Cartesian product of parameter ranges addressed by a mixed-radix ordinal.
/// The last range varies fastest.
#[derive(Debug, Clone)]
pub struct ParameterGrid {
    ranges: Vec<ParameterRange>,
    counts: Vec<u64>,
}

impl ParameterGrid {
    pub fn new(ranges: &[ParameterRange]) -> EngineResult<Self> {
        let mut seen = HashSet::new();
        for range in ranges {
            range.validate()?;
            if !seen.insert(range.name.as_str()) {
                return Err(EngineError::validation(format!(
                    "Parameter range `{}` is listed more than once",
                    range.name
                )));
            }
        }
        Ok(Self {
            ranges: ranges.to_vec(),
            counts: ranges.iter().map(ParameterRange::value_count).collect(),
        })
    }

    /// Product of per-range value counts, saturating at `u64::MAX`.
    pub fn total_combinations(&self) -> u64 {
        self.counts
            .iter()
            .fold(1u64, |acc, &count| acc.saturating_mul(count))
    }

    pub fn combination_at(&self, ordinal: u64) -> ParameterSet {
        let mut remainder = ordinal;
        let mut combination = ParameterSet::new();
        for (range, &count) in self.ranges.iter().zip(self.counts.iter()).rev() {
            let index = remainder % count;
            remainder /= count;
            combination.insert(range.name.clone(), range.value_at(index));
        }
        combination
    }

    /// Every ordinal when the grid fits, otherwise `floor(k * total / max)` for `k < max`.
    pub fn sample_ordinals(&self, max_combinations: usize) -> Vec<u64> {
        let total = self.total_combinations();
        let max = max_combinations.max(1) as u64;
        if total <= max {
            return (0..total).collect();
        }
        (0..max)
            .map(|k| ((k as u128 * total as u128) / max as u128) as u64)
            .collect()
    }
}

/// Score used for ranking; NaN ranks below everything.
pub fn objective_score(metrics: &BacktestMetrics, objective: Objective) -> f64 {
    let score = match objective {
        Objective::WinRate => metrics.win_rate,
        Objective::TotalReturn => metrics.total_return_percent,
        Objective::AnnualizedReturn => metrics.annualized_return_percent,
        Objective::SharpeRatio => metrics.sharpe_ratio,
        Objective::ProfitFactor => metrics.profit_factor,
    };
    if score.is_nan() {
        f64::NEG_INFINITY
    } else {
        score
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub ordinal: u64,
    pub parameters: ParameterSet,
    #[serde(with = "sentinel_f64")]
    pub objective_value: f64,
    pub metrics: BacktestMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GridSearchResult {
    pub strategy_id: String,
    pub objective: Objective,
    pub best_parameters: ParameterSet,
    pub best_metrics: BacktestMetrics,
    pub leaderboard: Vec<LeaderboardEntry>,
    pub total_combinations: u64,
    pub combinations_evaluated: usize,
    pub combinations_failed: usize,
    pub truncated: bool,
    pub sampling_policy: String,
}

impl GridSearchResult {
    pub fn best_objective(&self) -> f64 {
        self.leaderboard
            .first()
            .map(|entry| entry.objective_value)
            .unwrap_or(f64::NEG_INFINITY)
    }
}

#[derive(Debug, Clone)]
pub struct GridSearchOptions {
    pub max_combinations: usize,
    pub worker_threads: usize,
    pub show_progress: bool,
}

impl GridSearchOptions {
    pub fn from_settings(settings: &EngineRuntimeSettings) -> Self {
        Self {
            max_combinations: settings.grid_max_combinations,
            worker_threads: settings.worker_threads,
            show_progress: false,
        }
    }
}

struct GridTask {
    ordinal: u64,
    parameters: ParameterSet,
}

struct GridTaskResult {
    ordinal: u64,
    parameters: ParameterSet,
    outcome: EngineResult<BacktestMetrics>,
}

pub struct GridSearchOptimizer {
    options: GridSearchOptions,
    status: OptimizerStatus,
}

impl GridSearchOptimizer {
    pub fn new(options: GridSearchOptions) -> Self {
        Self {
            options,
            status: OptimizerStatus::new(),
        }
    }

    pub fn with_status(options: GridSearchOptions, status: OptimizerStatus) -> Self {
        Self { options, status }
    }

    pub fn status(&self) -> &OptimizerStatus {
        &self.status
    }

    /// Evaluates the (possibly sampled) grid of `ranges` on `candles`. Empty `ranges`
    /// fall back to the strategy's catalog ranges. Failing combinations are counted and
    /// skipped; the search only fails when none succeed.
    pub fn search(
        &self,
        strategy_id: &str,
        candles: &[Candle],
        ranges: &[ParameterRange],
        objective: Objective,
        base_parameters: &ParameterSet,
    ) -> EngineResult<GridSearchResult> {
        let template = find_template(strategy_id)?;
        validate_candles(candles)?;
        if self.options.max_combinations == 0 {
            return Err(EngineError::validation("maxCombinations must be >= 1"));
        }

        let default_ranges;
        let ranges = if ranges.is_empty() {
            default_ranges = template.default_ranges();
            default_ranges.as_slice()
        } else {
            ranges
        };
        let grid = ParameterGrid::new(ranges)?;
        let total_combinations = grid.total_combinations();
        let ordinals = grid.sample_ordinals(self.options.max_combinations);
        let truncated = (ordinals.len() as u64) < total_combinations;
        if truncated {
            warn!(
                "Grid for {} has {} combinations; stride-sampling {}",
                strategy_id,
                total_combinations,
                ordinals.len()
            );
        }

        let mut tasks = Vec::with_capacity(ordinals.len());
        for ordinal in ordinals {
            let combination = merge_with_defaults(base_parameters, &grid.combination_at(ordinal));
            tasks.push(GridTask {
                ordinal,
                parameters: resolve_parameters(strategy_id, &combination)?,
            });
        }

        self.status
            .set_phase(format!("Grid search {} ({})", strategy_id, objective.label()));
        info!(
            "Running {} backtests for {} ranked by {}",
            tasks.len(),
            strategy_id,
            objective.label()
        );
        let mut results = self.run_parallel_backtests(strategy_id, candles, tasks, objective);
        results.sort_by_key(|result| result.ordinal);

        let mut failed = 0usize;
        let mut first_error: Option<EngineError> = None;
        let mut scored = Vec::with_capacity(results.len());
        for result in results {
            match result.outcome {
                Ok(metrics) => {
                    let score = objective_score(&metrics, objective);
                    scored.push((score, result.ordinal, result.parameters, metrics));
                }
                Err(err) => {
                    warn!(
                        "Combination {} of {} failed: {}",
                        result.ordinal, strategy_id, err
                    );
                    failed += 1;
                    first_error.get_or_insert(err);
                }
            }
        }

        if scored.is_empty() {
            let detail = first_error
                .map(|err| err.to_string())
                .unwrap_or_else(|| "no combinations evaluated".to_string());
            return Err(EngineError::calculation(format!(
                "All {} parameter combinations failed for {}: {}",
                failed, strategy_id, detail
            )));
        }

        scored.sort_by(|a, b| {
            b.0.total_cmp(&a.0)
                .then_with(|| {
                    a.3.max_drawdown_percent
                        .partial_cmp(&b.3.max_drawdown_percent)
                        .unwrap_or(Ordering::Equal)
                })
                .then_with(|| a.1.cmp(&b.1))
        });

        let combinations_evaluated = scored.len();
        let leaderboard: Vec<LeaderboardEntry> = scored
            .into_iter()
            .enumerate()
            .map(|(index, (score, ordinal, parameters, metrics))| LeaderboardEntry {
                rank: index + 1,
                ordinal,
                parameters,
                objective_value: score,
                metrics,
            })
            .collect();

        let best = &leaderboard[0];
        info!(
            "Best {} for {}: {:.4} at {:?}",
            objective.label(),
            strategy_id,
            best.objective_value,
            best.parameters
        );
        self.status.set_phase("Grid search complete");

        Ok(GridSearchResult {
            strategy_id: strategy_id.to_string(),
            objective,
            best_parameters: best.parameters.clone(),
            best_metrics: best.metrics.clone(),
            total_combinations,
            combinations_evaluated,
            combinations_failed: failed,
            truncated,
            sampling_policy: if truncated {
                STRIDE_SAMPLING_POLICY.to_string()
            } else {
                EXHAUSTIVE_POLICY.to_string()
            },
            leaderboard,
        })
    }

    fn run_parallel_backtests(
        &self,
        strategy_id: &str,
        candles: &[Candle],
        tasks: Vec<GridTask>,
        objective: Objective,
    ) -> Vec<GridTaskResult> {
        let task_count = tasks.len();
        if task_count == 0 {
            return Vec::new();
        }
        let num_workers = self.options.worker_threads.clamp(1, task_count);

        let (tx, rx): (Sender<GridTask>, Receiver<GridTask>) = bounded(task_count);
        let (result_tx, result_rx): (Sender<GridTaskResult>, Receiver<GridTaskResult>) =
            bounded(task_count);

        let pb = if self.options.show_progress {
            ProgressBar::new(task_count as u64)
        } else {
            ProgressBar::hidden()
        };
        if let Ok(style) = ProgressStyle::default_bar().template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
        ) {
            pb.set_style(style.progress_chars("#>-"));
        }

        thread::scope(|scope| {
            for _worker_id in 0..num_workers {
                let rx = rx.clone();
                let result_tx = result_tx.clone();
                scope.spawn(move || {
                    while let Ok(task) = rx.recv() {
                        let outcome = run_backtest(strategy_id, candles, &task.parameters)
                            .map(|run| run.metrics);
                        let result = GridTaskResult {
                            ordinal: task.ordinal,
                            parameters: task.parameters,
                            outcome,
                        };
                        if result_tx.send(result).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(result_tx);

            for task in tasks {
                if tx.send(task).is_err() {
                    warn!("Grid workers stopped before all tasks were queued");
                    break;
                }
            }
            drop(tx);

            let mut results = Vec::with_capacity(task_count);
            let mut failed = 0usize;
            for result in result_rx.iter() {
                match &result.outcome {
                    Ok(metrics) => self.status.record_objective(objective_score(metrics, objective)),
                    Err(_) => failed += 1,
                }
                results.push(result);
                pb.set_position(results.len() as u64);
                self.status.set_progress(task_count, results.len(), failed);
            }

            if failed > 0 {
                pb.finish_with_message("Grid search completed with errors");
            } else {
                pb.finish_with_message("Grid search completed");
            }
            results
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{init_logging, wavy_series};

    fn options(max_combinations: usize, worker_threads: usize) -> GridSearchOptions {
        GridSearchOptions {
            max_combinations,
            worker_threads,
            show_progress: false,
        }
    }

    #[test]
    fn grid_counts_and_decodes_ordinals() {
        let grid = ParameterGrid::new(&[
            ParameterRange::new("a", 1.0, 3.0, 1.0),
            ParameterRange::new("b", 0.0, 1.0, 0.5),
        ])
        .unwrap();
        assert_eq!(grid.total_combinations(), 9);
        let first = grid.combination_at(0);
        assert_eq!(first["a"], 1.0);
        assert_eq!(first["b"], 0.0);
        let second = grid.combination_at(1);
        assert_eq!(second["a"], 1.0);
        assert_eq!(second["b"], 0.5);
        let last = grid.combination_at(8);
        assert_eq!(last["a"], 3.0);
        assert_eq!(last["b"], 1.0);
    }

    #[test]
    fn stride_sampling_is_deterministic_and_distinct() {
        let grid = ParameterGrid::new(&[ParameterRange::new("a", 0.0, 99.0, 1.0)]).unwrap();
        let sample = grid.sample_ordinals(8);
        assert_eq!(sample, vec![0, 12, 25, 37, 50, 62, 75, 87]);
        assert_eq!(grid.sample_ordinals(200).len(), 100);
    }

    #[test]
    fn duplicate_range_names_are_rejected() {
        let result = ParameterGrid::new(&[
            ParameterRange::new("a", 0.0, 1.0, 1.0),
            ParameterRange::new("a", 0.0, 2.0, 1.0),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn search_ranks_and_counts_failures() {
        init_logging();
        let candles = wavy_series(260, 100.0);
        let ranges = vec![
            ParameterRange::new("fastPeriod", 5.0, 25.0, 10.0),
            ParameterRange::new("slowPeriod", 15.0, 35.0, 10.0),
        ];
        let optimizer = GridSearchOptimizer::new(options(100, 3));
        let result = optimizer
            .search(
                "sma_crossover",
                &candles,
                &ranges,
                Objective::TotalReturn,
                &ParameterSet::new(),
            )
            .unwrap();

        // fast >= slow: (15,15), (25,15), (25,25)
        assert_eq!(result.total_combinations, 9);
        assert_eq!(result.combinations_failed, 3);
        assert_eq!(result.combinations_evaluated, 6);
        assert!(!result.truncated);
        assert_eq!(result.sampling_policy, EXHAUSTIVE_POLICY);
        for pair in result.leaderboard.windows(2) {
            assert!(pair[0].objective_value >= pair[1].objective_value);
        }
        assert_eq!(result.best_parameters, result.leaderboard[0].parameters);
        assert_eq!(
            result.best_objective(),
            result.best_metrics.total_return_percent
        );

        let snapshot = optimizer.status().snapshot();
        assert_eq!(snapshot.completed_combinations, 9);
        assert_eq!(snapshot.failed_combinations, 3);
    }

    #[test]
    fn truncation_caps_evaluations_but_reports_true_total() {
        let candles = wavy_series(200, 50.0);
        let ranges = vec![
            ParameterRange::new("period", 5.0, 40.0, 5.0),
            ParameterRange::new("entryZ", 1.0, 3.0, 0.5),
        ];
        let result = GridSearchOptimizer::new(options(7, 2))
            .search(
                "mean_reversion",
                &candles,
                &ranges,
                Objective::SharpeRatio,
                &ParameterSet::new(),
            )
            .unwrap();
        assert_eq!(result.total_combinations, 40);
        assert_eq!(result.combinations_evaluated + result.combinations_failed, 7);
        assert!(result.truncated);
        assert_eq!(result.sampling_policy, STRIDE_SAMPLING_POLICY);
    }

    #[test]
    fn results_do_not_depend_on_worker_count() {
        let candles = wavy_series(240, 80.0);
        let run = |workers| {
            GridSearchOptimizer::new(options(50, workers))
                .search("rsi", &candles, &[], Objective::WinRate, &ParameterSet::new())
                .unwrap()
        };
        let single = run(1);
        let many = run(4);
        let ordinals = |r: &GridSearchResult| {
            r.leaderboard.iter().map(|e| e.ordinal).collect::<Vec<_>>()
        };
        assert_eq!(ordinals(&single), ordinals(&many));
        assert_eq!(single.best_parameters, many.best_parameters);
    }

    #[test]
    fn absurd_lookbacks_are_counted_as_failures() {
        let candles = wavy_series(260, 100.0);
        let ranges = vec![ParameterRange::new("entryLookback", 20.0, 1e30, 1e29)];
        let result = GridSearchOptimizer::new(options(50, 3))
            .search(
                "breakout",
                &candles,
                &ranges,
                Objective::TotalReturn,
                &ParameterSet::new(),
            )
            .unwrap();
        assert_eq!(result.total_combinations, 11);
        assert_eq!(result.combinations_evaluated, 1);
        assert_eq!(result.combinations_failed, 10);
        assert_eq!(result.best_parameters["entryLookback"], 20.0);
    }

    #[test]
    fn all_failing_combinations_is_an_error() {
        let candles = wavy_series(120, 80.0);
        let ranges = vec![
            ParameterRange::new("fastPeriod", 30.0, 40.0, 10.0),
            ParameterRange::new("slowPeriod", 10.0, 20.0, 10.0),
        ];
        let err = GridSearchOptimizer::new(options(10, 2))
            .search(
                "sma_crossover",
                &candles,
                &ranges,
                Objective::SharpeRatio,
                &ParameterSet::new(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::CalculationError);
    }

    #[test]
    fn tie_break_prefers_lower_drawdown_then_ordinal() {
        // No trades anywhere: every objective ties at zero.
        let candles = crate::test_support::candles_from_closes(&[10.0; 40]);
        let ranges = vec![ParameterRange::new("period", 10.0, 20.0, 5.0)];
        let result = GridSearchOptimizer::new(options(10, 2))
            .search(
                "mean_reversion",
                &candles,
                &ranges,
                Objective::TotalReturn,
                &ParameterSet::new(),
            )
            .unwrap();
        let ordinals: Vec<u64> = result.leaderboard.iter().map(|e| e.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1, 2]);
    }
}
