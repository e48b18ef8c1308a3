use crate::error::{EngineError, EngineResult};
use crate::models::{sentinel_f64, BacktestMetrics, EquityPoint};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

pub const TRADING_DAYS_PER_YEAR: f64 = 252.0;
pub const DEFAULT_RISK_FREE_RATE: f64 = 0.02;
const MIN_OBSERVATIONS: usize = 20;
const WEIGHT_TOLERANCE: f64 = 1e-6;
const MAX_ITERATIONS: usize = 5_000;
const CONVERGENCE_EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortfolioMethod {
    Equal,
    RiskParity,
    MaxSharpe,
    MinVariance,
    MaxReturn,
}

impl PortfolioMethod {
    pub fn parse(value: &str) -> EngineResult<Self> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "equal" | "equal_weight" => Ok(PortfolioMethod::Equal),
            "risk_parity" => Ok(PortfolioMethod::RiskParity),
            "max_sharpe" => Ok(PortfolioMethod::MaxSharpe),
            "min_variance" => Ok(PortfolioMethod::MinVariance),
            "max_return" => Ok(PortfolioMethod::MaxReturn),
            other => Err(EngineError::validation(format!(
                "Unknown portfolio method '{}'",
                other
            ))),
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            PortfolioMethod::Equal => "Equal weight: every asset receives 1/N of the capital.",
            PortfolioMethod::RiskParity => {
                "Risk parity: weights scaled so each asset contributes equally to portfolio volatility."
            }
            PortfolioMethod::MaxSharpe => {
                "Maximum Sharpe: weights maximise excess return per unit of volatility within the weight bounds."
            }
            PortfolioMethod::MinVariance => {
                "Minimum variance: weights minimise portfolio volatility within the weight bounds."
            }
            PortfolioMethod::MaxReturn => {
                "Maximum return: capital concentrated into the highest-return assets up to the maximum weight."
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightConstraints {
    #[serde(default)]
    pub min_weight: f64,
    #[serde(default = "default_max_weight")]
    pub max_weight: f64,
}

fn default_max_weight() -> f64 {
    1.0
}

impl Default for WeightConstraints {
    fn default() -> Self {
        Self {
            min_weight: 0.0,
            max_weight: default_max_weight(),
        }
    }
}

impl WeightConstraints {
    pub fn validate(&self, asset_count: usize) -> EngineResult<()> {
        let (min, max) = (self.min_weight, self.max_weight);
        if !min.is_finite() || !max.is_finite() || min < 0.0 || max > 1.0 || min > max {
            return Err(EngineError::validation(format!(
                "Weight bounds must satisfy 0 <= minWeight <= maxWeight <= 1 (min: {}, max: {})",
                min, max
            )));
        }
        let n = asset_count as f64;
        if min * n > 1.0 + 1e-12 {
            return Err(EngineError::validation(format!(
                "minWeight {} x {} assets exceeds 100%",
                min, asset_count
            )));
        }
        if max * n < 1.0 - 1e-12 {
            return Err(EngineError::validation(format!(
                "maxWeight {} x {} assets cannot reach 100%",
                max, asset_count
            )));
        }
        Ok(())
    }
}

/// A backtested strategy/ticker pair offered to the allocator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioAsset {
    pub id: String,
    pub ticker: String,
    pub strategy_id: String,
    #[serde(default)]
    pub metrics: Option<BacktestMetrics>,
    #[serde(default)]
    pub equity_curve: Vec<EquityPoint>,
    #[serde(default)]
    pub returns: Option<Vec<f64>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetAllocation {
    pub asset_id: String,
    pub ticker: String,
    pub strategy_id: String,
    pub weight: f64,
    pub annualized_return: f64,
    pub annualized_volatility: f64,
    /// Share of portfolio variance attributable to this asset.
    pub risk_contribution: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioAllocation {
    pub method: PortfolioMethod,
    pub method_description: String,
    pub risk_free_rate: f64,
    pub constraints: WeightConstraints,
    pub observations: usize,
    pub weights: Vec<AssetAllocation>,
    pub expected_return: f64,
    pub expected_risk: f64,
    #[serde(with = "sentinel_f64")]
    pub sharpe_ratio: f64,
    #[serde(with = "sentinel_f64")]
    pub diversification_ratio: f64,
}

/// Annualised return vector and covariance matrix of the aligned asset returns.
struct ReturnModel {
    expected: Vec<f64>,
    covariance: Vec<Vec<f64>>,
    volatility: Vec<f64>,
    observations: usize,
}

pub struct PortfolioOptimizer {
    risk_free_rate: f64,
    constraints: WeightConstraints,
}

impl PortfolioOptimizer {
    pub fn new(risk_free_rate: f64, constraints: WeightConstraints) -> Self {
        Self {
            risk_free_rate,
            constraints,
        }
    }

    pub fn optimize(
        &self,
        assets: &[PortfolioAsset],
        method: PortfolioMethod,
    ) -> EngineResult<PortfolioAllocation> {
        if assets.len() < 2 {
            return Err(EngineError::validation(
                "Portfolio optimization requires at least 2 assets",
            ));
        }
        if !self.risk_free_rate.is_finite() {
            return Err(EngineError::validation("riskFreeRate must be finite"));
        }
        self.constraints.validate(assets.len())?;

        let series = assets
            .iter()
            .map(asset_returns)
            .collect::<EngineResult<Vec<_>>>()?;
        let model = build_return_model(&series)?;
        info!(
            "Optimizing {} assets with {:?} over {} aligned returns",
            assets.len(),
            method,
            model.observations
        );

        let weights = match method {
            PortfolioMethod::Equal => vec![1.0 / assets.len() as f64; assets.len()],
            PortfolioMethod::MaxReturn => self.max_return_weights(&model.expected),
            PortfolioMethod::MinVariance => {
                ensure_positive_definite(&model.covariance)?;
                self.min_variance_weights(&model)
            }
            PortfolioMethod::MaxSharpe => {
                ensure_positive_definite(&model.covariance)?;
                self.max_sharpe_weights(&model)
            }
            PortfolioMethod::RiskParity => {
                ensure_positive_definite(&model.covariance)?;
                self.risk_parity_weights(&model)
            }
        };
        self.check_weights(&weights)?;

        Ok(self.describe(assets, method, &model, weights))
    }

    fn check_weights(&self, weights: &[f64]) -> EngineResult<()> {
        let total: f64 = weights.iter().sum();
        if (total - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(EngineError::calculation(format!(
                "Optimized weights sum to {} instead of 1",
                total
            )));
        }
        let out_of_bounds = weights.iter().any(|&w| {
            !w.is_finite()
                || w < self.constraints.min_weight - WEIGHT_TOLERANCE
                || w > self.constraints.max_weight + WEIGHT_TOLERANCE
        });
        if out_of_bounds {
            return Err(EngineError::calculation(
                "Optimized weights violate the weight bounds",
            ));
        }
        Ok(())
    }

    fn project(&self, raw: &[f64]) -> Vec<f64> {
        project_to_bounded_simplex(raw, self.constraints.min_weight, self.constraints.max_weight)
    }

    fn max_return_weights(&self, expected: &[f64]) -> Vec<f64> {
        let (min, max) = (self.constraints.min_weight, self.constraints.max_weight);
        let mut weights = vec![min; expected.len()];
        let mut remaining = 1.0 - min * expected.len() as f64;

        let mut order: Vec<usize> = (0..expected.len()).collect();
        order.sort_by(|&a, &b| expected[b].total_cmp(&expected[a]).then(a.cmp(&b)));
        for index in order {
            if remaining <= 0.0 {
                break;
            }
            let add = (max - min).min(remaining);
            weights[index] += add;
            remaining -= add;
        }
        weights
    }

    fn inverse_volatility_start(&self, model: &ReturnModel) -> Vec<f64> {
        let raw: Vec<f64> = model
            .volatility
            .iter()
            .map(|&vol| if vol > 0.0 { 1.0 / vol } else { 0.0 })
            .collect();
        let total: f64 = raw.iter().sum();
        if total > 0.0 {
            self.project(&raw.iter().map(|v| v / total).collect::<Vec<_>>())
        } else {
            self.project(&vec![1.0 / raw.len() as f64; raw.len()])
        }
    }

    fn starting_points(&self, model: &ReturnModel) -> Vec<Vec<f64>> {
        let n = model.expected.len();
        let mut starts = vec![
            self.project(&vec![1.0 / n as f64; n]),
            self.inverse_volatility_start(model),
        ];
        for corner in 0..n {
            let mut raw = vec![0.0; n];
            raw[corner] = 1.0;
            starts.push(self.project(&raw));
        }
        starts
    }

    fn min_variance_weights(&self, model: &ReturnModel) -> Vec<f64> {
        // Gershgorin bound on the largest eigenvalue gives a safe fixed step.
        let lipschitz = 2.0
            * model
                .covariance
                .iter()
                .map(|row| row.iter().map(|v| v.abs()).sum::<f64>())
                .fold(0.0, f64::max);
        let step = if lipschitz > 0.0 { 1.0 / lipschitz } else { 1.0 };

        let mut best: Option<(f64, Vec<f64>)> = None;
        for mut weights in self.starting_points(model) {
            for _ in 0..MAX_ITERATIONS {
                let gradient = mat_vec(&model.covariance, &weights);
                let candidate: Vec<f64> = weights
                    .iter()
                    .zip(&gradient)
                    .map(|(w, g)| w - step * 2.0 * g)
                    .collect();
                let next = self.project(&candidate);
                let moved = max_abs_diff(&next, &weights);
                weights = next;
                if moved < CONVERGENCE_EPSILON {
                    break;
                }
            }
            let variance = quadratic_form(&model.covariance, &weights);
            if best.as_ref().map_or(true, |(value, _)| variance < *value) {
                best = Some((variance, weights));
            }
        }
        best.map(|(_, weights)| weights)
            .unwrap_or_else(|| self.project(&vec![0.0; model.expected.len()]))
    }

    fn sharpe_of(&self, model: &ReturnModel, weights: &[f64]) -> f64 {
        let risk = quadratic_form(&model.covariance, weights).max(0.0).sqrt();
        if risk <= 0.0 {
            return f64::NEG_INFINITY;
        }
        (dot(weights, &model.expected) - self.risk_free_rate) / risk
    }

    fn max_sharpe_weights(&self, model: &ReturnModel) -> Vec<f64> {
        let mut best: Option<(f64, Vec<f64>)> = None;
        for mut weights in self.starting_points(model) {
            let mut value = self.sharpe_of(model, &weights);
            let mut step = 1.0;
            for _ in 0..MAX_ITERATIONS {
                let gradient = self.sharpe_gradient(model, &weights);
                let mut accepted = false;
                while step > CONVERGENCE_EPSILON {
                    let candidate: Vec<f64> = weights
                        .iter()
                        .zip(&gradient)
                        .map(|(w, g)| w + step * g)
                        .collect();
                    let next = self.project(&candidate);
                    let next_value = self.sharpe_of(model, &next);
                    let ascent: f64 = gradient
                        .iter()
                        .zip(next.iter().zip(&weights))
                        .map(|(g, (a, b))| g * (a - b))
                        .sum();
                    if next_value.is_finite() && next_value >= value + 1e-4 * ascent {
                        let moved = max_abs_diff(&next, &weights);
                        weights = next;
                        value = next_value;
                        step *= 2.0;
                        accepted = moved >= CONVERGENCE_EPSILON;
                        break;
                    }
                    step *= 0.5;
                }
                if !accepted {
                    break;
                }
            }
            debug!("max_sharpe start converged at {:.6}", value);
            if best.as_ref().map_or(true, |(current, _)| value > *current) {
                best = Some((value, weights));
            }
        }
        best.map(|(_, weights)| weights)
            .unwrap_or_else(|| self.project(&vec![0.0; model.expected.len()]))
    }

    fn sharpe_gradient(&self, model: &ReturnModel, weights: &[f64]) -> Vec<f64> {
        let variance = quadratic_form(&model.covariance, weights);
        let risk = variance.max(0.0).sqrt();
        if risk <= 0.0 {
            return vec![0.0; weights.len()];
        }
        let excess = dot(weights, &model.expected) - self.risk_free_rate;
        let marginal = mat_vec(&model.covariance, weights);
        model
            .expected
            .iter()
            .zip(&marginal)
            .map(|(mu, m)| (mu * risk - excess * m / risk) / variance)
            .collect()
    }

    /// Cyclical coordinate descent on the log-barrier risk-budgeting problem,
    /// started from inverse volatility and projected onto the bounds.
    fn risk_parity_weights(&self, model: &ReturnModel) -> Vec<f64> {
        let n = model.expected.len();
        let budget = 1.0 / n as f64;
        let cov = &model.covariance;
        let mut y = self.inverse_volatility_start(model);

        for _ in 0..MAX_ITERATIONS {
            let previous = y.clone();
            for i in 0..n {
                let cross: f64 = (0..n).filter(|&j| j != i).map(|j| cov[i][j] * y[j]).sum();
                let diag = cov[i][i];
                y[i] = (-cross + (cross * cross + 4.0 * diag * budget).sqrt()) / (2.0 * diag);
            }
            if max_abs_diff(&y, &previous) < CONVERGENCE_EPSILON {
                break;
            }
        }

        let total: f64 = y.iter().sum();
        let normalized: Vec<f64> = y.iter().map(|v| v / total).collect();
        self.project(&normalized)
    }

    fn describe(
        &self,
        assets: &[PortfolioAsset],
        method: PortfolioMethod,
        model: &ReturnModel,
        weights: Vec<f64>,
    ) -> PortfolioAllocation {
        let variance = quadratic_form(&model.covariance, &weights).max(0.0);
        let expected_risk = variance.sqrt();
        let expected_return = dot(&weights, &model.expected);
        let excess = expected_return - self.risk_free_rate;
        let sharpe_ratio = if expected_risk > 0.0 {
            excess / expected_risk
        } else if excess == 0.0 {
            0.0
        } else {
            excess.signum() * f64::INFINITY
        };

        let marginal = mat_vec(&model.covariance, &weights);
        let contributions: Vec<f64> = if variance > 0.0 {
            weights
                .iter()
                .zip(&marginal)
                .map(|(w, m)| w * m / variance)
                .collect()
        } else {
            weights.clone()
        };
        let weighted_vol = dot(&weights, &model.volatility);
        let diversification_ratio = if expected_risk > 0.0 {
            weighted_vol / expected_risk
        } else {
            f64::INFINITY
        };

        let allocations = assets
            .iter()
            .enumerate()
            .map(|(i, asset)| AssetAllocation {
                asset_id: asset.id.clone(),
                ticker: asset.ticker.clone(),
                strategy_id: asset.strategy_id.clone(),
                weight: weights[i],
                annualized_return: model.expected[i],
                annualized_volatility: model.volatility[i],
                risk_contribution: contributions[i],
            })
            .collect();

        PortfolioAllocation {
            method,
            method_description: method.description().to_string(),
            risk_free_rate: self.risk_free_rate,
            constraints: self.constraints,
            observations: model.observations,
            weights: allocations,
            expected_return,
            expected_risk,
            sharpe_ratio,
            diversification_ratio,
        }
    }
}

/// Explicit returns when provided, otherwise day-over-day change of the equity curve.
fn asset_returns(asset: &PortfolioAsset) -> EngineResult<Vec<f64>> {
    if let Some(returns) = asset.returns.as_ref().filter(|r| !r.is_empty()) {
        if returns.iter().any(|r| !r.is_finite()) {
            return Err(EngineError::validation(format!(
                "Asset {} has non-finite returns",
                asset.id
            )));
        }
        return Ok(returns.clone());
    }

    asset
        .equity_curve
        .windows(2)
        .map(|pair| {
            let (previous, current) = (pair[0].equity, pair[1].equity);
            if previous > 0.0 && current.is_finite() {
                Ok(current / previous - 1.0)
            } else {
                Err(EngineError::calculation(format!(
                    "Asset {} has a non-positive equity value on {}",
                    asset.id, pair[0].date
                )))
            }
        })
        .collect()
}

fn build_return_model(series: &[Vec<f64>]) -> EngineResult<ReturnModel> {
    let n = series.len();
    let required = MIN_OBSERVATIONS.max(n + 1);
    let observations = series.iter().map(Vec::len).min().unwrap_or(0);
    if observations < required {
        return Err(EngineError::insufficient_data(format!(
            "Need at least {} overlapping returns across assets, found {}",
            required, observations
        )));
    }

    let aligned: Vec<&[f64]> = series
        .iter()
        .map(|s| &s[s.len() - observations..])
        .collect();
    let expected = aligned
        .iter()
        .map(|s| s.iter().mean() * TRADING_DAYS_PER_YEAR)
        .collect();
    let covariance: Vec<Vec<f64>> = (0..n)
        .map(|i| {
            (0..n)
                .map(|j| aligned[i].iter().covariance(aligned[j].iter()) * TRADING_DAYS_PER_YEAR)
                .collect()
        })
        .collect();
    let volatility = (0..n).map(|i| covariance[i][i].max(0.0).sqrt()).collect();

    Ok(ReturnModel {
        expected,
        covariance,
        volatility,
        observations,
    })
}

/// Cholesky factorisation used only as a conditioning check.
fn ensure_positive_definite(matrix: &[Vec<f64>]) -> EngineResult<()> {
    let n = matrix.len();
    let scale = (0..n).map(|i| matrix[i][i]).fold(0.0, f64::max);
    if !(scale > 0.0) {
        return Err(EngineError::calculation(
            "Covariance matrix is singular (all assets have zero variance)",
        ));
    }
    let tolerance = scale * 1e-10;
    let mut lower = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in 0..=i {
            let partial: f64 = (0..j).map(|k| lower[i][k] * lower[j][k]).sum();
            if i == j {
                let pivot = matrix[i][i] - partial;
                if !(pivot > tolerance) {
                    return Err(EngineError::calculation(format!(
                        "Covariance matrix is near-singular at asset {}",
                        i
                    )));
                }
                lower[i][j] = pivot.sqrt();
            } else {
                lower[i][j] = (matrix[i][j] - partial) / lower[j][j];
            }
        }
    }
    Ok(())
}

/// Euclidean projection onto {w : sum(w) = 1, min <= w_i <= max} by bisection
/// on the shift applied before clamping.
fn project_to_bounded_simplex(raw: &[f64], min: f64, max: f64) -> Vec<f64> {
    let clamped_sum = |shift: f64| -> f64 {
        raw.iter().map(|v| (v - shift).clamp(min, max)).sum()
    };
    let mut low = raw.iter().copied().fold(f64::INFINITY, f64::min) - max - 1.0;
    let mut high = raw.iter().copied().fold(f64::NEG_INFINITY, f64::max) - min + 1.0;
    for _ in 0..200 {
        let mid = 0.5 * (low + high);
        if clamped_sum(mid) > 1.0 {
            low = mid;
        } else {
            high = mid;
        }
    }
    let shift = 0.5 * (low + high);
    raw.iter().map(|v| (v - shift).clamp(min, max)).collect()
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn mat_vec(matrix: &[Vec<f64>], vector: &[f64]) -> Vec<f64> {
    matrix.iter().map(|row| dot(row, vector)).collect()
}

fn quadratic_form(matrix: &[Vec<f64>], vector: &[f64]) -> f64 {
    dot(vector, &mat_vec(matrix, vector))
}

fn max_abs_diff(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f64::max)
}
