use crate::batch::{BatchBacktestResult, BatchBacktester, BatchPeriod, PriceHistoryProvider};
use crate::config::{EngineRuntimeSettings, Objective};
use crate::engine::run_backtest;
use crate::error::{EngineError, ErrorKind};
use crate::models::{BacktestRun, Candle, ParameterRange, ParameterSet, StrategyTemplate};
use crate::monte_carlo::{
    MonteCarloConfig, MonteCarloResult, MonteCarloSimulator, ResamplingMethod, TradeSample,
    DEFAULT_CONFIDENCE_LEVEL, DEFAULT_INITIAL_CAPITAL as DEFAULT_SIMULATION_CAPITAL,
    DEFAULT_SIMULATIONS,
};
use crate::optimizer::{GridSearchOptimizer, GridSearchOptions, GridSearchResult};
use crate::portfolio::{
    PortfolioAllocation, PortfolioAsset, PortfolioMethod, PortfolioOptimizer, WeightConstraints,
    DEFAULT_RISK_FREE_RATE,
};
use crate::strategy::catalog;
use crate::walk_forward::{WalkForwardConfig, WalkForwardOptimizer, WalkForwardResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Failure as reported across the request boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ApiError {
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self {
            kind: ErrorKind::ValidationError,
            message: message.into(),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Per-process context shared by every handler.
#[derive(Debug, Clone)]
pub struct ApiContext {
    pub settings: EngineRuntimeSettings,
    pub show_progress: bool,
}

impl ApiContext {
    pub fn new(settings: EngineRuntimeSettings) -> Self {
        Self {
            settings,
            show_progress: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestRequest {
    #[serde(default, alias = "strategy")]
    pub strategy_id: String,
    #[serde(default, alias = "prices", alias = "priceSeries")]
    pub candles: Vec<Candle>,
    #[serde(default)]
    pub parameters: ParameterSet,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    #[serde(default)]
    pub tickers: Vec<String>,
    #[serde(default)]
    pub period: BatchPeriod,
    #[serde(default)]
    pub min_trades: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GridSearchRequest {
    #[serde(default, alias = "strategy")]
    pub strategy_id: String,
    #[serde(default, alias = "prices", alias = "priceSeries")]
    pub candles: Vec<Candle>,
    #[serde(default, alias = "ranges")]
    pub parameter_ranges: Vec<ParameterRange>,
    #[serde(default)]
    pub objective: Option<String>,
    #[serde(default)]
    pub max_combinations: Option<usize>,
    #[serde(default)]
    pub base_parameters: ParameterSet,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalkForwardRequest {
    #[serde(default, alias = "strategy")]
    pub strategy_id: String,
    #[serde(default, alias = "prices", alias = "priceSeries")]
    pub candles: Vec<Candle>,
    #[serde(default, alias = "ranges")]
    pub parameter_ranges: Vec<ParameterRange>,
    #[serde(default)]
    pub objective: Option<String>,
    #[serde(default = "default_window_count")]
    pub window_count: usize,
    #[serde(default = "default_train_ratio")]
    pub train_ratio: f64,
    #[serde(default)]
    pub anchored_start: bool,
    #[serde(default)]
    pub max_combinations: Option<usize>,
    #[serde(default)]
    pub base_parameters: ParameterSet,
}

fn default_window_count() -> usize {
    5
}

fn default_train_ratio() -> f64 {
    0.7
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonteCarloRequest {
    #[serde(default)]
    pub trades: Vec<TradeSample>,
    #[serde(default = "default_simulation_capital")]
    pub initial_capital: f64,
    #[serde(default = "default_simulations")]
    pub simulations: usize,
    #[serde(default = "default_confidence_level")]
    pub confidence_level: f64,
    #[serde(default)]
    pub method: ResamplingMethod,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub compound: bool,
}

fn default_simulation_capital() -> f64 {
    DEFAULT_SIMULATION_CAPITAL
}

fn default_simulations() -> usize {
    DEFAULT_SIMULATIONS
}

fn default_confidence_level() -> f64 {
    DEFAULT_CONFIDENCE_LEVEL
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioRequest {
    #[serde(default)]
    pub assets: Vec<PortfolioAsset>,
    #[serde(default = "default_portfolio_method")]
    pub method: String,
    #[serde(default = "default_risk_free_rate")]
    pub risk_free_rate: f64,
    #[serde(default)]
    pub constraints: WeightConstraints,
}

fn default_portfolio_method() -> String {
    "equal".to_string()
}

fn default_risk_free_rate() -> f64 {
    DEFAULT_RISK_FREE_RATE
}

/// Parses a JSON request body; malformed input is a validation failure.
pub fn decode_request<T: DeserializeOwned>(body: &str) -> ApiResult<T> {
    serde_json::from_str(body).map_err(|err| ApiError::validation(format!("Invalid request: {}", err)))
}

/// `{"ok": true, "data": ..}` or `{"ok": false, "error": {kind, message}}`.
pub fn envelope<T: Serialize>(result: ApiResult<T>) -> Value {
    match result.and_then(|data| {
        serde_json::to_value(data)
            .map_err(|err| ApiError::from(EngineError::calculation(err.to_string())))
    }) {
        Ok(data) => json!({ "ok": true, "data": data }),
        Err(error) => json!({ "ok": false, "error": error }),
    }
}

fn require_strategy_id(strategy_id: &str) -> ApiResult<&str> {
    let trimmed = strategy_id.trim();
    if trimmed.is_empty() {
        return Err(ApiError::validation("strategyId is required"));
    }
    Ok(trimmed)
}

fn require_candles(candles: &[Candle]) -> ApiResult<()> {
    if candles.is_empty() {
        return Err(ApiError::validation("Price series is empty"));
    }
    Ok(())
}

fn parse_objective(raw: Option<&str>) -> ApiResult<Objective> {
    match raw {
        Some(value) if !value.trim().is_empty() => Ok(Objective::parse(value)?),
        _ => Ok(Objective::default()),
    }
}

fn bounded_combinations(requested: Option<usize>, default: usize, cap: usize) -> ApiResult<usize> {
    let value = requested.unwrap_or(default);
    if value == 0 || value > cap {
        return Err(ApiError::validation(format!(
            "maxCombinations must be within [1, {}] (value: {})",
            cap, value
        )));
    }
    Ok(value)
}

pub fn list_strategies() -> Vec<StrategyTemplate> {
    catalog().to_vec()
}

pub fn handle_backtest(request: &BacktestRequest) -> ApiResult<BacktestRun> {
    let strategy_id = require_strategy_id(&request.strategy_id)?;
    require_candles(&request.candles)?;
    Ok(run_backtest(strategy_id, &request.candles, &request.parameters)?)
}

pub fn handle_batch<P: PriceHistoryProvider + ?Sized>(
    context: &ApiContext,
    provider: &P,
    request: &BatchRequest,
) -> ApiResult<BatchBacktestResult> {
    let batch = BatchBacktester::new(provider, &context.settings);
    Ok(batch.run(&request.tickers, request.period, request.min_trades)?)
}

pub fn handle_grid_search(
    context: &ApiContext,
    request: &GridSearchRequest,
) -> ApiResult<GridSearchResult> {
    let strategy_id = require_strategy_id(&request.strategy_id)?;
    require_candles(&request.candles)?;
    let objective = parse_objective(request.objective.as_deref())?;
    let settings = &context.settings;
    let max_combinations = bounded_combinations(
        request.max_combinations,
        settings.grid_max_combinations,
        settings.grid_max_combinations_cap,
    )?;

    let options = GridSearchOptions {
        max_combinations,
        show_progress: context.show_progress,
        ..GridSearchOptions::from_settings(settings)
    };
    Ok(GridSearchOptimizer::new(options).search(
        strategy_id,
        &request.candles,
        &request.parameter_ranges,
        objective,
        &request.base_parameters,
    )?)
}

pub fn handle_walk_forward(
    context: &ApiContext,
    request: &WalkForwardRequest,
) -> ApiResult<WalkForwardResult> {
    let strategy_id = require_strategy_id(&request.strategy_id)?;
    let settings = &context.settings;
    if request.candles.len() < settings.walk_forward_min_bars {
        return Err(ApiError::validation(format!(
            "Walk-forward analysis requires at least {} bars (got {})",
            settings.walk_forward_min_bars,
            request.candles.len()
        )));
    }
    if request.window_count == 0 || request.window_count > settings.walk_forward_max_windows {
        return Err(ApiError::validation(format!(
            "windowCount must be within [1, {}] (value: {})",
            settings.walk_forward_max_windows, request.window_count
        )));
    }
    let objective = parse_objective(request.objective.as_deref())?;
    let max_combinations = bounded_combinations(
        request.max_combinations,
        settings.walk_forward_max_combinations,
        settings.walk_forward_max_combinations,
    )?;

    let config = WalkForwardConfig {
        window_count: request.window_count,
        train_ratio: request.train_ratio,
        anchored_start: request.anchored_start,
        objective,
        max_combinations,
        ..WalkForwardConfig::from_settings(settings)
    };
    Ok(WalkForwardOptimizer::new(config).run(
        strategy_id,
        &request.candles,
        &request.parameter_ranges,
        &request.base_parameters,
    )?)
}

pub fn handle_monte_carlo(
    context: &ApiContext,
    request: &MonteCarloRequest,
) -> ApiResult<MonteCarloResult> {
    let config = MonteCarloConfig {
        initial_capital: request.initial_capital,
        simulations: request.simulations,
        confidence_level: request.confidence_level,
        method: request.method,
        seed: request.seed,
        compound: request.compound,
        max_simulations: context.settings.monte_carlo_max_simulations,
    };
    Ok(MonteCarloSimulator::new(config).simulate(&request.trades)?)
}

pub fn handle_portfolio(request: &PortfolioRequest) -> ApiResult<PortfolioAllocation> {
    let method = PortfolioMethod::parse(&request.method)?;
    let optimizer = PortfolioOptimizer::new(request.risk_free_rate, request.constraints);
    Ok(optimizer.optimize(&request.assets, method)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_context::MarketData;
    use crate::test_support::{candles_from_closes, wavy_series};

    fn context() -> ApiContext {
        ApiContext::new(EngineRuntimeSettings::default())
    }

    #[test]
    fn envelope_wraps_success_and_failure() {
        let ok = envelope::<u32>(Ok(7));
        assert_eq!(ok, json!({ "ok": true, "data": 7 }));

        let failed = envelope::<u32>(Err(EngineError::insufficient_data("too short").into()));
        assert_eq!(failed["ok"], json!(false));
        assert_eq!(failed["error"]["kind"], json!("INSUFFICIENT_DATA"));
        assert_eq!(failed["error"]["message"], json!("too short"));
    }

    #[test]
    fn backtest_request_reports_missing_inputs() {
        let request: BacktestRequest =
            decode_request(r#"{"strategyId": "", "candles": []}"#).unwrap();
        let err = handle_backtest(&request).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ValidationError);

        let unknown = BacktestRequest {
            strategy_id: "nope".to_string(),
            candles: candles_from_closes(&[1.0, 2.0]),
            parameters: ParameterSet::new(),
        };
        assert_eq!(
            handle_backtest(&unknown).unwrap_err().kind,
            ErrorKind::ValidationError
        );

        let malformed = decode_request::<BacktestRequest>("{not json").unwrap_err();
        assert_eq!(malformed.kind, ErrorKind::ValidationError);
    }

    #[test]
    fn backtest_output_serializes_dates_as_iso_strings() {
        let request = BacktestRequest {
            strategy_id: "buy_and_hold".to_string(),
            candles: candles_from_closes(&[10.0, 11.0, 12.0]),
            parameters: ParameterSet::new(),
        };
        let value = envelope(handle_backtest(&request));
        assert_eq!(value["data"]["trades"][0]["entryDate"], json!("2020-01-01"));
        assert_eq!(value["data"]["equity"].as_array().map(Vec::len), Some(3));
    }

    #[test]
    fn grid_search_enforces_the_combination_cap() {
        let mut request: GridSearchRequest = decode_request(
            r#"{"strategyId": "sma_crossover", "candles": [], "maxCombinations": 999999}"#,
        )
        .unwrap();
        request.candles = wavy_series(200, 50.0);
        let err = handle_grid_search(&context(), &request).unwrap_err();
        assert!(err.message.contains("maxCombinations"));

        request.max_combinations = Some(4);
        request.objective = Some("total_return".to_string());
        let result = handle_grid_search(&context(), &request).unwrap();
        assert!(result.truncated);
        assert!(result.combinations_evaluated + result.combinations_failed <= 4);
    }

    #[test]
    fn oversized_ranges_and_lookbacks_are_validation_errors() {
        let grid = GridSearchRequest {
            strategy_id: "sma_crossover".to_string(),
            candles: wavy_series(200, 50.0),
            parameter_ranges: vec![ParameterRange::new("fastPeriod", 0.0, 1e30, 1.0)],
            objective: None,
            max_combinations: Some(10),
            base_parameters: ParameterSet::new(),
        };
        assert_eq!(
            handle_grid_search(&context(), &grid).unwrap_err().kind,
            ErrorKind::ValidationError
        );

        let mut parameters = ParameterSet::new();
        parameters.insert("entryLookback".to_string(), 1e30);
        let backtest = BacktestRequest {
            strategy_id: "breakout".to_string(),
            candles: wavy_series(60, 50.0),
            parameters,
        };
        assert_eq!(
            handle_backtest(&backtest).unwrap_err().kind,
            ErrorKind::ValidationError
        );
    }

    #[test]
    fn walk_forward_requires_enough_bars_and_bounded_windows() {
        let mut request: WalkForwardRequest =
            decode_request(r#"{"strategyId": "sma_crossover"}"#).unwrap();
        assert_eq!(request.window_count, 5);
        assert!((request.train_ratio - 0.7).abs() < 1e-12);
        request.candles = wavy_series(99, 50.0);
        assert_eq!(
            handle_walk_forward(&context(), &request).unwrap_err().kind,
            ErrorKind::ValidationError
        );

        request.candles = wavy_series(300, 50.0);
        request.window_count = 21;
        assert!(handle_walk_forward(&context(), &request)
            .unwrap_err()
            .message
            .contains("windowCount"));
    }

    #[test]
    fn monte_carlo_defaults_and_simulation_cap() {
        let mut request: MonteCarloRequest =
            decode_request(r#"{"trades": [{"profitPercent": 5}, {"profitPercent": -3}], "seed": 9}"#)
                .unwrap();
        assert_eq!(request.simulations, 1_000);
        assert_eq!(request.initial_capital, 1_000_000.0);
        let result = handle_monte_carlo(&context(), &request).unwrap();
        assert_eq!(result.trade_count, 2);

        request.simulations = 100_001;
        assert_eq!(
            handle_monte_carlo(&context(), &request).unwrap_err().kind,
            ErrorKind::ValidationError
        );
    }

    #[test]
    fn batch_and_portfolio_flow_through_handlers() {
        let mut data = MarketData::new();
        data.insert("AAA", wavy_series(260, 80.0)).unwrap();
        let request: BatchRequest =
            decode_request(r#"{"tickers": ["aaa"], "period": "3y", "minTrades": 0}"#).unwrap();
        let batch = handle_batch(&context(), &data, &request).unwrap();
        assert_eq!(batch.period, BatchPeriod::ThreeYears);
        assert_eq!(batch.tickers.len(), 1);

        let portfolio: PortfolioRequest =
            decode_request(r#"{"assets": [], "method": "risk_parity"}"#).unwrap();
        assert_eq!(portfolio.constraints, WeightConstraints::default());
        assert_eq!(
            handle_portfolio(&portfolio).unwrap_err().kind,
            ErrorKind::ValidationError
        );
    }
}
