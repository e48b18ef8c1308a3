use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::models::*;
use crate::performance::PerformanceCalculator;
use crate::signals::generate_signal_at;
use crate::strategy::{create_strategy, resolve_parameters, Strategy};
use log::{debug, warn};

struct OpenPosition {
    direction: TradeDirection,
    entry_index: usize,
    entry_price: f64,
    quantity: f64,
}

pub struct Engine {
    pub config: EngineConfig,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    // Construct an Engine configured from a parameter map.
    pub fn from_parameters(parameters: &ParameterSet) -> EngineResult<Self> {
        Ok(Self {
            config: EngineConfig::from_parameters(parameters)?,
        })
    }

    pub fn backtest(
        &self,
        strategy: &dyn Strategy,
        parameters: &ParameterSet,
        candles: &[Candle],
    ) -> EngineResult<BacktestRun> {
        self.backtest_from(strategy, parameters, candles, 0)
    }

    /// Simulates bars `trading_start_index..`; earlier bars are visible to the strategy
    /// as indicator history but are never traded or recorded on the equity curve.
    pub fn backtest_from(
        &self,
        strategy: &dyn Strategy,
        parameters: &ParameterSet,
        candles: &[Candle],
        trading_start_index: usize,
    ) -> EngineResult<BacktestRun> {
        validate_candles(candles)?;
        if trading_start_index >= candles.len() {
            return Err(EngineError::validation(format!(
                "Trading start index {} is beyond the last bar ({})",
                trading_start_index,
                candles.len() - 1
            )));
        }

        let initial_capital = self.config.initial_capital;
        let last_index = candles.len() - 1;
        let mut equity = initial_capital;
        let mut peak = initial_capital;
        let mut position: Option<OpenPosition> = None;
        let mut signals = Vec::new();
        let mut trades = Vec::new();
        let mut equity_curve = Vec::with_capacity(candles.len() - trading_start_index);

        for index in trading_start_index..candles.len() {
            if let Some(signal) = generate_signal_at(strategy, candles, index) {
                let action = signal.action;
                signals.push(signal);

                let closes_position = matches!(
                    (position.as_ref().map(|open| open.direction), action),
                    (Some(TradeDirection::Long), SignalAction::Sell)
                        | (Some(TradeDirection::Short), SignalAction::Buy)
                );
                if closes_position {
                    if let Some(open) = position.take() {
                        let trade = self.close_position(open, candles, index, ExitReason::Signal);
                        equity += trade.profit_amount;
                        trades.push(trade);
                    }
                } else if position.is_none() && index < last_index {
                    // A position opened on the final bar could never close after its entry.
                    let direction = match action {
                        SignalAction::Buy => Some(TradeDirection::Long),
                        SignalAction::Sell if self.config.allow_short_selling => {
                            Some(TradeDirection::Short)
                        }
                        _ => None,
                    };
                    if let Some(direction) = direction {
                        position = self.open_position(direction, candles, index, equity);
                    }
                }
            }

            if index == last_index {
                if let Some(open) = position.take() {
                    let trade = self.close_position(open, candles, index, ExitReason::EndOfData);
                    equity += trade.profit_amount;
                    trades.push(trade);
                }
            }

            peak = peak.max(equity);
            let drawdown_percent = if peak > 0.0 {
                ((peak - equity) / peak * 100.0).max(0.0)
            } else {
                0.0
            };
            equity_curve.push(EquityPoint {
                date: candles[index].date,
                equity,
                drawdown_percent,
            });
        }

        let metrics =
            PerformanceCalculator::calculate_metrics(&trades, &equity_curve, initial_capital);
        debug!(
            "Backtest {}: {} bars, {} signals, {} trades, return {:.2}%",
            strategy.template_id(),
            equity_curve.len(),
            signals.len(),
            trades.len(),
            metrics.total_return_percent
        );

        Ok(BacktestRun {
            strategy_id: strategy.template_id().to_string(),
            parameters: parameters.clone(),
            initial_capital,
            start_date: candles.get(trading_start_index).map(|c| c.date),
            end_date: candles.last().map(|c| c.date),
            signals,
            trades,
            equity: equity_curve,
            metrics,
        })
    }

    fn open_position(
        &self,
        direction: TradeDirection,
        candles: &[Candle],
        index: usize,
        equity: f64,
    ) -> Option<OpenPosition> {
        if equity <= 0.0 {
            warn!(
                "Skipping entry on {}: equity exhausted ({:.2})",
                candles[index].date, equity
            );
            return None;
        }
        let close = candles[index].close;
        let entry_price = match direction {
            TradeDirection::Long => close * (1.0 + self.config.slippage_rate),
            TradeDirection::Short => close * (1.0 - self.config.slippage_rate),
        };
        let quantity = equity * self.config.trade_size_ratio / entry_price;
        Some(OpenPosition {
            direction,
            entry_index: index,
            entry_price,
            quantity,
        })
    }

    fn close_position(
        &self,
        open: OpenPosition,
        candles: &[Candle],
        index: usize,
        exit_reason: ExitReason,
    ) -> Trade {
        let close = candles[index].close;
        let (exit_price, gross) = match open.direction {
            TradeDirection::Long => {
                let exit_price = close * (1.0 - self.config.slippage_rate);
                (exit_price, (exit_price - open.entry_price) * open.quantity)
            }
            TradeDirection::Short => {
                let exit_price = close * (1.0 + self.config.slippage_rate);
                (exit_price, (open.entry_price - exit_price) * open.quantity)
            }
        };
        let entry_notional = open.entry_price * open.quantity;
        let commission =
            self.config.commission_rate * (entry_notional + exit_price * open.quantity);
        let profit_amount = gross - commission;
        let profit_percent = if entry_notional > 0.0 {
            profit_amount / entry_notional * 100.0
        } else {
            0.0
        };
        let entry_date = candles[open.entry_index].date;
        let exit_date = candles[index].date;

        Trade {
            entry_date,
            entry_price: open.entry_price,
            exit_date,
            exit_price,
            direction: open.direction,
            quantity: open.quantity,
            profit_percent,
            profit_amount,
            holding_days: (exit_date - entry_date).num_days(),
            exit_reason,
        }
    }
}

/// Bars must be non-empty, strictly increasing in date and carry finite positive prices.
pub fn validate_candles(candles: &[Candle]) -> EngineResult<()> {
    if candles.is_empty() {
        return Err(EngineError::validation("Price series is empty"));
    }
    for (index, candle) in candles.iter().enumerate() {
        let prices = [candle.open, candle.high, candle.low, candle.close];
        if prices.iter().any(|p| !p.is_finite()) || candle.close <= 0.0 {
            return Err(EngineError::calculation(format!(
                "Bar {} ({}) has a missing or invalid price",
                index, candle.date
            )));
        }
        if index > 0 && candle.date <= candles[index - 1].date {
            return Err(EngineError::calculation(format!(
                "Bar dates must be strictly increasing ({} follows {})",
                candle.date,
                candles[index - 1].date
            )));
        }
    }
    Ok(())
}

/// Resolves `strategy_id` against the catalog, merges defaults and runs one backtest.
pub fn run_backtest(
    strategy_id: &str,
    candles: &[Candle],
    parameters: &ParameterSet,
) -> EngineResult<BacktestRun> {
    run_backtest_from(strategy_id, candles, parameters, 0)
}

pub fn run_backtest_from(
    strategy_id: &str,
    candles: &[Candle],
    parameters: &ParameterSet,
    trading_start_index: usize,
) -> EngineResult<BacktestRun> {
    let resolved = resolve_parameters(strategy_id, parameters)?;
    let engine = Engine::from_parameters(&resolved)?;
    let strategy = create_strategy(strategy_id, &resolved)?;
    engine.backtest_from(strategy.as_ref(), &resolved, candles, trading_start_index)
}
