use crate::error::{EngineError, EngineResult};
use crate::indicators;
use crate::models::*;
use crate::param_utils::{get_param, get_param_usize};
use crate::strategy_utils::{buy_signal, hold_signal, require_period, sell_signal};

pub const TEMPLATE_ID: &str = "rsi";

pub fn template() -> StrategyTemplate {
    StrategyTemplate {
        id: TEMPLATE_ID.to_string(),
        name: "RSI Reversal".to_string(),
        description: "Buys oversold readings and sells overbought ones".to_string(),
        category: "oscillator".to_string(),
        parameters: vec![
            super::parameter("period", 7.0, 28.0, 7.0, 14.0, "RSI lookback"),
            super::parameter("oversoldLevel", 20.0, 40.0, 5.0, 30.0, "Buy below this RSI"),
            super::parameter("overboughtLevel", 60.0, 80.0, 5.0, 70.0, "Sell above this RSI"),
        ],
    }
}

pub struct RSIStrategy {
    period: usize,
    oversold_level: f64,
    overbought_level: f64,
}

impl RSIStrategy {
    pub fn new(parameters: &ParameterSet) -> EngineResult<Self> {
        let period = require_period(
            TEMPLATE_ID,
            "period",
            get_param_usize(parameters, "period", 14),
        )?;
        let oversold_level = get_param(parameters, "oversoldLevel", 30.0);
        let overbought_level = get_param(parameters, "overboughtLevel", 70.0);
        if !(0.0..100.0).contains(&oversold_level)
            || !(0.0..=100.0).contains(&overbought_level)
            || oversold_level >= overbought_level
        {
            return Err(EngineError::validation(format!(
                "{}: levels must satisfy 0 <= oversoldLevel ({}) < overboughtLevel ({}) <= 100",
                TEMPLATE_ID, oversold_level, overbought_level
            )));
        }
        Ok(Self {
            period,
            oversold_level,
            overbought_level,
        })
    }
}

impl super::Strategy for RSIStrategy {
    fn template_id(&self) -> &str {
        TEMPLATE_ID
    }

    fn generate_signal(&self, candles: &[Candle]) -> StrategySignal {
        if candles.len() < self.min_data_points() {
            return hold_signal();
        }
        let prices = indicators::closes(candles);
        let Some(&current_rsi) = indicators::calculate_rsi(&prices, self.period).last() else {
            return hold_signal();
        };

        // Buy signal: RSI is oversold
        let signal = if current_rsi < self.oversold_level {
            buy_signal((self.oversold_level - current_rsi) / self.oversold_level.max(1.0) + 0.5)
        // Sell signal: RSI is overbought
        } else if current_rsi > self.overbought_level {
            sell_signal(
                (current_rsi - self.overbought_level) / (100.0 - self.overbought_level).max(1.0)
                    + 0.5,
            )
        } else {
            hold_signal()
        };
        signal.with_indicator("rsi", current_rsi)
    }

    fn min_data_points(&self) -> usize {
        self.period.saturating_add(1)
    }
}
