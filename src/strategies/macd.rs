use crate::error::EngineResult;
use crate::indicators;
use crate::models::*;
use crate::param_utils::get_param_usize;
use crate::strategy_utils::{
    buy_signal, gap_confidence, hold_signal, require_ordered_periods, require_period, sell_signal,
};

pub const TEMPLATE_ID: &str = "macd";

pub fn template() -> StrategyTemplate {
    StrategyTemplate {
        id: TEMPLATE_ID.to_string(),
        name: "MACD Signal Cross".to_string(),
        description: "Trades MACD line crosses of its signal line".to_string(),
        category: "momentum".to_string(),
        parameters: vec![
            super::parameter("fastPeriod", 8.0, 16.0, 2.0, 12.0, "Fast EMA length"),
            super::parameter("slowPeriod", 20.0, 34.0, 2.0, 26.0, "Slow EMA length"),
            super::parameter("signalPeriod", 5.0, 13.0, 2.0, 9.0, "Signal EMA length"),
        ],
    }
}

pub struct MACDStrategy {
    fast_period: usize,
    slow_period: usize,
    signal_period: usize,
}

impl MACDStrategy {
    pub fn new(parameters: &ParameterSet) -> EngineResult<Self> {
        let fast_period = require_period(
            TEMPLATE_ID,
            "fastPeriod",
            get_param_usize(parameters, "fastPeriod", 12),
        )?;
        let slow_period = require_period(
            TEMPLATE_ID,
            "slowPeriod",
            get_param_usize(parameters, "slowPeriod", 26),
        )?;
        let signal_period = require_period(
            TEMPLATE_ID,
            "signalPeriod",
            get_param_usize(parameters, "signalPeriod", 9),
        )?;
        require_ordered_periods(
            TEMPLATE_ID,
            "fastPeriod",
            fast_period,
            "slowPeriod",
            slow_period,
        )?;
        Ok(Self {
            fast_period,
            slow_period,
            signal_period,
        })
    }
}

impl super::Strategy for MACDStrategy {
    fn template_id(&self) -> &str {
        TEMPLATE_ID
    }

    fn generate_signal(&self, candles: &[Candle]) -> StrategySignal {
        if candles.len() < self.min_data_points() {
            return hold_signal();
        }
        let prices = indicators::closes(candles);
        let (macd_line, signal_line, _histogram) = indicators::calculate_macd(
            &prices,
            self.fast_period,
            self.slow_period,
            self.signal_period,
        );

        let n = macd_line.len();
        if n < 2 || signal_line.len() < 2 {
            return hold_signal();
        }
        let (prev_macd, current_macd) = (macd_line[n - 2], macd_line[n - 1]);
        let (prev_signal, current_signal) = (signal_line[n - 2], signal_line[n - 1]);
        let confidence = gap_confidence(current_macd, current_signal, 10.0);

        // MACD line crossing above signal line (bullish)
        let signal = if prev_macd <= prev_signal && current_macd > current_signal {
            buy_signal(confidence)
        // MACD line crossing below signal line (bearish)
        } else if prev_macd >= prev_signal && current_macd < current_signal {
            sell_signal(confidence)
        } else {
            hold_signal()
        };
        signal
            .with_indicator("macd", current_macd)
            .with_indicator("macdSignal", current_signal)
    }

    fn min_data_points(&self) -> usize {
        self.slow_period.saturating_add(self.signal_period)
    }
}
