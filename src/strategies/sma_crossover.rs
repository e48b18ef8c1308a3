use crate::error::EngineResult;
use crate::indicators;
use crate::models::*;
use crate::param_utils::get_param_usize;
use crate::strategy_utils::{
    buy_signal, gap_confidence, hold_signal, require_ordered_periods, require_period, sell_signal,
};

pub const TEMPLATE_ID: &str = "sma_crossover";

pub fn template() -> StrategyTemplate {
    StrategyTemplate {
        id: TEMPLATE_ID.to_string(),
        name: "SMA Crossover".to_string(),
        description: "Long while the fast simple moving average is above the slow one".to_string(),
        category: "trend".to_string(),
        parameters: vec![
            super::parameter("fastPeriod", 5.0, 50.0, 5.0, 10.0, "Fast SMA length"),
            super::parameter("slowPeriod", 20.0, 200.0, 10.0, 30.0, "Slow SMA length"),
        ],
    }
}

pub struct SmaCrossoverStrategy {
    fast_period: usize,
    slow_period: usize,
}

impl SmaCrossoverStrategy {
    pub fn new(parameters: &ParameterSet) -> EngineResult<Self> {
        let fast_period = require_period(
            TEMPLATE_ID,
            "fastPeriod",
            get_param_usize(parameters, "fastPeriod", 10),
        )?;
        let slow_period = require_period(
            TEMPLATE_ID,
            "slowPeriod",
            get_param_usize(parameters, "slowPeriod", 30),
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
        })
    }
}

impl super::Strategy for SmaCrossoverStrategy {
    fn template_id(&self) -> &str {
        TEMPLATE_ID
    }

    fn generate_signal(&self, candles: &[Candle]) -> StrategySignal {
        let prices = indicators::closes(candles);
        let (Some(fast), Some(slow)) = (
            indicators::sma_at(&prices, self.fast_period, 0),
            indicators::sma_at(&prices, self.slow_period, 0),
        ) else {
            return hold_signal();
        };

        let confidence = gap_confidence(fast, slow, 10.0);
        let previous = indicators::sma_at(&prices, self.fast_period, 1)
            .zip(indicators::sma_at(&prices, self.slow_period, 1));

        let signal = match previous {
            // First bar with both averages: act on the prevailing regime.
            None if fast > slow => buy_signal(confidence),
            None if fast < slow => sell_signal(confidence),
            Some((prev_fast, prev_slow)) if prev_fast <= prev_slow && fast > slow => {
                buy_signal(confidence)
            }
            Some((prev_fast, prev_slow)) if prev_fast >= prev_slow && fast < slow => {
                sell_signal(confidence)
            }
            _ => hold_signal(),
        };

        signal
            .with_indicator("smaFast", fast)
            .with_indicator("smaSlow", slow)
    }

    fn min_data_points(&self) -> usize {
        self.slow_period
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::Strategy;
    use crate::test_support::candles_from_closes;

    fn strategy(fast: f64, slow: f64) -> SmaCrossoverStrategy {
        let mut params = ParameterSet::new();
        params.insert("fastPeriod".to_string(), fast);
        params.insert("slowPeriod".to_string(), slow);
        SmaCrossoverStrategy::new(&params).unwrap()
    }

    #[test]
    fn fast_must_be_shorter_than_slow() {
        let mut params = ParameterSet::new();
        params.insert("fastPeriod".to_string(), 30.0);
        params.insert("slowPeriod".to_string(), 30.0);
        assert!(SmaCrossoverStrategy::new(&params).is_err());
    }

    #[test]
    fn first_evaluable_bar_follows_regime() {
        let candles = candles_from_closes(&(0..10).map(|i| 100.0 + i as f64).collect::<Vec<_>>());
        let s = strategy(2.0, 5.0);
        assert_eq!(s.generate_signal(&candles[..4]).action, SignalAction::Hold);
        let first = s.generate_signal(&candles[..5]);
        assert_eq!(first.action, SignalAction::Buy);
        assert!(first.indicators.contains_key("smaFast"));
        // still trending, no new cross
        assert_eq!(s.generate_signal(&candles[..6]).action, SignalAction::Hold);
    }

    #[test]
    fn detects_bearish_cross() {
        let mut closes: Vec<f64> = (0..10).map(|i| 100.0 + i as f64).collect();
        closes.extend((0..10).map(|i| 108.0 - 3.0 * i as f64));
        let candles = candles_from_closes(&closes);
        let s = strategy(2.0, 5.0);
        let sells = (5..=candles.len())
            .filter(|&end| s.generate_signal(&candles[..end]).action == SignalAction::Sell)
            .count();
        assert_eq!(sells, 1);
    }
}
