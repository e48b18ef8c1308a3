use crate::error::EngineResult;
use crate::indicators;
use crate::models::*;
use crate::param_utils::get_param_usize;
use crate::strategy_utils::{buy_signal, gap_confidence, hold_signal, require_period, sell_signal};

pub const TEMPLATE_ID: &str = "breakout";

pub fn template() -> StrategyTemplate {
    StrategyTemplate {
        id: TEMPLATE_ID.to_string(),
        name: "Channel Breakout".to_string(),
        description: "Buys a close above the prior N-bar high, exits below the prior M-bar low"
            .to_string(),
        category: "trend".to_string(),
        parameters: vec![
            super::parameter("entryLookback", 10.0, 60.0, 5.0, 20.0, "Bars in the entry channel"),
            super::parameter("exitLookback", 5.0, 30.0, 5.0, 10.0, "Bars in the exit channel"),
        ],
    }
}

pub struct BreakoutStrategy {
    entry_lookback: usize,
    exit_lookback: usize,
}

impl BreakoutStrategy {
    pub fn new(parameters: &ParameterSet) -> EngineResult<Self> {
        Ok(Self {
            entry_lookback: require_period(
                TEMPLATE_ID,
                "entryLookback",
                get_param_usize(parameters, "entryLookback", 20),
            )?,
            exit_lookback: require_period(
                TEMPLATE_ID,
                "exitLookback",
                get_param_usize(parameters, "exitLookback", 10),
            )?,
        })
    }
}

impl super::Strategy for BreakoutStrategy {
    fn template_id(&self) -> &str {
        TEMPLATE_ID
    }

    fn generate_signal(&self, candles: &[Candle]) -> StrategySignal {
        let (Some((entry_high, _)), Some((_, exit_low))) = (
            indicators::prior_channel(candles, self.entry_lookback),
            indicators::prior_channel(candles, self.exit_lookback),
        ) else {
            return hold_signal();
        };
        let Some(close) = candles.last().map(|c| c.close) else {
            return hold_signal();
        };

        let signal = if close > entry_high {
            buy_signal(gap_confidence(close, entry_high, 20.0))
        } else if close < exit_low {
            sell_signal(gap_confidence(close, exit_low, 20.0))
        } else {
            hold_signal()
        };

        signal
            .with_indicator("channelHigh", entry_high)
            .with_indicator("channelLow", exit_low)
    }

    fn min_data_points(&self) -> usize {
        self.entry_lookback.max(self.exit_lookback).saturating_add(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::Strategy;
    use crate::test_support::candles_from_closes;

    #[test]
    fn oversized_lookbacks_are_rejected() {
        let mut params = ParameterSet::new();
        params.insert("entryLookback".to_string(), 1e30);
        let err = BreakoutStrategy::new(&params).err().unwrap();
        assert!(matches!(err, crate::error::EngineError::Validation(_)));
    }

    #[test]
    fn breaks_out_above_prior_high_and_exits_below_prior_low() {
        let mut params = ParameterSet::new();
        params.insert("entryLookback".to_string(), 3.0);
        params.insert("exitLookback".to_string(), 2.0);
        let s = BreakoutStrategy::new(&params).unwrap();
        assert_eq!(s.min_data_points(), 4);

        let candles = candles_from_closes(&[10.0, 10.0, 10.0, 15.0, 15.0, 5.0]);
        assert_eq!(s.generate_signal(&candles[..3]).action, SignalAction::Hold);
        assert_eq!(s.generate_signal(&candles[..4]).action, SignalAction::Buy);
        assert_eq!(s.generate_signal(&candles[..5]).action, SignalAction::Hold);
        assert_eq!(s.generate_signal(&candles[..6]).action, SignalAction::Sell);
    }
}
