use crate::error::{EngineError, EngineResult};
use crate::indicators;
use crate::models::*;
use crate::param_utils::{get_param, get_param_usize};
use crate::strategy_utils::{buy_signal, hold_signal, require_period, sell_signal};

pub const TEMPLATE_ID: &str = "mean_reversion";

pub fn template() -> StrategyTemplate {
    StrategyTemplate {
        id: TEMPLATE_ID.to_string(),
        name: "Mean Reversion".to_string(),
        description: "Buys when price is stretched below its rolling mean, exits on reversion"
            .to_string(),
        category: "mean_reversion".to_string(),
        parameters: vec![
            super::parameter("period", 10.0, 50.0, 5.0, 20.0, "Rolling window length"),
            super::parameter("entryZ", 1.0, 3.0, 0.5, 2.0, "Z-score below the mean to enter"),
            super::parameter("exitZ", 0.0, 1.0, 0.5, 0.0, "Z-score above the mean to exit"),
        ],
    }
}

pub struct MeanReversionStrategy {
    period: usize,
    entry_z: f64,
    exit_z: f64,
}

impl MeanReversionStrategy {
    pub fn new(parameters: &ParameterSet) -> EngineResult<Self> {
        let period = require_period(
            TEMPLATE_ID,
            "period",
            get_param_usize(parameters, "period", 20),
        )?;
        if period < 2 {
            return Err(EngineError::validation(format!(
                "{}: period must be >= 2",
                TEMPLATE_ID
            )));
        }
        let entry_z = get_param(parameters, "entryZ", 2.0);
        let exit_z = get_param(parameters, "exitZ", 0.0);
        if !entry_z.is_finite() || entry_z <= 0.0 {
            return Err(EngineError::validation(format!(
                "{}: entryZ must be > 0 (value: {})",
                TEMPLATE_ID, entry_z
            )));
        }
        if !exit_z.is_finite() || exit_z <= -entry_z {
            return Err(EngineError::validation(format!(
                "{}: exitZ must be > -entryZ (value: {})",
                TEMPLATE_ID, exit_z
            )));
        }
        Ok(Self {
            period,
            entry_z,
            exit_z,
        })
    }
}

impl super::Strategy for MeanReversionStrategy {
    fn template_id(&self) -> &str {
        TEMPLATE_ID
    }

    fn generate_signal(&self, candles: &[Candle]) -> StrategySignal {
        let prices = indicators::closes(candles);
        let Some((mean, std)) = indicators::rolling_mean_std(&prices, self.period) else {
            return hold_signal();
        };
        let Some(&close) = prices.last() else {
            return hold_signal();
        };
        if std <= f64::EPSILON * mean.abs().max(1.0) {
            return hold_signal();
        }

        let z = (close - mean) / std;
        let signal = if z <= -self.entry_z {
            buy_signal(0.5 + (-z - self.entry_z) / self.entry_z)
        } else if z >= self.exit_z {
            sell_signal(0.5 + (z - self.exit_z).min(0.5))
        } else {
            hold_signal()
        };
        signal
            .with_indicator("zScore", z)
            .with_indicator("rollingMean", mean)
    }

    fn min_data_points(&self) -> usize {
        self.period
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::Strategy;
    use crate::test_support::candles_from_closes;

    #[test]
    fn buys_the_dip_and_sells_the_recovery() {
        let s = MeanReversionStrategy::new(&template().default_parameters()).unwrap();
        let mut closes = vec![100.0, 101.0, 99.0, 100.0, 101.0, 99.0, 100.0, 101.0, 99.0, 100.0];
        closes.extend_from_slice(&[100.0, 101.0, 99.0, 100.0, 101.0, 99.0, 100.0, 101.0, 99.0]);
        closes.push(90.0);
        let candles = candles_from_closes(&closes);
        let dip = s.generate_signal(&candles);
        assert_eq!(dip.action, SignalAction::Buy);
        assert!(dip.indicators["zScore"] < -2.0);

        let mut recovered = closes.clone();
        recovered.push(104.0);
        let candles = candles_from_closes(&recovered);
        assert_eq!(s.generate_signal(&candles).action, SignalAction::Sell);
    }

    #[test]
    fn flat_series_holds() {
        let s = MeanReversionStrategy::new(&template().default_parameters()).unwrap();
        let candles = candles_from_closes(&[50.0; 25]);
        assert_eq!(s.generate_signal(&candles).action, SignalAction::Hold);
    }

    #[test]
    fn rejects_non_positive_entry_threshold() {
        let mut params = template().default_parameters();
        params.insert("entryZ".to_string(), 0.0);
        assert!(MeanReversionStrategy::new(&params).is_err());
    }
}
