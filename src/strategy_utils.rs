use crate::error::{EngineError, EngineResult};
use crate::models::{SignalAction, StrategySignal};
use std::collections::BTreeMap;

/// Create a hold signal (default action when no trade signal is generated)
pub fn hold_signal() -> StrategySignal {
    StrategySignal {
        action: SignalAction::Hold,
        confidence: 0.0,
        indicators: BTreeMap::new(),
    }
}

/// Create a buy signal with the given confidence
pub fn buy_signal(confidence: f64) -> StrategySignal {
    StrategySignal {
        action: SignalAction::Buy,
        confidence: confidence.clamp(0.0, 1.0),
        indicators: BTreeMap::new(),
    }
}

/// Create a sell signal with the given confidence
pub fn sell_signal(confidence: f64) -> StrategySignal {
    StrategySignal {
        action: SignalAction::Sell,
        confidence: confidence.clamp(0.0, 1.0),
        indicators: BTreeMap::new(),
    }
}

/// Confidence that grows with the relative gap between two lines.
pub fn gap_confidence(a: f64, b: f64, scale: f64) -> f64 {
    if b == 0.0 || !a.is_finite() || !b.is_finite() {
        return 0.5;
    }
    ((a - b).abs() / b.abs() * scale + 0.5).min(1.0)
}

/// Longest lookback any strategy accepts.
pub const MAX_PERIOD: usize = 100_000;

pub fn require_period(strategy: &str, name: &str, value: usize) -> EngineResult<usize> {
    if value == 0 || value > MAX_PERIOD {
        return Err(EngineError::validation(format!(
            "{}: {} must be between 1 and {} (value: {})",
            strategy, name, MAX_PERIOD, value
        )));
    }
    Ok(value)
}

pub fn require_ordered_periods(
    strategy: &str,
    fast_name: &str,
    fast: usize,
    slow_name: &str,
    slow: usize,
) -> EngineResult<()> {
    if fast >= slow {
        return Err(EngineError::validation(format!(
            "{}: {} ({}) must be < {} ({})",
            strategy, fast_name, fast, slow_name, slow
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn periods_are_bounded() {
        assert_eq!(require_period("rsi", "period", 14), Ok(14));
        assert_eq!(require_period("rsi", "period", MAX_PERIOD), Ok(MAX_PERIOD));
        assert!(require_period("rsi", "period", 0).is_err());
        let err = require_period("breakout", "entryLookback", usize::MAX).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ValidationError);
    }
}
