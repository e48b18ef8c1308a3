use crate::models::{Candle, Signal, SignalAction, StrategySignal};
use crate::strategy::Strategy;

/// Builds a `Signal` when the action is tradable; `None` for holds.
/// Non-finite confidence is dropped rather than reported.
pub fn maybe_create_signal(candle: &Candle, decision: StrategySignal) -> Option<Signal> {
    if !matches!(decision.action, SignalAction::Buy | SignalAction::Sell) {
        return None;
    }

    let confidence = if decision.confidence.is_finite() {
        Some(decision.confidence)
    } else {
        None
    };

    Some(Signal {
        date: candle.date,
        action: decision.action,
        price: candle.close,
        confidence,
        indicators: decision.indicators,
    })
}

/// Evaluates `strategy` at `candle_index`, handing it only the bars up to and including
/// that index so no rule can read future prices.
pub fn generate_signal_at(
    strategy: &dyn Strategy,
    candles: &[Candle],
    candle_index: usize,
) -> Option<Signal> {
    if candle_index >= candles.len() {
        return None;
    }
    let prefix = &candles[..=candle_index];
    if prefix.len() < strategy.min_data_points() {
        return None;
    }
    let decision = strategy.generate_signal(prefix);
    maybe_create_signal(&candles[candle_index], decision)
}
