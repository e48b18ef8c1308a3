use crate::models::*;

pub const TEMPLATE_ID: &str = "buy_and_hold";

pub fn template() -> StrategyTemplate {
    StrategyTemplate {
        id: TEMPLATE_ID.to_string(),
        name: "Buy and Hold".to_string(),
        description: "Enters on the first bar and holds to the end of the series".to_string(),
        category: "benchmark".to_string(),
        parameters: Vec::new(),
    }
}

pub struct BuyAndHoldStrategy;

impl BuyAndHoldStrategy {
    pub fn new(_parameters: &ParameterSet) -> Self {
        Self
    }
}

impl super::Strategy for BuyAndHoldStrategy {
    fn template_id(&self) -> &str {
        TEMPLATE_ID
    }

    fn generate_signal(&self, _candles: &[Candle]) -> StrategySignal {
        // Repeated buys are ignored by the engine while the position is open.
        crate::strategy_utils::buy_signal(1.0)
    }

    fn min_data_points(&self) -> usize {
        1
    }
}
