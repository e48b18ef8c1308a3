use crate::error::{EngineError, EngineResult};
use crate::models::*;
use std::sync::OnceLock;

/// Signal rule evaluated on a prefix of the series; the last candle is the current bar.
pub trait Strategy: Send + Sync {
    fn template_id(&self) -> &str;
    fn generate_signal(&self, candles: &[Candle]) -> StrategySignal;
    /// Bars required before the rule can say anything other than hold.
    fn min_data_points(&self) -> usize;
}

#[path = "strategies/sma_crossover.rs"]
pub mod sma_crossover;

pub use sma_crossover::SmaCrossoverStrategy;

#[path = "strategies/breakout.rs"]
pub mod breakout;

pub use breakout::BreakoutStrategy;

#[path = "strategies/mean_reversion.rs"]
pub mod mean_reversion;

pub use mean_reversion::MeanReversionStrategy;

#[path = "strategies/rsi.rs"]
pub mod rsi;

pub use rsi::RSIStrategy;

#[path = "strategies/macd.rs"]
pub mod macd;

pub use macd::MACDStrategy;

#[path = "strategies/buy_and_hold.rs"]
pub mod buy_and_hold;

pub use buy_and_hold::BuyAndHoldStrategy;

static CATALOG: OnceLock<Vec<StrategyTemplate>> = OnceLock::new();

/// Every registered strategy template, built on first use.
pub fn catalog() -> &'static [StrategyTemplate] {
    CATALOG.get_or_init(|| {
        vec![
            sma_crossover::template(),
            breakout::template(),
            mean_reversion::template(),
            rsi::template(),
            macd::template(),
            buy_and_hold::template(),
        ]
    })
}

pub fn find_template(template_id: &str) -> EngineResult<&'static StrategyTemplate> {
    catalog()
        .iter()
        .find(|template| template.id == template_id)
        .ok_or_else(|| EngineError::UnknownStrategy(template_id.to_string()))
}

/// Catalog defaults overlaid with `parameters`.
pub fn resolve_parameters(
    template_id: &str,
    parameters: &ParameterSet,
) -> EngineResult<ParameterSet> {
    let template = find_template(template_id)?;
    for name in parameters.keys() {
        let known = template.parameters.iter().any(|p| &p.name == name)
            || crate::config::ENGINE_PARAMETER_NAMES.contains(&name.as_str());
        if !known {
            log::debug!("Parameter '{}' is not used by {}", name, template_id);
        }
    }
    Ok(crate::param_utils::merge_with_defaults(
        &template.default_parameters(),
        parameters,
    ))
}

pub fn create_strategy(
    template_id: &str,
    parameters: &ParameterSet,
) -> EngineResult<Box<dyn Strategy>> {
    match template_id {
        "sma_crossover" => Ok(Box::new(SmaCrossoverStrategy::new(parameters)?)),
        "breakout" => Ok(Box::new(BreakoutStrategy::new(parameters)?)),
        "mean_reversion" => Ok(Box::new(MeanReversionStrategy::new(parameters)?)),
        "rsi" => Ok(Box::new(RSIStrategy::new(parameters)?)),
        "macd" => Ok(Box::new(MACDStrategy::new(parameters)?)),
        "buy_and_hold" => Ok(Box::new(BuyAndHoldStrategy::new(parameters))),
        _ => Err(EngineError::UnknownStrategy(template_id.to_string())),
    }
}

pub(crate) fn parameter(
    name: &str,
    min: f64,
    max: f64,
    step: f64,
    default: f64,
    description: &str,
) -> StrategyParameter {
    StrategyParameter {
        name: name.to_string(),
        min,
        max,
        step,
        default,
        description: description.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_catalog_entry_builds_with_defaults() {
        for template in catalog() {
            let strategy = create_strategy(&template.id, &template.default_parameters())
                .unwrap_or_else(|err| panic!("{} failed: {}", template.id, err));
            assert_eq!(strategy.template_id(), template.id);
            for range in template.default_ranges() {
                range.validate().unwrap();
            }
            for param in &template.parameters {
                assert!(param.default >= param.min && param.default <= param.max);
            }
        }
    }

    #[test]
    fn unknown_ids_are_reported() {
        let err = create_strategy("nope", &ParameterSet::new()).err().unwrap();
        assert_eq!(err, EngineError::UnknownStrategy("nope".to_string()));
        assert!(find_template("nope").is_err());
    }

    #[test]
    fn resolve_parameters_fills_missing_defaults() {
        let mut overrides = ParameterSet::new();
        overrides.insert("slowPeriod".to_string(), 50.0);
        let resolved = resolve_parameters("sma_crossover", &overrides).unwrap();
        assert_eq!(resolved["slowPeriod"], 50.0);
        assert_eq!(resolved["fastPeriod"], 10.0);
    }
}
