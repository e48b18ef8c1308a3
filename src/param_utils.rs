use crate::models::ParameterSet;

/// Extract a parameter as usize with a default value
pub fn get_param_usize(params: &ParameterSet, key: &str, default: usize) -> usize {
    params
        .get(key)
        .copied()
        .filter(|v| v.is_finite() && *v >= 0.0)
        .map(|v| v.round() as usize)
        .unwrap_or(default)
}

/// Get a parameter value with a default fallback
pub fn get_param(params: &ParameterSet, key: &str, default: f64) -> f64 {
    params.get(key).copied().unwrap_or(default)
}

/// Clamp a raw parameter value to bounds with a finite check
pub fn clamp_f64(value: f64, default: f64, min: f64, max: f64) -> f64 {
    if !value.is_finite() {
        return default;
    }
    value.clamp(min, max)
}

pub fn coerce_binary_param(value: f64, default: f64) -> f64 {
    if !value.is_finite() {
        return default;
    }

    if value >= 0.5 {
        1.0
    } else {
        0.0
    }
}

/// Overlay `overrides` on top of `defaults`; keys only present in `overrides` are kept.
pub fn merge_with_defaults(defaults: &ParameterSet, overrides: &ParameterSet) -> ParameterSet {
    let mut merged = defaults.clone();
    for (key, value) in overrides {
        merged.insert(key.clone(), *value);
    }
    merged
}

/// Stable textual key for a parameter set, used to compare sets across runs.
pub fn parameter_signature(params: &ParameterSet) -> String {
    params
        .iter()
        .map(|(key, value)| format!("{}={}", key, format_param_value(*value)))
        .collect::<Vec<_>>()
        .join(",")
}

fn format_param_value(value: f64) -> String {
    let rounded = (value * 1e8).round() / 1e8;
    if rounded == 0.0 {
        // avoid "-0"
        return "0".to_string();
    }
    format!("{}", rounded)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, f64)]) -> ParameterSet {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn usize_params_round_and_fall_back() {
        let p = params(&[("period", 13.6), ("bad", f64::NAN), ("neg", -3.0)]);
        assert_eq!(get_param_usize(&p, "period", 5), 14);
        assert_eq!(get_param_usize(&p, "bad", 5), 5);
        assert_eq!(get_param_usize(&p, "neg", 5), 5);
        assert_eq!(get_param_usize(&p, "missing", 7), 7);
    }

    #[test]
    fn merge_keeps_defaults_and_overrides() {
        let defaults = params(&[("fast", 10.0), ("slow", 30.0)]);
        let overrides = params(&[("slow", 50.0), ("initialCapital", 1000.0)]);
        let merged = merge_with_defaults(&defaults, &overrides);
        assert_eq!(merged["fast"], 10.0);
        assert_eq!(merged["slow"], 50.0);
        assert_eq!(merged["initialCapital"], 1000.0);
    }

    #[test]
    fn signature_is_order_independent_and_tolerant() {
        let a = params(&[("b", 2.0), ("a", 0.1 + 0.2)]);
        let b = params(&[("a", 0.3), ("b", 2.0)]);
        assert_eq!(parameter_signature(&a), parameter_signature(&b));
        assert_eq!(parameter_signature(&a), "a=0.3,b=2");
    }
}
