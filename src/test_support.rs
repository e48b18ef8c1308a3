use crate::models::Candle;
use chrono::{Duration, NaiveDate};
use std::sync::Once;

static INIT: Once = Once::new();

pub fn init_logging() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

pub fn base_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2020, 1, 1).unwrap()
}

/// Consecutive calendar days starting at 2020-01-01.
pub fn candles_from_closes(closes: &[f64]) -> Vec<Candle> {
    closes
        .iter()
        .enumerate()
        .map(|(i, &close)| Candle {
            date: base_date() + Duration::days(i as i64),
            open: close,
            high: close + 0.5,
            low: close - 0.5,
            close,
            volume: 1_000.0,
            adjusted_close: None,
        })
        .collect()
}

/// Linear rise for the first half, linear fall for the second.
pub fn rise_then_fall(len: usize, start: f64, step: f64) -> Vec<Candle> {
    let peak = len / 2;
    let closes: Vec<f64> = (0..len)
        .map(|i| {
            if i <= peak {
                start + step * i as f64
            } else {
                start + step * peak as f64 - step * (i - peak) as f64
            }
        })
        .collect();
    candles_from_closes(&closes)
}

/// Deterministic noisy series: trend plus two superimposed cycles.
pub fn wavy_series(len: usize, start: f64) -> Vec<Candle> {
    let closes: Vec<f64> = (0..len)
        .map(|i| {
            let t = i as f64;
            start + 0.05 * t + 6.0 * (t / 9.0).sin() + 2.5 * (t / 3.7).cos()
        })
        .collect();
    candles_from_closes(&closes)
}
