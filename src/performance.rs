use crate::models::*;
use statrs::statistics::Statistics;

const TRADING_DAYS_PER_YEAR: f64 = 252.0;
const RISK_FREE_RATE: f64 = 0.02;

pub struct PerformanceCalculator;

impl PerformanceCalculator {
    /// Metrics are a pure function of the closed trades and the equity curve.
    pub fn calculate_metrics(
        trades: &[Trade],
        equity: &[EquityPoint],
        initial_capital: f64,
    ) -> BacktestMetrics {
        let total_trades = trades.len();
        let trade_percents: Vec<f64> = trades.iter().map(|t| t.profit_percent).collect();
        let winning_trades = trades.iter().filter(|t| t.profit_amount > 0.0).count();
        let losing_trades = trades.iter().filter(|t| t.profit_amount < 0.0).count();
        let win_rate = if total_trades > 0 {
            winning_trades as f64 / total_trades as f64 * 100.0
        } else {
            0.0
        };

        let final_equity = equity
            .last()
            .map(|point| point.equity)
            .filter(|value| value.is_finite())
            .unwrap_or(initial_capital);
        let total_return_percent = if initial_capital > 0.0 {
            (final_equity / initial_capital - 1.0) * 100.0
        } else {
            0.0
        };

        let annualized_return_percent =
            Self::calculate_cagr(initial_capital, final_equity, equity) * 100.0;
        let max_drawdown_percent = Self::calculate_max_drawdown_percent(equity);
        let sharpe_ratio = Self::calculate_sharpe_ratio(equity);
        let calmar_ratio =
            Self::calculate_calmar_ratio(annualized_return_percent, max_drawdown_percent);
        let profit_factor = Self::calculate_profit_factor(trades);

        let best_trade_percent = trade_percents
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        let worst_trade_percent = trade_percents.iter().copied().fold(f64::INFINITY, f64::min);
        let holding_days: Vec<f64> = trades.iter().map(|t| t.holding_days as f64).collect();

        BacktestMetrics {
            total_trades,
            winning_trades,
            losing_trades,
            win_rate,
            total_return_percent,
            annualized_return_percent,
            max_drawdown_percent,
            sharpe_ratio,
            calmar_ratio,
            profit_factor,
            avg_trade_return_percent: Self::average(&trade_percents),
            best_trade_percent: finite_or_zero(best_trade_percent),
            worst_trade_percent: finite_or_zero(worst_trade_percent),
            avg_holding_days: Self::average(&holding_days),
            final_equity,
        }
    }

    fn calculate_cagr(initial_capital: f64, final_equity: f64, equity: &[EquityPoint]) -> f64 {
        if initial_capital <= 0.0 || !final_equity.is_finite() {
            return 0.0;
        }
        let (Some(first), Some(last)) = (equity.first(), equity.last()) else {
            return 0.0;
        };
        let days = (last.date - first.date).num_days();
        if days <= 0 {
            return 0.0;
        }
        let years = days as f64 / 365.25;

        let total_return_ratio = final_equity / initial_capital;
        if total_return_ratio <= 0.0 {
            return -1.0;
        }

        total_return_ratio.powf(1.0 / years) - 1.0
    }

    fn average(values: &[f64]) -> f64 {
        let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        if finite.is_empty() {
            0.0
        } else {
            finite.mean()
        }
    }

    /// Annualised Sharpe of bar-to-bar equity returns against a 2% risk-free rate.
    /// A curve with no variation reports 0 when flat and a signed infinity otherwise.
    pub fn calculate_sharpe_ratio(equity: &[EquityPoint]) -> f64 {
        if equity.len() < 2 {
            return 0.0;
        }

        let returns: Vec<f64> = equity
            .windows(2)
            .map(|window| {
                let prev_value = window[0].equity;
                if prev_value > 0.0 {
                    (window[1].equity - prev_value) / prev_value
                } else {
                    0.0
                }
            })
            .collect();

        let mean_return = returns.iter().mean();
        let std_dev = returns.iter().std_dev();

        if !std_dev.is_finite() || std_dev == 0.0 {
            return if mean_return == 0.0 {
                0.0
            } else {
                f64::INFINITY.copysign(mean_return)
            };
        }

        let annualized_return = mean_return * TRADING_DAYS_PER_YEAR;
        let annualized_volatility = std_dev * TRADING_DAYS_PER_YEAR.sqrt();

        (annualized_return - RISK_FREE_RATE) / annualized_volatility
    }

    /// CAGR over max drawdown. Without a drawdown the ratio is a signed infinity,
    /// or 0 when the return is flat as well.
    pub fn calculate_calmar_ratio(
        annualized_return_percent: f64,
        max_drawdown_percent: f64,
    ) -> f64 {
        if !annualized_return_percent.is_finite() || !max_drawdown_percent.is_finite() {
            return 0.0;
        }

        if max_drawdown_percent.abs() <= f64::EPSILON {
            return if annualized_return_percent == 0.0 {
                0.0
            } else {
                f64::INFINITY.copysign(annualized_return_percent)
            };
        }

        annualized_return_percent / max_drawdown_percent.abs()
    }

    /// Gross profit over gross loss; `+inf` when there are winners and no losers.
    pub fn calculate_profit_factor(trades: &[Trade]) -> f64 {
        let gross_profit: f64 = trades
            .iter()
            .map(|t| t.profit_amount)
            .filter(|p| *p > 0.0)
            .sum();
        let gross_loss: f64 = trades
            .iter()
            .map(|t| t.profit_amount)
            .filter(|p| *p < 0.0)
            .map(f64::abs)
            .sum();

        if gross_loss > 0.0 {
            gross_profit / gross_loss
        } else if gross_profit > 0.0 {
            f64::INFINITY
        } else {
            0.0
        }
    }

    fn calculate_max_drawdown_percent(equity: &[EquityPoint]) -> f64 {
        equity
            .iter()
            .map(|point| point.drawdown_percent)
            .filter(|value| value.is_finite())
            .fold(0.0, f64::max)
    }
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}
