//! Strategy scoring: per-bar strategy returns, compounding, Sharpe and
//! drawdown.

use serde::Serialize;
use serde_json::json;

use crate::data::{validate_bars, Bar};
use crate::error::{PipelineError, Result};
use crate::features::daily_return;
use crate::indicators::RunningMax;
use crate::logging::{obj, v_num, v_str, Domain, Level, Logger};
use crate::signals::{Action, Signal};

pub const TRADING_DAYS: f64 = 252.0;

/// Return earned on one bar by taking `action` at its open.
pub fn strategy_return(daily_return: f64, action: Action) -> f64 {
    match action {
        Action::Buy => daily_return,
        Action::Sell => -daily_return,
        Action::Hold => 0.0,
    }
}

/// Running product of `1 + r`, starting from a basis of 1.
pub fn cumulative_return_series(returns: &[f64]) -> Vec<f64> {
    let mut acc = 1.0;
    returns
        .iter()
        .map(|r| {
            acc *= 1.0 + r;
            acc
        })
        .collect()
}

/// Annualised mean over population standard deviation, risk-free rate 0.
pub fn sharpe_ratio(returns: &[f64], annualization: f64) -> Result<f64> {
    if returns.is_empty() {
        return Err(PipelineError::degenerate("Sharpe ratio of an empty series"));
    }
    let n = returns.len() as f64;
    // Deviations from the first value keep a constant series at exactly zero spread.
    let base = returns[0];
    let shifted_mean = returns.iter().map(|r| r - base).sum::<f64>() / n;
    let var = returns
        .iter()
        .map(|r| {
            let d = r - base - shifted_mean;
            d * d
        })
        .sum::<f64>()
        / n;
    let std = var.sqrt();
    if !(std > 0.0) || !std.is_finite() {
        return Err(PipelineError::degenerate(
            "strategy returns have zero variance; Sharpe ratio undefined",
        ));
    }
    Ok((base + shifted_mean) / std * annualization.sqrt())
}

/// `(cum - peak) / peak` at every bar.
pub fn drawdown_series(cumulative: &[f64]) -> Vec<f64> {
    let mut peak = RunningMax::default();
    cumulative
        .iter()
        .map(|&c| {
            let p = peak.update(c);
            if p > 0.0 {
                (c - p) / p
            } else {
                0.0
            }
        })
        .collect()
}

/// Worst drawdown; 0 for a non-decreasing series.
pub fn max_drawdown(cumulative: &[f64]) -> f64 {
    drawdown_series(cumulative).into_iter().fold(0.0, f64::min)
}

pub fn final_cumulative_return(cumulative: &[f64]) -> Option<f64> {
    cumulative.last().copied()
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceMetrics {
    pub cumulative_return: f64,
    /// `None` when the strategy returns have zero variance
    pub sharpe_ratio: Option<f64>,
    pub max_drawdown: f64,
    /// Final cumulative value of holding long every bar
    pub buy_hold_return: f64,
    pub bars: usize,
}

impl PerformanceMetrics {
    /// Sharpe ratio, with the undefined case as an error.
    pub fn sharpe(&self) -> Result<f64> {
        self.sharpe_ratio.ok_or_else(|| {
            PipelineError::degenerate("strategy returns have zero variance; Sharpe ratio undefined")
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    pub metrics: PerformanceMetrics,
    pub daily_return: Vec<f64>,
    pub strategy_return: Vec<f64>,
    pub cumulative_return: Vec<f64>,
    pub drawdown: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct PerformanceEvaluator {
    pub annualization: f64,
}

impl Default for PerformanceEvaluator {
    fn default() -> Self {
        Self { annualization: TRADING_DAYS }
    }
}

impl PerformanceEvaluator {
    pub fn new(annualization: f64) -> Self {
        Self { annualization }
    }

    /// Score `signals` against `bars`. Bars must pass [`validate_bars`] and
    /// both must cover the same dates in the same order.
    pub fn evaluate(&self, bars: &[Bar], signals: &[Signal], log: &Logger) -> Result<PerformanceReport> {
        validate_bars(bars)?;
        if bars.len() != signals.len() {
            return Err(PipelineError::data(format!(
                "{} bars but {} signals",
                bars.len(),
                signals.len()
            )));
        }
        if let Some((b, s)) = bars.iter().zip(signals).find(|(b, s)| b.date != s.date) {
            return Err(PipelineError::data(format!(
                "bar {} aligned with signal {}",
                b.date, s.date
            )));
        }

        let daily = daily_return(bars)?;
        let strat: Vec<f64> = daily
            .iter()
            .zip(signals)
            .map(|(r, s)| strategy_return(*r, s.action))
            .collect();
        let cumulative = cumulative_return_series(&strat);
        let drawdown = drawdown_series(&cumulative);

        let sharpe = match sharpe_ratio(&strat, self.annualization) {
            Ok(v) => Some(v),
            Err(e) => {
                log.log(
                    Level::Warn,
                    Domain::Performance,
                    "sharpe_undefined",
                    obj(&[("msg", v_str(&e.to_string()))]),
                );
                None
            }
        };

        let buy_hold = cumulative_return_series(&daily);
        let metrics = PerformanceMetrics {
            cumulative_return: final_cumulative_return(&cumulative).unwrap_or(1.0),
            sharpe_ratio: sharpe,
            max_drawdown: drawdown.iter().copied().fold(0.0, f64::min),
            buy_hold_return: final_cumulative_return(&buy_hold).unwrap_or(1.0),
            bars: bars.len(),
        };

        log.log(
            Level::Info,
            Domain::Performance,
            "metrics.summary",
            obj(&[
                ("cumulative_return", v_num(metrics.cumulative_return)),
                ("sharpe_ratio", metrics.sharpe_ratio.map(v_num).unwrap_or(serde_json::Value::Null)),
                ("max_drawdown", v_num(metrics.max_drawdown)),
                ("buy_hold_return", v_num(metrics.buy_hold_return)),
                ("bars", json!(metrics.bars)),
            ]),
        );

        Ok(PerformanceReport {
            metrics,
            daily_return: daily,
            strategy_return: strat,
            cumulative_return: cumulative,
            drawdown,
        })
    }
}
