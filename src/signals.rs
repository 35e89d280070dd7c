//! Regime-conditioned signal rules.
//!
//! Each bar maps to an action from its own row alone: momentum against a
//! threshold in trending regimes, SMA crossover otherwise.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::features::FeatureRow;
use crate::logging::{log_signal_counts, Logger};
use crate::regime::{RegimeAssignment, RegimeLabel};

/// Bearish momentum must clear the threshold by this factor.
pub const BEARISH_WIDENING: f64 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Buy,
    Sell,
    Hold,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Buy => "buy",
            Action::Sell => "sell",
            Action::Hold => "hold",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = PipelineError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "buy" => Ok(Action::Buy),
            "sell" => Ok(Action::Sell),
            "hold" => Ok(Action::Hold),
            other => Err(PipelineError::data(format!("unknown signal {:?}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    pub date: NaiveDate,
    pub action: Action,
}

/// One row of rule inputs. `None` means the value is missing.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SignalInput {
    pub regime: Option<RegimeLabel>,
    pub daily_return: Option<f64>,
    pub sma_short: Option<f64>,
    pub sma_long: Option<f64>,
}

fn or_zero(v: Option<f64>) -> f64 {
    match v {
        Some(x) if !x.is_nan() => x,
        _ => 0.0,
    }
}

#[derive(Debug, Clone)]
pub struct SignalEngine {
    pub momentum_threshold: f64,
    pub sma_short: usize,
    pub sma_long: usize,
}

impl SignalEngine {
    pub fn new(momentum_threshold: f64, sma_short: usize, sma_long: usize) -> Self {
        Self { momentum_threshold, sma_short, sma_long }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(cfg.momentum_threshold, cfg.sma_short, cfg.sma_long)
    }

    pub fn decide(&self, input: &SignalInput) -> Action {
        let t = self.momentum_threshold;
        let r = or_zero(input.daily_return);
        match input.regime.unwrap_or(RegimeLabel::Neutral) {
            RegimeLabel::Bullish => momentum(r, t),
            RegimeLabel::Bearish => momentum(r, BEARISH_WIDENING * t),
            RegimeLabel::Neutral | RegimeLabel::Unknown => {
                let short = or_zero(input.sma_short);
                let long = or_zero(input.sma_long);
                if short > long {
                    Action::Buy
                } else if short < long {
                    Action::Sell
                } else {
                    Action::Hold
                }
            }
        }
    }

    pub fn input_for(&self, row: &FeatureRow, regime: Option<RegimeLabel>) -> SignalInput {
        SignalInput {
            regime,
            daily_return: Some(row.daily_return),
            sma_short: row.sma(self.sma_short),
            sma_long: row.sma(self.sma_long),
        }
    }

    /// One signal per feature row. `regimes` must cover the same dates in the
    /// same order.
    pub fn generate(
        &self,
        rows: &[FeatureRow],
        regimes: &[RegimeAssignment],
        log: &Logger,
    ) -> Result<Vec<Signal>> {
        if rows.len() != regimes.len() {
            return Err(PipelineError::data(format!(
                "{} feature rows but {} regime assignments",
                rows.len(),
                regimes.len()
            )));
        }
        let signals = rows
            .iter()
            .zip(regimes)
            .map(|(row, reg)| {
                if row.date() != reg.date {
                    return Err(PipelineError::data(format!(
                        "feature row {} aligned with regime {}",
                        row.date(),
                        reg.date
                    )));
                }
                let input = self.input_for(row, Some(reg.regime_label));
                Ok(Signal { date: row.date(), action: self.decide(&input) })
            })
            .collect::<Result<Vec<_>>>()?;

        let count = |a: Action| signals.iter().filter(|s| s.action == a).count();
        log_signal_counts(log, count(Action::Buy), count(Action::Sell), count(Action::Hold));
        Ok(signals)
    }
}

fn momentum(r: f64, threshold: f64) -> Action {
    if r > threshold {
        Action::Buy
    } else if r < -threshold {
        Action::Sell
    } else {
        Action::Hold
    }
}
