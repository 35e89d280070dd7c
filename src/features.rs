//! Per-bar technical features: SMAs, daily return and rolling volatility.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::json;

use crate::config::Config;
use crate::data::Bar;
use crate::error::{PipelineError, Result};
use crate::indicators::{RollingStd, Sma};
use crate::logging::{obj, Domain, Level, Logger};

/// A bar plus every derived column. Windows are keys into the maps.
#[derive(Debug, Clone, Serialize)]
pub struct FeatureRow {
    pub bar: Bar,
    pub sma: BTreeMap<usize, f64>,
    pub daily_return: f64,
    pub volatility: BTreeMap<usize, f64>,
}

impl FeatureRow {
    pub fn date(&self) -> NaiveDate {
        self.bar.date
    }

    pub fn sma(&self, window: usize) -> Option<f64> {
        self.sma.get(&window).copied()
    }

    pub fn volatility(&self, window: usize) -> Option<f64> {
        self.volatility.get(&window).copied()
    }
}

fn check_window(window: usize) -> Result<()> {
    if window == 0 {
        return Err(PipelineError::data("rolling window must be at least 1"));
    }
    Ok(())
}

/// Rolling mean of close with `min_periods = 1`.
pub fn moving_average(bars: &[Bar], window: usize) -> Result<Vec<f64>> {
    check_window(window)?;
    let mut sma = Sma::new(window);
    Ok(bars.iter().map(|b| sma.update(b.close)).collect())
}

/// Simple return close-over-close; the first bar has no predecessor and is 0.
pub fn daily_return(bars: &[Bar]) -> Result<Vec<f64>> {
    let mut out = Vec::with_capacity(bars.len());
    for (i, bar) in bars.iter().enumerate() {
        if i == 0 {
            out.push(0.0);
            continue;
        }
        let prev = bars[i - 1].close;
        if !(prev.is_finite() && prev > 0.0) {
            return Err(PipelineError::data(format!(
                "close {} on {} cannot be a return base",
                prev,
                bars[i - 1].date
            )));
        }
        out.push((bar.close - prev) / prev);
    }
    Ok(out)
}

/// Rolling sample standard deviation with `min_periods = 1`; a single sample
/// has zero spread.
pub fn volatility(returns: &[f64], window: usize) -> Result<Vec<f64>> {
    check_window(window)?;
    let mut std = RollingStd::new(window);
    Ok(returns.iter().map(|r| std.update(*r)).collect())
}

/// Builds [`FeatureRow`]s for a fixed set of windows.
#[derive(Debug, Clone)]
pub struct FeatureBuilder {
    sma_windows: Vec<usize>,
    vol_windows: Vec<usize>,
}

impl FeatureBuilder {
    pub fn new(sma_windows: Vec<usize>, vol_windows: Vec<usize>) -> Self {
        Self { sma_windows, vol_windows }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(cfg.sma_windows(), vec![cfg.vol_window])
    }

    pub fn build(&self, bars: &[Bar], log: &Logger) -> Result<Vec<FeatureRow>> {
        let returns = daily_return(bars)?;
        let smas = self
            .sma_windows
            .iter()
            .map(|w| moving_average(bars, *w).map(|col| (*w, col)))
            .collect::<Result<Vec<_>>>()?;
        let vols = self
            .vol_windows
            .iter()
            .map(|w| volatility(&returns, *w).map(|col| (*w, col)))
            .collect::<Result<Vec<_>>>()?;

        let rows: Vec<FeatureRow> = bars
            .iter()
            .enumerate()
            .map(|(i, bar)| FeatureRow {
                bar: *bar,
                sma: smas.iter().map(|(w, col)| (*w, col[i])).collect(),
                daily_return: returns[i],
                volatility: vols.iter().map(|(w, col)| (*w, col[i])).collect(),
            })
            .collect();

        log.log(
            Level::Info,
            Domain::Feature,
            "features_built",
            obj(&[
                ("rows", json!(rows.len())),
                ("sma_windows", json!(self.sma_windows)),
                ("vol_windows", json!(self.vol_windows)),
            ]),
        );
        Ok(rows)
    }
}
