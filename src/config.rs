use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::error::{PipelineError, Result};
use crate::hmm::CovarianceType;
use crate::regime::LabelMapping;

/// Run configuration. Every knob has a default; `from_env` overrides them.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Short SMA window, the "fast" side of the neutral-regime crossover
    pub sma_short: usize,
    /// Long SMA window
    pub sma_long: usize,
    /// Window for rolling volatility of daily returns (also the HMM feature)
    pub vol_window: usize,
    pub n_components: usize,
    pub covariance_type: CovarianceType,
    pub max_iter: usize,
    /// Stop EM once the log-likelihood gain drops below this
    pub tol: f64,
    /// Added to covariance diagonals to keep them positive definite
    pub min_covar: f64,
    pub seed: u64,
    pub label_mapping: LabelMapping,
    pub momentum_threshold: f64,
    /// Periods per year for Sharpe annualization
    pub annualization: f64,
    pub sqlite_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sma_short: 20,
            sma_long: 50,
            vol_window: 20,
            n_components: 3,
            covariance_type: CovarianceType::Full,
            max_iter: 1000,
            tol: 1e-2,
            min_covar: 1e-3,
            seed: 42,
            label_mapping: LabelMapping::Positional,
            momentum_threshold: 0.01,
            annualization: 252.0,
            sqlite_path: None,
        }
    }
}

/// Parse `key` when set, otherwise fall back to `default`.
fn setting<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(v) => v
            .trim()
            .parse()
            .map_err(|e| PipelineError::data(format!("invalid {}={:?}: {}", key, v, e))),
    }
}

impl Config {
    /// Defaults overridden by the environment. A variable that is set but
    /// does not parse is an error, never a silent default.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let d = Self::default();
        Ok(Self {
            sma_short: setting(&lookup, "SMA_SHORT", d.sma_short)?,
            sma_long: setting(&lookup, "SMA_LONG", d.sma_long)?,
            vol_window: setting(&lookup, "VOL_WINDOW", d.vol_window)?,
            n_components: setting(&lookup, "N_COMPONENTS", d.n_components)?,
            covariance_type: setting(&lookup, "COVARIANCE_TYPE", d.covariance_type)?,
            max_iter: setting(&lookup, "MAX_ITER", d.max_iter)?,
            tol: setting(&lookup, "HMM_TOL", d.tol)?,
            min_covar: setting(&lookup, "MIN_COVAR", d.min_covar)?,
            seed: setting(&lookup, "SEED", d.seed)?,
            label_mapping: setting(&lookup, "LABEL_MAPPING", d.label_mapping)?,
            momentum_threshold: setting(&lookup, "MOMENTUM_TH", d.momentum_threshold)?,
            annualization: setting(&lookup, "ANNUALIZATION", d.annualization)?,
            sqlite_path: lookup("SQLITE_PATH").filter(|v| !v.trim().is_empty()),
        })
    }

    /// Reject settings no stage could run with.
    pub fn validate(&self) -> Result<()> {
        if self.sma_short == 0 || self.sma_long == 0 || self.vol_window == 0 {
            return Err(PipelineError::data("rolling windows must be at least 1"));
        }
        if self.n_components == 0 {
            return Err(PipelineError::data("n_components must be at least 1"));
        }
        if self.max_iter == 0 {
            return Err(PipelineError::data("max_iter must be at least 1"));
        }
        if !self.tol.is_finite() || self.tol < 0.0 {
            return Err(PipelineError::data(format!("invalid tol {}", self.tol)));
        }
        if !self.min_covar.is_finite() || self.min_covar < 0.0 {
            return Err(PipelineError::data(format!("invalid min_covar {}", self.min_covar)));
        }
        if !self.momentum_threshold.is_finite() || self.momentum_threshold < 0.0 {
            return Err(PipelineError::data(format!(
                "invalid momentum threshold {}",
                self.momentum_threshold
            )));
        }
        if !(self.annualization > 0.0) {
            return Err(PipelineError::data(format!("invalid annualization {}", self.annualization)));
        }
        Ok(())
    }

    /// SMA windows the feature stage must produce.
    pub fn sma_windows(&self) -> Vec<usize> {
        let mut w = vec![self.sma_short, self.sma_long];
        w.sort_unstable();
        w.dedup();
        w
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_windows_and_model() {
        let cfg = Config::default();
        assert_eq!(cfg.sma_windows(), vec![20, 50]);
        assert_eq!(cfg.vol_window, 20);
        assert_eq!(cfg.n_components, 3);
        assert_eq!(cfg.momentum_threshold, 0.01);
        assert_eq!(cfg.label_mapping, LabelMapping::Positional);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_window() {
        let cfg = Config { vol_window: 0, ..Config::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_components() {
        let cfg = Config { n_components: 0, ..Config::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_sma_windows_dedup() {
        let cfg = Config { sma_short: 10, sma_long: 10, ..Config::default() };
        assert_eq!(cfg.sma_windows(), vec![10]);
    }

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_lookup_overrides_defaults() {
        let cfg = Config::from_lookup(env(&[
            ("SMA_SHORT", "5"),
            ("COVARIANCE_TYPE", "diag"),
            ("LABEL_MAPPING", "ranked"),
            ("HMM_TOL", " 0.001 "),
            ("SQLITE_PATH", ""),
        ]))
        .unwrap();
        assert_eq!(cfg.sma_short, 5);
        assert_eq!(cfg.covariance_type, CovarianceType::Diag);
        assert_eq!(cfg.label_mapping, LabelMapping::Ranked);
        assert_eq!(cfg.tol, 0.001);
        assert_eq!(cfg.sma_long, 50);
        assert_eq!(cfg.sqlite_path, None);
    }

    #[test]
    fn test_lookup_rejects_misspelled_values() {
        for (key, bad) in [
            ("LABEL_MAPPING", "positonal"),
            ("COVARIANCE_TYPE", "diagonal"),
            ("N_COMPONENTS", "three"),
            ("HMM_TOL", "1e-2x"),
        ] {
            let err = Config::from_lookup(env(&[(key, bad)])).unwrap_err();
            assert!(matches!(err, PipelineError::Data(_)));
            assert!(err.to_string().contains(key), "{}", err);
        }
    }
}
