//! Stage orchestration: validate → features → regime → signals → performance.
//!
//! Each stage runs on the complete output of the one before it. A failure is
//! tagged with its stage, logged, and returned; nothing downstream runs.

use serde_json::json;

use crate::config::Config;
use crate::data::{validate_bars, Bar};
use crate::error::{PipelineError, Result, Stage};
use crate::features::{FeatureBuilder, FeatureRow};
use crate::logging::{log_stage_failure, obj, params_hash, v_str, Domain, Level, Logger, ProfileScope};
use crate::metrics::{PerformanceEvaluator, PerformanceReport};
use crate::regime::{RegimeAssignment, RegimeClassifier, RegimeFit};
use crate::signals::{Signal, SignalEngine};

/// Everything a run produces.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub features: Vec<FeatureRow>,
    pub regime: RegimeFit,
    pub signals: Vec<Signal>,
    pub performance: PerformanceReport,
}

/// One bar with every derived column, in output order.
#[derive(Debug, Clone, Copy)]
pub struct AugmentedRow<'a> {
    pub features: &'a FeatureRow,
    pub regime: &'a RegimeAssignment,
    pub signal: &'a Signal,
    /// Posterior probability of the decoded state
    pub state_prob: f64,
    pub strategy_return: f64,
    pub cumulative_return: f64,
}

impl PipelineOutput {
    pub fn rows(&self) -> Vec<AugmentedRow<'_>> {
        self.features
            .iter()
            .enumerate()
            .map(|(i, f)| AugmentedRow {
                features: f,
                regime: &self.regime.assignments[i],
                signal: &self.signals[i],
                state_prob: self.regime.state_probability(i).unwrap_or(f64::NAN),
                strategy_return: self.performance.strategy_return[i],
                cumulative_return: self.performance.cumulative_return[i],
            })
            .collect()
    }
}

pub struct Pipeline<'a> {
    cfg: Config,
    log: &'a Logger,
}

impl<'a> Pipeline<'a> {
    pub fn new(cfg: Config, log: &'a Logger) -> Self {
        Self { cfg, log }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Stable fingerprint of the configuration, for run records.
    pub fn params_hash(&self) -> String {
        params_hash(&serde_json::to_string(&self.cfg).unwrap_or_default())
    }

    pub fn run(&self, bars: &[Bar]) -> Result<PipelineOutput> {
        let _profile = ProfileScope::with_context(self.log, "pipeline", &[("bars", json!(bars.len()))]);
        self.log.log(
            Level::Info,
            Domain::System,
            "pipeline_start",
            obj(&[
                ("bars", json!(bars.len())),
                ("params_hash", v_str(&self.params_hash())),
                ("config", json!(self.cfg)),
            ]),
        );

        let out = self.run_stages(bars);
        match &out {
            Ok(o) => self.log.log(
                Level::Info,
                Domain::System,
                "pipeline_done",
                obj(&[
                    ("bars", json!(o.features.len())),
                    ("converged", json!(o.regime.report.converged)),
                ]),
            ),
            Err(e) => log_stage_failure(self.log, e),
        }
        self.log.flush();
        out
    }

    fn run_stages(&self, bars: &[Bar]) -> Result<PipelineOutput> {
        stage(Stage::Validation, || {
            self.cfg.validate()?;
            validate_bars(bars)
        })?;

        let features = stage(Stage::Features, || {
            let _p = ProfileScope::new(self.log, "features");
            FeatureBuilder::from_config(&self.cfg).build(bars, self.log)
        })?;

        let regime = stage(Stage::Regime, || {
            let _p = ProfileScope::new(self.log, "regime");
            RegimeClassifier::from_config(&self.cfg).classify(&features, self.log)
        })?;

        let signals = stage(Stage::Signals, || {
            let _p = ProfileScope::new(self.log, "signals");
            SignalEngine::from_config(&self.cfg).generate(&features, &regime.assignments, self.log)
        })?;

        let performance = stage(Stage::Performance, || {
            let _p = ProfileScope::new(self.log, "performance");
            PerformanceEvaluator::new(self.cfg.annualization).evaluate(bars, &signals, self.log)
        })?;

        Ok(PipelineOutput { features, regime, signals, performance })
    }
}

fn stage<T>(stage: Stage, f: impl FnOnce() -> Result<T>) -> Result<T> {
    f().map_err(|e: PipelineError| e.in_stage(stage))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::parse_date;
    use crate::error::ErrorKind;

    fn bars(closes: &[f64]) -> Vec<Bar> {
        let start = parse_date("2022-06-01").unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Bar {
                date: start + chrono::Duration::days(i as i64),
                open: c,
                high: c * 1.01,
                low: c * 0.99,
                close: c,
                volume: 5_000.0,
            })
            .collect()
    }

    fn small_config() -> Config {
        Config { sma_short: 3, sma_long: 5, vol_window: 3, n_components: 2, ..Config::default() }
    }

    #[test]
    fn test_run_produces_aligned_columns() {
        let closes: Vec<f64> = (0..40).map(|i| 100.0 + (i as f64 * 0.7).sin() * 4.0 + i as f64 * 0.2).collect();
        let out = Pipeline::new(small_config(), &Logger::null()).run(&bars(&closes)).unwrap();
        assert_eq!(out.features.len(), 40);
        assert_eq!(out.signals.len(), 40);
        let rows = out.rows();
        assert_eq!(rows.len(), 40);
        assert_eq!(rows[7].signal.date, rows[7].features.date());
        assert_eq!(rows[7].regime.date, rows[7].features.date());
    }

    #[test]
    fn test_unsorted_dates_fail_validation() {
        let mut b = bars(&[100.0, 101.0, 102.0, 103.0]);
        b.swap(1, 2);
        let err = Pipeline::new(small_config(), &Logger::null()).run(&b).unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Validation));
        assert_eq!(err.kind(), ErrorKind::Data);
    }

    #[test]
    fn test_too_few_bars_fail_in_regime_stage() {
        let cfg = Config { n_components: 5, ..small_config() };
        let (logger, buf) = Logger::memory(Level::Info);
        let err = Pipeline::new(cfg, &logger).run(&bars(&[100.0, 101.0, 102.0])).unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Regime));
        assert_eq!(err.kind(), ErrorKind::Data);
        let failed = buf.events("stage_failed");
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0]["stage"], "regime");
    }

    #[test]
    fn test_params_hash_tracks_config() {
        let log = Logger::null();
        let a = Pipeline::new(small_config(), &log).params_hash();
        let b = Pipeline::new(Config { seed: 7, ..small_config() }, &log).params_hash();
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
    }
}
