//! Regime classification: HMM over {daily_return, volatility} plus the
//! state-to-label mapping.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use ndarray::Array2;
use serde::Serialize;
use serde_json::json;

use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::features::FeatureRow;
use crate::hmm::{FitConfig, FitReport, GaussianHmm};
use crate::logging::{obj, v_num, v_str, Domain, Level, Logger};

/// Column of the return feature in the observation matrix.
const RETURN_COL: usize = 0;
const VOL_COL: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RegimeLabel {
    Bullish,
    Bearish,
    Neutral,
    Unknown,
}

impl RegimeLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegimeLabel::Bullish => "bullish",
            RegimeLabel::Bearish => "bearish",
            RegimeLabel::Neutral => "neutral",
            RegimeLabel::Unknown => "unknown",
        }
    }
}

impl fmt::Display for RegimeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RegimeLabel {
    type Err = PipelineError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "bullish" => Ok(RegimeLabel::Bullish),
            "bearish" => Ok(RegimeLabel::Bearish),
            "neutral" => Ok(RegimeLabel::Neutral),
            "unknown" => Ok(RegimeLabel::Unknown),
            other => Err(PipelineError::data(format!("unknown regime label {:?}", other))),
        }
    }
}

/// How integer states become labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelMapping {
    /// 0 → bullish, 1 → bearish, 2 → neutral, anything else unknown.
    Positional,
    /// Highest mean return → bullish, lowest → bearish, the rest neutral.
    Ranked,
}

impl FromStr for LabelMapping {
    type Err = PipelineError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "positional" => Ok(LabelMapping::Positional),
            "ranked" => Ok(LabelMapping::Ranked),
            other => Err(PipelineError::data(format!("unknown label mapping {:?}", other))),
        }
    }
}

impl LabelMapping {
    /// One label per state of `model`.
    pub fn labels(&self, model: &GaussianHmm) -> Vec<RegimeLabel> {
        let k = model.n_components;
        match self {
            LabelMapping::Positional => (0..k)
                .map(|s| match s {
                    0 => RegimeLabel::Bullish,
                    1 => RegimeLabel::Bearish,
                    2 => RegimeLabel::Neutral,
                    _ => RegimeLabel::Unknown,
                })
                .collect(),
            LabelMapping::Ranked => {
                if k == 1 {
                    return vec![RegimeLabel::Neutral];
                }
                let means = model.means();
                let mut order: Vec<usize> = (0..k).collect();
                // Ties keep state order, so the mapping is stable for a given fit.
                order.sort_by(|a, b| {
                    means[[*a, RETURN_COL]]
                        .partial_cmp(&means[[*b, RETURN_COL]])
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                let mut labels = vec![RegimeLabel::Neutral; k];
                labels[order[0]] = RegimeLabel::Bearish;
                labels[order[k - 1]] = RegimeLabel::Bullish;
                labels
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegimeAssignment {
    pub date: NaiveDate,
    pub hmm_state: usize,
    pub regime_label: RegimeLabel,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateSummary {
    pub state: usize,
    pub label: RegimeLabel,
    pub mean_return: f64,
    pub mean_volatility: f64,
    /// Share of bars decoded to this state
    pub occupancy: f64,
    pub count: usize,
}

/// Everything one classification run produced.
#[derive(Debug, Clone)]
pub struct RegimeFit {
    pub model: GaussianHmm,
    pub report: FitReport,
    /// Label of each state, indexed by state
    pub labels: Vec<RegimeLabel>,
    pub assignments: Vec<RegimeAssignment>,
    pub states: Vec<StateSummary>,
    /// Log-likelihood of the whole series under the fitted model
    pub log_likelihood: f64,
    /// P(state | series) per bar, shape (T, N)
    pub posteriors: Array2<f64>,
}

impl RegimeFit {
    pub fn label_for(&self, date: NaiveDate) -> Option<RegimeLabel> {
        self.assignments
            .binary_search_by_key(&date, |a| a.date)
            .ok()
            .map(|i| self.assignments[i].regime_label)
    }

    /// Posterior probability of the decoded state at bar `t`.
    pub fn state_probability(&self, t: usize) -> Option<f64> {
        let state = self.assignments.get(t)?.hmm_state;
        self.posteriors.get([t, state]).copied()
    }
}

/// Observation matrix (T, 2) of daily return and volatility. NaN becomes 0.
pub fn prepare_features(rows: &[FeatureRow], vol_window: usize) -> Result<Array2<f64>> {
    let mut obs = Array2::<f64>::zeros((rows.len(), 2));
    for (t, row) in rows.iter().enumerate() {
        let vol = row.volatility(vol_window).ok_or_else(|| {
            PipelineError::data(format!("volatility_{} column missing on {}", vol_window, row.date()))
        })?;
        obs[[t, RETURN_COL]] = impute(row.daily_return);
        obs[[t, VOL_COL]] = impute(vol);
    }
    Ok(obs)
}

fn impute(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v
    }
}

#[derive(Debug, Clone)]
pub struct RegimeClassifier {
    pub fit: FitConfig,
    pub vol_window: usize,
    pub mapping: LabelMapping,
}

impl RegimeClassifier {
    pub fn new(fit: FitConfig, vol_window: usize, mapping: LabelMapping) -> Self {
        Self { fit, vol_window, mapping }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(FitConfig::from_config(cfg), cfg.vol_window, cfg.label_mapping)
    }

    /// Fit on `features` and decode the same data.
    pub fn train(
        &self,
        features: &Array2<f64>,
        log: &Logger,
    ) -> Result<(GaussianHmm, Vec<usize>, FitReport)> {
        let (model, report) = GaussianHmm::fit(features, &self.fit, log)?;
        let (states, _) = model.decode(features)?;
        Ok((model, states, report))
    }

    pub fn classify(&self, rows: &[FeatureRow], log: &Logger) -> Result<RegimeFit> {
        let obs = prepare_features(rows, self.vol_window)?;
        let (model, path, report) = self.train(&obs, log)?;
        let log_likelihood = model.score(&obs)?;
        let posteriors = model.predict_proba(&obs)?;
        let labels = self.mapping.labels(&model);

        let assignments: Vec<RegimeAssignment> = rows
            .iter()
            .zip(path.iter())
            .map(|(row, &s)| RegimeAssignment {
                date: row.date(),
                hmm_state: s,
                regime_label: labels[s],
            })
            .collect();

        let means = model.means();
        let total = path.len().max(1) as f64;
        let states: Vec<StateSummary> = (0..model.n_components)
            .map(|s| {
                let count = path.iter().filter(|p| **p == s).count();
                StateSummary {
                    state: s,
                    label: labels[s],
                    mean_return: means[[s, RETURN_COL]],
                    mean_volatility: means[[s, VOL_COL]],
                    occupancy: count as f64 / total,
                    count,
                }
            })
            .collect();

        for st in &states {
            log.log(
                Level::Debug,
                Domain::Regime,
                "regime_state",
                obj(&[
                    ("state", json!(st.state)),
                    ("label", v_str(st.label.as_str())),
                    ("mean_return", v_num(st.mean_return)),
                    ("mean_volatility", v_num(st.mean_volatility)),
                    ("occupancy", v_num(st.occupancy)),
                ]),
            );
        }
        log.log(
            Level::Info,
            Domain::Regime,
            "regimes_assigned",
            obj(&[
                ("bars", json!(assignments.len())),
                ("mapping", json!(self.mapping)),
                ("log_likelihood", v_num(log_likelihood)),
            ]),
        );

        Ok(RegimeFit { model, report, labels, assignments, states, log_likelihood, posteriors })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{parse_date, Bar};
    use crate::features::FeatureBuilder;
    use crate::hmm::CovarianceType;

    fn rows(closes: &[f64]) -> Vec<FeatureRow> {
        let start = parse_date("2023-03-01").unwrap();
        let bars: Vec<Bar> = closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Bar {
                date: start + chrono::Duration::days(i as i64),
                open: c,
                high: c,
                low: c,
                close: c,
                volume: 10.0,
            })
            .collect();
        FeatureBuilder::new(vec![2, 3], vec![3]).build(&bars, &Logger::null()).unwrap()
    }

    /// Alternating calm uptrend and volatile selloff.
    fn regime_closes(n: usize) -> Vec<f64> {
        let mut c = 100.0;
        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            let step = if (i / 15) % 2 == 0 {
                0.004 + 0.001 * ((i % 3) as f64)
            } else if i % 2 == 0 {
                -0.03
            } else {
                0.012
            };
            c *= 1.0 + step;
            out.push(c);
        }
        out
    }

    fn classifier(k: usize, mapping: LabelMapping) -> RegimeClassifier {
        let fit = FitConfig { n_components: k, ..FitConfig::default() };
        RegimeClassifier::new(fit, 3, mapping)
    }

    #[test]
    fn test_label_parse() {
        assert_eq!("Bullish".parse::<RegimeLabel>().unwrap(), RegimeLabel::Bullish);
        assert!("sideways".parse::<RegimeLabel>().is_err());
        assert_eq!("ranked".parse::<LabelMapping>().unwrap(), LabelMapping::Ranked);
    }

    #[test]
    fn test_prepare_features_imputes_nan() {
        let mut r = rows(&[100.0, 101.0, 102.0]);
        r[1].daily_return = f64::NAN;
        let obs = prepare_features(&r, 3).unwrap();
        assert_eq!(obs[[1, 0]], 0.0);
        assert_eq!(obs.dim(), (3, 2));
    }

    #[test]
    fn test_prepare_features_missing_window() {
        let r = rows(&[100.0, 101.0]);
        let err = prepare_features(&r, 20).unwrap_err();
        assert!(matches!(err, PipelineError::Data(_)));
    }

    #[test]
    fn test_states_in_range_and_labelled() {
        let r = rows(&regime_closes(90));
        for mapping in [LabelMapping::Positional, LabelMapping::Ranked] {
            let fit = classifier(3, mapping).classify(&r, &Logger::null()).unwrap();
            assert_eq!(fit.assignments.len(), r.len());
            for a in &fit.assignments {
                assert!(a.hmm_state < 3);
                assert_eq!(a.regime_label, fit.labels[a.hmm_state]);
            }
            let total: usize = fit.states.iter().map(|s| s.count).sum();
            assert_eq!(total, r.len());
        }
    }

    #[test]
    fn test_positional_labels() {
        let r = rows(&regime_closes(60));
        let fit = classifier(3, LabelMapping::Positional).classify(&r, &Logger::null()).unwrap();
        assert_eq!(
            fit.labels,
            vec![RegimeLabel::Bullish, RegimeLabel::Bearish, RegimeLabel::Neutral]
        );
    }

    #[test]
    fn test_ranked_labels_follow_mean_return() {
        let r = rows(&regime_closes(90));
        let fit = classifier(3, LabelMapping::Ranked).classify(&r, &Logger::null()).unwrap();
        let bull = fit.states.iter().find(|s| s.label == RegimeLabel::Bullish).unwrap();
        let bear = fit.states.iter().find(|s| s.label == RegimeLabel::Bearish).unwrap();
        assert!(bull.mean_return >= bear.mean_return);
        for s in &fit.states {
            assert!(s.mean_return <= bull.mean_return);
            assert!(s.mean_return >= bear.mean_return);
        }
    }

    #[test]
    fn test_single_state_is_neutral() {
        let r = rows(&regime_closes(20));
        let fit = classifier(1, LabelMapping::Ranked).classify(&r, &Logger::null()).unwrap();
        assert!(fit.assignments.iter().all(|a| a.regime_label == RegimeLabel::Neutral));
    }

    #[test]
    fn test_more_states_than_bars() {
        let r = rows(&[100.0, 101.0]);
        let err = classifier(3, LabelMapping::Ranked).classify(&r, &Logger::null()).unwrap_err();
        assert!(matches!(err, PipelineError::Data(_)));
    }

    #[test]
    fn test_train_is_deterministic() {
        let r = rows(&regime_closes(60));
        let obs = prepare_features(&r, 3).unwrap();
        let c = RegimeClassifier::new(
            FitConfig { covariance_type: CovarianceType::Diag, ..FitConfig::default() },
            3,
            LabelMapping::Ranked,
        );
        let (_, a, _) = c.train(&obs, &Logger::null()).unwrap();
        let (_, b, _) = c.train(&obs, &Logger::null()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_classify_exposes_posteriors() {
        let r = rows(&regime_closes(45));
        let fit = classifier(2, LabelMapping::Positional).classify(&r, &Logger::null()).unwrap();
        assert_eq!(fit.posteriors.dim(), (45, 2));
        for t in 0..45 {
            let p = fit.state_probability(t).unwrap();
            assert!((0.0..=1.0 + 1e-12).contains(&p));
            assert!((fit.posteriors.row(t).sum() - 1.0).abs() < 1e-9);
        }
        assert_eq!(fit.state_probability(45), None);
        assert!(fit.log_likelihood.is_finite());
    }

    #[test]
    fn test_classify_matches_train() {
        let r = rows(&regime_closes(60));
        let c = classifier(3, LabelMapping::Positional);
        let (_, states, _) = c.train(&prepare_features(&r, 3).unwrap(), &Logger::null()).unwrap();
        let fit = c.classify(&r, &Logger::null()).unwrap();
        let decoded: Vec<usize> = fit.assignments.iter().map(|a| a.hmm_state).collect();
        assert_eq!(decoded, states);
    }

    #[test]
    fn test_label_for_date() {
        let r = rows(&regime_closes(30));
        let fit = classifier(2, LabelMapping::Ranked).classify(&r, &Logger::null()).unwrap();
        assert_eq!(fit.label_for(r[5].date()), Some(fit.assignments[5].regime_label));
        assert_eq!(fit.label_for(parse_date("1999-01-01").unwrap()), None);
    }
}
