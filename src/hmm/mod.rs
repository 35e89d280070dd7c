//! Gaussian-emission hidden Markov model fitted with Baum-Welch.
//!
//! Initialisation is deterministic for a given seed: uniform start and
//! transition probabilities, k-means cluster centres for the means and the
//! data covariance (plus `min_covar`) for every state.

pub mod algorithms;
pub mod gaussian;

use std::fmt;
use std::str::FromStr;

use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use serde_json::json;

use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::logging::{log_fit_iteration, obj, v_num, v_str, Domain, Level, Logger};

use self::algorithms::{forward_backward, log_emissions, viterbi};
use self::gaussian::Gaussian;

const KMEANS_MAX_ITER: usize = 100;

// =============================================================================
// Configuration
// =============================================================================

/// Shape of the per-state covariance matrices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CovarianceType {
    Full,
    Diag,
    Spherical,
    Tied,
}

impl CovarianceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CovarianceType::Full => "full",
            CovarianceType::Diag => "diag",
            CovarianceType::Spherical => "spherical",
            CovarianceType::Tied => "tied",
        }
    }
}

impl fmt::Display for CovarianceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CovarianceType {
    type Err = PipelineError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "full" => Ok(CovarianceType::Full),
            "diag" => Ok(CovarianceType::Diag),
            "spherical" => Ok(CovarianceType::Spherical),
            "tied" => Ok(CovarianceType::Tied),
            other => Err(PipelineError::data(format!("unknown covariance type {:?}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FitConfig {
    pub n_components: usize,
    pub covariance_type: CovarianceType,
    pub max_iter: usize,
    pub tol: f64,
    pub min_covar: f64,
    pub seed: u64,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl FitConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            n_components: cfg.n_components,
            covariance_type: cfg.covariance_type,
            max_iter: cfg.max_iter,
            tol: cfg.tol,
            min_covar: cfg.min_covar,
            seed: cfg.seed,
        }
    }
}

/// How the EM loop ended.
#[derive(Debug, Clone, Serialize)]
pub struct FitReport {
    pub iterations: usize,
    pub converged: bool,
    pub log_likelihood: f64,
    /// Log-likelihood after each E-step
    pub history: Vec<f64>,
}

// =============================================================================
// Model
// =============================================================================

#[derive(Debug, Clone)]
pub struct GaussianHmm {
    pub n_components: usize,
    pub covariance_type: CovarianceType,
    pub start_prob: Array1<f64>,
    pub trans_mat: Array2<f64>,
    pub emissions: Vec<Gaussian>,
}

/// Plain-data view of a fitted model for logs and reports.
#[derive(Debug, Clone, Serialize)]
pub struct HmmSummary {
    pub n_components: usize,
    pub covariance_type: CovarianceType,
    pub start_prob: Vec<f64>,
    pub trans_mat: Vec<Vec<f64>>,
    pub means: Vec<Vec<f64>>,
    pub covariances: Vec<Vec<Vec<f64>>>,
}

impl GaussianHmm {
    /// Fit to a (T, D) observation matrix.
    pub fn fit(obs: &Array2<f64>, cfg: &FitConfig, log: &Logger) -> Result<(Self, FitReport)> {
        check_observations(obs, cfg.n_components)?;
        let k = cfg.n_components;
        let mut model = Self::initialise(obs, cfg)?;

        let mut history: Vec<f64> = Vec::new();
        let mut converged = false;
        for iter in 1..=cfg.max_iter {
            let log_b = log_emissions(obs, &model.emissions);
            let post = forward_backward(&log_b, &model.start_prob, &model.trans_mat)?;
            let ll = post.log_likelihood;
            if !ll.is_finite() {
                return Err(PipelineError::convergence(format!(
                    "log-likelihood is not finite at iteration {}",
                    iter
                )));
            }
            let delta = history.last().map(|prev| ll - prev).unwrap_or(f64::INFINITY);
            history.push(ll);
            log_fit_iteration(log, iter, ll, delta);

            model.m_step(obs, &post.gamma, &post.xi_sum, cfg)?;

            if delta < cfg.tol {
                converged = true;
                break;
            }
        }

        let report = FitReport {
            iterations: history.len(),
            converged,
            log_likelihood: history.last().copied().unwrap_or(f64::NAN),
            history,
        };

        if !converged {
            log.log(
                Level::Warn,
                Domain::Regime,
                "hmm_not_converged",
                obj(&[
                    ("msg", v_str("EM stopped at max_iter before reaching tol")),
                    ("max_iter", json!(cfg.max_iter)),
                    ("tol", v_num(cfg.tol)),
                ]),
            );
        }
        log.log(
            Level::Info,
            Domain::Regime,
            "hmm_fit",
            obj(&[
                ("n_components", json!(k)),
                ("covariance_type", v_str(cfg.covariance_type.as_str())),
                ("observations", json!(obs.nrows())),
                ("iterations", json!(report.iterations)),
                ("converged", json!(report.converged)),
                ("log_likelihood", v_num(report.log_likelihood)),
            ]),
        );
        Ok((model, report))
    }

    /// Viterbi path and its log-probability.
    pub fn decode(&self, obs: &Array2<f64>) -> Result<(Vec<usize>, f64)> {
        self.check_dims(obs)?;
        let log_b = log_emissions(obs, &self.emissions);
        let (path, log_prob) = viterbi(&log_b, &self.start_prob, &self.trans_mat);
        if !log_prob.is_finite() {
            return Err(PipelineError::convergence("no state path has positive probability"));
        }
        Ok((path, log_prob))
    }

    /// Log-likelihood of `obs` under the model.
    pub fn score(&self, obs: &Array2<f64>) -> Result<f64> {
        self.check_dims(obs)?;
        let log_b = log_emissions(obs, &self.emissions);
        Ok(forward_backward(&log_b, &self.start_prob, &self.trans_mat)?.log_likelihood)
    }

    /// Posterior state probabilities, shape (T, N).
    pub fn predict_proba(&self, obs: &Array2<f64>) -> Result<Array2<f64>> {
        self.check_dims(obs)?;
        let log_b = log_emissions(obs, &self.emissions);
        Ok(forward_backward(&log_b, &self.start_prob, &self.trans_mat)?.gamma)
    }

    pub fn n_features(&self) -> usize {
        self.emissions.first().map(|g| g.dim()).unwrap_or(0)
    }

    /// Emission means, shape (N, D).
    pub fn means(&self) -> Array2<f64> {
        let d = self.n_features();
        let mut out = Array2::zeros((self.n_components, d));
        for (j, g) in self.emissions.iter().enumerate() {
            out.row_mut(j).assign(&g.mean);
        }
        out
    }

    pub fn summary(&self) -> HmmSummary {
        HmmSummary {
            n_components: self.n_components,
            covariance_type: self.covariance_type,
            start_prob: self.start_prob.to_vec(),
            trans_mat: self.trans_mat.rows().into_iter().map(|r| r.to_vec()).collect(),
            means: self.emissions.iter().map(|g| g.mean.to_vec()).collect(),
            covariances: self
                .emissions
                .iter()
                .map(|g| g.covariance.rows().into_iter().map(|r| r.to_vec()).collect())
                .collect(),
        }
    }

    fn check_dims(&self, obs: &Array2<f64>) -> Result<()> {
        if obs.ncols() != self.n_features() {
            return Err(PipelineError::data(format!(
                "model has {} features, observations have {}",
                self.n_features(),
                obs.ncols()
            )));
        }
        if obs.iter().any(|v| !v.is_finite()) {
            return Err(PipelineError::data("observations contain non-finite values"));
        }
        Ok(())
    }

    // =========================================================================
    // EM internals
    // =========================================================================

    fn initialise(obs: &Array2<f64>, cfg: &FitConfig) -> Result<Self> {
        let k = cfg.n_components;
        let d = obs.ncols();
        let means = kmeans(obs, k, cfg.seed);

        let data_cov = sample_covariance(obs);
        let mut emissions = Vec::with_capacity(k);
        for j in 0..k {
            let cov = shape_covariance(&data_cov, cfg.covariance_type, cfg.min_covar, d);
            emissions.push(Gaussian::new(means.row(j).to_owned(), cov)?);
        }

        Ok(Self {
            n_components: k,
            covariance_type: cfg.covariance_type,
            start_prob: Array1::from_elem(k, 1.0 / k as f64),
            trans_mat: Array2::from_elem((k, k), 1.0 / k as f64),
            emissions,
        })
    }

    fn m_step(
        &mut self,
        obs: &Array2<f64>,
        gamma: &Array2<f64>,
        xi_sum: &Array2<f64>,
        cfg: &FitConfig,
    ) -> Result<()> {
        let k = self.n_components;
        let (t_len, d) = obs.dim();

        let first = gamma.row(0);
        let s = first.sum();
        if s > 0.0 {
            self.start_prob = first.mapv(|v| v / s);
        }

        for i in 0..k {
            let row_sum = xi_sum.row(i).sum();
            if row_sum > 0.0 {
                let row = xi_sum.row(i).mapv(|v| v / row_sum);
                self.trans_mat.row_mut(i).assign(&row);
            }
        }

        let weights = gamma.sum_axis(Axis(0));
        let mut means: Vec<Option<Array1<f64>>> = Vec::with_capacity(k);
        for j in 0..k {
            if weights[j] > 0.0 {
                let w = gamma.column(j);
                let mean = w.dot(obs) / weights[j];
                means.push(Some(mean));
            } else {
                means.push(None);
            }
        }

        if self.covariance_type == CovarianceType::Tied {
            let mut pooled = Array2::<f64>::zeros((d, d));
            for j in 0..k {
                let mean = means[j].clone().unwrap_or_else(|| self.emissions[j].mean.clone());
                pooled += &scatter(obs, &mean, Some(gamma.column(j).to_owned()));
            }
            pooled /= t_len as f64;
            let cov = shape_covariance(&pooled, CovarianceType::Full, cfg.min_covar, d);
            for j in 0..k {
                let mean = means[j].take().unwrap_or_else(|| self.emissions[j].mean.clone());
                self.emissions[j] = Gaussian::new(mean, cov.clone())?;
            }
            return Ok(());
        }

        for j in 0..k {
            // A state no observation visits keeps its parameters.
            let Some(mean) = means[j].take() else { continue };
            let w = gamma.column(j).to_owned();
            let cov = scatter(obs, &mean, Some(w)) / weights[j];
            let cov = shape_covariance(&cov, self.covariance_type, cfg.min_covar, d);
            self.emissions[j] = Gaussian::new(mean, cov)?;
        }
        Ok(())
    }
}

fn check_observations(obs: &Array2<f64>, k: usize) -> Result<()> {
    if k == 0 {
        return Err(PipelineError::data("n_components must be at least 1"));
    }
    if obs.ncols() == 0 {
        return Err(PipelineError::data("observations have no feature columns"));
    }
    if obs.nrows() < k {
        return Err(PipelineError::data(format!(
            "{} observations cannot fit {} states",
            obs.nrows(),
            k
        )));
    }
    if obs.iter().any(|v| !v.is_finite()) {
        return Err(PipelineError::data("observations contain non-finite values"));
    }
    Ok(())
}

fn column_mean(obs: &Array2<f64>) -> Array1<f64> {
    obs.sum_axis(Axis(0)) / obs.nrows() as f64
}

/// Sum over rows of `w_t (x_t - mean)(x_t - mean)^T`; unit weights when
/// `weights` is `None`.
fn scatter(obs: &Array2<f64>, mean: &Array1<f64>, weights: Option<Array1<f64>>) -> Array2<f64> {
    let d = obs.ncols();
    let mut out = Array2::<f64>::zeros((d, d));
    for (t, row) in obs.rows().into_iter().enumerate() {
        let w = weights.as_ref().map(|w| w[t]).unwrap_or(1.0);
        if w == 0.0 {
            continue;
        }
        let diff = &row - mean;
        for a in 0..d {
            for b in 0..d {
                out[[a, b]] += w * diff[a] * diff[b];
            }
        }
    }
    out
}

/// Sample covariance (divides by T - 1) of the observations.
fn sample_covariance(obs: &Array2<f64>) -> Array2<f64> {
    let denom = obs.nrows().saturating_sub(1).max(1) as f64;
    scatter(obs, &column_mean(obs), None) / denom
}

/// Restrict a full covariance estimate to `kind` and add `min_covar` to the
/// diagonal.
fn shape_covariance(cov: &Array2<f64>, kind: CovarianceType, min_covar: f64, d: usize) -> Array2<f64> {
    let mut out = match kind {
        CovarianceType::Full | CovarianceType::Tied => cov.clone(),
        CovarianceType::Diag => Array2::from_diag(&cov.diag().to_owned()),
        CovarianceType::Spherical => {
            let var = cov.diag().sum() / d as f64;
            Array2::eye(d) * var
        }
    };
    for i in 0..d {
        out[[i, i]] += min_covar;
    }
    out
}

/// Lloyd's algorithm from `k` distinct seeded rows. Returns centres (k, D).
fn kmeans(obs: &Array2<f64>, k: usize, seed: u64) -> Array2<f64> {
    let (t_len, d) = obs.dim();
    let mut rng = StdRng::seed_from_u64(seed);
    let picks = rand::seq::index::sample(&mut rng, t_len, k);

    let mut centres = Array2::<f64>::zeros((k, d));
    for (j, idx) in picks.iter().enumerate() {
        centres.row_mut(j).assign(&obs.row(idx));
    }

    let mut assignment = vec![usize::MAX; t_len];
    for _ in 0..KMEANS_MAX_ITER {
        let mut changed = false;
        for (t, row) in obs.rows().into_iter().enumerate() {
            let mut best = 0;
            let mut best_dist = f64::INFINITY;
            for j in 0..k {
                let dist: f64 = row
                    .iter()
                    .zip(centres.row(j).iter())
                    .map(|(a, b)| (a - b) * (a - b))
                    .sum();
                if dist < best_dist {
                    best_dist = dist;
                    best = j;
                }
            }
            if assignment[t] != best {
                assignment[t] = best;
                changed = true;
            }
        }
        if !changed {
            break;
        }

        let mut sums = Array2::<f64>::zeros((k, d));
        let mut counts = vec![0usize; k];
        for (t, row) in obs.rows().into_iter().enumerate() {
            let j = assignment[t];
            let mut s = sums.row_mut(j);
            s += &row;
            counts[j] += 1;
        }
        for j in 0..k {
            // Empty clusters keep their centre.
            if counts[j] > 0 {
                let c = sums.row(j).mapv(|v| v / counts[j] as f64);
                centres.row_mut(j).assign(&c);
            }
        }
    }
    centres
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;
    use rand::Rng;

    /// Two well-separated blobs in 2D, alternating in runs of 10.
    fn two_blobs(n: usize, seed: u64) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut obs = Array2::zeros((n, 2));
        for t in 0..n {
            let centre = if (t / 10) % 2 == 0 { -5.0 } else { 5.0 };
            obs[[t, 0]] = centre + rng.gen_range(-0.5..0.5);
            obs[[t, 1]] = centre + rng.gen_range(-0.5..0.5);
        }
        obs
    }

    fn cfg(k: usize) -> FitConfig {
        FitConfig { n_components: k, ..FitConfig::default() }
    }

    #[test]
    fn test_covariance_type_parse() {
        assert_eq!("Full".parse::<CovarianceType>().unwrap(), CovarianceType::Full);
        assert_eq!("spherical".parse::<CovarianceType>().unwrap(), CovarianceType::Spherical);
        assert!("banded".parse::<CovarianceType>().is_err());
    }

    #[test]
    fn test_fit_recovers_two_regimes() {
        let obs = two_blobs(80, 7);
        let (model, report) = GaussianHmm::fit(&obs, &cfg(2), &Logger::null()).unwrap();
        assert!(report.converged);
        assert!(report.log_likelihood.is_finite());

        let (path, _) = model.decode(&obs).unwrap();
        for t in 0..80 {
            let same_block = path[t] == path[(t / 10) * 10];
            assert!(same_block, "state flipped inside a block at {}", t);
        }
        assert_ne!(path[0], path[10]);

        for row in model.trans_mat.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-9);
        }
        assert!((model.start_prob.sum() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_fit_is_deterministic_for_seed() {
        let obs = two_blobs(60, 3);
        let (a, ra) = GaussianHmm::fit(&obs, &cfg(3), &Logger::null()).unwrap();
        let (b, rb) = GaussianHmm::fit(&obs, &cfg(3), &Logger::null()).unwrap();
        assert_eq!(ra.history, rb.history);
        assert_eq!(a.means(), b.means());
        assert_eq!(a.decode(&obs).unwrap().0, b.decode(&obs).unwrap().0);
    }

    #[test]
    fn test_every_covariance_type_fits() {
        let obs = two_blobs(40, 11);
        for kind in [
            CovarianceType::Full,
            CovarianceType::Diag,
            CovarianceType::Spherical,
            CovarianceType::Tied,
        ] {
            let c = FitConfig { covariance_type: kind, ..cfg(2) };
            let (model, _) = GaussianHmm::fit(&obs, &c, &Logger::null()).unwrap();
            assert_eq!(model.covariance_type, kind);
            let cov = &model.emissions[0].covariance;
            if kind != CovarianceType::Full && kind != CovarianceType::Tied {
                assert_eq!(cov[[0, 1]], 0.0);
            }
            if kind == CovarianceType::Spherical {
                assert_eq!(cov[[0, 0]], cov[[1, 1]]);
            }
        }
    }

    #[test]
    fn test_too_few_observations() {
        let obs = arr2(&[[0.1, 0.2], [0.3, 0.1]]);
        let err = GaussianHmm::fit(&obs, &cfg(3), &Logger::null()).unwrap_err();
        assert!(matches!(err, PipelineError::Data(_)));
    }

    #[test]
    fn test_non_finite_observations_rejected() {
        let obs = arr2(&[[0.1, f64::INFINITY], [0.3, 0.1], [0.2, 0.2]]);
        let err = GaussianHmm::fit(&obs, &cfg(2), &Logger::null()).unwrap_err();
        assert!(matches!(err, PipelineError::Data(_)));
    }

    #[test]
    fn test_single_state() {
        let obs = two_blobs(20, 5);
        let (model, _) = GaussianHmm::fit(&obs, &cfg(1), &Logger::null()).unwrap();
        let (path, _) = model.decode(&obs).unwrap();
        assert!(path.iter().all(|s| *s == 0));
        assert_eq!(model.trans_mat[[0, 0]], 1.0);
    }

    #[test]
    fn test_max_iter_reports_not_converged() {
        let obs = two_blobs(40, 2);
        let c = FitConfig { max_iter: 1, tol: 0.0, ..cfg(2) };
        let (logger, buf) = Logger::memory(Level::Warn);
        let (_, report) = GaussianHmm::fit(&obs, &c, &logger).unwrap();
        assert!(!report.converged);
        assert_eq!(report.iterations, 1);
        assert_eq!(buf.events("hmm_not_converged").len(), 1);
    }

    #[test]
    fn test_posteriors_and_score() {
        let obs = two_blobs(30, 9);
        let (model, report) = GaussianHmm::fit(&obs, &cfg(2), &Logger::null()).unwrap();
        let proba = model.predict_proba(&obs).unwrap();
        assert_eq!(proba.dim(), (30, 2));
        for row in proba.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-9);
        }
        assert!(model.score(&obs).unwrap().is_finite());
        assert_eq!(report.history.len(), report.iterations);
    }

    #[test]
    fn test_decode_rejects_wrong_width() {
        let obs = two_blobs(20, 1);
        let (model, _) = GaussianHmm::fit(&obs, &cfg(2), &Logger::null()).unwrap();
        let narrow = arr2(&[[0.0], [1.0]]);
        assert!(model.decode(&narrow).is_err());
    }
}
