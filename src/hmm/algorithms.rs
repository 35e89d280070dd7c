//! Forward-backward and Viterbi over precomputed log emission densities.

use ndarray::{Array1, Array2};

use super::gaussian::Gaussian;
use crate::error::{PipelineError, Result};

/// `log_b[[t, j]] = log p(x_t | state j)`, shape (T, N).
pub fn log_emissions(observations: &Array2<f64>, emissions: &[Gaussian]) -> Array2<f64> {
    let t = observations.nrows();
    let n = emissions.len();
    let mut out = Array2::zeros((t, n));
    for (t_idx, row) in observations.rows().into_iter().enumerate() {
        for (j, g) in emissions.iter().enumerate() {
            out[[t_idx, j]] = g.log_pdf(row);
        }
    }
    out
}

/// E-step output.
#[derive(Debug, Clone)]
pub struct Posteriors {
    /// P(z_t = j | x), shape (T, N)
    pub gamma: Array2<f64>,
    /// Sum over t of P(z_t = i, z_{t+1} = j | x), shape (N, N)
    pub xi_sum: Array2<f64>,
    pub log_likelihood: f64,
}

/// Scaled forward-backward.
///
/// Each row of emission densities is shifted by its maximum before
/// exponentiation and each forward step is normalised; both offsets are added
/// back into the log-likelihood.
pub fn forward_backward(
    log_b: &Array2<f64>,
    start: &Array1<f64>,
    trans: &Array2<f64>,
) -> Result<Posteriors> {
    let (t_len, n) = log_b.dim();
    if t_len == 0 {
        return Err(PipelineError::data("no observations"));
    }

    let mut b = Array2::<f64>::zeros((t_len, n));
    let mut offset_sum = 0.0;
    for t in 0..t_len {
        let m = log_b.row(t).iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        if !m.is_finite() {
            return Err(PipelineError::convergence(format!(
                "emission density not finite at observation {}",
                t
            )));
        }
        offset_sum += m;
        for j in 0..n {
            b[[t, j]] = (log_b[[t, j]] - m).exp();
        }
    }

    // Forward
    let mut alpha = Array2::<f64>::zeros((t_len, n));
    let mut scale = Array1::<f64>::zeros(t_len);
    for t in 0..t_len {
        for j in 0..n {
            let prior = if t == 0 {
                start[j]
            } else {
                (0..n).map(|i| alpha[[t - 1, i]] * trans[[i, j]]).sum()
            };
            alpha[[t, j]] = prior * b[[t, j]];
        }
        let c: f64 = alpha.row(t).sum();
        if !(c.is_finite() && c > 0.0) {
            return Err(PipelineError::convergence(format!(
                "forward pass collapsed at observation {}",
                t
            )));
        }
        scale[t] = c;
        alpha.row_mut(t).mapv_inplace(|v| v / c);
    }

    // Backward
    let mut beta = Array2::<f64>::zeros((t_len, n));
    beta.row_mut(t_len - 1).fill(1.0);
    for t in (0..t_len - 1).rev() {
        for i in 0..n {
            let s: f64 = (0..n)
                .map(|j| trans[[i, j]] * b[[t + 1, j]] * beta[[t + 1, j]])
                .sum();
            beta[[t, i]] = s / scale[t + 1];
        }
    }

    let mut gamma = &alpha * &beta;
    for mut row in gamma.rows_mut() {
        let s = row.sum();
        if s > 0.0 {
            row.mapv_inplace(|v| v / s);
        }
    }

    let mut xi_sum = Array2::<f64>::zeros((n, n));
    for t in 0..t_len - 1 {
        for i in 0..n {
            for j in 0..n {
                xi_sum[[i, j]] +=
                    alpha[[t, i]] * trans[[i, j]] * b[[t + 1, j]] * beta[[t + 1, j]] / scale[t + 1];
            }
        }
    }

    let log_likelihood = scale.iter().map(|c| c.ln()).sum::<f64>() + offset_sum;
    Ok(Posteriors { gamma, xi_sum, log_likelihood })
}

/// Most likely state path and its joint log-probability.
pub fn viterbi(log_b: &Array2<f64>, start: &Array1<f64>, trans: &Array2<f64>) -> (Vec<usize>, f64) {
    let (t_len, n) = log_b.dim();
    if t_len == 0 || n == 0 {
        return (Vec::new(), 0.0);
    }
    let log_start = start.mapv(f64::ln);
    let log_trans = trans.mapv(f64::ln);

    let mut delta = Array2::<f64>::zeros((t_len, n));
    let mut psi = Array2::<usize>::zeros((t_len, n));
    for j in 0..n {
        delta[[0, j]] = log_start[j] + log_b[[0, j]];
    }
    for t in 1..t_len {
        for j in 0..n {
            let mut best_val = f64::NEG_INFINITY;
            let mut best_state = 0;
            for i in 0..n {
                let val = delta[[t - 1, i]] + log_trans[[i, j]];
                if val > best_val {
                    best_val = val;
                    best_state = i;
                }
            }
            delta[[t, j]] = best_val + log_b[[t, j]];
            psi[[t, j]] = best_state;
        }
    }

    let mut last = 0;
    let mut best = f64::NEG_INFINITY;
    for j in 0..n {
        if delta[[t_len - 1, j]] > best {
            best = delta[[t_len - 1, j]];
            last = j;
        }
    }
    let mut path = vec![0; t_len];
    path[t_len - 1] = last;
    for t in (0..t_len - 1).rev() {
        path[t] = psi[[t + 1, path[t + 1]]];
    }
    (path, best)
}
