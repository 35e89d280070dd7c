//! Rolling window primitives behind the feature columns.
//!
//! All windows use `min_periods = 1`: until `period` values have been pushed
//! the statistic covers whatever is available.

use std::collections::VecDeque;

/// Simple moving average over the last `period` values.
///
/// Recomputed from the window on every update (offset by the oldest value)
/// rather than kept as a running sum, so a flat series averages to exactly
/// its own level.
#[derive(Debug, Clone)]
pub struct Sma {
    window: VecDeque<f64>,
    period: usize,
}

impl Sma {
    pub fn new(period: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(period),
            period: period.max(1),
        }
    }

    pub fn update(&mut self, value: f64) -> f64 {
        self.window.push_back(value);
        if self.window.len() > self.period {
            self.window.pop_front();
        }
        self.get()
    }

    pub fn get(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let shift = self.window[0];
        let offset: f64 = self.window.iter().map(|x| x - shift).sum();
        shift + offset / self.window.len() as f64
    }
}

/// Rolling sample standard deviation (ddof = 1).
///
/// Deviations are taken relative to the oldest value in the window, so a
/// window of identical values yields exactly zero.
#[derive(Debug, Clone)]
pub struct RollingStd {
    window: VecDeque<f64>,
    period: usize,
}

impl RollingStd {
    pub fn new(period: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(period),
            period: period.max(1),
        }
    }

    pub fn update(&mut self, value: f64) -> f64 {
        self.window.push_back(value);
        if self.window.len() > self.period {
            self.window.pop_front();
        }
        self.get()
    }

    pub fn get(&self) -> f64 {
        let n = self.window.len();
        if n < 2 {
            return 0.0;
        }
        let shift = self.window[0];
        let (sum, sumsq) = self
            .window
            .iter()
            .map(|x| x - shift)
            .fold((0.0, 0.0), |(s, sq), d| (s + d, sq + d * d));
        let n = n as f64;
        let var = ((sumsq - sum * sum / n) / (n - 1.0)).max(0.0);
        var.sqrt()
    }
}

/// Running maximum, the peak that drawdowns are measured from.
#[derive(Debug, Clone, Default)]
pub struct RunningMax {
    peak: Option<f64>,
}

impl RunningMax {
    pub fn update(&mut self, value: f64) -> f64 {
        let peak = match self.peak {
            Some(p) if p >= value => p,
            _ => value,
        };
        self.peak = Some(peak);
        peak
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sma_shrinking_window() {
        let mut sma = Sma::new(3);
        assert_eq!(sma.update(1.0), 1.0);
        assert_eq!(sma.update(3.0), 2.0);
        assert_eq!(sma.update(5.0), 3.0);
        assert_eq!(sma.update(7.0), 5.0);
    }

    #[test]
    fn test_rolling_std_single_sample_is_zero() {
        let mut std = RollingStd::new(5);
        assert_eq!(std.update(0.3), 0.0);
    }

    #[test]
    fn test_rolling_std_matches_sample_std() {
        let mut std = RollingStd::new(4);
        let mut last = 0.0;
        for x in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            last = std.update(x);
        }
        // window = [5, 5, 7, 9]: mean 6.5, ss = 11, var = 11/3
        assert!((last - (11.0f64 / 3.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_rolling_std_constant_exactly_zero() {
        let mut std = RollingStd::new(3);
        for _ in 0..10 {
            assert_eq!(std.update(0.1), 0.0);
        }
    }

    #[test]
    fn test_running_max() {
        let mut m = RunningMax::default();
        assert_eq!(m.update(1.0), 1.0);
        assert_eq!(m.update(0.5), 1.0);
        assert_eq!(m.update(2.0), 2.0);
    }
}
