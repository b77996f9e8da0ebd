//! Synthetic position traces of a bead in a harmonic trap.

use crate::error::{Error, Result};
use crate::signal::TimeSeries;
use log::debug;
use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Overdamped bead with diffusion constant `d` and corner frequency `fc`.
///
/// Sampled with the exact Ornstein-Uhlenbeck update
/// `x[k+1] = c x[k] + sqrt(var (1 - c^2)) xi`, `c = exp(-2 pi fc / fs)`,
/// `var = d / (2 pi fc)`, so the one-sided PSD is the Lorentzian
/// `d / (pi^2 (f^2 + fc^2))` up to aliasing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrapSimulation {
    pub fs: f64,
    pub d: f64,
    pub fc: f64,
    pub n_samples: usize,
    pub seed: u64,
}

impl TrapSimulation {
    pub fn stationary_variance(&self) -> f64 {
        self.d / (2.0 * PI * self.fc)
    }

    pub fn generate(&self) -> Result<TimeSeries> {
        if !(self.fs > 0.0 && self.fs.is_finite()) {
            return Err(Error::invalid("fs", self.fs, "sampling rate must be positive"));
        }
        if !(self.d > 0.0) {
            return Err(Error::invalid("D", self.d, "diffusion constant must be positive"));
        }
        if !(self.fc > 0.0) {
            return Err(Error::invalid("fc", self.fc, "corner frequency must be positive"));
        }
        let mut rng = StdRng::seed_from_u64(self.seed);
        let c = (-2.0 * PI * self.fc / self.fs).exp();
        let var = self.stationary_variance();
        let kick = (var * (1.0 - c * c)).sqrt();

        let mut data = Vec::with_capacity(self.n_samples);
        let start: f64 = StandardNormal.sample(&mut rng);
        let mut x = var.sqrt() * start;
        for _ in 0..self.n_samples {
            data.push(x);
            let xi: f64 = StandardNormal.sample(&mut rng);
            x = c * x + kick * xi;
        }
        debug!(
            "simulated {} samples at {} Hz (D = {:e}, fc = {} Hz)",
            self.n_samples, self.fs, self.d, self.fc
        );
        TimeSeries::new(self.fs, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fit::{Estimator, FrequencyWindow, SFactorEstimator, WindowedSpectrum};
    use crate::signal::BlockParams;
    use crate::spectrum::compute_psd;

    fn sim(seed: u64) -> TrapSimulation {
        TrapSimulation {
            fs: 80_000.0,
            d: 1e-3,
            fc: 500.0,
            n_samples: 1 << 18,
            seed,
        }
    }

    #[test]
    fn same_seed_same_trace() {
        let mut s = sim(7);
        s.n_samples = 1000;
        assert_eq!(s.generate().unwrap().data, s.generate().unwrap().data);
        let other = TrapSimulation { seed: 8, ..s };
        assert_ne!(s.generate().unwrap().data, other.generate().unwrap().data);
    }

    #[test]
    fn variance_matches_equipartition() {
        let s = sim(1);
        let series = s.generate().unwrap();
        let n = series.len() as f64;
        let mean = series.data.iter().sum::<f64>() / n;
        let var = series.data.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        let rel = (var / s.stationary_variance() - 1.0).abs();
        assert!(rel < 0.05, "variance off by {rel}");
    }

    #[test]
    fn psd_of_trace_recovers_trap_parameters() {
        let s = sim(2);
        let series = s.generate().unwrap();
        let estimate = compute_psd(&series, &BlockParams::new(4096), false).unwrap();
        let window = FrequencyWindow::new(50.0, 5000.0).unwrap();
        let spectrum = WindowedSpectrum::from_psd(&estimate.psd, &window).unwrap();
        let fit = SFactorEstimator::new().fit(&spectrum).unwrap();
        assert!((fit.fc / s.fc - 1.0).abs() < 0.1, "fc = {}", fit.fc);
        assert!((fit.d / s.d - 1.0).abs() < 0.1, "D = {}", fit.d);
    }

    #[test]
    fn rejects_non_physical_parameters() {
        let bad = TrapSimulation { fc: 0.0, ..sim(0) };
        assert!(bad.generate().is_err());
        let bad = TrapSimulation { d: -1.0, ..sim(0) };
        assert!(bad.generate().is_err());
    }
}
