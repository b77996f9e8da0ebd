//! Weighted nonlinear least squares (Levenberg-Marquardt) over the model parameters.

use super::linalg::{invert_symmetric, mat_vec};
use super::{Estimator, EstimatorKind, FitOptions, FitResult, Weighting, WindowedSpectrum};
use crate::error::{Error, Result};
use crate::model::SpectralModel;
use log::debug;

const LAMBDA_START: f64 = 1e-3;
/// Damping beyond which no step can lower the cost any more.
const LAMBDA_MAX: f64 = 1e12;

/// Levenberg-Marquardt fit of a [`SpectralModel`] to a windowed PSD.
///
/// Parameters are scaled by the initial guess so `D` (often ~1e-3 V^2/s) and
/// `fc` (~1e2 Hz) are iterated on comparable scales. The covariance is
/// `(J^T W J)^-1`, multiplied by the reduced chi squared unless the weights
/// are inverse variances. A singular covariance, or fewer bins than needed
/// to estimate it, is reported as [`Error::FitDidNotConverge`] so the caller
/// can retry with another window or guess.
#[derive(Debug, Clone)]
pub struct CurveFitter {
    options: FitOptions,
}

impl CurveFitter {
    pub fn new(options: FitOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &FitOptions {
        &self.options
    }

    fn weights(&self, spectrum: &WindowedSpectrum) -> Result<Vec<f64>> {
        match &self.options.weighting {
            Weighting::Uniform => Ok(vec![1.0; spectrum.len()]),
            Weighting::InverseVariance => spectrum
                .usable_std()
                .map(|std| std.iter().map(|s| 1.0 / (s * s)).collect())
                .ok_or_else(|| {
                    Error::Configuration(
                        "inverse-variance weighting needs a finite positive std for every bin"
                            .to_string(),
                    )
                }),
            Weighting::Explicit(w) => {
                if w.len() != spectrum.len() {
                    return Err(Error::Configuration(format!(
                        "{} weights given for {} frequency bins",
                        w.len(),
                        spectrum.len()
                    )));
                }
                if w.iter().any(|v| !(v.is_finite() && *v >= 0.0)) {
                    return Err(Error::Configuration(
                        "weights must be finite and non-negative".to_string(),
                    ));
                }
                Ok(w.clone())
            }
        }
    }
}

struct Problem<'a> {
    model: SpectralModel,
    frequency: &'a [f64],
    power: &'a [f64],
    weights: &'a [f64],
    scale: Vec<f64>,
}

impl Problem<'_> {
    fn unscale(&self, p: &[f64]) -> Vec<f64> {
        p.iter().zip(&self.scale).map(|(p, s)| p * s).collect()
    }

    fn cost(&self, p: &[f64]) -> f64 {
        let params = self.unscale(p);
        self.frequency
            .iter()
            .zip(self.power)
            .zip(self.weights)
            .map(|((&f, &y), &w)| w * (y - self.model.eval(f, &params)).powi(2))
            .sum()
    }

    /// `J^T W J` and `J^T W r` in scaled coordinates.
    fn normal_equations(&self, p: &[f64]) -> (Vec<Vec<f64>>, Vec<f64>) {
        let params = self.unscale(p);
        let k = params.len();
        let mut jtwj = vec![vec![0.0f64; k]; k];
        let mut jtwr = vec![0.0f64; k];
        for ((&f, &y), &w) in self.frequency.iter().zip(self.power).zip(self.weights) {
            let g = self.model.gradient(f, &params);
            let j: Vec<f64> = g.iter().zip(&self.scale).map(|(g, s)| g * s).collect();
            let r = y - self.model.eval(f, &params);
            for a in 0..k {
                jtwr[a] += w * j[a] * r;
                for b in 0..k {
                    jtwj[a][b] += w * j[a] * j[b];
                }
            }
        }
        (jtwj, jtwr)
    }
}

impl Estimator for CurveFitter {
    fn kind(&self) -> EstimatorKind {
        EstimatorKind::LeastSquares
    }

    fn fit(&self, spectrum: &WindowedSpectrum) -> Result<FitResult> {
        spectrum.ensure_non_empty()?;
        let model = self.options.model;
        let n = spectrum.len();
        let k = model.n_params();
        let absolute_sigma = self.options.weighting == Weighting::InverseVariance;
        if !absolute_sigma && n <= k {
            return Err(Error::not_converged(
                0,
                format!("{n} bins leave no degrees of freedom for {k} parameters"),
            ));
        }
        let weights = self.weights(spectrum)?;
        let guess = self.options.starting_point(spectrum)?;
        let scale: Vec<f64> = guess
            .iter()
            .map(|&v| if v != 0.0 && v.is_finite() { v.abs() } else { 1.0 })
            .collect();
        let mut p: Vec<f64> = guess.iter().zip(&scale).map(|(g, s)| g / s).collect();
        let problem = Problem {
            model,
            frequency: &spectrum.frequency,
            power: &spectrum.power,
            weights: &weights,
            scale,
        };

        let mut cost = problem.cost(&p);
        if !cost.is_finite() {
            return Err(Error::not_converged(0, "cost is not finite at the initial guess"));
        }
        let mut lambda = LAMBDA_START;
        let mut converged_at = None;

        for iter in 1..=self.options.max_iterations {
            let (jtwj, jtwr) = problem.normal_equations(&p);
            let mut damped = jtwj;
            for (i, row) in damped.iter_mut().enumerate() {
                row[i] *= 1.0 + lambda;
            }
            let Some(inv) = invert_symmetric(&damped) else {
                return Err(Error::not_converged(iter, "normal equations are singular"));
            };
            let delta = mat_vec(&inv, &jtwr);
            let trial: Vec<f64> = p.iter().zip(&delta).map(|(p, d)| p + d).collect();
            let trial_cost = problem.cost(&trial);

            if trial_cost.is_finite() && trial_cost <= cost {
                let decrease = cost - trial_cost;
                p = trial;
                cost = trial_cost;
                lambda = (lambda / 10.0).max(1e-12);
                if decrease <= self.options.tolerance * cost.max(f64::MIN_POSITIVE) {
                    converged_at = Some(iter);
                    break;
                }
            } else {
                lambda *= 10.0;
                if lambda > LAMBDA_MAX {
                    converged_at = Some(iter);
                    break;
                }
            }
        }

        let Some(iterations) = converged_at else {
            return Err(Error::not_converged(
                self.options.max_iterations,
                format!("cost still decreasing ({cost:e})"),
            ));
        };

        let (jtwj, _) = problem.normal_equations(&p);
        let Some(cov) = invert_symmetric(&jtwj) else {
            return Err(Error::not_converged(iterations, "covariance is singular"));
        };
        let variance_scale = if absolute_sigma {
            1.0
        } else {
            cost / (n - k) as f64
        };
        let errors: Vec<f64> = (0..k)
            .map(|i| (cov[i][i] * variance_scale).sqrt() * problem.scale[i])
            .collect();
        let params = problem.unscale(&p);
        debug!(
            "least squares converged in {} iterations: D = {:e}, fc = {:.3} Hz",
            iterations,
            params[0],
            params[1].abs()
        );
        Ok(FitResult::evaluate(
            spectrum,
            model,
            EstimatorKind::LeastSquares,
            &params,
            &errors,
            iterations,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::model::{diode_lorentzian, hydrodynamic_lorentzian, lorentzian, HydrodynamicScales};
    use super::super::FrequencyWindow;

    fn fitter(guess: Option<[f64; 2]>) -> CurveFitter {
        CurveFitter::new(FitOptions {
            initial_guess: guess.map(|g| g.to_vec()),
            ..FitOptions::default()
        })
    }

    #[test]
    fn recovers_lorentzian_parameters() {
        let spectrum = noisy_lorentzian(3);
        let result = fitter(None).fit(&spectrum).unwrap();
        assert_within(result.d, D0, 0.05);
        assert_within(result.fc, FC0, 0.05);
        assert!(result.r_squared > 0.99);
    }

    #[test]
    fn recovers_from_a_poor_initial_guess() {
        let spectrum = noisy_lorentzian(4);
        let result = fitter(Some([5e-4, 300.0])).fit(&spectrum).unwrap();
        assert_within(result.d, D0, 0.05);
        assert_within(result.fc, FC0, 0.05);
        assert!(result.iterations > 1);
        assert!(result.d_error > 0.0 && result.d_error < 0.05 * result.d);
        assert!(result.fc_error > 0.0 && result.fc_error < 0.05 * result.fc);
    }

    #[test]
    fn negative_corner_frequency_guess_reports_absolute_value() {
        let spectrum = noisy_lorentzian(5);
        let result = fitter(Some([8e-4, -400.0])).fit(&spectrum).unwrap();
        assert!(result.fc > 0.0);
        assert_within(result.fc, FC0, 0.05);
    }

    #[test]
    fn fits_hydrodynamic_model() {
        let scales = HydrodynamicScales {
            fv: 2.8e5,
            fm: 1.1e6,
        };
        let frequency: Vec<f64> = (1..=400).map(|i| i as f64 * 25.0).collect();
        let power: Vec<f64> = frequency
            .iter()
            .map(|&f| hydrodynamic_lorentzian(f, D0, FC0, &scales))
            .collect();
        let spectrum = WindowedSpectrum {
            frequency,
            power,
            std: None,
            n_blocks: 1,
            window: FrequencyWindow::new(25.0, 10_000.0).unwrap(),
        };
        let options = FitOptions {
            model: SpectralModel::Hydrodynamic(scales),
            initial_guess: Some(vec![7e-4, 350.0]),
            ..FitOptions::default()
        };
        let result = CurveFitter::new(options).fit(&spectrum).unwrap();
        assert_within(result.d, D0, 1e-4);
        assert_within(result.fc, FC0, 1e-4);
    }

    #[test]
    fn inverse_variance_needs_std() {
        let spectrum = noisy_lorentzian(6);
        let options = FitOptions {
            weighting: Weighting::InverseVariance,
            ..FitOptions::default()
        };
        let err = CurveFitter::new(options).fit(&spectrum).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn inverse_variance_weights_use_block_spread() {
        let mut spectrum = noisy_lorentzian(7);
        spectrum.std = Some(spectrum.power.iter().map(|p| 0.01 * p).collect());
        let options = FitOptions {
            weighting: Weighting::InverseVariance,
            ..FitOptions::default()
        };
        let result = CurveFitter::new(options).fit(&spectrum).unwrap();
        assert_within(result.fc, FC0, 0.02);
        // residuals are ~1 sigma each
        let reduced = result.chi_squared / (spectrum.len() - 2) as f64;
        assert!(reduced > 0.5 && reduced < 1.5, "reduced chi2 {reduced}");
    }

    #[test]
    fn explicit_weights_must_match_bins() {
        let spectrum = noisy_lorentzian(8);
        let options = FitOptions {
            weighting: Weighting::Explicit(vec![1.0; 3]),
            ..FitOptions::default()
        };
        assert!(CurveFitter::new(options).fit(&spectrum).is_err());
    }

    #[test]
    fn iteration_cap_reports_non_convergence() {
        let spectrum = noisy_lorentzian(9);
        let options = FitOptions {
            initial_guess: Some(vec![5e-4, 300.0]),
            max_iterations: 1,
            ..FitOptions::default()
        };
        let err = CurveFitter::new(options).fit(&spectrum).unwrap_err();
        assert!(matches!(err, Error::FitDidNotConverge { iterations: 1, .. }));
    }

    fn exact_spectrum(frequency: Vec<f64>, power: impl Fn(f64) -> f64) -> WindowedSpectrum {
        let power = frequency.iter().map(|&f| power(f)).collect();
        WindowedSpectrum {
            frequency,
            power,
            std: None,
            n_blocks: 1,
            window: FrequencyWindow::new(0.0, 1e6).unwrap(),
        }
    }

    #[test]
    fn two_bins_leave_no_degrees_of_freedom() {
        let spectrum = exact_spectrum(vec![100.0, 1000.0], |f| lorentzian(f, D0, FC0));
        let err = fitter(Some([8e-4, 400.0])).fit(&spectrum).unwrap_err();
        assert!(matches!(err, Error::FitDidNotConverge { iterations: 0, .. }));
    }

    #[test]
    fn singular_covariance_is_not_converged() {
        // repeated frequency: D and fc cannot be told apart
        let spectrum = exact_spectrum(vec![100.0; 3], |f| lorentzian(f, D0, FC0));
        let err = fitter(Some([D0, FC0])).fit(&spectrum).unwrap_err();
        assert!(
            matches!(&err, Error::FitDidNotConverge { reason, .. } if reason.contains("singular")),
            "{err}"
        );
    }

    #[test]
    fn fits_diode_filtered_spectrum() {
        let (f3db, a) = (6000.0, 0.35);
        let frequency: Vec<f64> = (1..=800).map(|i| i as f64 * 25.0).collect();
        let spectrum = exact_spectrum(frequency, |f| diode_lorentzian(f, D0, FC0, f3db, a));
        // relative weights so the rolled-off tail still constrains f3db and a
        let weights = spectrum.power.iter().map(|p| p.powi(-2)).collect();
        let options = FitOptions {
            model: SpectralModel::Diode,
            initial_guess: Some(vec![8e-4, 420.0, 4500.0, 0.5]),
            weighting: Weighting::Explicit(weights),
            ..FitOptions::default()
        };
        let result = CurveFitter::new(options).fit(&spectrum).unwrap();
        let diode = result.diode.unwrap();
        assert_within(result.d, D0, 1e-4);
        assert_within(result.fc, FC0, 1e-4);
        assert_within(diode.f3db, f3db, 1e-3);
        assert_within(diode.a, a, 1e-3);
        assert_eq!(result.model, SpectralModel::Diode);
    }

    #[test]
    fn diode_model_absorbs_detector_roll_off() {
        let frequency: Vec<f64> = (1..=800).map(|i| i as f64 * 25.0).collect();
        let spectrum = exact_spectrum(frequency, |f| diode_lorentzian(f, D0, FC0, 6000.0, 0.35));
        let plain = fitter(None).fit(&spectrum).unwrap();
        let options = FitOptions {
            model: SpectralModel::Diode,
            initial_guess: Some(vec![plain.d, plain.fc]),
            ..FitOptions::default()
        };
        let diode = CurveFitter::new(options).fit(&spectrum).unwrap();
        assert!(diode.mean_squared_relative_residual < plain.mean_squared_relative_residual);
        assert!(diode.diode.is_some());
    }
}
