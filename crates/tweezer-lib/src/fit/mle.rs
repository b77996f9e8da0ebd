//! Numerical maximum likelihood fit.
//!
//! Periodogram bins are treated as independent with mean `model(f)`, giving
//! the negative log-likelihood `sum(y / m + ln m)`. It is minimised by Fisher
//! scoring with step halving, which keeps `m > 0` along the path.

use super::linalg::{invert_symmetric, mat_vec};
use super::{Estimator, EstimatorKind, FitOptions, FitResult, WindowedSpectrum};
use crate::error::{Error, Result};
use crate::model::SpectralModel;
use log::debug;

const MAX_HALVINGS: usize = 40;

#[derive(Debug, Clone)]
pub struct MleEstimator {
    options: FitOptions,
}

impl MleEstimator {
    pub fn new(options: FitOptions) -> Self {
        Self { options }
    }
}

/// Negative log-likelihood, `inf` when the model is not positive everywhere.
fn negative_log_likelihood(
    model: &SpectralModel,
    frequency: &[f64],
    power: &[f64],
    params: &[f64],
) -> f64 {
    let mut total = 0.0;
    for (&f, &y) in frequency.iter().zip(power) {
        let m = model.eval(f, params);
        if !(m.is_finite() && m > 0.0) {
            return f64::INFINITY;
        }
        total += y / m + m.ln();
    }
    total
}

/// Fisher information `sum(g g^T)` and score `sum((y/m - 1) g)` with
/// `g = grad(m) / m`, in coordinates scaled by `scale`.
fn scoring_terms(
    model: &SpectralModel,
    frequency: &[f64],
    power: &[f64],
    params: &[f64],
    scale: &[f64],
) -> (Vec<Vec<f64>>, Vec<f64>) {
    let k = params.len();
    let mut info = vec![vec![0.0f64; k]; k];
    let mut score = vec![0.0f64; k];
    for (&f, &y) in frequency.iter().zip(power) {
        let m = model.eval(f, params);
        let g: Vec<f64> = model
            .gradient(f, params)
            .iter()
            .zip(scale)
            .map(|(g, s)| g * s / m)
            .collect();
        let u = y / m - 1.0;
        for a in 0..k {
            score[a] += u * g[a];
            for b in 0..k {
                info[a][b] += g[a] * g[b];
            }
        }
    }
    (info, score)
}

impl Estimator for MleEstimator {
    fn kind(&self) -> EstimatorKind {
        EstimatorKind::Mle
    }

    fn fit(&self, spectrum: &WindowedSpectrum) -> Result<FitResult> {
        spectrum.ensure_non_empty()?;
        let model = self.options.model;
        let (frequency, power) = (&spectrum.frequency, &spectrum.power);
        let guess = self.options.starting_point(spectrum)?;
        let scale: Vec<f64> = guess
            .iter()
            .map(|&v| if v != 0.0 && v.is_finite() { v.abs() } else { 1.0 })
            .collect();
        let unscale = |p: &[f64]| -> Vec<f64> { p.iter().zip(&scale).map(|(p, s)| p * s).collect() };
        let nll = |p: &[f64]| negative_log_likelihood(&model, frequency, power, &unscale(p));

        let mut p: Vec<f64> = guess.iter().zip(&scale).map(|(g, s)| g / s).collect();
        let mut value = nll(&p);
        if !value.is_finite() {
            return Err(Error::not_converged(
                0,
                "likelihood undefined at the initial guess",
            ));
        }

        let mut converged_at = None;
        for iter in 1..=self.options.max_iterations {
            let (info, score) = scoring_terms(&model, frequency, power, &unscale(&p), &scale);
            let Some(inv) = invert_symmetric(&info) else {
                return Err(Error::not_converged(iter, "Fisher information is singular"));
            };
            let mut step = mat_vec(&inv, &score);
            let mut accepted = None;
            for _ in 0..MAX_HALVINGS {
                let trial: Vec<f64> = p.iter().zip(&step).map(|(p, s)| p + s).collect();
                let trial_value = nll(&trial);
                if trial_value <= value {
                    accepted = Some((trial, trial_value));
                    break;
                }
                step.iter_mut().for_each(|s| *s /= 2.0);
            }
            let Some((trial, trial_value)) = accepted else {
                // no descent direction left
                converged_at = Some(iter);
                break;
            };
            let decrease = value - trial_value;
            p = trial;
            value = trial_value;
            if decrease <= self.options.tolerance * value.abs().max(1.0) {
                converged_at = Some(iter);
                break;
            }
        }

        let Some(iterations) = converged_at else {
            return Err(Error::not_converged(
                self.options.max_iterations,
                format!("negative log-likelihood still decreasing ({value:e})"),
            ));
        };

        let params = unscale(&p);
        let (info, _) = scoring_terms(&model, frequency, power, &params, &scale);
        let Some(cov) = invert_symmetric(&info) else {
            return Err(Error::not_converged(iterations, "Fisher information is singular"));
        };
        let blocks = spectrum.n_blocks.max(1) as f64;
        let errors: Vec<f64> = (0..params.len())
            .map(|i| (cov[i][i] / blocks).sqrt() * scale[i])
            .collect();
        debug!(
            "MLE converged in {} iterations: D = {:e}, fc = {:.3} Hz",
            iterations,
            params[0],
            params[1].abs()
        );
        Ok(FitResult::evaluate(
            spectrum,
            model,
            EstimatorKind::Mle,
            &params,
            &errors,
            iterations,
        ))
    }
}
