//! Closed-form maximum likelihood fit of the Lorentzian (Nørrelykke & Flyvbjerg).
//!
//! With `1/P(f) = (fc^2 + f^2) pi^2 / D = a + b f^2`, the likelihood of an
//! averaged PSD is maximised by a linear solve in `(a, b)` using five sample
//! moments of the data.

use super::{Estimator, EstimatorKind, FitResult, WindowedSpectrum};
use crate::error::{Error, Result};
use crate::model::{lorentzian, SpectralModel};
use log::{debug, warn};
use std::f64::consts::PI;

/// Sample moments `S_pq = mean(f^(2p) P^q)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SFactors {
    pub s01: f64,
    pub s02: f64,
    pub s11: f64,
    pub s12: f64,
    pub s22: f64,
}

impl SFactors {
    pub fn from_data(frequency: &[f64], power: &[f64]) -> Self {
        let n = frequency.len() as f64;
        let mut s = Self {
            s01: 0.0,
            s02: 0.0,
            s11: 0.0,
            s12: 0.0,
            s22: 0.0,
        };
        for (&f, &p) in frequency.iter().zip(power) {
            let f2 = f * f;
            let p2 = p * p;
            s.s01 += p;
            s.s02 += p2;
            s.s11 += f2 * p;
            s.s12 += f2 * p2;
            s.s22 += f2 * f2 * p2;
        }
        s.s01 /= n;
        s.s02 /= n;
        s.s11 /= n;
        s.s12 /= n;
        s.s22 /= n;
        s
    }

    fn determinant(&self) -> f64 {
        self.s02 * self.s22 - self.s12 * self.s12
    }

    /// Pre-parameters `(a, b)`.
    pub fn pre_parameters(&self) -> Result<(f64, f64)> {
        let det = self.determinant();
        let scale = (self.s02 * self.s22).abs();
        if !det.is_finite() || det == 0.0 || det.abs() <= scale * 1e-14 {
            return Err(Error::not_converged(
                0,
                "S-factor moment matrix is singular",
            ));
        }
        let a = (self.s01 * self.s22 - self.s11 * self.s12) / det;
        let b = (self.s11 * self.s02 - self.s01 * self.s12) / det;
        Ok((a, b))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SFactorSolution {
    pub a: f64,
    pub b: f64,
    pub d: f64,
    /// Zero when `a * b <= 0`.
    pub fc: f64,
}

/// Solve for `(D, fc)`. A sign mismatch between `a` and `b` gives `fc = 0`
/// with a warning rather than an error; the window is then unreliable.
pub fn solve(frequency: &[f64], power: &[f64]) -> Result<SFactorSolution> {
    if frequency.is_empty() || frequency.len() != power.len() {
        return Err(Error::Configuration(
            "S-factor fit needs equal, non-empty frequency and power".to_string(),
        ));
    }
    let (a, b) = SFactors::from_data(frequency, power).pre_parameters()?;
    if b == 0.0 {
        return Err(Error::DivisionByZero("D = pi^2 / b"));
    }
    let fc = if a * b > 0.0 {
        (a / b).sqrt()
    } else {
        warn!("S-factor pre-parameters a = {a:e}, b = {b:e} differ in sign; fc set to 0");
        0.0
    };
    Ok(SFactorSolution {
        a,
        b,
        d: PI * PI / b,
        fc,
    })
}

/// Analytic `[sigma_D, sigma_fc]` from the moments of the fitted model.
/// Entries that cannot be evaluated come back as NaN.
pub fn errors(frequency: &[f64], solution: &SFactorSolution) -> [f64; 2] {
    let SFactorSolution { a, b, d, fc } = *solution;
    let model: Vec<f64> = frequency.iter().map(|&f| lorentzian(f, d, fc)).collect();
    let s = SFactors::from_data(frequency, &model);
    let n = frequency.len() as f64;
    let Some(inv) = super::invert_2x2([[s.s02, s.s12], [s.s12, s.s22]]) else {
        return [f64::NAN, f64::NAN];
    };
    let e = inv.map(|row| row.map(|v| v / (128.0 * n)));
    let var_fc = fc * fc / 4.0 * (e[0][0] / (a * a) + e[1][1] / (b * b) - 2.0 * e[0][1] / (a * b));
    let var_d = d * d * e[1][1] / (b * b);
    [finite_sqrt(var_d), finite_sqrt(var_fc)]
}

fn finite_sqrt(v: f64) -> f64 {
    if v.is_finite() && v >= 0.0 {
        v.sqrt()
    } else {
        f64::NAN
    }
}

/// Closed-form Lorentzian estimator; always fits the plain Lorentzian.
#[derive(Debug, Clone, Copy, Default)]
pub struct SFactorEstimator;

impl SFactorEstimator {
    pub fn new() -> Self {
        Self
    }
}

impl Estimator for SFactorEstimator {
    fn kind(&self) -> EstimatorKind {
        EstimatorKind::SFactor
    }

    fn fit(&self, spectrum: &WindowedSpectrum) -> Result<FitResult> {
        let solution = solve(&spectrum.frequency, &spectrum.power)?;
        let errors = errors(&spectrum.frequency, &solution);
        debug!(
            "S-factor fit over {} bins: D = {:e}, fc = {:.3} Hz",
            spectrum.len(),
            solution.d,
            solution.fc
        );
        Ok(FitResult::evaluate(
            spectrum,
            SpectralModel::Lorentzian,
            EstimatorKind::SFactor,
            &[solution.d, solution.fc],
            &errors,
            0,
        ))
    }
}
