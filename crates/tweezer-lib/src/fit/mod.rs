//! Estimators that turn an averaged PSD into `(D, fc)` with uncertainties.
//!
//! Three strategies share the [`Estimator`] capability and are picked by
//! [`EstimatorKind`]: weighted nonlinear least squares, numerical maximum
//! likelihood and the closed-form S-factor maximum likelihood solution. All of
//! them work on a [`WindowedSpectrum`], the PSD restricted to
//! `min_hz <= f <= max_hz`.

pub mod least_squares;
mod linalg;
pub mod mle;
pub mod s_factor;
pub mod search;

use crate::error::{Error, Result};
use crate::model::SpectralModel;
use crate::spectrum::AveragedPsd;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

pub(crate) use linalg::invert_2x2;
pub use least_squares::CurveFitter;
pub use mle::MleEstimator;
pub use s_factor::SFactorEstimator;
pub use search::{WindowAttempt, WindowSearch, WindowSearchOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EstimatorKind {
    LeastSquares,
    Mle,
    SFactor,
}

/// Inclusive frequency band (Hz) used for fitting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrequencyWindow {
    pub min_hz: f64,
    pub max_hz: f64,
}

impl Default for FrequencyWindow {
    fn default() -> Self {
        Self {
            min_hz: 5.0,
            max_hz: 3000.0,
        }
    }
}

impl FrequencyWindow {
    pub fn new(min_hz: f64, max_hz: f64) -> Result<Self> {
        if min_hz.is_nan() || max_hz.is_nan() || min_hz > max_hz {
            return Err(Error::Configuration(format!(
                "frequency window [{}, {}] Hz is not ordered",
                min_hz, max_hz
            )));
        }
        Ok(Self { min_hz, max_hz })
    }

    pub fn contains(&self, f: f64) -> bool {
        f >= self.min_hz && f <= self.max_hz
    }

    /// Legacy convention: keep bins `2..floor(len * limit)` of `frequency`.
    ///
    /// Converted once into absolute Hz so the result no longer depends on bin
    /// spacing. Prefer [`FrequencyWindow::new`].
    pub fn from_fraction(frequency: &[f64], limit: f64) -> Result<Self> {
        if !(limit.is_finite() && limit > 0.0) {
            return Err(Error::Configuration(format!(
                "window fraction {} must be positive",
                limit
            )));
        }
        warn!(
            "fractional window limit {} is deprecated; converting to an absolute Hz band",
            limit
        );
        if limit > 1.0 {
            warn!("window fraction {} exceeds 1; using the full spectrum", limit);
        }
        let end = ((frequency.len() as f64 * limit).floor() as usize).min(frequency.len());
        if end <= 2 {
            return Err(Error::EmptyFitWindow {
                min_hz: frequency.get(2).copied().unwrap_or(f64::NAN),
                max_hz: frequency.get(end.saturating_sub(1)).copied().unwrap_or(f64::NAN),
            });
        }
        Self::new(frequency[2], frequency[end - 1])
    }
}

/// PSD bins inside a [`FrequencyWindow`], ready for fitting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowedSpectrum {
    pub frequency: Vec<f64>,
    pub power: Vec<f64>,
    pub std: Option<Vec<f64>>,
    /// Number of periodograms averaged into `power`.
    pub n_blocks: usize,
    pub window: FrequencyWindow,
}

impl WindowedSpectrum {
    pub fn from_psd(psd: &AveragedPsd, window: &FrequencyWindow) -> Result<Self> {
        let mut spectrum = Self::from_slices(
            &psd.frequency,
            &psd.mean_power,
            Some(psd.std_power.as_slice()),
            window,
        )?;
        spectrum.n_blocks = psd.n_blocks.max(1);
        Ok(spectrum)
    }

    pub fn from_slices(
        frequency: &[f64],
        power: &[f64],
        std: Option<&[f64]>,
        window: &FrequencyWindow,
    ) -> Result<Self> {
        if frequency.len() != power.len() || std.is_some_and(|s| s.len() != frequency.len()) {
            return Err(Error::Configuration(
                "frequency, power and std must have equal lengths".to_string(),
            ));
        }
        let keep: Vec<usize> = (0..frequency.len())
            .filter(|&i| window.contains(frequency[i]))
            .collect();
        if keep.is_empty() {
            return Err(Error::EmptyFitWindow {
                min_hz: window.min_hz,
                max_hz: window.max_hz,
            });
        }
        Ok(Self {
            frequency: keep.iter().map(|&i| frequency[i]).collect(),
            power: keep.iter().map(|&i| power[i]).collect(),
            std: std.map(|s| keep.iter().map(|&i| s[i]).collect()),
            n_blocks: 1,
            window: *window,
        })
    }

    /// Copy without the bins inside `band`, e.g. the peak of a driven trap.
    pub fn excluding(&self, band: &FrequencyWindow) -> Result<Self> {
        let keep: Vec<usize> = (0..self.len())
            .filter(|&i| !band.contains(self.frequency[i]))
            .collect();
        if keep.is_empty() {
            return Err(Error::EmptyFitWindow {
                min_hz: self.window.min_hz,
                max_hz: self.window.max_hz,
            });
        }
        debug!(
            "excluding [{}, {}] Hz leaves {} of {} bins",
            band.min_hz,
            band.max_hz,
            keep.len(),
            self.len()
        );
        Ok(Self {
            frequency: keep.iter().map(|&i| self.frequency[i]).collect(),
            power: keep.iter().map(|&i| self.power[i]).collect(),
            std: self.std.as_ref().map(|s| keep.iter().map(|&i| s[i]).collect()),
            n_blocks: self.n_blocks,
            window: self.window,
        })
    }

    pub fn len(&self) -> usize {
        self.frequency.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frequency.is_empty()
    }

    pub(crate) fn ensure_non_empty(&self) -> Result<()> {
        if self.is_empty() || self.frequency.len() != self.power.len() {
            return Err(Error::EmptyFitWindow {
                min_hz: self.window.min_hz,
                max_hz: self.window.max_hz,
            });
        }
        Ok(())
    }

    /// Standard deviations if every one is finite and positive.
    pub fn usable_std(&self) -> Option<&[f64]> {
        self.std
            .as_deref()
            .filter(|s| s.iter().all(|v| v.is_finite() && *v > 0.0))
    }
}

/// Fitted photodiode filter of [`SpectralModel::Diode`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DiodeFilter {
    /// Roll-off frequency in Hz.
    pub f3db: f64,
    /// Instantaneous fraction of the response.
    pub a: f64,
    pub f3db_error: f64,
    pub a_error: f64,
}

/// Outcome of one estimator run over one window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitResult {
    /// Diffusion constant in PSD units times Hz (V^2/s for a voltage signal).
    pub d: f64,
    /// Corner frequency in Hz, always non-negative.
    pub fc: f64,
    pub d_error: f64,
    pub fc_error: f64,
    /// Present for [`SpectralModel::Diode`] fits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diode: Option<DiodeFilter>,
    pub r_squared: f64,
    pub chi_squared: f64,
    pub mean_squared_residual: f64,
    /// Mean of `((power - model) / model)^2`; comparable across windows.
    pub mean_squared_relative_residual: f64,
    pub frequency: Vec<f64>,
    /// `power - model` for every fitted bin.
    pub residuals: Vec<f64>,
    pub model: SpectralModel,
    pub estimator: EstimatorKind,
    pub window: FrequencyWindow,
    pub iterations: usize,
}

impl FitResult {
    /// Score `params` (`[D, fc, ..]`) against the spectrum. Parameters the
    /// model is even in, `fc` among them, are folded to their absolute value.
    pub fn evaluate(
        spectrum: &WindowedSpectrum,
        model: SpectralModel,
        estimator: EstimatorKind,
        params: &[f64],
        errors: &[f64],
        iterations: usize,
    ) -> Self {
        let mut params = params.to_vec();
        model.canonicalize(&mut params);
        let fitted = model.eval_all(&spectrum.frequency, &params);
        let residuals: Vec<f64> = spectrum
            .power
            .iter()
            .zip(fitted.iter())
            .map(|(y, m)| y - m)
            .collect();
        let n = residuals.len() as f64;
        let ss_res: f64 = residuals.iter().map(|r| r * r).sum();
        let mean = spectrum.power.iter().sum::<f64>() / n;
        let ss_tot: f64 = spectrum.power.iter().map(|y| (y - mean).powi(2)).sum();
        let r_squared = if ss_tot > 0.0 {
            1.0 - ss_res / ss_tot
        } else {
            f64::NAN
        };
        let chi_squared = match spectrum.usable_std() {
            Some(std) => residuals
                .iter()
                .zip(std)
                .map(|(r, s)| (r / s).powi(2))
                .sum(),
            None => {
                if spectrum.std.is_some() {
                    warn!("PSD spread unusable for chi squared; using unit sigma");
                }
                ss_res
            }
        };
        let mean_squared_relative_residual = residuals
            .iter()
            .zip(fitted.iter())
            .map(|(r, m)| (r / m).powi(2))
            .sum::<f64>()
            / n;
        let error = |k: usize| errors.get(k).copied().unwrap_or(f64::NAN);
        let diode = match model {
            SpectralModel::Diode => Some(DiodeFilter {
                f3db: params[2],
                a: params[3],
                f3db_error: error(2),
                a_error: error(3),
            }),
            _ => None,
        };
        Self {
            d: params[0],
            fc: params[1],
            d_error: error(0),
            fc_error: error(1),
            diode,
            r_squared,
            chi_squared,
            mean_squared_residual: ss_res / n,
            mean_squared_relative_residual,
            frequency: spectrum.frequency.clone(),
            residuals,
            model,
            estimator,
            window: spectrum.window,
            iterations,
        }
    }

    /// Fitted parameter vector in the model's order.
    pub fn parameters(&self) -> Vec<f64> {
        let mut params = vec![self.d, self.fc];
        if let Some(diode) = &self.diode {
            params.extend([diode.f3db, diode.a]);
        }
        params
    }

    pub fn fitted(&self) -> Vec<f64> {
        self.model.eval_all(&self.frequency, &self.parameters())
    }

    /// Fitted model at an arbitrary frequency.
    pub fn model_at(&self, f: f64) -> f64 {
        self.model.eval(f, &self.parameters())
    }
}

/// Common capability of the three estimators.
pub trait Estimator {
    fn kind(&self) -> EstimatorKind;
    fn fit(&self, spectrum: &WindowedSpectrum) -> Result<FitResult>;
}

/// How least-squares residuals are weighted.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Weighting {
    #[default]
    Uniform,
    /// `w_i = 1 / std_i^2` from the block spread.
    InverseVariance,
    /// One weight per windowed bin.
    Explicit(Vec<f64>),
}

/// Settings shared by the iterative estimators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitOptions {
    pub model: SpectralModel,
    /// `[D, fc]` or a full parameter vector for the model.
    #[serde(default)]
    pub initial_guess: Option<Vec<f64>>,
    #[serde(default)]
    pub weighting: Weighting,
    pub max_iterations: usize,
    /// Relative change of the objective below which the fit is converged.
    pub tolerance: f64,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            model: SpectralModel::Lorentzian,
            initial_guess: None,
            weighting: Weighting::Uniform,
            max_iterations: 200,
            tolerance: 1e-10,
        }
    }
}

impl FitOptions {
    /// Initial parameter vector: the configured guess, or one read off the
    /// spectrum. A `[D, fc]` guess is completed with the model's defaults.
    pub fn starting_point(&self, spectrum: &WindowedSpectrum) -> Result<Vec<f64>> {
        let mut guess = match &self.initial_guess {
            Some(guess) => guess.clone(),
            None => initial_guess(spectrum).to_vec(),
        };
        let n = self.model.n_params();
        if guess.len() == 2 && n > 2 {
            guess.extend_from_slice(self.model.default_extra_params());
        }
        if guess.len() != n {
            return Err(Error::Configuration(format!(
                "initial guess has {} values, {:?} model takes {}",
                guess.len(),
                self.model.kind(),
                n
            )));
        }
        Ok(guess)
    }
}

impl EstimatorKind {
    pub fn build(self, options: FitOptions) -> Box<dyn Estimator> {
        match self {
            EstimatorKind::LeastSquares => Box::new(CurveFitter::new(options)),
            EstimatorKind::Mle => Box::new(MleEstimator::new(options)),
            EstimatorKind::SFactor => {
                if options.model != SpectralModel::Lorentzian {
                    warn!(
                        "S-factor fits the plain Lorentzian; ignoring the {:?} model",
                        options.model.kind()
                    );
                }
                Box::new(SFactorEstimator::new())
            }
        }
    }
}

/// Starting point for the iterative estimators: the closed-form solution when
/// it is physical, else a plateau / half-power reading of the spectrum.
pub fn initial_guess(spectrum: &WindowedSpectrum) -> [f64; 2] {
    if let Ok(solution) = s_factor::solve(&spectrum.frequency, &spectrum.power) {
        if solution.d.is_finite() && solution.d > 0.0 && solution.fc > 0.0 {
            return [solution.d, solution.fc];
        }
    }
    let head = spectrum.power.len().min(3);
    let plateau = spectrum.power[..head].iter().sum::<f64>() / head as f64;
    let f0 = spectrum.frequency[0];
    let fc = spectrum
        .frequency
        .iter()
        .zip(spectrum.power.iter())
        .find(|(_, p)| **p <= plateau / 2.0)
        .map(|(f, _)| *f)
        .unwrap_or_else(|| spectrum.frequency[spectrum.len() - 1])
        .max(f64::MIN_POSITIVE);
    [plateau * PI * PI * (f0 * f0 + fc * fc), fc]
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::model::lorentzian;
    use rand::{rngs::StdRng, SeedableRng};
    use rand_distr::{Distribution, Normal};

    pub const D0: f64 = 1e-3;
    pub const FC0: f64 = 500.0;

    /// Lorentzian over 5..=3000 Hz with 1% multiplicative Gaussian noise.
    pub fn noisy_lorentzian(seed: u64) -> WindowedSpectrum {
        let mut rng = StdRng::seed_from_u64(seed);
        let noise = Normal::new(0.0, 0.01).unwrap();
        let frequency: Vec<f64> = (1..=600).map(|i| i as f64 * 5.0).collect();
        let power = frequency
            .iter()
            .map(|&f| lorentzian(f, D0, FC0) * (1.0 + noise.sample(&mut rng)))
            .collect();
        WindowedSpectrum {
            frequency,
            power,
            std: None,
            n_blocks: 1,
            window: FrequencyWindow::new(5.0, 3000.0).unwrap(),
        }
    }

    pub fn assert_within(actual: f64, expected: f64, rel: f64) {
        let err = ((actual - expected) / expected).abs();
        assert!(err <= rel, "expected {expected} within {rel}, got {actual}");
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::model::lorentzian;

    #[test]
    fn restriction_keeps_inclusive_band() {
        let f = [0.0, 5.0, 10.0, 15.0, 20.0];
        let p = [1.0, 2.0, 3.0, 4.0, 5.0];
        let w = FrequencyWindow::new(5.0, 15.0).unwrap();
        let s = WindowedSpectrum::from_slices(&f, &p, None, &w).unwrap();
        assert_eq!(s.frequency, vec![5.0, 10.0, 15.0]);
        assert_eq!(s.power, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn window_outside_data_is_empty() {
        let f = [0.0, 5.0, 10.0];
        let p = [1.0, 2.0, 3.0];
        let w = FrequencyWindow::new(100.0, 200.0).unwrap();
        let err = WindowedSpectrum::from_slices(&f, &p, None, &w).unwrap_err();
        assert!(matches!(err, Error::EmptyFitWindow { .. }));
        assert!(FrequencyWindow::new(10.0, 1.0).is_err());
    }

    #[test]
    fn fraction_window_matches_legacy_slice() {
        let f: Vec<f64> = (0..100).map(|i| i as f64 * 10.0).collect();
        let w = FrequencyWindow::from_fraction(&f, 0.5).unwrap();
        assert_eq!(w.min_hz, 20.0);
        assert_eq!(w.max_hz, 490.0);
        assert!(FrequencyWindow::from_fraction(&f, 0.02).is_err());
        let full = FrequencyWindow::from_fraction(&f, 3.0).unwrap();
        assert_eq!(full.max_hz, 990.0);
    }

    #[test]
    fn evaluate_scores_exact_model() {
        let spectrum = noisy_lorentzian(1);
        let exact: Vec<f64> = spectrum
            .frequency
            .iter()
            .map(|&f| lorentzian(f, D0, FC0))
            .collect();
        let clean = WindowedSpectrum {
            power: exact,
            ..spectrum
        };
        let result = FitResult::evaluate(
            &clean,
            SpectralModel::Lorentzian,
            EstimatorKind::LeastSquares,
            &[D0, -FC0],
            &[0.0, 0.0],
            0,
        );
        assert_eq!(result.fc, FC0);
        assert!(result.r_squared > 1.0 - 1e-12);
        assert!(result.mean_squared_relative_residual < 1e-20);
        assert_eq!(result.residuals.len(), clean.frequency.len());
    }

    #[test]
    fn chi_squared_uses_std_when_available() {
        let f = [1.0, 2.0];
        let p = [
            lorentzian(1.0, D0, FC0) + 2.0,
            lorentzian(2.0, D0, FC0) - 1.0,
        ];
        let w = FrequencyWindow::new(0.0, 10.0).unwrap();
        let with_std = WindowedSpectrum::from_slices(&f, &p, Some(&[2.0, 0.5][..]), &w).unwrap();
        let r = FitResult::evaluate(
            &with_std,
            SpectralModel::Lorentzian,
            EstimatorKind::SFactor,
            &[D0, FC0],
            &[0.0; 2],
            0,
        );
        assert_within(r.chi_squared, 1.0 + 4.0, 1e-9);
        let nan_std =
            WindowedSpectrum::from_slices(&f, &p, Some(&[f64::NAN, f64::NAN][..]), &w).unwrap();
        let r = FitResult::evaluate(
            &nan_std,
            SpectralModel::Lorentzian,
            EstimatorKind::SFactor,
            &[D0, FC0],
            &[0.0; 2],
            0,
        );
        assert_within(r.chi_squared, 4.0 + 1.0, 1e-9);
    }

    #[test]
    fn initial_guess_is_close_on_clean_data() {
        let spectrum = noisy_lorentzian(2);
        let [d, fc] = initial_guess(&spectrum);
        assert_within(d, D0, 0.1);
        assert_within(fc, FC0, 0.1);
    }

    #[test]
    fn excluding_drops_the_drive_peak() {
        let f = [10.0, 20.0, 30.0, 40.0, 50.0];
        let p = [1.0, 2.0, 9.0, 4.0, 5.0];
        let s = [0.1; 5];
        let w = FrequencyWindow::new(0.0, 100.0).unwrap();
        let spectrum = WindowedSpectrum::from_slices(&f, &p, Some(&s[..]), &w).unwrap();
        let trimmed = spectrum
            .excluding(&FrequencyWindow::new(25.0, 35.0).unwrap())
            .unwrap();
        assert_eq!(trimmed.frequency, vec![10.0, 20.0, 40.0, 50.0]);
        assert_eq!(trimmed.power, vec![1.0, 2.0, 4.0, 5.0]);
        assert_eq!(trimmed.std.as_ref().map(Vec::len), Some(4));
        let err = spectrum
            .excluding(&FrequencyWindow::new(0.0, 60.0).unwrap())
            .unwrap_err();
        assert!(matches!(err, Error::EmptyFitWindow { .. }));
    }

    #[test]
    fn starting_point_completes_diode_guess() {
        let spectrum = noisy_lorentzian(3);
        let options = FitOptions {
            model: SpectralModel::Diode,
            initial_guess: Some(vec![1e-3, 400.0]),
            ..FitOptions::default()
        };
        assert_eq!(
            options.starting_point(&spectrum).unwrap(),
            vec![1e-3, 400.0, 2000.0, 0.5]
        );
        let bad = FitOptions {
            initial_guess: Some(vec![1e-3, 400.0, 1.0]),
            ..options
        };
        assert!(matches!(
            bad.starting_point(&spectrum),
            Err(Error::Configuration(_))
        ));
        let lorentzian = FitOptions::default().starting_point(&spectrum).unwrap();
        assert_eq!(lorentzian.len(), 2);
    }

    #[test]
    fn diode_fit_result_carries_filter_parameters() {
        let spectrum = noisy_lorentzian(4);
        let r = FitResult::evaluate(
            &spectrum,
            SpectralModel::Diode,
            EstimatorKind::LeastSquares,
            &[D0, FC0, -7000.0, 0.3],
            &[1e-5, 5.0, 100.0, 0.01],
            7,
        );
        let diode = r.diode.unwrap();
        assert_eq!(diode.f3db, 7000.0);
        assert_eq!(diode.a_error, 0.01);
        assert_eq!(r.parameters(), vec![D0, FC0, 7000.0, 0.3]);
        assert_eq!(r.model_at(100.0), crate::model::diode_lorentzian(100.0, D0, FC0, 7000.0, 0.3));
        let plain = FitResult::evaluate(
            &spectrum,
            SpectralModel::Lorentzian,
            EstimatorKind::LeastSquares,
            &[D0, FC0],
            &[0.0, 0.0],
            0,
        );
        assert!(plain.diode.is_none());
    }
}
