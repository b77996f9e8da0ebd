//! Spectral models for a bead in a harmonic trap.
//!
//! Every model is evaluated on a parameter vector whose first two entries are
//! `[D, fc]`; [`SpectralModel::Diode`] appends the photodiode's `[f3db, a]`.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

const PI2: f64 = PI * PI;

/// Starting `[f3db, a]` for the diode parameters when no guess is given.
pub const DIODE_GUESS: [f64; 2] = [2000.0, 0.5];

/// Frequencies (Hz) above which the hydrodynamic corrections matter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HydrodynamicScales {
    /// Viscous boundary-layer frequency `nu / (pi R^2)`.
    pub fv: f64,
    /// Inertial frequency `gamma / (2 pi (m + 2 pi rho R^3 / 3))`.
    pub fm: f64,
}

/// Which spectral model to fit; selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelKind {
    Lorentzian,
    Hydrodynamic,
    Diode,
}

/// Closed set of PSD models.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SpectralModel {
    /// `D / (pi^2 (f^2 + fc^2))`
    Lorentzian,
    /// Lorentzian with frequency-dependent drag and added mass.
    Hydrodynamic(HydrodynamicScales),
    /// Lorentzian seen through a silicon photodiode, which acts as a low-pass
    /// filter with roll-off `f3db` and instantaneous response fraction `a`.
    /// Both are fitted along with `(D, fc)`.
    Diode,
}

impl SpectralModel {
    pub fn kind(&self) -> ModelKind {
        match self {
            SpectralModel::Lorentzian => ModelKind::Lorentzian,
            SpectralModel::Hydrodynamic(_) => ModelKind::Hydrodynamic,
            SpectralModel::Diode => ModelKind::Diode,
        }
    }

    /// Number of fitted parameters.
    pub fn n_params(&self) -> usize {
        match self {
            SpectralModel::Lorentzian | SpectralModel::Hydrodynamic(_) => 2,
            SpectralModel::Diode => 4,
        }
    }

    /// Parameters appended to `[D, fc]` when the caller only guesses those two.
    pub fn default_extra_params(&self) -> &'static [f64] {
        match self {
            SpectralModel::Lorentzian | SpectralModel::Hydrodynamic(_) => &[],
            SpectralModel::Diode => &DIODE_GUESS,
        }
    }

    /// Power at `f`. `params` holds [`SpectralModel::n_params`] entries.
    pub fn eval(&self, f: f64, params: &[f64]) -> f64 {
        let (d, fc) = (params[0], params[1]);
        match self {
            SpectralModel::Lorentzian => lorentzian(f, d, fc),
            SpectralModel::Hydrodynamic(scales) => hydrodynamic_lorentzian(f, d, fc, scales),
            SpectralModel::Diode => diode_lorentzian(f, d, fc, params[2], params[3]),
        }
    }

    pub fn eval_all(&self, frequency: &[f64], params: &[f64]) -> Vec<f64> {
        frequency.iter().map(|&f| self.eval(f, params)).collect()
    }

    /// Partial derivatives of the power at `f`, in parameter order.
    pub fn gradient(&self, f: f64, params: &[f64]) -> Vec<f64> {
        let (d, fc) = (params[0], params[1]);
        match self {
            SpectralModel::Lorentzian => lorentzian_gradient(f, d, fc).to_vec(),
            SpectralModel::Hydrodynamic(scales) => {
                let terms = HydroTerms::new(f, fc, scales);
                let den = terms.denominator();
                vec![
                    terms.numerator / (PI2 * den),
                    -2.0 * d * terms.numerator * terms.real / (PI2 * den * den),
                ]
            }
            SpectralModel::Diode => {
                let (f3db, a) = (params[2], params[3]);
                let x = (f / f3db).powi(2);
                let g = diode_response(f, f3db, a);
                let l = lorentzian(f, d, fc);
                let [dl_dd, dl_dfc] = lorentzian_gradient(f, d, fc);
                vec![
                    g * dl_dd,
                    g * dl_dfc,
                    l * (1.0 - a * a) * 2.0 * x / (f3db * (1.0 + x).powi(2)),
                    l * 2.0 * a * x / (1.0 + x),
                ]
            }
        }
    }

    /// Fold parameters the model is even in to their non-negative value.
    pub fn canonicalize(&self, params: &mut [f64]) {
        let even = match self {
            SpectralModel::Lorentzian | SpectralModel::Hydrodynamic(_) => 1..2,
            SpectralModel::Diode => 1..4,
        };
        for p in &mut params[even] {
            *p = p.abs();
        }
    }
}

pub fn lorentzian(f: f64, d: f64, fc: f64) -> f64 {
    d / (PI2 * (f * f + fc * fc))
}

fn lorentzian_gradient(f: f64, d: f64, fc: f64) -> [f64; 2] {
    let s = f * f + fc * fc;
    [1.0 / (PI2 * s), -2.0 * d * fc / (PI2 * s * s)]
}

/// Hydrodynamically corrected Lorentzian. Reduces to [`lorentzian`] as
/// `fv, fm -> infinity`.
///
/// This is the legacy expression `D (1 + sqrt(f/fv)) / [...]` divided by
/// `pi^2`, unlike the legacy code, so that `D` means the same thing for both
/// models and feeds the calibration unchanged.
pub fn hydrodynamic_lorentzian(f: f64, d: f64, fc: f64, scales: &HydrodynamicScales) -> f64 {
    let terms = HydroTerms::new(f, fc, scales);
    d * terms.numerator / (PI2 * terms.denominator())
}

/// Transfer `a^2 + (1 - a^2) / (1 + (f / f3db)^2)` of a photodiode
/// (Berg-Sørensen et al. 2004).
pub fn diode_response(f: f64, f3db: f64, a: f64) -> f64 {
    a * a + (1.0 - a * a) / (1.0 + (f / f3db).powi(2))
}

pub fn diode_lorentzian(f: f64, d: f64, fc: f64, f3db: f64, a: f64) -> f64 {
    diode_response(f, f3db, a) * lorentzian(f, d, fc)
}

struct HydroTerms {
    numerator: f64,
    real: f64,
    imag: f64,
}

impl HydroTerms {
    fn new(f: f64, fc: f64, scales: &HydrodynamicScales) -> Self {
        let root = (f / scales.fv).sqrt();
        let f32_term = f * root;
        Self {
            numerator: 1.0 + root,
            real: fc - f32_term - f * f / scales.fm,
            imag: f + f32_term,
        }
    }

    fn denominator(&self) -> f64 {
        self.real * self.real + self.imag * self.imag
    }
}
