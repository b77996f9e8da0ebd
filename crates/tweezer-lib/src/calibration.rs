//! Conversion of a fitted `(D, fc)` into trap calibration factors.
//!
//! The drag coefficient comes from one of three places: Stokes' law for a
//! sphere of known radius in a medium of known viscosity, a value measured
//! elsewhere (typically the oscillated axis of the same bead), or the power
//! a sinusoidal trap drive puts into the spectrum.

use crate::error::{Error, Result};
use crate::fit::{FitResult, FrequencyWindow};
use crate::physics::{stokes_drag, thermal_energy};
use crate::spectrum::AveragedPsd;
use log::debug;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Constants injected into [`CalibrationDeriver`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhysicalConstants {
    /// Boltzmann constant in J/K.
    pub boltzmann: f64,
    /// Kelvin, used when the caller gives no temperature.
    pub default_temperature: f64,
}

impl Default for PhysicalConstants {
    fn default() -> Self {
        Self {
            boltzmann: 1.380649e-23,
            default_temperature: 298.15,
        }
    }
}

/// Bead and medium the calibration refers to.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrapParameters {
    pub radius_nm: f64,
    /// pN s / nm^2
    pub viscosity: f64,
    /// Kelvin; `None` uses [`PhysicalConstants::default_temperature`].
    pub temperature: Option<f64>,
}

/// Sinusoidal trap motion used by the oscillation calibration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrapDrive {
    pub frequency_hz: f64,
    /// Amplitude of the trap motion in nm.
    pub amplitude_nm: f64,
}

impl TrapDrive {
    pub fn validate(&self) -> Result<()> {
        if !(self.frequency_hz.is_finite() && self.frequency_hz > 0.0) {
            return Err(Error::invalid(
                "drive frequency",
                self.frequency_hz,
                "must be positive",
            ));
        }
        if !(self.amplitude_nm.is_finite() && self.amplitude_nm > 0.0) {
            return Err(Error::invalid(
                "drive amplitude",
                self.amplitude_nm,
                "must be positive",
            ));
        }
        Ok(())
    }

    /// Bins holding the drive peak: the one nearest the drive and its two
    /// neighbours, which is where a Hann window spreads a sinusoid.
    pub fn peak_band(&self, bin_width: f64) -> FrequencyWindow {
        FrequencyWindow {
            min_hz: self.frequency_hz - 1.5 * bin_width,
            max_hz: self.frequency_hz + 1.5 * bin_width,
        }
    }

    /// Expected power of the bead's response at the drive, in nm^2, for a
    /// trap with corner frequency `fc`.
    pub fn response_power(&self, fc: f64) -> f64 {
        self.amplitude_nm.powi(2) / (2.0 * (1.0 + (fc / self.frequency_hz).powi(2)))
    }
}

/// Power of the drive peak above the fitted thermal background, in PSD units
/// times Hz (V^2 for a voltage signal).
pub fn peak_power(psd: &AveragedPsd, fit: &FitResult, drive: &TrapDrive) -> Result<f64> {
    drive.validate()?;
    let bin_width = psd.bin_width()?;
    let band = drive.peak_band(bin_width);
    let mut bins = 0;
    let mut excess = 0.0;
    for (&f, &p) in psd.frequency.iter().zip(&psd.mean_power) {
        if band.contains(f) {
            bins += 1;
            excess += p - fit.model_at(f);
        }
    }
    if bins == 0 {
        return Err(Error::EmptyFitWindow {
            min_hz: band.min_hz,
            max_hz: band.max_hz,
        });
    }
    let power = excess * bin_width;
    if !(power.is_finite() && power > 0.0) {
        return Err(Error::invalid(
            "peak power",
            power,
            "drive peak is not above the fitted background",
        ));
    }
    debug!(
        "drive peak at {} Hz: {:e} over {} bins",
        drive.frequency_hz, power, bins
    );
    Ok(power)
}

/// Where the drag coefficient of a calibration came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CalibrationMethod {
    Stokes,
    KnownDrag,
    Oscillation,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationConstants {
    /// Distance calibration in V/nm (PSD units per nm).
    pub beta: f64,
    /// Trap stiffness in pN/nm.
    pub kappa: f64,
    /// Force calibration in pN/V.
    pub alpha: f64,
    pub beta_error: f64,
    pub kappa_error: f64,
    pub alpha_error: f64,
    /// Kelvin
    pub temperature: f64,
    /// pN s / nm
    pub drag_coefficient: f64,
    /// Non-zero only when the drag itself was inferred from the fit.
    pub drag_coefficient_error: f64,
    pub method: CalibrationMethod,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CalibrationDeriver {
    constants: PhysicalConstants,
}

impl CalibrationDeriver {
    pub fn new(constants: PhysicalConstants) -> Self {
        Self { constants }
    }

    pub fn constants(&self) -> &PhysicalConstants {
        &self.constants
    }

    /// Temperature in Kelvin and `k_B T` in pN nm.
    fn thermal_energy(&self, temperature: Option<f64>) -> Result<(f64, f64)> {
        let temperature = temperature.unwrap_or(self.constants.default_temperature);
        if !(temperature.is_finite() && temperature > 0.0) {
            return Err(Error::invalid("temperature", temperature, "must be positive Kelvin"));
        }
        let boltzmann = self.constants.boltzmann;
        if !(boltzmann.is_finite() && boltzmann > 0.0) {
            return Err(Error::invalid("boltzmann", boltzmann, "must be positive J/K"));
        }
        Ok((temperature, thermal_energy(boltzmann, temperature)))
    }

    /// Stokes drag of the bead, then [`CalibrationDeriver::derive_with_drag`].
    /// Uncertainties are left at zero; see [`CalibrationDeriver::derive_from_fit`].
    pub fn derive(&self, d: f64, fc: f64, trap: &TrapParameters) -> Result<CalibrationConstants> {
        let drag = stokes_drag(trap.radius_nm, trap.viscosity);
        if !(drag.is_finite() && drag > 0.0) {
            return Err(Error::invalid("drag", drag, "radius and viscosity must be positive"));
        }
        let mut c = self.derive_with_drag(d, fc, drag, trap.temperature)?;
        c.method = CalibrationMethod::Stokes;
        Ok(c)
    }

    /// `beta = sqrt(drag D / kT)`, `kappa = 2 pi fc drag`, `alpha = kappa / beta`
    /// for a drag coefficient (pN s / nm) known from elsewhere.
    pub fn derive_with_drag(
        &self,
        d: f64,
        fc: f64,
        drag: f64,
        temperature: Option<f64>,
    ) -> Result<CalibrationConstants> {
        let (temperature, kt) = self.thermal_energy(temperature)?;
        if !(d.is_finite() && d > 0.0) {
            return Err(Error::invalid("D", d, "diffusion constant must be positive"));
        }
        if !(drag.is_finite() && drag > 0.0) {
            return Err(Error::invalid("drag", drag, "must be positive"));
        }
        let beta = 1.0 / (kt / (drag * d)).sqrt();
        Self::finish(beta, fc, drag, temperature, CalibrationMethod::KnownDrag)
    }

    /// Oscillation method: the drive peak fixes `beta = sqrt(W_exp / W_th)`
    /// and the drag follows as `kT beta^2 / D`. `peak_power` is the result of
    /// [`peak_power`].
    pub fn derive_oscillation(
        &self,
        d: f64,
        fc: f64,
        drive: &TrapDrive,
        peak_power: f64,
        temperature: Option<f64>,
    ) -> Result<CalibrationConstants> {
        let (temperature, kt) = self.thermal_energy(temperature)?;
        drive.validate()?;
        if !(d.is_finite() && d > 0.0) {
            return Err(Error::invalid("D", d, "diffusion constant must be positive"));
        }
        if !(peak_power.is_finite() && peak_power > 0.0) {
            return Err(Error::invalid("peak power", peak_power, "must be positive"));
        }
        let beta = (peak_power / drive.response_power(fc)).sqrt();
        let drag = kt * beta * beta / d;
        Self::finish(beta, fc, drag, temperature, CalibrationMethod::Oscillation)
    }

    fn finish(
        beta: f64,
        fc: f64,
        drag: f64,
        temperature: f64,
        method: CalibrationMethod,
    ) -> Result<CalibrationConstants> {
        if beta == 0.0 || !beta.is_finite() {
            return Err(Error::DivisionByZero("alpha = kappa / beta"));
        }
        let kappa = 2.0 * PI * fc * drag;
        let alpha = kappa / beta;
        debug!(
            "{:?} calibration at {} K: beta = {:e} V/nm, kappa = {:e} pN/nm, alpha = {:e} pN/V",
            method, temperature, beta, kappa, alpha
        );
        Ok(CalibrationConstants {
            beta,
            kappa,
            alpha,
            beta_error: 0.0,
            kappa_error: 0.0,
            alpha_error: 0.0,
            temperature,
            drag_coefficient: drag,
            drag_coefficient_error: 0.0,
            method,
        })
    }

    /// [`CalibrationDeriver::derive`] with the fit's uncertainties propagated
    /// to first order.
    pub fn derive_from_fit(
        &self,
        fit: &FitResult,
        trap: &TrapParameters,
    ) -> Result<CalibrationConstants> {
        let mut c = self.derive(fit.d, fit.fc, trap)?;
        propagate_fixed_drag(&mut c, fit);
        Ok(c)
    }

    /// [`CalibrationDeriver::derive_with_drag`] with the fit's uncertainties.
    /// The drag is taken as exact.
    pub fn derive_from_fit_with_drag(
        &self,
        fit: &FitResult,
        drag: f64,
        temperature: Option<f64>,
    ) -> Result<CalibrationConstants> {
        let mut c = self.derive_with_drag(fit.d, fit.fc, drag, temperature)?;
        propagate_fixed_drag(&mut c, fit);
        Ok(c)
    }

    /// [`CalibrationDeriver::derive_oscillation`] with the fit's uncertainties,
    /// neglecting the correlation of `D` and `fc` and the noise of the peak.
    pub fn derive_oscillation_from_fit(
        &self,
        fit: &FitResult,
        drive: &TrapDrive,
        peak_power: f64,
        temperature: Option<f64>,
    ) -> Result<CalibrationConstants> {
        let mut c = self.derive_oscillation(fit.d, fit.fc, drive, peak_power, temperature)?;
        let ratio = fit.fc / drive.frequency_hz;
        let rel_beta = (fit.fc / drive.frequency_hz.powi(2)) / (1.0 + ratio * ratio) * fit.fc_error;
        let rel_drag = ((2.0 * rel_beta).powi(2) + (fit.d_error / fit.d).powi(2)).sqrt();
        let rel_kappa = if fit.fc != 0.0 {
            ((fit.fc_error / fit.fc).powi(2) + rel_drag.powi(2)).sqrt()
        } else {
            f64::NAN
        };
        c.beta_error = c.beta * rel_beta.abs();
        c.drag_coefficient_error = c.drag_coefficient * rel_drag;
        c.kappa_error = c.kappa.abs() * rel_kappa;
        c.alpha_error = c.alpha.abs() * (rel_kappa.powi(2) + rel_beta.powi(2)).sqrt();
        Ok(c)
    }
}

fn propagate_fixed_drag(c: &mut CalibrationConstants, fit: &FitResult) {
    c.beta_error = c.beta * fit.d_error / (2.0 * fit.d);
    c.kappa_error = if fit.fc != 0.0 {
        c.kappa * fit.fc_error / fit.fc.abs()
    } else {
        f64::NAN
    };
    c.alpha_error =
        c.alpha.abs() * ((c.kappa_error / c.kappa).powi(2) + (c.beta_error / c.beta).powi(2)).sqrt();
}
