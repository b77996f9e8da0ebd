//! TOML configuration of a thermal calibration run.
//!
//! Every field has a default, so an empty document is a valid configuration:
//!
//! ```toml
//! sampling_rate = 80000.0
//!
//! [blocking]
//! block_length = 8192
//!
//! [window]
//! min_hz = 5.0
//! max_hz = 3000.0
//! search_max_hz = [1500.0, 2000.0, 3000.0]
//!
//! [fit]
//! estimator = "s-factor"
//! model = "lorentzian"
//!
//! [bead]
//! radius_nm = 500.0
//! # drag_coefficient = 9.4e-6   # pN s/nm, skips Stokes' law
//!
//! # [oscillation]               # driven-trap calibration
//! # frequency_hz = 32.0
//! # amplitude_nm = 150.0
//!
//! [medium]
//! temperature_c = 25.0
//! glycerol_volume = 0.0
//! ```

use crate::calibration::{PhysicalConstants, TrapDrive, TrapParameters};
use crate::error::{Error, Result};
use crate::fit::search::WindowSearch;
use crate::fit::{EstimatorKind, FitOptions, FrequencyWindow, Weighting};
use crate::model::{ModelKind, SpectralModel};
use crate::physics;
use crate::signal::BlockParams;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Hz; required when samples come without a rate.
    pub sampling_rate: Option<f64>,
    pub blocking: BlockParams,
    pub window: WindowConfig,
    pub fit: FitConfig,
    pub bead: BeadConfig,
    pub medium: MediumConfig,
    pub constants: PhysicalConstants,
    /// When set, the drag comes from the drive peak instead of the bead.
    pub oscillation: Option<TrapDrive>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub min_hz: f64,
    pub max_hz: f64,
    /// When set, the upper cutoff is chosen among these by [`WindowSearch`].
    pub search_max_hz: Option<Vec<f64>>,
}

impl Default for WindowConfig {
    fn default() -> Self {
        let window = FrequencyWindow::default();
        Self {
            min_hz: window.min_hz,
            max_hz: window.max_hz,
            search_max_hz: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    pub estimator: EstimatorKind,
    pub model: ModelKind,
    pub weighting: Weighting,
    /// `[D, fc]`, or every parameter of the model.
    pub initial_guess: Option<Vec<f64>>,
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for FitConfig {
    fn default() -> Self {
        let options = FitOptions::default();
        Self {
            estimator: EstimatorKind::LeastSquares,
            model: ModelKind::Lorentzian,
            weighting: options.weighting,
            initial_guess: None,
            max_iterations: options.max_iterations,
            tolerance: options.tolerance,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BeadConfig {
    pub radius_nm: f64,
    /// kg/m^3, polystyrene by default.
    pub density: f64,
    /// pN s / nm, measured elsewhere; replaces Stokes' law.
    pub drag_coefficient: Option<f64>,
}

impl Default for BeadConfig {
    fn default() -> Self {
        Self {
            radius_nm: 500.0,
            density: 1050.0,
            drag_coefficient: None,
        }
    }
}

/// The medium is water by default. Viscosity and density are computed from
/// the water/glycerol volumes at `temperature_c` unless given explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediumConfig {
    /// pN s / nm^2
    pub viscosity: Option<f64>,
    /// kg/m^3
    pub density: Option<f64>,
    /// Falls back to `constants.default_temperature`.
    pub temperature_c: Option<f64>,
    pub water_volume: f64,
    pub glycerol_volume: f64,
}

impl Default for MediumConfig {
    fn default() -> Self {
        Self {
            viscosity: None,
            density: None,
            temperature_c: None,
            water_volume: 1.0,
            glycerol_volume: 0.0,
        }
    }
}

impl CalibrationConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(contents).map_err(|err| Error::Configuration(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config = Self::from_toml_str(&contents)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(fs) = self.sampling_rate {
            if !(fs.is_finite() && fs > 0.0) {
                return Err(Error::invalid("sampling_rate", fs, "must be positive"));
            }
        }
        if self.blocking.block_length == 0 {
            return Err(Error::Configuration("block_length must be positive".to_string()));
        }
        FrequencyWindow::new(self.window.min_hz, self.window.max_hz)?;
        if !(self.bead.radius_nm > 0.0) {
            return Err(Error::invalid("radius_nm", self.bead.radius_nm, "must be positive"));
        }
        if self.fit.max_iterations == 0 {
            return Err(Error::Configuration("max_iterations must be positive".to_string()));
        }
        if let Some(drag) = self.bead.drag_coefficient {
            if !(drag.is_finite() && drag > 0.0) {
                return Err(Error::invalid("drag_coefficient", drag, "must be positive"));
            }
        }
        if let Some(drive) = &self.oscillation {
            drive.validate()?;
            if self.bead.drag_coefficient.is_some() {
                return Err(Error::Configuration(
                    "drag_coefficient and [oscillation] both fix the drag; set one".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Kelvin
    pub fn temperature(&self) -> f64 {
        self.medium
            .temperature_c
            .map(physics::celsius_to_kelvin)
            .unwrap_or(self.constants.default_temperature)
    }

    fn temperature_c(&self) -> f64 {
        physics::kelvin_to_celsius(self.temperature())
    }

    /// pN s / nm^2
    pub fn viscosity(&self) -> f64 {
        self.medium.viscosity.unwrap_or_else(|| {
            physics::mixture_viscosity(
                self.medium.water_volume,
                self.medium.glycerol_volume,
                self.temperature_c(),
            )
        })
    }

    /// kg/m^3
    pub fn fluid_density(&self) -> f64 {
        self.medium.density.unwrap_or_else(|| {
            physics::mixture_density(
                self.medium.water_volume,
                self.medium.glycerol_volume,
                self.temperature_c(),
            )
        })
    }

    pub fn spectral_model(&self) -> Result<SpectralModel> {
        Ok(match self.fit.model {
            ModelKind::Lorentzian => SpectralModel::Lorentzian,
            ModelKind::Diode => SpectralModel::Diode,
            ModelKind::Hydrodynamic => SpectralModel::Hydrodynamic(physics::hydrodynamic_scales(
                self.bead.radius_nm,
                self.viscosity(),
                self.fluid_density(),
                self.bead.density,
            )?),
        })
    }

    pub fn fit_options(&self) -> Result<FitOptions> {
        Ok(FitOptions {
            model: self.spectral_model()?,
            initial_guess: self.fit.initial_guess.clone(),
            weighting: self.fit.weighting.clone(),
            max_iterations: self.fit.max_iterations,
            tolerance: self.fit.tolerance,
        })
    }

    pub fn frequency_window(&self) -> Result<FrequencyWindow> {
        FrequencyWindow::new(self.window.min_hz, self.window.max_hz)
    }

    pub fn window_search(&self) -> Option<WindowSearch> {
        self.window
            .search_max_hz
            .as_ref()
            .map(|cutoffs| WindowSearch::new(self.window.min_hz, cutoffs.clone()))
    }

    pub fn trap_parameters(&self) -> TrapParameters {
        TrapParameters {
            radius_nm: self.bead.radius_nm,
            viscosity: self.viscosity(),
            temperature: Some(self.temperature()),
        }
    }
}
