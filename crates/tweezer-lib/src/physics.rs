//! Physical helpers for beads in water-glycerol media.
//!
//! Units follow the trap conventions: lengths in nm, forces in pN, dynamic
//! viscosity in pN s / nm^2, energies in pN nm. Densities are taken in kg/m^3
//! and temperatures of the interpolation formulas in degrees Celsius.

use crate::error::{Error, Result};
use crate::model::HydrodynamicScales;
use std::f64::consts::PI;

pub const ZERO_CELSIUS: f64 = 273.15;

/// 1 Pa s expressed in pN s / nm^2.
const PASCAL_SECOND: f64 = 1e-6;
/// 1 kg/m^3 expressed in kg/nm^3.
const KG_PER_M3: f64 = 1e-27;

pub fn celsius_to_kelvin(t_c: f64) -> f64 {
    t_c + ZERO_CELSIUS
}

pub fn kelvin_to_celsius(t_k: f64) -> f64 {
    t_k - ZERO_CELSIUS
}

/// Stokes drag `6 pi R eta` in pN s / nm.
pub fn stokes_drag(radius_nm: f64, viscosity: f64) -> f64 {
    6.0 * PI * radius_nm * viscosity
}

/// `k_B T` in pN nm, for `boltzmann` in J/K.
pub fn thermal_energy(boltzmann: f64, temperature_k: f64) -> f64 {
    boltzmann * temperature_k * 1e21
}

/// Stokes-Einstein diffusion constant in nm^2/s.
pub fn diffusion_coefficient(
    boltzmann: f64,
    temperature_k: f64,
    radius_nm: f64,
    viscosity: f64,
) -> Result<f64> {
    let drag = stokes_drag(radius_nm, viscosity);
    if !(drag > 0.0) {
        return Err(Error::invalid("drag", drag, "must be positive"));
    }
    Ok(thermal_energy(boltzmann, temperature_k) / drag)
}

/// Mass in kg of a sphere of `radius_nm` and `density` kg/m^3.
pub fn sphere_mass(radius_nm: f64, density: f64) -> f64 {
    density * KG_PER_M3 * 4.0 / 3.0 * PI * radius_nm.powi(3)
}

/// Cheng's interpolation, valid for 0..=100 C.
pub fn water_viscosity(t_c: f64) -> f64 {
    1.790e-3 * ((-1230.0 - t_c) * t_c / (36100.0 + 360.0 * t_c)).exp() * PASCAL_SECOND
}

pub fn glycerol_viscosity(t_c: f64) -> f64 {
    12100e-3 * ((-1233.0 + t_c) * t_c / (9900.0 + 70.0 * t_c)).exp() * PASCAL_SECOND
}

/// kg/m^3
pub fn water_density(t_c: f64) -> f64 {
    1000.0 * (1.0 - ((t_c - 4.0) / 622.0).abs().powf(1.7))
}

/// kg/m^3
pub fn glycerol_density(t_c: f64) -> f64 {
    1277.0 - 0.654 * t_c
}

/// Mass fraction of glycerol; zero for an empty mixture.
pub fn glycerol_mass_fraction(water_volume: f64, glycerol_volume: f64, t_c: f64) -> f64 {
    let water = water_volume * water_density(t_c);
    let glycerol = glycerol_volume * glycerol_density(t_c);
    if water + glycerol == 0.0 {
        0.0
    } else {
        glycerol / (water + glycerol)
    }
}

/// Dynamic viscosity of a water-glycerol mixture, `mu_w^alpha mu_g^(1 - alpha)`.
pub fn mixture_viscosity(water_volume: f64, glycerol_volume: f64, t_c: f64) -> f64 {
    let cm = glycerol_mass_fraction(water_volume, glycerol_volume, t_c);
    let a = 0.705 - 0.0017 * t_c;
    let b = (4.9 + 0.036 * t_c) * a.powf(2.5);
    let alpha = 1.0 - cm + a * b * cm * (1.0 - cm) / (a * cm + b * (1.0 - cm));
    water_viscosity(t_c).powf(alpha) * glycerol_viscosity(t_c).powf(1.0 - alpha)
}

/// kg/m^3
pub fn mixture_density(water_volume: f64, glycerol_volume: f64, t_c: f64) -> f64 {
    let cm = glycerol_mass_fraction(water_volume, glycerol_volume, t_c);
    glycerol_density(t_c) * cm + water_density(t_c) * (1.0 - cm)
}

/// Frequency scales of the hydrodynamic PSD correction for a bead of
/// `bead_density` in a fluid of `fluid_density` (both kg/m^3).
pub fn hydrodynamic_scales(
    radius_nm: f64,
    viscosity: f64,
    fluid_density: f64,
    bead_density: f64,
) -> Result<HydrodynamicScales> {
    if !(radius_nm > 0.0) {
        return Err(Error::invalid("radius_nm", radius_nm, "must be positive"));
    }
    if !(viscosity > 0.0) {
        return Err(Error::invalid("viscosity", viscosity, "must be positive"));
    }
    if !(fluid_density > 0.0) {
        return Err(Error::invalid("fluid_density", fluid_density, "must be positive"));
    }
    if !(bead_density > 0.0) {
        return Err(Error::invalid("bead_density", bead_density, "must be positive"));
    }
    let rho = fluid_density * KG_PER_M3;
    // nm^2/s
    let kinematic = 1e-3 * viscosity / rho;
    let fv = kinematic / (PI * radius_nm * radius_nm);
    let added_mass = 2.0 * PI * rho * radius_nm.powi(3) / 3.0;
    let mass = sphere_mass(radius_nm, bead_density) + added_mass;
    // pN s / nm -> kg / s
    let drag = stokes_drag(radius_nm, viscosity) * 1e-3;
    let fm = drag / (2.0 * PI * mass);
    Ok(HydrodynamicScales { fv, fm })
}
