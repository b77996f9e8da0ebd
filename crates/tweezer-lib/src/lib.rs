pub mod calibration;
pub mod config;
pub mod error;
pub mod fit;
pub mod io;
pub mod model;
pub mod physics;
pub mod pipeline;
pub mod signal;
pub mod simulate;
pub mod spectrum;

pub use calibration::*;
pub use error::{Error, Result};
pub use fit::{Estimator, EstimatorKind, FitOptions, FitResult, FrequencyWindow, WindowedSpectrum};
pub use model::*;
pub use signal::*;
pub use spectrum::*;
