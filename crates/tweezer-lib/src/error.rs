use thiserror::Error;

/// Failures reported by the PSD and calibration core.
///
/// Every stage returns these to its immediate caller; nothing in the core
/// retries or silently substitutes a default.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid blocking or fitting parameters.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Periodograms with different frequency grids were passed to averaging.
    #[error("periodogram {index} does not share the frequency grid of periodogram 0")]
    InconsistentGrid { index: usize },

    /// Averaging was requested over an empty set of periodograms.
    #[error("no complete block to average")]
    NoBlocks,

    /// The frequency restriction left nothing to fit.
    #[error("no frequency bins within [{min_hz}, {max_hz}] Hz")]
    EmptyFitWindow { min_hz: f64, max_hz: f64 },

    /// The optimizer gave up. Callers may retry with a different initial guess.
    #[error("fit did not converge after {iterations} iterations: {reason}")]
    FitDidNotConverge { iterations: usize, reason: String },

    /// Physically meaningless input to a calibration or physics routine.
    #[error("invalid parameter {name} = {value}: {reason}")]
    InvalidParameter {
        name: &'static str,
        value: f64,
        reason: &'static str,
    },

    #[error("division by zero while computing {0}")]
    DivisionByZero(&'static str),

    #[error("FFT failed: {0}")]
    Fft(#[from] realfft::FftError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn not_converged(iterations: usize, reason: impl Into<String>) -> Self {
        Error::FitDidNotConverge {
            iterations,
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid(name: &'static str, value: f64, reason: &'static str) -> Self {
        Error::InvalidParameter {
            name,
            value,
            reason,
        }
    }
}
