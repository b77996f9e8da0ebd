//! Sweep of the fit's upper frequency cutoff.
//!
//! Every candidate window is fitted with the same estimator; failed attempts
//! are recorded and skipped. The winner has the smallest mean squared
//! relative residual, with ties going to the earliest candidate.

use super::{Estimator, FitResult, FrequencyWindow, WindowedSpectrum};
use crate::error::{Error, Result};
use crate::spectrum::AveragedPsd;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowSearch {
    pub min_hz: f64,
    /// Upper cutoffs to try, in order.
    pub max_hz: Vec<f64>,
    /// Band left out of every candidate window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<FrequencyWindow>,
}

/// One candidate window and what happened to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowAttempt {
    pub window: FrequencyWindow,
    pub mean_squared_relative_residual: Option<f64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowSearchOutcome {
    pub best: FitResult,
    pub best_index: usize,
    pub attempts: Vec<WindowAttempt>,
}

impl WindowSearch {
    pub fn new(min_hz: f64, max_hz: Vec<f64>) -> Self {
        Self {
            min_hz,
            max_hz,
            exclude: None,
        }
    }

    pub fn excluding(mut self, band: FrequencyWindow) -> Self {
        self.exclude = Some(band);
        self
    }

    /// Cutoffs `start, start + step, ...` up to and including `stop`.
    pub fn stepped(min_hz: f64, start: f64, stop: f64, step: f64) -> Result<Self> {
        if !(step.is_finite() && step > 0.0) || !(start <= stop) {
            return Err(Error::Configuration(format!(
                "cutoff sweep {start}..={stop} by {step} is empty"
            )));
        }
        let count = ((stop - start) / step + 1e-9).floor() as usize + 1;
        let max_hz = (0..count).map(|i| start + i as f64 * step).collect();
        Ok(Self::new(min_hz, max_hz))
    }

    pub fn run(&self, psd: &AveragedPsd, estimator: &dyn Estimator) -> Result<WindowSearchOutcome> {
        if self.max_hz.is_empty() {
            return Err(Error::Configuration(
                "window search needs at least one cutoff".to_string(),
            ));
        }
        let mut attempts = Vec::with_capacity(self.max_hz.len());
        let mut best: Option<(usize, FitResult)> = None;
        let mut last_error = None;

        for (index, &max_hz) in self.max_hz.iter().enumerate() {
            let outcome = FrequencyWindow::new(self.min_hz, max_hz)
                .and_then(|window| {
                    let spectrum = WindowedSpectrum::from_psd(psd, &window)?;
                    match &self.exclude {
                        Some(band) => Ok((window, spectrum.excluding(band)?)),
                        None => Ok((window, spectrum)),
                    }
                })
                .and_then(|(window, spectrum)| {
                    estimator.fit(&spectrum).map(|fit| (window, fit))
                });
            match outcome {
                Ok((window, fit)) => {
                    let score = fit.mean_squared_relative_residual;
                    debug!(
                        "window [{}, {}] Hz: relative residual {:e}",
                        window.min_hz, window.max_hz, score
                    );
                    attempts.push(WindowAttempt {
                        window,
                        mean_squared_relative_residual: Some(score),
                        error: None,
                    });
                    let better = score.is_finite()
                        && best
                            .as_ref()
                            .map_or(true, |(_, b)| score < b.mean_squared_relative_residual);
                    if better {
                        best = Some((index, fit));
                    }
                }
                Err(err) => {
                    warn!(
                        "fit over [{}, {}] Hz failed: {}",
                        self.min_hz, max_hz, err
                    );
                    attempts.push(WindowAttempt {
                        window: FrequencyWindow {
                            min_hz: self.min_hz,
                            max_hz,
                        },
                        mean_squared_relative_residual: None,
                        error: Some(err.to_string()),
                    });
                    last_error = Some(err);
                }
            }
        }

        match best {
            Some((best_index, best)) => Ok(WindowSearchOutcome {
                best,
                best_index,
                attempts,
            }),
            None => Err(last_error.unwrap_or_else(|| {
                Error::not_converged(0, "no window produced a finite residual")
            })),
        }
    }
}
