//! Time series to calibration factors in one call.

use crate::calibration::{peak_power, CalibrationConstants, CalibrationDeriver};
use crate::config::CalibrationConfig;
use crate::error::Result;
use crate::fit::{FitResult, WindowAttempt, WindowedSpectrum};
use crate::signal::TimeSeries;
use crate::spectrum::compute_psd;
use log::info;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationReport {
    pub fs: f64,
    pub n_samples: usize,
    pub block_length: usize,
    pub overlap: usize,
    pub n_blocks: usize,
    pub fit: FitResult,
    pub calibration: CalibrationConstants,
    /// Present when the upper cutoff was chosen by a window search.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_attempts: Option<Vec<WindowAttempt>>,
    /// Drive peak above the thermal background, for oscillation runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peak_power: Option<f64>,
}

/// Block, average, fit and derive calibration factors for one detector axis.
///
/// With `[oscillation]` configured, the bins of the drive peak are left out
/// of the fit and the peak's power fixes the drag; otherwise a configured
/// `drag_coefficient` or Stokes' law does.
pub fn calibrate(series: &TimeSeries, config: &CalibrationConfig) -> Result<CalibrationReport> {
    let estimate = compute_psd(series, &config.blocking, false)?;
    let estimator = config.fit.estimator.build(config.fit_options()?);
    let peak_band = match &config.oscillation {
        Some(drive) => Some(drive.peak_band(estimate.psd.bin_width()?)),
        None => None,
    };

    let (fit, window_attempts) = match config.window_search() {
        Some(search) => {
            let search = match peak_band {
                Some(band) => search.excluding(band),
                None => search,
            };
            let outcome = search.run(&estimate.psd, estimator.as_ref())?;
            (outcome.best, Some(outcome.attempts))
        }
        None => {
            let mut spectrum =
                WindowedSpectrum::from_psd(&estimate.psd, &config.frequency_window()?)?;
            if let Some(band) = &peak_band {
                spectrum = spectrum.excluding(band)?;
            }
            (estimator.fit(&spectrum)?, None)
        }
    };

    let deriver = CalibrationDeriver::new(config.constants);
    let temperature = Some(config.temperature());
    let (calibration, peak_power) = match (&config.oscillation, config.bead.drag_coefficient) {
        (Some(drive), _) => {
            let power = peak_power(&estimate.psd, &fit, drive)?;
            let c = deriver.derive_oscillation_from_fit(&fit, drive, power, temperature)?;
            (c, Some(power))
        }
        (None, Some(drag)) => (deriver.derive_from_fit_with_drag(&fit, drag, temperature)?, None),
        (None, None) => (deriver.derive_from_fit(&fit, &config.trap_parameters())?, None),
    };
    info!(
        "{:?} fit over [{}, {}] Hz: D = {:e}, fc = {:.2} Hz, kappa = {:e} pN/nm ({:?})",
        fit.estimator,
        fit.window.min_hz,
        fit.window.max_hz,
        fit.d,
        fit.fc,
        calibration.kappa,
        calibration.method
    );
    Ok(CalibrationReport {
        fs: series.fs,
        n_samples: series.len(),
        block_length: estimate.block_length,
        overlap: estimate.overlap,
        n_blocks: estimate.psd.n_blocks,
        fit,
        calibration,
        window_attempts,
        peak_power,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{CalibrationMethod, TrapDrive};
    use crate::error::Error;
    use crate::fit::EstimatorKind;
    use crate::simulate::TrapSimulation;
    use std::f64::consts::PI;

    fn trace() -> TimeSeries {
        TrapSimulation {
            fs: 80_000.0,
            d: 1e-3,
            fc: 500.0,
            n_samples: 1 << 18,
            seed: 42,
        }
        .generate()
        .unwrap()
    }

    fn config(estimator: &str) -> CalibrationConfig {
        CalibrationConfig::from_toml_str(&format!(
            "[blocking]\nblock_length = 4096\n[window]\nmin_hz = 50.0\nmax_hz = 5000.0\n\
             [fit]\nestimator = \"{estimator}\"\n[medium]\nviscosity = 1e-9\ntemperature_c = 25.0\n"
        ))
        .unwrap()
    }

    #[test]
    fn every_estimator_recovers_the_corner_frequency() {
        let series = trace();
        for name in ["least-squares", "mle", "s-factor"] {
            let report = calibrate(&series, &config(name)).unwrap();
            assert_eq!(report.n_blocks, 64);
            assert!(
                (report.fit.fc / 500.0 - 1.0).abs() < 0.1,
                "{name}: fc = {}",
                report.fit.fc
            );
            assert_eq!(report.calibration.alpha, report.calibration.kappa / report.calibration.beta);
            assert_eq!(report.calibration.method, CalibrationMethod::Stokes);
        }
    }

    #[test]
    fn window_search_reports_attempts() {
        let mut config = config("s-factor");
        config.window.search_max_hz = Some(vec![2000.0, 5000.0, 10.0]);
        let report = calibrate(&trace(), &config).unwrap();
        let attempts = report.window_attempts.as_ref().unwrap();
        assert_eq!(attempts.len(), 3);
        assert!(attempts[2].error.is_some());
        assert_eq!(report.fit.estimator, EstimatorKind::SFactor);
    }

    #[test]
    fn report_serializes_to_json() {
        let report = calibrate(&trace(), &config("s-factor")).unwrap();
        let json = serde_json::to_string(&report).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["fit"]["estimator"], "s-factor");
        assert_eq!(value["calibration"]["method"], "stokes");
        assert!(value["calibration"]["kappa"].as_f64().unwrap() > 0.0);
        assert!(value.get("window_attempts").is_none());
        assert!(value.get("peak_power").is_none());
    }

    #[test]
    fn short_series_has_no_blocks() {
        let series = TimeSeries::new(80_000.0, vec![0.0; 100]).unwrap();
        let err = calibrate(&series, &config("s-factor")).unwrap_err();
        assert!(matches!(err, Error::NoBlocks));
    }

    #[test]
    fn known_drag_replaces_stokes() {
        let mut config = config("s-factor");
        config.bead.drag_coefficient = Some(2e-5);
        let report = calibrate(&trace(), &config).unwrap();
        assert_eq!(report.calibration.method, CalibrationMethod::KnownDrag);
        assert_eq!(report.calibration.drag_coefficient, 2e-5);
        assert_eq!(report.calibration.kappa, 2.0 * PI * report.fit.fc * 2e-5);
    }

    #[test]
    fn oscillation_recovers_the_bead_drag() {
        let config = config("s-factor");
        let stokes = calibrate(&trace(), &config).unwrap().calibration;

        // 1250 Hz is bin 64 of a 4096-sample block at 80 kHz
        let drive = TrapDrive {
            frequency_hz: 1250.0,
            amplitude_nm: 100.0,
        };
        let amplitude = stokes.beta * (2.0 * drive.response_power(500.0)).sqrt();
        let mut series = trace();
        for (i, x) in series.data.iter_mut().enumerate() {
            *x += amplitude * (2.0 * PI * drive.frequency_hz * i as f64 / series.fs).sin();
        }
        let config = CalibrationConfig {
            oscillation: Some(drive),
            ..config
        };
        let report = calibrate(&series, &config).unwrap();
        assert_eq!(report.calibration.method, CalibrationMethod::Oscillation);
        assert!(report.peak_power.unwrap() > 0.0);
        assert!(!report.fit.frequency.contains(&1250.0));
        assert!((report.fit.fc / 500.0 - 1.0).abs() < 0.1, "fc = {}", report.fit.fc);
        let drag_ratio = report.calibration.drag_coefficient / stokes.drag_coefficient;
        assert!((drag_ratio - 1.0).abs() < 0.15, "drag ratio {drag_ratio}");
    }
}
