//! Welch-style power spectral densities with per-bin spread.
//!
//! Each block is mean-detrended, multiplied by a periodic Hann window and
//! transformed with a real FFT. Power is scaled by `1 / (fs * sum(w^2))` and
//! folded into a one-sided spectrum, so integrating the PSD over frequency
//! gives back the variance of the signal (up to windowing loss). The blocks
//! are averaged here rather than inside the estimator so that the sample
//! standard deviation of every bin is available for weighting and chi squared.

use crate::error::{Error, Result};
use crate::signal::{block, BlockParams, BlockSet, TimeSeries};
use log::debug;
use realfft::{RealFftPlanner, RealToComplex};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::sync::Arc;

/// One-sided spectrum of a single block, bins `0..=block_length/2`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Periodogram {
    pub frequency: Vec<f64>,
    pub power: Vec<f64>,
}

/// Block-averaged PSD.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AveragedPsd {
    pub frequency: Vec<f64>,
    pub mean_power: Vec<f64>,
    /// Sample standard deviation (ddof = 1); NaN when only one block was averaged.
    pub std_power: Vec<f64>,
    pub n_blocks: usize,
}

impl AveragedPsd {
    pub fn len(&self) -> usize {
        self.frequency.len()
    }
    pub fn is_empty(&self) -> bool {
        self.frequency.is_empty()
    }
    /// Frequency resolution `fs / block_length` in Hz.
    pub fn bin_width(&self) -> Result<f64> {
        match self.frequency.as_slice() {
            [f0, f1, ..] if f1 > f0 => Ok(f1 - f0),
            _ => Err(Error::Configuration(
                "bin width needs at least two increasing frequency bins".to_string(),
            )),
        }
    }
    pub fn points(&self) -> Vec<[f64; 2]> {
        self.frequency
            .iter()
            .zip(self.mean_power.iter())
            .map(|(f, p)| [*f, *p])
            .collect()
    }
}

/// Planned FFT plus window for a fixed block length and sampling rate.
pub struct PeriodogramEngine {
    fs: f64,
    block_length: usize,
    window: Vec<f64>,
    scale: f64,
    fft: Arc<dyn RealToComplex<f64>>,
}

impl PeriodogramEngine {
    pub fn new(block_length: usize, fs: f64) -> Result<Self> {
        if block_length < 2 {
            return Err(Error::Configuration(format!(
                "block length {} is too short for a periodogram",
                block_length
            )));
        }
        if !(fs.is_finite() && fs > 0.0) {
            return Err(Error::invalid("fs", fs, "sampling rate must be positive"));
        }
        let window = hann(block_length);
        let window_energy: f64 = window.iter().map(|w| w * w).sum();
        let mut planner = RealFftPlanner::<f64>::new();
        let fft = planner.plan_fft_forward(block_length);
        Ok(Self {
            fs,
            block_length,
            window,
            scale: 1.0 / (fs * window_energy),
            fft,
        })
    }

    pub fn block_length(&self) -> usize {
        self.block_length
    }

    /// Bin frequencies `k * fs / block_length` for `k = 0..=block_length/2`.
    pub fn frequencies(&self) -> Vec<f64> {
        (0..=self.block_length / 2)
            .map(|k| k as f64 * self.fs / self.block_length as f64)
            .collect()
    }

    pub fn compute(&self, block: &[f64]) -> Result<Periodogram> {
        if block.len() != self.block_length {
            return Err(Error::Configuration(format!(
                "block has {} samples, engine expects {}",
                block.len(),
                self.block_length
            )));
        }
        let mean = block.iter().sum::<f64>() / block.len() as f64;
        let mut frame: Vec<f64> = block
            .iter()
            .zip(self.window.iter())
            .map(|(x, w)| (x - mean) * w)
            .collect();
        let mut spectrum = self.fft.make_output_vec();
        self.fft.process(&mut frame, &mut spectrum)?;
        let n = self.block_length;
        let power = spectrum
            .iter()
            .enumerate()
            .map(|(k, val)| {
                let folded = if k == 0 || (n % 2 == 0 && k == n / 2) {
                    val.norm_sqr()
                } else {
                    2.0 * val.norm_sqr()
                };
                folded * self.scale
            })
            .collect();
        Ok(Periodogram {
            frequency: self.frequencies(),
            power,
        })
    }

    pub fn compute_all(&self, blocks: &BlockSet) -> Result<Vec<Periodogram>> {
        blocks.blocks.iter().map(|b| self.compute(b)).collect()
    }
}

/// Single-block periodogram, planning a fresh FFT.
pub fn block_periodogram(block: &[f64], fs: f64) -> Result<Periodogram> {
    PeriodogramEngine::new(block.len(), fs)?.compute(block)
}

/// Average periodograms that share one frequency grid (bit-for-bit).
pub fn average_psd(periodograms: &[Periodogram]) -> Result<AveragedPsd> {
    let first = periodograms.first().ok_or(Error::NoBlocks)?;
    for (index, p) in periodograms.iter().enumerate().skip(1) {
        if !same_grid(&first.frequency, &p.frequency) || p.power.len() != first.power.len() {
            return Err(Error::InconsistentGrid { index });
        }
    }
    let n_blocks = periodograms.len();
    let bins = first.power.len();
    let mut mean_power = vec![0.0; bins];
    for p in periodograms {
        for (acc, v) in mean_power.iter_mut().zip(p.power.iter()) {
            *acc += v;
        }
    }
    for acc in mean_power.iter_mut() {
        *acc /= n_blocks as f64;
    }
    let std_power = if n_blocks < 2 {
        vec![f64::NAN; bins]
    } else {
        (0..bins)
            .map(|k| {
                let ss: f64 = periodograms
                    .iter()
                    .map(|p| (p.power[k] - mean_power[k]).powi(2))
                    .sum();
                (ss / (n_blocks as f64 - 1.0)).sqrt()
            })
            .collect()
    };
    Ok(AveragedPsd {
        frequency: first.frequency.clone(),
        mean_power,
        std_power,
        n_blocks,
    })
}

fn same_grid(a: &[f64], b: &[f64]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
}

/// Result of [`compute_psd`]: the averaged spectrum plus how it was blocked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PsdEstimate {
    pub psd: AveragedPsd,
    pub fs: f64,
    pub block_length: usize,
    pub overlap: usize,
    /// Power of every block, kept only on request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_power: Option<Vec<Vec<f64>>>,
}

/// Block the series, compute every block's periodogram and average them.
pub fn compute_psd(
    series: &TimeSeries,
    params: &BlockParams,
    keep_blocks: bool,
) -> Result<PsdEstimate> {
    let blocks = block(series, params)?;
    let engine = PeriodogramEngine::new(blocks.block_length, blocks.fs)?;
    let periodograms = engine.compute_all(&blocks)?;
    let psd = average_psd(&periodograms)?;
    debug!(
        "averaged {} periodograms of {} bins (fs {} Hz)",
        psd.n_blocks,
        psd.len(),
        series.fs
    );
    let block_power = keep_blocks.then(|| periodograms.into_iter().map(|p| p.power).collect());
    Ok(PsdEstimate {
        psd,
        fs: blocks.fs,
        block_length: blocks.block_length,
        overlap: blocks.overlap,
        block_power,
    })
}

fn hann(size: usize) -> Vec<f64> {
    (0..size)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f64 / (size as f64)).cos()))
        .collect()
}
