use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use env_logger::Env;
use log::info;
use std::{
    io::{self, Read, Write},
    path::{Path, PathBuf},
};
use tweezer_lib::{
    compute_psd,
    TrapDrive,
    config::CalibrationConfig,
    fit::{Estimator, EstimatorKind, FrequencyWindow, WindowedSpectrum},
    io::text as text_io,
    io::Column,
    model::ModelKind,
    pipeline::calibrate,
    simulate::TrapSimulation,
    TimeSeries,
};

#[derive(Parser)]
#[command(
    name = "tweezer",
    version,
    about = "Power spectra and thermal calibration of optical tweezers"
)]
struct Cli {
    /// Default log filter; RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum EstimatorArg {
    #[value(name = "least-squares")]
    LeastSquares,
    #[value(name = "mle")]
    Mle,
    #[value(name = "s-factor")]
    SFactor,
}

impl From<EstimatorArg> for EstimatorKind {
    fn from(arg: EstimatorArg) -> Self {
        match arg {
            EstimatorArg::LeastSquares => EstimatorKind::LeastSquares,
            EstimatorArg::Mle => EstimatorKind::Mle,
            EstimatorArg::SFactor => EstimatorKind::SFactor,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ModelArg {
    #[value(name = "lorentzian")]
    Lorentzian,
    #[value(name = "hydrodynamic")]
    Hydrodynamic,
    #[value(name = "diode")]
    Diode,
}

impl From<ModelArg> for ModelKind {
    fn from(arg: ModelArg) -> Self {
        match arg {
            ModelArg::Lorentzian => ModelKind::Lorentzian,
            ModelArg::Hydrodynamic => ModelKind::Hydrodynamic,
            ModelArg::Diode => ModelKind::Diode,
        }
    }
}

/// Where the samples come from and how they are blocked.
#[derive(Args)]
struct InputArgs {
    /// Newline-delimited samples, or a tab-delimited trace with --column; stdin if omitted
    #[arg(long)]
    input: Option<PathBuf>,
    /// Column of a tab-delimited trace, zero-based index or header name
    #[arg(long)]
    column: Option<Column>,
    /// Metadata lines to skip before the column data
    #[arg(long, default_value_t = 0)]
    header_lines: usize,
    /// Sampling rate in Hz; overrides the config file
    #[arg(long)]
    fs: Option<f64>,
    /// TOML calibration config
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    block_length: Option<usize>,
    #[arg(long)]
    overlap: Option<usize>,
    #[arg(long)]
    n_blocks: Option<usize>,
}

/// Fit window and estimator overrides.
#[derive(Args)]
struct FitArgs {
    #[arg(long)]
    estimator: Option<EstimatorArg>,
    #[arg(long)]
    model: Option<ModelArg>,
    #[arg(long)]
    min_hz: Option<f64>,
    #[arg(long)]
    max_hz: Option<f64>,
    /// Legacy upper limit as a fraction of the spectrum (bins 2..len*fraction)
    #[arg(long, conflicts_with_all = ["min_hz", "max_hz"])]
    fraction: Option<f64>,
    /// Candidate upper cutoffs for a window search, comma-separated
    #[arg(long, value_delimiter = ',')]
    search_max_hz: Option<Vec<f64>>,
}

/// Alternatives to Stokes drag of the configured bead.
#[derive(Args)]
struct DragArgs {
    /// Known drag coefficient in pN s / nm
    #[arg(long, conflicts_with = "drive_hz")]
    drag: Option<f64>,
    /// Frequency of a sinusoidal trap drive; calibrates from its peak
    #[arg(long, requires = "drive_amplitude_nm")]
    drive_hz: Option<f64>,
    /// Amplitude of the trap drive in nm
    #[arg(long, requires = "drive_hz")]
    drive_amplitude_nm: Option<f64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Averaged power spectral density of a trace
    Psd {
        #[command(flatten)]
        input: InputArgs,
        /// Also print every block's periodogram
        #[arg(long)]
        keep_blocks: bool,
    },
    /// Fit (D, fc) to the spectrum of a trace
    Fit {
        #[command(flatten)]
        input: InputArgs,
        #[command(flatten)]
        fit: FitArgs,
    },
    /// Fit and convert to distance, stiffness and force calibration
    Calibrate {
        #[command(flatten)]
        input: InputArgs,
        #[command(flatten)]
        fit: FitArgs,
        #[arg(long)]
        radius_nm: Option<f64>,
        /// Dynamic viscosity in pN s / nm^2
        #[arg(long)]
        viscosity: Option<f64>,
        #[arg(long)]
        temperature_c: Option<f64>,
        #[command(flatten)]
        drag: DragArgs,
    },
    /// Newline-delimited samples of a simulated trapped bead
    Simulate {
        #[arg(long, default_value_t = 80_000.0)]
        fs: f64,
        /// Diffusion constant in squared signal units per second
        #[arg(long, default_value_t = 1e-3)]
        d: f64,
        #[arg(long, default_value_t = 500.0)]
        fc: f64,
        #[arg(long, default_value_t = 1 << 18)]
        samples: usize,
        #[arg(long, default_value_t = 0)]
        seed: u64,
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or(&cli.log_level)).init();
    match cli.command {
        Commands::Psd { input, keep_blocks } => cmd_psd(&input, keep_blocks)?,
        Commands::Fit { input, fit } => cmd_fit(&input, &fit)?,
        Commands::Calibrate {
            input,
            fit,
            radius_nm,
            viscosity,
            temperature_c,
            drag,
        } => cmd_calibrate(&input, &fit, radius_nm, viscosity, temperature_c, &drag)?,
        Commands::Simulate {
            fs,
            d,
            fc,
            samples,
            seed,
            out,
        } => cmd_simulate(
            TrapSimulation {
                fs,
                d,
                fc,
                n_samples: samples,
                seed,
            },
            out.as_deref(),
        )?,
    }
    Ok(())
}

fn load_config(input: &InputArgs) -> Result<CalibrationConfig> {
    let mut config = match &input.config {
        Some(path) => CalibrationConfig::load(path)?,
        None => CalibrationConfig::default(),
    };
    if let Some(fs) = input.fs {
        config.sampling_rate = Some(fs);
    }
    if let Some(block_length) = input.block_length {
        config.blocking.block_length = block_length;
    }
    if input.overlap.is_some() {
        config.blocking.overlap = input.overlap;
    }
    if input.n_blocks.is_some() {
        config.blocking.n_blocks = input.n_blocks;
    }
    Ok(config)
}

fn apply_fit_args(config: &mut CalibrationConfig, fit: &FitArgs) {
    if let Some(estimator) = fit.estimator {
        config.fit.estimator = estimator.into();
    }
    if let Some(model) = fit.model {
        config.fit.model = model.into();
    }
    if let Some(min_hz) = fit.min_hz {
        config.window.min_hz = min_hz;
    }
    if let Some(max_hz) = fit.max_hz {
        config.window.max_hz = max_hz;
    }
    if fit.search_max_hz.is_some() {
        config.window.search_max_hz = fit.search_max_hz.clone();
    }
}

fn read_samples(input: &InputArgs) -> Result<Vec<f64>> {
    let text = match &input.input {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => {
            let mut buf = String::new();
            io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };
    match &input.column {
        Some(column) => text_io::parse_column(&text, column, input.header_lines),
        None => text_io::parse_f64_series(&text),
    }
}

fn load_series(input: &InputArgs, config: &CalibrationConfig) -> Result<TimeSeries> {
    let fs = config
        .sampling_rate
        .ok_or_else(|| anyhow!("sampling rate required: pass --fs or set sampling_rate"))?;
    let data = read_samples(input)?;
    info!("read {} samples at {} Hz", data.len(), fs);
    Ok(TimeSeries::new(fs, data)?)
}

fn cmd_psd(input: &InputArgs, keep_blocks: bool) -> Result<()> {
    let config = load_config(input)?;
    config.validate()?;
    let series = load_series(input, &config)?;
    let estimate = compute_psd(&series, &config.blocking, keep_blocks)?;
    println!("{}", serde_json::to_string(&estimate)?);
    Ok(())
}

fn cmd_fit(input: &InputArgs, fit: &FitArgs) -> Result<()> {
    let mut config = load_config(input)?;
    apply_fit_args(&mut config, fit);
    config.validate()?;
    let series = load_series(input, &config)?;
    let estimate = compute_psd(&series, &config.blocking, false)?;
    let estimator = config.fit.estimator.build(config.fit_options()?);

    if let Some(search) = config.window_search() {
        let outcome = search.run(&estimate.psd, estimator.as_ref())?;
        println!("{}", serde_json::to_string(&outcome)?);
        return Ok(());
    }
    let window = match fit.fraction {
        Some(fraction) => FrequencyWindow::from_fraction(&estimate.psd.frequency, fraction)?,
        None => config.frequency_window()?,
    };
    let spectrum = WindowedSpectrum::from_psd(&estimate.psd, &window)?;
    let result = estimator.fit(&spectrum)?;
    println!("{}", serde_json::to_string(&result)?);
    Ok(())
}

fn cmd_calibrate(
    input: &InputArgs,
    fit: &FitArgs,
    radius_nm: Option<f64>,
    viscosity: Option<f64>,
    temperature_c: Option<f64>,
    drag: &DragArgs,
) -> Result<()> {
    let mut config = load_config(input)?;
    apply_fit_args(&mut config, fit);
    if fit.fraction.is_some() {
        return Err(anyhow!("--fraction is only supported by `fit`; use --min-hz/--max-hz"));
    }
    if let Some(radius_nm) = radius_nm {
        config.bead.radius_nm = radius_nm;
    }
    if viscosity.is_some() {
        config.medium.viscosity = viscosity;
    }
    if temperature_c.is_some() {
        config.medium.temperature_c = temperature_c;
    }
    if drag.drag.is_some() {
        config.bead.drag_coefficient = drag.drag;
        config.oscillation = None;
    }
    if let (Some(frequency_hz), Some(amplitude_nm)) = (drag.drive_hz, drag.drive_amplitude_nm) {
        config.oscillation = Some(TrapDrive {
            frequency_hz,
            amplitude_nm,
        });
        config.bead.drag_coefficient = None;
    }
    config.validate()?;
    let series = load_series(input, &config)?;
    let report = calibrate(&series, &config)?;
    println!("{}", serde_json::to_string(&report)?);
    Ok(())
}

fn cmd_simulate(sim: TrapSimulation, out: Option<&Path>) -> Result<()> {
    let series = sim.generate()?;
    let text = text_io::format_f64_series(&series.data);
    match out {
        Some(path) => std::fs::write(path, text)
            .with_context(|| format!("failed to write {}", path.display()))?,
        None => io::stdout().lock().write_all(text.as_bytes())?,
    }
    Ok(())
}
