use assert_cmd::cargo::cargo_bin_cmd;
use serde::Deserialize;
use std::{error::Error, fs, path::Path};
use tempfile::tempdir;

#[derive(Deserialize)]
struct PsdOutput {
    psd: Psd,
    fs: f64,
    block_length: usize,
    overlap: usize,
    block_power: Option<Vec<Vec<f64>>>,
}

#[derive(Deserialize)]
struct Psd {
    frequency: Vec<f64>,
    mean_power: Vec<f64>,
    n_blocks: usize,
}

fn simulate(path: &Path, samples: usize) {
    cargo_bin_cmd!("tweezer")
        .args([
            "simulate",
            "--fs",
            "40000",
            "--samples",
            &samples.to_string(),
            "--seed",
            "3",
            "--out",
            path.to_str().unwrap(),
        ])
        .assert()
        .success();
}

#[test]
fn simulate_writes_requested_samples() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    let trace = dir.path().join("trace.txt");
    simulate(&trace, 1000);
    let lines = fs::read_to_string(&trace)?.lines().count();
    assert_eq!(lines, 1000);
    Ok(())
}

#[test]
fn psd_command_blocks_and_averages() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    let trace = dir.path().join("trace.txt");
    simulate(&trace, 10_000);
    let mut cmd = cargo_bin_cmd!("tweezer");
    cmd.args([
        "psd",
        "--input",
        trace.to_str().unwrap(),
        "--fs",
        "40000",
        "--block-length",
        "1024",
        "--overlap",
        "512",
        "--keep-blocks",
    ]);
    let out = cmd.assert().success().get_output().stdout.clone();
    let value: PsdOutput = serde_json::from_slice(&out)?;
    assert_eq!(value.fs, 40000.0);
    assert_eq!(value.block_length, 1024);
    assert_eq!(value.overlap, 512);
    assert_eq!(value.psd.n_blocks, (10_000 - 1024) / 512 + 1);
    assert_eq!(value.psd.frequency.len(), 513);
    assert_eq!(value.psd.mean_power.len(), 513);
    assert_eq!(value.block_power.map(|b| b.len()), Some(value.psd.n_blocks));
    Ok(())
}

#[test]
fn psd_reads_a_named_column_from_stdin() -> Result<(), Box<dyn Error>> {
    let mut text = String::from("instrument: test\nX\tY\n");
    for i in 0..64 {
        text.push_str(&format!("{}\t{}\n", i % 4, (i as f64 * 0.3).sin()));
    }
    let mut cmd = cargo_bin_cmd!("tweezer");
    cmd.args([
        "psd",
        "--fs",
        "100",
        "--column",
        "Y",
        "--header-lines",
        "1",
        "--block-length",
        "16",
    ])
    .write_stdin(text);
    let out = cmd.assert().success().get_output().stdout.clone();
    let value: PsdOutput = serde_json::from_slice(&out)?;
    assert_eq!(value.psd.n_blocks, 4);
    assert!(value.block_power.is_none());
    Ok(())
}

#[test]
fn psd_requires_a_sampling_rate() {
    cargo_bin_cmd!("tweezer")
        .args(["psd"])
        .write_stdin("1\n2\n3\n")
        .assert()
        .failure();
}
