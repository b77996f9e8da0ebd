use anyhow::{anyhow, bail, Context, Result};
use csv::{ReaderBuilder, Trim};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Parse newline-delimited floating point series, ignoring blank/comment lines.
pub fn parse_f64_series(text: &str) -> Result<Vec<f64>> {
    let mut out = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let val: f64 = trimmed
            .parse()
            .with_context(|| format!("line {} is not f64: {}", idx + 1, trimmed))?;
        out.push(val);
    }
    if out.is_empty() {
        bail!("no numeric samples found");
    }
    Ok(out)
}

/// Read a newline-delimited floating point series from disk.
pub fn read_f64_series(path: &Path) -> Result<Vec<f64>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_f64_series(&text)
}

/// Column of a tab-delimited trace file, by zero-based index or header name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Column {
    Index(usize),
    Name(String),
}

impl FromStr for Column {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.parse::<usize>() {
            Ok(index) => Column::Index(index),
            Err(_) => Column::Name(s.to_string()),
        })
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Column::Index(index) => write!(f, "#{index}"),
            Column::Name(name) => f.write_str(name),
        }
    }
}

/// Parse one column of tab-delimited text.
///
/// The first `header_lines` lines (instrument metadata) are skipped. When the
/// column is selected by name, the next line holds the column names. Lines
/// starting with `#` are ignored.
pub fn parse_column(text: &str, column: &Column, header_lines: usize) -> Result<Vec<f64>> {
    let body = text
        .split_inclusive('\n')
        .skip(header_lines)
        .collect::<String>();
    let mut reader = ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(matches!(column, Column::Name(_)))
        .comment(Some(b'#'))
        .flexible(true)
        .trim(Trim::All)
        .from_reader(body.as_bytes());
    let index = match column {
        Column::Index(index) => *index,
        Column::Name(name) => reader
            .headers()
            .context("reading column names")?
            .iter()
            .position(|header| header.eq_ignore_ascii_case(name))
            .ok_or_else(|| anyhow!("missing column '{}'", name))?,
    };
    let mut out = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("reading row {}", row + 1))?;
        if record.iter().all(str::is_empty) {
            continue;
        }
        let field = record
            .get(index)
            .ok_or_else(|| anyhow!("row {} has no column {}", row + 1, column))?;
        let val: f64 = field
            .parse()
            .with_context(|| format!("row {} column {} is not f64: {}", row + 1, column, field))?;
        out.push(val);
    }
    if out.is_empty() {
        bail!("no numeric samples found in column {}", column);
    }
    Ok(out)
}

pub fn read_column(path: &Path, column: &Column, header_lines: usize) -> Result<Vec<f64>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_column(&text, column, header_lines)
        .with_context(|| format!("parsing {}", path.display()))
}

/// Render samples one per line, the format [`parse_f64_series`] reads.
pub fn format_f64_series(values: &[f64]) -> String {
    let mut out = String::with_capacity(values.len() * 24);
    for v in values {
        out.push_str(&v.to_string());
        out.push('\n');
    }
    out
}
