//! Readers for sample traces on disk. These return `anyhow::Result`; the
//! numerical core never touches files.

pub mod text;

pub use text::{
    format_f64_series, parse_column, parse_f64_series, read_column, read_f64_series, Column,
};
