use crate::error::{Error, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

/// Uniformly sampled detector signal (e.g. one QPD axis).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSeries {
    /// Uniform sampling frequency in Hz
    pub fs: f64,
    /// Samples
    pub data: Vec<f64>,
}

impl TimeSeries {
    pub fn new(fs: f64, data: Vec<f64>) -> Result<Self> {
        if !(fs.is_finite() && fs > 0.0) {
            return Err(Error::invalid("fs", fs, "sampling rate must be positive"));
        }
        Ok(Self { fs, data })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
    pub fn duration(&self) -> f64 {
        self.data.len() as f64 / self.fs
    }
}

/// How a series is cut into blocks.
///
/// An explicit `overlap` wins over `n_blocks`. With neither, blocks are
/// contiguous and their number is `floor(N / block_length)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockParams {
    pub block_length: usize,
    pub overlap: Option<usize>,
    pub n_blocks: Option<usize>,
}

impl Default for BlockParams {
    fn default() -> Self {
        Self {
            block_length: 1 << 13,
            overlap: None,
            n_blocks: None,
        }
    }
}

impl BlockParams {
    pub fn new(block_length: usize) -> Self {
        Self {
            block_length,
            overlap: None,
            n_blocks: None,
        }
    }

    pub fn with_overlap(mut self, overlap: usize) -> Self {
        self.overlap = Some(overlap);
        self
    }

    pub fn with_n_blocks(mut self, n_blocks: usize) -> Self {
        self.n_blocks = Some(n_blocks);
        self
    }

    /// Resolve the overlap (in samples) for a series of `series_len` samples.
    pub fn resolve_overlap(&self, series_len: usize) -> Result<usize> {
        let overlap = match (self.overlap, self.n_blocks) {
            (Some(overlap), _) => overlap,
            (None, Some(0)) => {
                return Err(Error::Configuration(
                    "n_blocks must be positive".to_string(),
                ))
            }
            (None, Some(n_blocks)) => {
                let stride = series_len / n_blocks;
                if stride > self.block_length {
                    warn!(
                        "{} blocks of {} samples leave gaps in {} samples; using zero overlap",
                        n_blocks, self.block_length, series_len
                    );
                }
                self.block_length.saturating_sub(stride)
            }
            (None, None) => 0,
        };
        if overlap >= self.block_length {
            return Err(Error::Configuration(format!(
                "overlap {} must be smaller than block length {}",
                overlap, self.block_length
            )));
        }
        Ok(overlap)
    }
}

/// Equal-length blocks cut from a [`TimeSeries`], in time order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockSet {
    pub fs: f64,
    pub block_length: usize,
    pub overlap: usize,
    pub blocks: Vec<Vec<f64>>,
}

impl BlockSet {
    pub fn step(&self) -> usize {
        self.block_length - self.overlap
    }
    pub fn len(&self) -> usize {
        self.blocks.len()
    }
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Number of whole blocks that fit in `series_len` samples.
pub fn block_count(series_len: usize, block_length: usize, overlap: usize) -> usize {
    if block_length == 0 || overlap >= block_length || series_len < block_length {
        return 0;
    }
    (series_len - block_length) / (block_length - overlap) + 1
}

/// Slide a `block_length` window over the series with step
/// `block_length - overlap`, starting at sample 0. A trailing partial block is
/// dropped, and a series shorter than one block gives an empty set.
pub fn block(series: &TimeSeries, params: &BlockParams) -> Result<BlockSet> {
    let n = series.len();
    let overlap = params.resolve_overlap(n)?;
    let block_length = params.block_length;
    let step = block_length - overlap;
    let count = block_count(n, block_length, overlap);
    let blocks: Vec<Vec<f64>> = (0..count)
        .map(|i| {
            let start = i * step;
            series.data[start..start + block_length].to_vec()
        })
        .collect();
    debug!(
        "blocked {} samples into {} blocks (length {}, overlap {})",
        n, count, block_length, overlap
    );
    Ok(BlockSet {
        fs: series.fs,
        block_length,
        overlap,
        blocks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n: usize) -> TimeSeries {
        TimeSeries::new(1000.0, (0..n).map(|i| i as f64).collect()).unwrap()
    }

    #[test]
    fn block_count_matches_formula_for_many_shapes() {
        for n in [0usize, 1, 7, 64, 100, 257, 1000] {
            for block_length in [1usize, 2, 8, 33, 64, 128] {
                for overlap in 0..block_length {
                    let params = BlockParams::new(block_length).with_overlap(overlap);
                    let set = block(&ramp(n), &params).unwrap();
                    let expected = if n >= block_length {
                        (n - block_length) / (block_length - overlap) + 1
                    } else {
                        0
                    };
                    assert_eq!(set.len(), expected, "n={n} L={block_length} o={overlap}");
                    assert!(set.blocks.iter().all(|b| b.len() == block_length));
                }
            }
        }
    }

    #[test]
    fn blocks_follow_time_order_with_overlap() {
        let set = block(&ramp(10), &BlockParams::new(4).with_overlap(2)).unwrap();
        assert_eq!(set.len(), 4);
        assert_eq!(set.blocks[0], vec![0.0, 1.0, 2.0, 3.0]);
        assert_eq!(set.blocks[1], vec![2.0, 3.0, 4.0, 5.0]);
        assert_eq!(set.blocks[3], vec![6.0, 7.0, 8.0, 9.0]);
    }

    #[test]
    fn trailing_partial_block_is_dropped() {
        let set = block(&ramp(11), &BlockParams::new(4)).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.blocks[1], vec![4.0, 5.0, 6.0, 7.0]);
    }

    #[test]
    fn short_series_gives_empty_set() {
        let set = block(&ramp(3), &BlockParams::new(8)).unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn overlap_not_smaller_than_block_is_rejected() {
        let err = block(&ramp(100), &BlockParams::new(8).with_overlap(8)).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        let err = block(&ramp(100), &BlockParams::new(0)).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn overlap_derived_from_block_count() {
        // floor(100 / 4) = 25 -> overlap 32 - 25 = 7
        let params = BlockParams::new(32).with_n_blocks(4);
        assert_eq!(params.resolve_overlap(100).unwrap(), 7);
        let set = block(&ramp(100), &params).unwrap();
        assert_eq!(set.overlap, 7);
        assert_eq!(set.len(), (100 - 32) / 25 + 1);
    }

    #[test]
    fn explicit_overlap_takes_priority() {
        let params = BlockParams::new(32).with_n_blocks(4).with_overlap(16);
        assert_eq!(params.resolve_overlap(100).unwrap(), 16);
    }

    #[test]
    fn sparse_block_request_clamps_overlap_to_zero() {
        let params = BlockParams::new(10).with_n_blocks(2);
        assert_eq!(params.resolve_overlap(100).unwrap(), 0);
        let err = BlockParams::new(10).with_n_blocks(0).resolve_overlap(100);
        assert!(matches!(err, Err(Error::Configuration(_))));
    }

    #[test]
    fn rejects_non_positive_sampling_rate() {
        assert!(TimeSeries::new(0.0, vec![1.0]).is_err());
        assert!(TimeSeries::new(f64::NAN, vec![1.0]).is_err());
    }
}
