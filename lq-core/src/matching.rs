//! Histogram matching: derive the bin mapping that reshapes one image's
//! lightness distribution toward another's.
//!
//! The mapping is produced by a two-cursor walk over the running cumulative
//! sums of both histograms: at each step emit `mapping[i_c] = i_p`, then
//! advance the cursor whose cumulative sum is behind (both on a tie). A
//! cursor that reaches the last bin pins there while the other side drains
//! its remaining mass.

use std::cmp::Ordering;

use thiserror::Error;

use crate::config::HISTOGRAM_SEGMENTS;
use crate::histogram::Histogram;

/// Per-bin substitution table. `mapping[i] = j` remaps a sample in bin `i`
/// of the current image to the lightness represented by bin `j` of the
/// reference image. Always monotonic non-decreasing.
pub type HistogramMapping = [u16; HISTOGRAM_SEGMENTS];

#[derive(Debug, Error)]
pub enum MatchError {
    /// A cumulative-sum comparison produced no ordering, meaning a NaN got
    /// into a histogram. There is no sane mapping to emit.
    #[error("cumulative histogram comparison was not a number")]
    NanComparison,
}

/// The mapping that leaves every bin in place. Used for the first image of
/// a run, which has no predecessor to match against.
pub fn identity_mapping() -> HistogramMapping {
    let mut mapping = [0u16; HISTOGRAM_SEGMENTS];
    for (i, slot) in mapping.iter_mut().enumerate() {
        *slot = i as u16;
    }
    mapping
}

/// Derive the mapping that takes `current`'s distribution toward
/// `previous`'s.
pub fn equalisation_mapping(
    previous: &Histogram,
    current: &Histogram,
) -> Result<HistogramMapping, MatchError> {
    let last = HISTOGRAM_SEGMENTS - 1;

    let mut cumulative_previous = 0.0f64;
    let mut cumulative_current = 0.0f64;
    let mut previous_bin = 0usize;
    let mut current_bin = 0usize;

    let mut mapping = [0u16; HISTOGRAM_SEGMENTS];

    while current_bin != last || previous_bin != last {
        mapping[current_bin] = previous_bin as u16;

        match cumulative_current.partial_cmp(&cumulative_previous) {
            Some(Ordering::Less) => {
                if current_bin < last {
                    cumulative_current += current[current_bin] as f64;
                    current_bin += 1;
                } else {
                    cumulative_previous += previous[previous_bin] as f64;
                    previous_bin += 1;
                }
            }
            Some(Ordering::Greater) => {
                if previous_bin < last {
                    cumulative_previous += previous[previous_bin] as f64;
                    previous_bin += 1;
                } else {
                    cumulative_current += current[current_bin] as f64;
                    current_bin += 1;
                }
            }
            Some(Ordering::Equal) => {
                if current_bin < last {
                    cumulative_current += current[current_bin] as f64;
                    current_bin += 1;
                }
                if previous_bin < last {
                    cumulative_previous += previous[previous_bin] as f64;
                    previous_bin += 1;
                }
            }
            None => return Err(MatchError::NanComparison),
        }
    }

    // Both cursors are pinned; the loop above never writes the final cell.
    mapping[last] = last as u16;

    Ok(mapping)
}
