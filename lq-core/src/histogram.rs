//! Proportional lightness histograms.

use thiserror::Error;

use crate::config::HISTOGRAM_SEGMENTS;

/// Proportional distribution of lightness values over
/// [`HISTOGRAM_SEGMENTS`] equal-width bins. Entries are non-negative and
/// sum to 1.0 within float rounding.
pub type Histogram = [f32; HISTOGRAM_SEGMENTS];

#[derive(Debug, Error)]
pub enum HistogramError {
    #[error("image has no pixels")]
    EmptyImage,
}

/// Bin index for a lightness sample in [0, 1].
///
/// Samples outside the range (float noise from colour conversion) clamp to
/// the boundary bins.
#[inline]
pub fn bin_index(lightness: f32) -> usize {
    let scaled = (lightness * (HISTOGRAM_SEGMENTS - 1) as f32).round();
    (scaled.max(0.0) as usize).min(HISTOGRAM_SEGMENTS - 1)
}

/// Bin lightness samples and normalise by the pixel count.
pub fn lightness_histogram(samples: &[f32]) -> Result<Histogram, HistogramError> {
    if samples.is_empty() {
        return Err(HistogramError::EmptyImage);
    }

    let mut counts = [0u64; HISTOGRAM_SEGMENTS];
    for &lightness in samples {
        counts[bin_index(lightness)] += 1;
    }

    let total = samples.len() as f64;
    let mut histogram = [0f32; HISTOGRAM_SEGMENTS];
    for (bin, &count) in histogram.iter_mut().zip(counts.iter()) {
        *bin = (count as f64 / total) as f32;
    }

    Ok(histogram)
}
