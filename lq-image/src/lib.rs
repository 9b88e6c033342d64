//! lq-image: the pixel-decoding collaborator.
//!
//! The rest of the cluster only needs two operations from an image library:
//! read a file into per-pixel lightness samples, and write a remapped
//! lightness channel back out in a standard container (TIFF). Both are
//! built on the `image` crate with a hand-rolled sRGB ↔ CIE Lab conversion.

pub mod lab;

use std::fs::File;
use std::io::{BufReader, Cursor};
use std::path::Path;

use image::codecs::tiff::TiffEncoder;
use image::{ColorType, RgbImage};
use thiserror::Error;

use lq_core::histogram::{bin_index, lightness_histogram, Histogram, HistogramError};
use lq_core::matching::HistogramMapping;
use lq_core::HISTOGRAM_SEGMENTS;

pub use lab::{lab_to_srgb, srgb_to_lab, Lab};

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to decode {path}: {source}")]
    Decode {
        path: String,
        source: image::ImageError,
    },
    #[error("failed to encode result: {0}")]
    Encode(image::ImageError),
    #[error(transparent)]
    Histogram(#[from] HistogramError),
}

/// An image decoded into Lab planes. The a/b planes are retained so a
/// lightness remap can re-encode without touching chroma.
#[derive(Debug, Clone)]
pub struct LabImage {
    width: u32,
    height: u32,
    pixels: Vec<Lab>,
}

impl LabImage {
    /// Decode an image file and convert it to Lab.
    pub fn open(path: &Path) -> Result<Self, ImageError> {
        let display = path.display().to_string();
        let file = File::open(path).map_err(|source| ImageError::Open {
            path: display.clone(),
            source,
        })?;
        let decoded = image::io::Reader::new(BufReader::new(file))
            .with_guessed_format()
            .map_err(|source| ImageError::Open {
                path: display.clone(),
                source,
            })?
            .decode()
            .map_err(|source| ImageError::Decode {
                path: display,
                source,
            })?;

        let rgb = decoded.to_rgb8();
        let (width, height) = rgb.dimensions();
        let pixels = rgb.pixels().map(|p| srgb_to_lab(p.0)).collect();

        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Lightness samples in [0, 1], one per pixel.
    pub fn lightness(&self) -> impl Iterator<Item = f32> + '_ {
        self.pixels.iter().map(|lab| lab.l)
    }

    /// Proportional lightness histogram of the whole image.
    pub fn histogram(&self) -> Result<Histogram, ImageError> {
        let samples: Vec<f32> = self.lightness().collect();
        Ok(lightness_histogram(&samples)?)
    }

    /// Apply a bin mapping to the lightness plane, leaving a/b untouched,
    /// and encode the result as an RGB8 TIFF.
    pub fn equalise(&self, mapping: &HistogramMapping) -> Result<Vec<u8>, ImageError> {
        let mut rgb = RgbImage::new(self.width, self.height);
        for (pixel, lab) in rgb.pixels_mut().zip(self.pixels.iter()) {
            let remapped = Lab {
                l: remap_lightness(lab.l, mapping),
                a: lab.a,
                b: lab.b,
            };
            pixel.0 = lab_to_srgb(remapped);
        }
        encode_tiff(&rgb)
    }
}

/// Remap one lightness sample through a bin substitution table.
#[inline]
pub fn remap_lightness(lightness: f32, mapping: &HistogramMapping) -> f32 {
    mapping[bin_index(lightness)] as f32 / (HISTOGRAM_SEGMENTS - 1) as f32
}

/// Compute the lightness histogram of an image file.
pub fn file_histogram(path: &Path) -> Result<Histogram, ImageError> {
    LabImage::open(path)?.histogram()
}

/// Decode a file, remap its lightness plane, and return TIFF bytes.
pub fn equalise_file(path: &Path, mapping: &HistogramMapping) -> Result<Vec<u8>, ImageError> {
    LabImage::open(path)?.equalise(mapping)
}

fn encode_tiff(rgb: &RgbImage) -> Result<Vec<u8>, ImageError> {
    let mut out = Cursor::new(Vec::new());
    let encoder = TiffEncoder::new(&mut out);
    encoder
        .encode(rgb.as_raw(), rgb.width(), rgb.height(), ColorType::Rgb8)
        .map_err(ImageError::Encode)?;
    Ok(out.into_inner())
}
