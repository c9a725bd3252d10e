//! Per-pixel vegetation indices computed from visible RGB bands

#[cfg(feature = "performance")]
use rayon::prelude::*;

use ndarray::Array2;

use crate::frame::RgbFrame;

/// Guards the index ratios against division by zero on black pixels
pub const EPSILON: f32 = 1e-10;

/// Index planes, each shaped like the source frame
#[derive(Debug, Clone)]
pub struct PixelIndices {
    /// NDVI approximation with green standing in for near-infrared
    pub ndvi: Array2<f32>,
    /// Excess-green, `2g - r - b`, in raw sample units
    pub exg: Array2<f32>,
    /// Green-red vegetation index
    pub grvi: Array2<f32>,
    /// Hue in degrees, `[0, 360)`
    pub hue: Array2<f32>,
    /// Saturation, `[0, 1]`
    pub saturation: Array2<f32>,
    /// Value (brightness), `[0, 1]`
    pub value: Array2<f32>,
}

impl PixelIndices {
    /// Compute every index for every pixel of `frame`
    pub fn compute(frame: &RgbFrame) -> Self {
        let shape = frame.shape();
        let features = compute_features(frame.as_raw());
        let plane = |f: fn(&PixelFeatures) -> f32| {
            Array2::from_shape_fn(shape, |(r, c)| f(&features[r * shape.1 + c]))
        };

        Self {
            ndvi: plane(|p| p.ndvi),
            exg: plane(|p| p.exg),
            grvi: plane(|p| p.grvi),
            hue: plane(|p| p.hue),
            saturation: plane(|p| p.saturation),
            value: plane(|p| p.value),
        }
    }

    /// (rows, cols)
    pub fn shape(&self) -> (usize, usize) {
        self.ndvi.dim()
    }
}

/// All indices of a single pixel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelFeatures {
    pub ndvi: f32,
    pub exg: f32,
    pub grvi: f32,
    pub hue: f32,
    pub saturation: f32,
    pub value: f32,
}

impl PixelFeatures {
    pub fn from_rgb([r, g, b]: [u8; 3]) -> Self {
        let (red, green, blue) = (f32::from(r), f32::from(g), f32::from(b));
        let (hue, saturation, value) = rgb_to_hsv(red, green, blue);

        Self {
            ndvi: ndvi(red, green),
            exg: 2.0 * green - red - blue,
            grvi: (green - red) / (green + red + EPSILON),
            hue,
            saturation,
            value,
        }
    }
}

/// NDVI using `green + (green - red)` as the near-infrared estimate.
///
/// The estimate goes negative when red dominates, which drives the denominator towards
/// zero, so the result is clamped to the index's nominal `[-1, 1]` range.
pub fn ndvi(red: f32, green: f32) -> f32 {
    let nir = green + (green - red);
    ((nir - red) / (nir + red + EPSILON)).clamp(-1.0, 1.0)
}

/// RGB samples in `[0, 255]` to (hue degrees, saturation, value)
pub fn rgb_to_hsv(r: f32, g: f32, b: f32) -> (f32, f32, f32) {
    let r = r / 255.0;
    let g = g / 255.0;
    let b = b / 255.0;

    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let hue = if delta <= f32::EPSILON {
        0.0
    } else if max == r {
        60.0 * ((g - b) / delta).rem_euclid(6.0)
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };

    let saturation = if max <= f32::EPSILON { 0.0 } else { delta / max };

    (hue, saturation, max)
}

#[cfg(feature = "performance")]
fn compute_features(raw: &[u8]) -> Vec<PixelFeatures> {
    raw.par_chunks_exact(3)
        .map(|p| PixelFeatures::from_rgb([p[0], p[1], p[2]]))
        .collect()
}

#[cfg(not(feature = "performance"))]
fn compute_features(raw: &[u8]) -> Vec<PixelFeatures> {
    raw.chunks_exact(3)
        .map(|p| PixelFeatures::from_rgb([p[0], p[1], p[2]]))
        .collect()
}
