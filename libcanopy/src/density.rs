//! Adaptive multi-index vegetation density classification
//!
//! Foreground pixels pass through a strict multi-index vegetation test, get a fused
//! intensity score, and are banded against percentile thresholds of that score. The floors
//! on the thresholds keep a uniformly sparse scene from being reported as dense just
//! because its own distribution is tight.

use std::fmt;

use log::{debug, warn};
use ndarray::Array2;
use serde::{Serialize, Serializer};

use crate::config::{BandThresholds, DensityConfig};
use crate::error::{AnalysisError, Result, Stage};
use crate::frame::RgbFrame;
use crate::indices::{self, PixelIndices};

/// A percentage rounded to two decimals and rendered as `"12.34 %"`
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
pub struct Percentage(f64);

impl Percentage {
    pub const ZERO: Self = Self(0.0);

    pub fn new(value: f64) -> Self {
        Self(round2(value))
    }

    pub fn value(self) -> f64 {
        self.0
    }
}

impl fmt::Display for Percentage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2} %", self.0)
    }
}

impl Serialize for Percentage {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Density class of a single pixel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DensityBand {
    None,
    Low,
    Medium,
    High,
}

/// Vegetation coverage summary for one image
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DensityReport {
    #[serde(rename = "NDVI Score")]
    pub ndvi_score: f64,
    #[serde(rename = "High Vegetation Density Coverage")]
    pub high_pct: Percentage,
    #[serde(rename = "Medium Vegetation Density Coverage")]
    pub medium_pct: Percentage,
    #[serde(rename = "Low Vegetation Density Coverage")]
    pub low_pct: Percentage,
    #[serde(rename = "Green Percentage", skip_serializing_if = "Option::is_none")]
    pub green_percentage: Option<Percentage>,
    /// How far below zero `100 - low - medium` fell before clamping
    #[serde(
        rename = "High Density Clamp Discrepancy",
        skip_serializing_if = "Option::is_none"
    )]
    pub clamp_discrepancy: Option<f64>,
    /// Set when the lenient green-dominance mask replaced the strict one
    #[serde(rename = "Lenient Fallback", skip_serializing_if = "std::ops::Not::not")]
    pub fallback_applied: bool,
    /// Band thresholds that were applied
    #[serde(skip)]
    pub thresholds: Option<BandThresholds>,
}

impl DensityReport {
    /// Report for an image with no valid pixels
    pub fn empty() -> Self {
        Self {
            ndvi_score: 0.0,
            high_pct: Percentage::ZERO,
            medium_pct: Percentage::ZERO,
            low_pct: Percentage::ZERO,
            green_percentage: None,
            clamp_discrepancy: None,
            fallback_applied: false,
            thresholds: None,
        }
    }

    pub fn with_green_percentage(mut self, green: Percentage) -> Self {
        self.green_percentage = Some(green);
        self
    }
}

/// Classifies foreground pixels into vegetation density bands
#[derive(Debug, Clone, Default)]
pub struct DensityClassifier {
    config: DensityConfig,
}

impl DensityClassifier {
    pub fn new(config: DensityConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DensityConfig {
        &self.config
    }

    /// Classify a frame where every non-black pixel is valid
    pub fn classify_frame(&self, frame: &RgbFrame) -> Result<(RgbFrame, DensityReport)> {
        let indices = PixelIndices::compute(frame);
        self.classify(frame, &indices, &frame.non_black_mask())
    }

    /// Classify the `valid` pixels of `frame`, returning a colorized copy and the report
    pub fn classify(
        &self,
        frame: &RgbFrame,
        indices: &PixelIndices,
        valid: &Array2<bool>,
    ) -> Result<(RgbFrame, DensityReport)> {
        let shape = frame.shape();
        for actual in [indices.shape(), valid.dim()] {
            if actual != shape {
                return Err(AnalysisError::ShapeMismatch {
                    stage: Stage::Density,
                    expected: shape,
                    actual,
                });
            }
        }

        let total_pixels = valid.iter().filter(|&&v| v).count();
        if total_pixels == 0 {
            debug!("No valid pixels, skipping density classification");
            return Ok((frame.clone(), DensityReport::empty()));
        }

        let rgb = |r: usize, c: usize| frame.pixel(c as u32, r as u32);

        let vegetation =
            Array2::from_shape_fn(shape, |(r, c)| self.is_vegetation(rgb(r, c), indices, valid, r, c));

        let intensity = Array2::from_shape_fn(shape, |(r, c)| {
            if vegetation[[r, c]] {
                self.intensity(rgb(r, c), indices, r, c)
            } else {
                0.0
            }
        });

        let mut vegetation_scores: Vec<f32> = intensity
            .iter()
            .zip(vegetation.iter())
            .filter_map(|(&i, &v)| v.then_some(i))
            .collect();
        let thresholds = self.adaptive_thresholds(&mut vegetation_scores);
        debug!(
            "Density thresholds high={:.3} medium={:.3} low={:.3} over {} vegetation pixels",
            thresholds.high,
            thresholds.medium,
            thresholds.low,
            vegetation_scores.len()
        );

        let mut bands = Array2::from_shape_fn(shape, |(r, c)| {
            if vegetation[[r, c]] {
                band_for(intensity[[r, c]], &thresholds)
            } else {
                DensityBand::None
            }
        });

        let percent = |count: usize| round2(count as f64 / total_pixels as f64 * 100.0);
        let count = |bands: &Array2<DensityBand>, band: DensityBand| bands.iter().filter(|&&b| b == band).count();

        let high = percent(count(&bands, DensityBand::High));
        let medium = percent(count(&bands, DensityBand::Medium));
        let low = percent(count(&bands, DensityBand::Low));

        let mut report = DensityReport {
            ndvi_score: self.ndvi_score(indices, &vegetation, valid),
            thresholds: Some(thresholds),
            ..DensityReport::empty()
        };

        if high + medium + low < self.config.fallback_min_pct {
            bands = Array2::from_shape_fn(shape, |(r, c)| {
                let [red, green, blue] = rgb(r, c);
                if valid[[r, c]] && green > red && green > blue {
                    DensityBand::Low
                } else {
                    DensityBand::None
                }
            });
            let lenient = percent(count(&bands, DensityBand::Low));
            debug!(
                "Strict vegetation coverage {:.2}% below {:.2}%, lenient mask gives {:.2}%",
                high + medium + low,
                self.config.fallback_min_pct,
                lenient
            );
            report.low_pct = Percentage::new(lenient);
            report.fallback_applied = true;
        } else {
            let derived = round2(100.0 - low - medium);
            let (high_pct, discrepancy) = clamp_percentage(derived);
            if let Some(excess) = discrepancy {
                warn!(
                    "High density share {derived:.2}% fell outside [0, 100] (low {low:.2}%, medium {medium:.2}%), clamped by {excess:.2}"
                );
            }
            debug!("Measured high density share {high:.2}%, reported {high_pct:.2}%");
            report.high_pct = Percentage::new(high_pct);
            report.medium_pct = Percentage::new(medium);
            report.low_pct = Percentage::new(low);
            report.clamp_discrepancy = discrepancy;
        }

        let colors = self.config.colors;
        let colorized = frame.map_pixels(|r, c, original| match bands[[r, c]] {
            DensityBand::High => colors.high,
            DensityBand::Medium => colors.medium,
            DensityBand::Low => colors.low,
            DensityBand::None => original,
        });

        Ok((colorized, report))
    }

    fn is_vegetation(
        &self,
        [red, green, blue]: [u8; 3],
        indices: &PixelIndices,
        valid: &Array2<bool>,
        r: usize,
        c: usize,
    ) -> bool {
        let cfg = &self.config;
        valid[[r, c]]
            && green > red
            && green > blue
            && indices.saturation[[r, c]] > cfg.min_saturation
            && indices.value[[r, c]] > cfg.min_value
            && indices.ndvi[[r, c]] > cfg.min_ndvi
            && indices.exg[[r, c]] > cfg.min_exg
    }

    fn intensity(&self, [_, green, _]: [u8; 3], indices: &PixelIndices, r: usize, c: usize) -> f32 {
        let w = &self.config.weights;
        let green = f32::from(green) / 255.0;
        let ndvi = (indices.ndvi[[r, c]] + 1.0) / 2.0;
        let saturation = indices.saturation[[r, c]];
        let exg = (indices.exg[[r, c]] + 510.0) / 1020.0;

        w.green * green.clamp(0.0, 1.0)
            + w.ndvi * ndvi.clamp(0.0, 1.0)
            + w.saturation * saturation.clamp(0.0, 1.0)
            + w.exg * exg.clamp(0.0, 1.0)
    }

    /// Percentile thresholds of the vegetation scores, floored; fixed defaults if empty
    fn adaptive_thresholds(&self, scores: &mut [f32]) -> BandThresholds {
        if scores.is_empty() {
            return self.config.defaults;
        }
        scores.sort_unstable_by(f32::total_cmp);

        let floors = &self.config.floors;
        BandThresholds {
            high: percentile(scores, 75.0).max(floors.high),
            medium: percentile(scores, 50.0).max(floors.medium),
            low: percentile(scores, 25.0).max(floors.low),
        }
    }

    /// Mean NDVI over vegetation pixels, else over valid pixels, rounded to two decimals
    fn ndvi_score(
        &self,
        indices: &PixelIndices,
        vegetation: &Array2<bool>,
        valid: &Array2<bool>,
    ) -> f64 {
        let mean_over = |selection: &Array2<bool>| {
            let (sum, n) = indices
                .ndvi
                .iter()
                .zip(selection.iter())
                .filter(|(_, keep)| **keep)
                .fold((0.0_f64, 0_usize), |(sum, n), (&v, _)| (sum + f64::from(v), n + 1));
            (n > 0).then(|| sum / n as f64)
        };

        mean_over(vegetation)
            .or_else(|| mean_over(valid))
            .map_or(0.0, round2)
    }
}

/// Band for an intensity using half-open `[low, medium)`, `[medium, high)`, `[high, ∞)`
pub fn band_for(intensity: f32, thresholds: &BandThresholds) -> DensityBand {
    if intensity >= thresholds.high {
        DensityBand::High
    } else if intensity >= thresholds.medium {
        DensityBand::Medium
    } else if intensity >= thresholds.low {
        DensityBand::Low
    } else {
        DensityBand::None
    }
}

/// Linear-interpolated percentile of an ascending slice
pub fn percentile(sorted: &[f32], pct: f64) -> f32 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = pct.clamp(0.0, 100.0) / 100.0 * (n - 1) as f64;
            let lower = rank.floor() as usize;
            let upper = rank.ceil() as usize;
            let (a, b) = (sorted[lower], sorted[upper]);
            let frac = (rank - lower as f64) as f32;
            a + (b - a) * frac
        }
    }
}

/// Clamp into `[0, 100]`, returning how far outside the value was
fn clamp_percentage(value: f64) -> (f64, Option<f64>) {
    let clamped = value.clamp(0.0, 100.0);
    if (clamped - value).abs() > f64::EPSILON {
        (clamped, Some(round2((clamped - value).abs())))
    } else {
        (value, None)
    }
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Green-channel cut-off classifier (180 / 120 / 60) over non-black pixels.
///
/// Ignores red and blue entirely, so grey or white surfaces count as dense vegetation.
#[deprecated(note = "use DensityClassifier, which tests color balance and adapts its thresholds")]
pub fn classify_fixed_thresholds(frame: &RgbFrame) -> (RgbFrame, DensityReport) {
    const HIGH: u8 = 180;
    const MEDIUM: u8 = 120;
    const LOW: u8 = 60;

    let colors = crate::config::BandColors::default();
    let band = |[_, green, _]: [u8; 3]| match green {
        g if g >= HIGH => DensityBand::High,
        g if g >= MEDIUM => DensityBand::Medium,
        g if g >= LOW => DensityBand::Low,
        _ => DensityBand::None,
    };

    let valid: Vec<[u8; 3]> = frame
        .as_raw()
        .chunks_exact(3)
        .map(|p| [p[0], p[1], p[2]])
        .filter(|p| *p != [0, 0, 0])
        .collect();
    if valid.is_empty() {
        return (frame.clone(), DensityReport::empty());
    }

    let share = |target: DensityBand| {
        let n = valid.iter().filter(|&&p| band(p) == target).count();
        round2(n as f64 / valid.len() as f64 * 100.0)
    };
    let medium = share(DensityBand::Medium);
    let low = share(DensityBand::Low);
    let (high, discrepancy) = clamp_percentage(round2(100.0 - low - medium));

    let all_pixels = frame.as_raw().chunks_exact(3);
    let pixel_count = all_pixels.len().max(1);
    let grvi_mean = all_pixels
        .map(|p| {
            let (red, green) = (f32::from(p[0]), f32::from(p[1]));
            f64::from((green - red) / (green + red + indices::EPSILON))
        })
        .sum::<f64>()
        / pixel_count as f64;

    let colorized = frame.map_pixels(|_, _, rgb| {
        if rgb == [0, 0, 0] {
            return rgb;
        }
        match band(rgb) {
            DensityBand::High => colors.high,
            DensityBand::Medium => colors.medium,
            DensityBand::Low => colors.low,
            DensityBand::None => rgb,
        }
    });

    let report = DensityReport {
        ndvi_score: round2(grvi_mean),
        high_pct: Percentage::new(high),
        medium_pct: Percentage::new(medium),
        low_pct: Percentage::new(low),
        clamp_discrepancy: discrepancy,
        ..DensityReport::empty()
    };
    (colorized, report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_of(width: u32, height: u32, pixels: &[[u8; 3]]) -> RgbFrame {
        RgbFrame::from_rgb_bytes(width, height, pixels.concat()).expect("valid buffer")
    }

    fn sum(report: &DensityReport) -> f64 {
        report.high_pct.value() + report.medium_pct.value() + report.low_pct.value()
    }

    #[test]
    fn test_black_frame_reports_zero() {
        let frame = RgbFrame::black(16, 16);
        let (out, report) = DensityClassifier::default().classify_frame(&frame).unwrap();

        assert_eq!(out, frame);
        assert_eq!(report.ndvi_score, 0.0);
        assert_eq!(report.high_pct.to_string(), "0.00 %");
        assert_eq!(report.medium_pct.to_string(), "0.00 %");
        assert_eq!(report.low_pct.to_string(), "0.00 %");
    }

    #[test]
    fn test_half_green_half_red() {
        let green = [0, 255, 0];
        let red = [255, 0, 0];
        let frame = frame_of(4, 1, &[green, red, green, red]);
        let (out, report) = DensityClassifier::default().classify_frame(&frame).unwrap();

        assert!((sum(&report) - 100.0).abs() <= 0.01);
        assert_eq!(out.pixel(0, 0), [0, 255, 0]);
        assert_eq!(out.pixel(1, 0), red);
        assert!(!report.fallback_applied);
        // NDVI of the green half is 1.0
        assert_eq!(report.ndvi_score, 1.0);
    }

    #[test]
    fn test_uniform_dark_green_is_held_below_high_by_floor() {
        let frame = frame_of(2, 2, &[[20, 60, 20]; 4]);
        let (out, report) = DensityClassifier::default().classify_frame(&frame).unwrap();

        assert_eq!(report.medium_pct.value(), 100.0);
        assert_eq!(report.low_pct.value(), 0.0);
        assert_eq!(report.high_pct.value(), 0.0);
        assert_eq!(out.pixel(0, 0), [0, 200, 0]);
        let thresholds = report.thresholds.unwrap();
        assert_eq!(thresholds.high, 0.6);
    }

    #[test]
    fn test_mixed_scene_uses_percentiles() {
        let bright = [0, 255, 0];
        let dark = [20, 60, 20];
        let frame = frame_of(2, 2, &[bright, dark, bright, dark]);
        let (out, report) = DensityClassifier::default().classify_frame(&frame).unwrap();

        assert_eq!(report.low_pct.value(), 50.0);
        assert_eq!(report.medium_pct.value(), 0.0);
        assert_eq!(report.high_pct.value(), 50.0);
        assert_eq!(out.pixel(0, 0), [0, 255, 0]);
        assert_eq!(out.pixel(1, 0), [0, 150, 0]);
    }

    #[test]
    fn test_lenient_fallback_on_dull_green() {
        // green-dominant but too unsaturated for the strict mask
        let frame = frame_of(2, 1, &[[100, 110, 100], [100, 110, 100]]);
        let (out, report) = DensityClassifier::default().classify_frame(&frame).unwrap();

        assert!(report.fallback_applied);
        assert_eq!(report.low_pct.value(), 100.0);
        assert_eq!(report.medium_pct, Percentage::ZERO);
        assert_eq!(report.high_pct, Percentage::ZERO);
        assert_eq!(out.pixel(0, 0), [0, 150, 0]);
    }

    #[test]
    fn test_no_vegetation_uses_default_thresholds() {
        let frame = frame_of(2, 1, &[[200, 10, 10], [10, 10, 200]]);
        let (out, report) = DensityClassifier::default().classify_frame(&frame).unwrap();

        assert_eq!(report.thresholds.unwrap().high, 0.7);
        assert!(report.fallback_applied);
        assert_eq!(report.low_pct, Percentage::ZERO);
        assert_eq!(out, frame);
    }

    #[test]
    fn test_invalid_pixels_are_ignored() {
        let frame = frame_of(2, 1, &[[0, 255, 0], [0, 255, 0]]);
        let indices = PixelIndices::compute(&frame);
        let valid = ndarray::array![[true, false]];
        let (out, report) = DensityClassifier::default()
            .classify(&frame, &indices, &valid)
            .unwrap();

        assert_eq!(report.high_pct.value(), 100.0);
        assert_eq!(out.pixel(1, 0), [0, 255, 0]);
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let frame = RgbFrame::black(2, 2);
        let indices = PixelIndices::compute(&RgbFrame::black(3, 3));
        let err = DensityClassifier::default()
            .classify(&frame, &indices, &frame.non_black_mask())
            .unwrap_err();
        assert_eq!(err.stage(), Stage::Density);
    }

    #[test]
    fn test_percentages_stay_in_range() {
        let mut pixels = Vec::new();
        for g in 0..64u8 {
            pixels.push([g, g.saturating_mul(4), g / 2]);
        }
        let frame = frame_of(8, 8, &pixels);
        let (_, report) = DensityClassifier::default().classify_frame(&frame).unwrap();
        for pct in [report.high_pct, report.medium_pct, report.low_pct] {
            assert!((0.0..=100.0).contains(&pct.value()));
        }
    }

    #[test]
    fn test_percentile_interpolates() {
        let sorted = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(percentile(&sorted, 0.0), 1.0);
        assert_eq!(percentile(&sorted, 100.0), 4.0);
        assert!((percentile(&sorted, 50.0) - 2.5).abs() < 1e-6);
        assert!((percentile(&sorted, 25.0) - 1.75).abs() < 1e-6);
        assert_eq!(percentile(&[], 50.0), 0.0);
    }

    #[test]
    fn test_band_edges_are_half_open() {
        let t = BandThresholds {
            high: 0.6,
            medium: 0.4,
            low: 0.2,
        };
        assert_eq!(band_for(0.6, &t), DensityBand::High);
        assert_eq!(band_for(0.5999, &t), DensityBand::Medium);
        assert_eq!(band_for(0.4, &t), DensityBand::Medium);
        assert_eq!(band_for(0.2, &t), DensityBand::Low);
        assert_eq!(band_for(0.1999, &t), DensityBand::None);
    }

    #[test]
    fn test_clamp_reports_discrepancy() {
        assert_eq!(clamp_percentage(-0.01), (0.0, Some(0.01)));
        assert_eq!(clamp_percentage(42.0), (42.0, None));
    }

    #[test]
    fn test_report_serializes_with_percent_strings() {
        let report = DensityReport::empty().with_green_percentage(Percentage::new(12.346));
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["High Vegetation Density Coverage"], "0.00 %");
        assert_eq!(json["Green Percentage"], "12.35 %");
        assert!(json.get("Lenient Fallback").is_none());
        assert!(json.get("High Density Clamp Discrepancy").is_none());
    }

    #[test]
    #[allow(deprecated)]
    fn test_fixed_threshold_classifier() {
        let frame = frame_of(4, 1, &[[0, 200, 0], [0, 130, 0], [0, 70, 0], [0, 0, 0]]);
        let (out, report) = classify_fixed_thresholds(&frame);

        assert!((report.medium_pct.value() - 33.33).abs() < 1e-9);
        assert!((report.low_pct.value() - 33.33).abs() < 1e-9);
        assert!((report.high_pct.value() - 33.34).abs() < 1e-9);
        assert_eq!(out.pixel(0, 0), [0, 255, 0]);
        assert_eq!(out.pixel(3, 0), [0, 0, 0]);
    }
}
