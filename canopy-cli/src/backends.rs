//! Inference backends available to the CLI

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use canopy::services::{CancellationToken, ForecastService, SegmentationService};
use canopy::{AnalysisError, RgbFrame, Stage};
use log::info;
use ndarray::{Array2, Array3, ArrayView3, ArrayView4, Axis};

/// Serves a mask image produced ahead of time; white pixels are foreground.
///
/// Scores are emitted so that `foreground_class` wins on white pixels and the lowest other
/// class wins elsewhere.
pub struct PrecomputedMask {
    mask: RgbFrame,
    foreground_class: usize,
}

impl PrecomputedMask {
    pub fn new(mask: RgbFrame, foreground_class: usize) -> Self {
        Self {
            mask,
            foreground_class,
        }
    }

    pub fn open(path: &Path, foreground_class: usize) -> Result<Self> {
        let mask = RgbFrame::open(path)
            .with_context(|| format!("Failed to read mask {}", path.display()))?;
        Ok(Self::new(mask, foreground_class))
    }
}

impl SegmentationService for PrecomputedMask {
    fn segment(
        &self,
        input: ArrayView4<'_, f32>,
        cancel: &CancellationToken,
    ) -> canopy::Result<Array3<f32>> {
        cancel.check(Stage::Segmentation)?;
        let (_, height, width, _) = input.dim();
        let mask = self.mask.resized_nearest(width as u32, height as u32);
        let classes = (self.foreground_class + 1).max(2);
        let background_class = usize::from(self.foreground_class == 0);

        Ok(Array3::from_shape_fn((height, width, classes), |(r, c, class)| {
            let [red, green, blue] = mask.pixel(c as u32, r as u32);
            let foreground = red > 127 && green > 127 && blue > 127;
            let winner = if foreground {
                self.foreground_class
            } else {
                background_class
            };
            if class == winner {
                1.0
            } else {
                0.0
            }
        }))
    }
}

/// Repeats the last observation of every location
pub struct PersistenceForecast;

impl ForecastService for PersistenceForecast {
    fn forecast(
        &self,
        input: ArrayView3<'_, f32>,
        cancel: &CancellationToken,
    ) -> canopy::Result<Array2<f32>> {
        cancel.check(Stage::Forecast)?;
        let batch = input.index_axis(Axis(0), 0);
        let Some(last) = batch.rows().into_iter().last() else {
            return Err(AnalysisError::InsufficientHistory {
                required: 1,
                available: 0,
            });
        };
        let mut output = Array2::zeros((3, last.len()));
        for mut step in output.rows_mut() {
            step.assign(&last);
        }
        Ok(output)
    }
}

pub fn segmentation(
    mask: Option<&Path>,
    model: Option<&Path>,
    foreground_class: usize,
) -> Result<Arc<dyn SegmentationService>> {
    if let Some(path) = mask {
        info!("Using precomputed mask {}", path.display());
        return Ok(Arc::new(PrecomputedMask::open(path, foreground_class)?));
    }
    onnx_segmentation(model)
}

pub fn forecast(model: Option<&Path>) -> Result<Arc<dyn ForecastService>> {
    match model {
        Some(path) => onnx_forecast(path),
        None => {
            info!("No forecast model given, repeating the last observation");
            Ok(Arc::new(PersistenceForecast))
        }
    }
}

#[cfg(feature = "ml")]
fn onnx_segmentation(model: Option<&Path>) -> Result<Arc<dyn SegmentationService>> {
    let Some(path) = model else {
        bail!("Either --mask or a segmentation model is required");
    };
    Ok(Arc::new(canopy::OnnxSegmentationService::from_file(path)?))
}

#[cfg(not(feature = "ml"))]
fn onnx_segmentation(model: Option<&Path>) -> Result<Arc<dyn SegmentationService>> {
    if model.is_some() {
        bail!("Segmentation models need the `ml` feature; pass --mask instead");
    }
    bail!("--mask is required when built without the `ml` feature");
}

#[cfg(feature = "ml")]
fn onnx_forecast(path: &Path) -> Result<Arc<dyn ForecastService>> {
    Ok(Arc::new(canopy::OnnxForecastService::from_file(path)?))
}

#[cfg(not(feature = "ml"))]
fn onnx_forecast(_path: &Path) -> Result<Arc<dyn ForecastService>> {
    bail!("Forecast models need the `ml` feature")
}
