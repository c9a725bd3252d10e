//! Binary segmentation masks

use image::{GrayImage, Luma, RgbImage};
use ndarray::{Array2, ArrayView3, Axis};

use crate::error::{AnalysisError, Result, Stage};
use crate::frame::RgbFrame;

/// Label for background pixels
pub const BACKGROUND: u8 = 0;

/// Label for foreground (vegetation/structure) pixels
pub const FOREGROUND: u8 = 1;

/// Per-pixel class labels produced by the segmentation service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mask {
    labels: Array2<u8>,
}

impl Mask {
    /// Wrap a label grid; every label must be 0 or 1
    pub fn from_labels(labels: Array2<u8>) -> Result<Self> {
        if let Some(bad) = labels.iter().find(|&&l| l > FOREGROUND) {
            return Err(AnalysisError::InvalidInput(format!(
                "mask label {bad} is not binary"
            )));
        }
        Ok(Self { labels })
    }

    /// Arg-max over the class axis of an `(H, W, classes)` probability tensor.
    ///
    /// Pixels whose winning class is `foreground_class` become foreground. Ties go to the
    /// lowest class index.
    pub fn from_probabilities(probs: ArrayView3<'_, f32>, foreground_class: usize) -> Result<Self> {
        let classes = probs.len_of(Axis(2));
        if classes == 0 || foreground_class >= classes {
            return Err(AnalysisError::segmentation(format!(
                "foreground class {foreground_class} not present in {classes}-class output"
            )));
        }

        let labels = probs.map_axis(Axis(2), |scores| {
            let mut best = 0;
            for (class, &score) in scores.iter().enumerate().skip(1) {
                if score > scores[best] {
                    best = class;
                }
            }
            u8::from(best == foreground_class)
        });

        Ok(Self { labels })
    }

    /// (rows, cols)
    pub fn shape(&self) -> (usize, usize) {
        self.labels.dim()
    }

    pub fn labels(&self) -> &Array2<u8> {
        &self.labels
    }

    pub fn is_foreground(&self, row: usize, col: usize) -> bool {
        self.labels[[row, col]] == FOREGROUND
    }

    pub fn foreground_count(&self) -> usize {
        self.labels.iter().filter(|&&l| l == FOREGROUND).count()
    }

    /// Fraction of foreground pixels in percent; 0 for an empty mask
    pub fn foreground_percentage(&self) -> f64 {
        let total = self.labels.len();
        if total == 0 {
            return 0.0;
        }
        self.foreground_count() as f64 / total as f64 * 100.0
    }

    /// Single-channel image with foreground at 255
    pub fn to_gray(&self) -> GrayImage {
        let (rows, cols) = self.shape();
        GrayImage::from_fn(cols as u32, rows as u32, |x, y| {
            Luma([if self.is_foreground(y as usize, x as usize) {
                255
            } else {
                0
            }])
        })
    }

    /// White-on-black rendering of the raw prediction
    pub fn to_frame(&self) -> RgbFrame {
        let (rows, cols) = self.shape();
        RgbFrame::from_rgb_image(RgbImage::from_fn(cols as u32, rows as u32, |x, y| {
            if self.is_foreground(y as usize, x as usize) {
                image::Rgb([255, 255, 255])
            } else {
                image::Rgb([0, 0, 0])
            }
        }))
    }

    /// Keep `frame`'s colors on foreground pixels and paint the rest black
    pub fn apply_to(&self, frame: &RgbFrame) -> Result<RgbFrame> {
        self.check_shape(frame, Stage::Density)?;
        Ok(frame.map_pixels(|r, c, rgb| {
            if self.is_foreground(r, c) {
                rgb
            } else {
                [0, 0, 0]
            }
        }))
    }

    pub(crate) fn check_shape(&self, frame: &RgbFrame, stage: Stage) -> Result<()> {
        if frame.shape() != self.shape() {
            return Err(AnalysisError::ShapeMismatch {
                stage,
                expected: self.shape(),
                actual: frame.shape(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array3};

    #[test]
    fn test_rejects_non_binary_labels() {
        assert!(Mask::from_labels(array![[0, 2]]).is_err());
        assert!(Mask::from_labels(array![[0, 1]]).is_ok());
    }

    #[test]
    fn test_argmax_picks_foreground_class() {
        let mut probs = Array3::<f32>::zeros((1, 3, 2));
        probs[[0, 0, 0]] = 0.9;
        probs[[0, 0, 1]] = 0.1;
        probs[[0, 1, 0]] = 0.2;
        probs[[0, 1, 1]] = 0.8;
        // tie resolves to class 0
        probs[[0, 2, 0]] = 0.5;
        probs[[0, 2, 1]] = 0.5;

        let mask = Mask::from_probabilities(probs.view(), 1).unwrap();
        assert_eq!(mask.labels(), &array![[0, 1, 0]]);
    }

    #[test]
    fn test_missing_foreground_class_is_an_inference_error() {
        let probs = Array3::<f32>::zeros((2, 2, 1));
        let err = Mask::from_probabilities(probs.view(), 1).unwrap_err();
        assert!(matches!(err, AnalysisError::ExternalInference { .. }));
    }

    #[test]
    fn test_foreground_percentage() {
        let mask = Mask::from_labels(array![[1, 0], [0, 0]]).unwrap();
        assert!((mask.foreground_percentage() - 25.0).abs() < 1e-9);
        let empty = Mask::from_labels(Array2::zeros((0, 0))).unwrap();
        assert_eq!(empty.foreground_percentage(), 0.0);
    }

    #[test]
    fn test_apply_blacks_out_background() {
        let mask = Mask::from_labels(array![[1, 0]]).unwrap();
        let frame = RgbFrame::from_rgb_bytes(2, 1, vec![10, 20, 30, 40, 50, 60]).unwrap();
        let overlay = mask.apply_to(&frame).unwrap();
        assert_eq!(overlay.pixel(0, 0), [10, 20, 30]);
        assert_eq!(overlay.pixel(1, 0), [0, 0, 0]);
    }

    #[test]
    fn test_apply_checks_shape() {
        let mask = Mask::from_labels(array![[1, 0]]).unwrap();
        let frame = RgbFrame::black(1, 2);
        assert!(matches!(
            mask.apply_to(&frame),
            Err(AnalysisError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_renderings() {
        let mask = Mask::from_labels(array![[0, 1]]).unwrap();
        assert_eq!(mask.to_gray().get_pixel(1, 0)[0], 255);
        assert_eq!(mask.to_frame().pixel(0, 0), [0, 0, 0]);
        assert_eq!(mask.to_frame().pixel(1, 0), [255, 255, 255]);
    }
}
