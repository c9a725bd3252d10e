//! Outer boundary extraction from a segmentation mask

use image::Rgb;
use imageproc::contours::{find_contours, BorderType};
use imageproc::drawing::draw_line_segment_mut;
use imageproc::edges::canny;
use log::debug;

use crate::config::ContourConfig;
use crate::error::{Result, Stage};
use crate::frame::RgbFrame;
use crate::mask::Mask;

/// A closed outline in pixel coordinates `(x, y)`
pub type Boundary = Vec<(u32, u32)>;

/// Traces external mask boundaries and draws them over a reference image
#[derive(Debug, Clone, Default)]
pub struct ContourExtractor {
    config: ContourConfig,
}

impl ContourExtractor {
    pub fn new(config: ContourConfig) -> Self {
        Self { config }
    }

    /// Outer boundaries of the Canny edges of `mask`; nested contours are skipped
    pub fn boundaries(&self, mask: &Mask) -> Vec<Boundary> {
        let edges = canny(&mask.to_gray(), self.config.canny_low, self.config.canny_high);

        find_contours::<u32>(&edges)
            .into_iter()
            .filter(|c| c.parent.is_none() && c.border_type == BorderType::Outer)
            .map(|c| c.points.into_iter().map(|p| (p.x, p.y)).collect::<Boundary>())
            .filter(|points| !points.is_empty())
            .collect()
    }

    /// Copy of `reference` with every outer boundary of `mask` drawn as a closed polyline
    pub fn extract(&self, mask: &Mask, reference: &RgbFrame) -> Result<RgbFrame> {
        mask.check_shape(reference, Stage::Contour)?;

        let boundaries = self.boundaries(mask);
        debug!("Drawing {} external contours", boundaries.len());

        let color = Rgb(self.config.color);
        let mut canvas = reference.as_image().clone();
        for boundary in &boundaries {
            let closing = boundary.iter().skip(1).chain(boundary.first());
            for (&(x0, y0), &(x1, y1)) in boundary.iter().zip(closing) {
                draw_line_segment_mut(
                    &mut canvas,
                    (x0 as f32, y0 as f32),
                    (x1 as f32, y1 as f32),
                    color,
                );
            }
        }

        Ok(RgbFrame::from_rgb_image(canvas))
    }
}
