//! RGB image frames
//!
//! Every function in the pipeline takes an [`RgbFrame`], so channel order is fixed by the
//! type rather than by convention. Frames decoded from files are RGB already; raw buffers in
//! BGR order (as produced by most capture libraries) are swapped exactly once, in
//! [`RgbFrame::from_bgr_bytes`].

use std::path::Path;

use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use ndarray::Array2;

use crate::error::{AnalysisError, Result};

/// Immutable RGB image, 8 bits per channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbFrame {
    image: RgbImage,
}

impl RgbFrame {
    /// Wrap an image that is already in RGB order
    pub fn from_rgb_image(image: RgbImage) -> Self {
        Self { image }
    }

    /// Convert a decoded image of any pixel layout to RGB
    pub fn from_dynamic(image: DynamicImage) -> Self {
        Self {
            image: image.into_rgb8(),
        }
    }

    /// Decode an image file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let image = image::open(path).map_err(|e| {
            AnalysisError::InvalidInput(format!("cannot read image {}: {e}", path.display()))
        })?;
        Ok(Self::from_dynamic(image))
    }

    /// Decode an in-memory encoded image (PNG, JPEG, ...)
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let image = image::load_from_memory(bytes)?;
        Ok(Self::from_dynamic(image))
    }

    /// Build a frame from interleaved RGB samples
    pub fn from_rgb_bytes(width: u32, height: u32, bytes: Vec<u8>) -> Result<Self> {
        check_buffer_len(width, height, bytes.len())?;
        RgbImage::from_raw(width, height, bytes)
            .map(Self::from_rgb_image)
            .ok_or_else(|| AnalysisError::InvalidInput("RGB buffer rejected".to_string()))
    }

    /// Build a frame from interleaved BGR samples, swapping to RGB
    pub fn from_bgr_bytes(width: u32, height: u32, mut bytes: Vec<u8>) -> Result<Self> {
        check_buffer_len(width, height, bytes.len())?;
        for pixel in bytes.chunks_exact_mut(3) {
            pixel.swap(0, 2);
        }
        Self::from_rgb_bytes(width, height, bytes)
    }

    /// All-black frame
    pub fn black(width: u32, height: u32) -> Self {
        Self {
            image: RgbImage::new(width, height),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// (width, height) in pixels
    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    /// (rows, cols), matching the layout of masks and index planes
    pub fn shape(&self) -> (usize, usize) {
        (self.image.height() as usize, self.image.width() as usize)
    }

    pub fn is_empty(&self) -> bool {
        self.image.width() == 0 || self.image.height() == 0
    }

    /// Pixel at column `x`, row `y`
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        self.image.get_pixel(x, y).0
    }

    /// Row-major interleaved RGB samples
    pub fn as_raw(&self) -> &[u8] {
        self.image.as_raw()
    }

    pub fn as_image(&self) -> &RgbImage {
        &self.image
    }

    pub fn into_image(self) -> RgbImage {
        self.image
    }

    /// Resample to the given size with area-style (triangle) filtering
    pub fn resized(&self, width: u32, height: u32) -> Self {
        self.resized_with(width, height, FilterType::Triangle)
    }

    /// Resample without interpolation, keeping label colors exact
    pub fn resized_nearest(&self, width: u32, height: u32) -> Self {
        self.resized_with(width, height, FilterType::Nearest)
    }

    fn resized_with(&self, width: u32, height: u32, filter: FilterType) -> Self {
        if self.dimensions() == (width, height) {
            return self.clone();
        }
        Self {
            image: image::imageops::resize(&self.image, width, height, filter),
        }
    }

    /// New frame with every pixel passed through `f(row, col, rgb)`
    pub fn map_pixels(&self, f: impl Fn(usize, usize, [u8; 3]) -> [u8; 3]) -> Self {
        let mut image = self.image.clone();
        for (x, y, pixel) in image.enumerate_pixels_mut() {
            *pixel = Rgb(f(y as usize, x as usize, pixel.0));
        }
        Self { image }
    }

    /// Pixels that are not pure black
    pub fn non_black_mask(&self) -> Array2<bool> {
        let (rows, cols) = self.shape();
        Array2::from_shape_fn((rows, cols), |(r, c)| {
            self.image.get_pixel(c as u32, r as u32).0 != [0, 0, 0]
        })
    }

    /// Encode as PNG at `path`
    pub fn save_png(&self, path: impl AsRef<Path>) -> Result<()> {
        self.image
            .save_with_format(path.as_ref(), ImageFormat::Png)
            .map_err(AnalysisError::from)
    }
}

impl From<RgbImage> for RgbFrame {
    fn from(image: RgbImage) -> Self {
        Self::from_rgb_image(image)
    }
}

fn check_buffer_len(width: u32, height: u32, len: usize) -> Result<()> {
    let expected = width as usize * height as usize * 3;
    if len != expected {
        return Err(AnalysisError::InvalidInput(format!(
            "expected {expected} bytes for a {width}x{height} RGB buffer, got {len}"
        )));
    }
    Ok(())
}
