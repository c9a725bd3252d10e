use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AnalysisError, Result};

/// Complete pipeline configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub segmentation: SegmentationConfig,
    pub density: DensityConfig,
    pub contour: ContourConfig,
    pub forecast: ForecastConfig,
    pub storage: StorageConfig,
}

/// Segmentation model input contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentationConfig {
    /// Model input width in pixels
    pub input_width: u32,
    /// Model input height in pixels
    pub input_height: u32,
    /// Class index that marks foreground in the model output
    pub foreground_class: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_path: Option<PathBuf>,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            input_width: 256,
            input_height: 256,
            foreground_class: 1,
            model_path: None,
        }
    }
}

/// Weights of the fused vegetation intensity; must sum to 1
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntensityWeights {
    pub green: f32,
    pub ndvi: f32,
    pub saturation: f32,
    pub exg: f32,
}

impl IntensityWeights {
    pub fn sum(&self) -> f32 {
        self.green + self.ndvi + self.saturation + self.exg
    }
}

impl Default for IntensityWeights {
    fn default() -> Self {
        Self {
            green: 0.4,
            ndvi: 0.3,
            saturation: 0.2,
            exg: 0.1,
        }
    }
}

/// Lower bounds of the high, medium and low density bands
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BandThresholds {
    pub high: f32,
    pub medium: f32,
    pub low: f32,
}

impl BandThresholds {
    fn is_ordered(&self) -> bool {
        self.high >= self.medium && self.medium >= self.low && self.low >= 0.0
    }
}

/// Colors painted over classified pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandColors {
    pub high: [u8; 3],
    pub medium: [u8; 3],
    pub low: [u8; 3],
}

impl Default for BandColors {
    fn default() -> Self {
        Self {
            high: [0, 255, 0],
            medium: [0, 200, 0],
            low: [0, 150, 0],
        }
    }
}

/// Vegetation density classification policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DensityConfig {
    /// Minimum HSV saturation, `[0, 1]`
    pub min_saturation: f32,
    /// Minimum HSV value, `[0, 1]`
    pub min_value: f32,
    /// NDVI must exceed this
    pub min_ndvi: f32,
    /// Excess-green must exceed this, in sample units
    pub min_exg: f32,
    /// Below this total coverage (percent) the lenient green-dominance mask is used
    pub fallback_min_pct: f64,
    pub weights: IntensityWeights,
    /// Floors applied to the adaptive percentile thresholds
    pub floors: BandThresholds,
    /// Thresholds used when no pixel passes the vegetation mask
    pub defaults: BandThresholds,
    pub colors: BandColors,
}

impl Default for DensityConfig {
    fn default() -> Self {
        Self {
            min_saturation: 0.15,
            min_value: 0.15,
            min_ndvi: 0.05,
            min_exg: 10.0,
            fallback_min_pct: 5.0,
            weights: IntensityWeights::default(),
            floors: BandThresholds {
                high: 0.6,
                medium: 0.4,
                low: 0.2,
            },
            defaults: BandThresholds {
                high: 0.7,
                medium: 0.5,
                low: 0.3,
            },
            colors: BandColors::default(),
        }
    }
}

/// Boundary extraction settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContourConfig {
    /// Lower Canny gradient threshold
    pub canny_low: f32,
    /// Upper Canny gradient threshold
    pub canny_high: f32,
    /// Line color
    pub color: [u8; 3],
}

impl Default for ContourConfig {
    fn default() -> Self {
        Self {
            canny_low: 30.0,
            canny_high: 200.0,
            color: [255, 0, 0],
        }
    }
}

/// Forecast window settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForecastConfig {
    /// Trailing rows fed to the model
    pub window: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_path: Option<PathBuf>,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            window: 12,
            model_path: None,
        }
    }
}

/// Artifact storage settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("store"),
        }
    }
}

impl AnalysisConfig {
    /// Load from a `.toml`, `.yaml`/`.yml` or `.json` file and validate
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        let config: Self = match extension.as_str() {
            "toml" => toml::from_str(&text).map_err(|e| AnalysisError::Config(e.to_string()))?,
            "yaml" | "yml" => {
                serde_yaml::from_str(&text).map_err(|e| AnalysisError::Config(e.to_string()))?
            }
            "json" => {
                serde_json::from_str(&text).map_err(|e| AnalysisError::Config(e.to_string()))?
            }
            other => {
                return Err(AnalysisError::Config(format!(
                    "unsupported config format '{other}' for {}",
                    path.display()
                )))
            }
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration consistency
    pub fn validate(&self) -> Result<()> {
        let seg = &self.segmentation;
        if seg.input_width == 0 || seg.input_height == 0 {
            return Err(AnalysisError::Config(
                "Segmentation input size must be greater than zero".to_string(),
            ));
        }

        let density = &self.density;
        if (density.weights.sum() - 1.0).abs() > 1e-4 {
            return Err(AnalysisError::Config(format!(
                "Intensity weights must sum to 1.0, got {}",
                density.weights.sum()
            )));
        }
        if !density.floors.is_ordered() || !density.defaults.is_ordered() {
            return Err(AnalysisError::Config(
                "Band thresholds must satisfy high >= medium >= low >= 0".to_string(),
            ));
        }
        if !(0.0..=100.0).contains(&density.fallback_min_pct) {
            return Err(AnalysisError::Config(
                "Fallback coverage must be a percentage".to_string(),
            ));
        }

        if self.contour.canny_low > self.contour.canny_high {
            return Err(AnalysisError::Config(
                "Canny low threshold must not exceed the high threshold".to_string(),
            ));
        }

        if self.forecast.window == 0 {
            return Err(AnalysisError::Config(
                "Forecast window must be at least one row".to_string(),
            ));
        }

        Ok(())
    }
}
