use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Result type for Canopy operations
pub type Result<T> = std::result::Result<T, AnalysisError>;

/// Pipeline stage an error originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    Input,
    Segmentation,
    Density,
    Contour,
    StationMatch,
    Forecast,
    Storage,
    Config,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Input => "input",
            Self::Segmentation => "segmentation",
            Self::Density => "density classification",
            Self::Contour => "contour extraction",
            Self::StationMatch => "station matching",
            Self::Forecast => "forecast",
            Self::Storage => "artifact storage",
            Self::Config => "configuration",
        };
        f.write_str(name)
    }
}

/// Errors that can occur while analyzing an image
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Shape mismatch during {stage}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        stage: Stage,
        expected: (usize, usize),
        actual: (usize, usize),
    },

    #[error("External inference failed during {stage}: {message}")]
    ExternalInference { stage: Stage, message: String },

    #[error("Analysis cancelled during {stage}")]
    Cancelled { stage: Stage },

    #[error("Station catalog is empty")]
    EmptyCatalog,

    #[error("Insufficient history: {required} rows required, {available} available")]
    InsufficientHistory { required: usize, available: usize },

    #[error("Station index {index} out of range for {locations} forecast locations")]
    InvalidStationIndex { index: usize, locations: usize },

    #[error("Artifact storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Image format error: {0}")]
    ImageError(#[from] image::ImageError),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
}

impl AnalysisError {
    pub(crate) fn segmentation(message: impl Into<String>) -> Self {
        Self::ExternalInference {
            stage: Stage::Segmentation,
            message: message.into(),
        }
    }

    pub(crate) fn forecast(message: impl Into<String>) -> Self {
        Self::ExternalInference {
            stage: Stage::Forecast,
            message: message.into(),
        }
    }

    /// Stage to blame in a user-facing message
    pub fn stage(&self) -> Stage {
        match self {
            Self::InvalidInput(_) | Self::ImageError(_) | Self::IoError(_) => Stage::Input,
            Self::ShapeMismatch { stage, .. }
            | Self::ExternalInference { stage, .. }
            | Self::Cancelled { stage } => *stage,
            Self::EmptyCatalog => Stage::StationMatch,
            Self::InsufficientHistory { .. } | Self::InvalidStationIndex { .. } => Stage::Forecast,
            Self::Storage(_) => Stage::Storage,
            Self::Config(_) => Stage::Config,
            Self::CsvError(_) => Stage::Input,
        }
    }

    /// Returns true if the pipeline can continue without the failed step
    pub fn is_recoverable(&self) -> bool {
        matches!(self.stage(), Stage::Contour)
    }

    /// Returns true if the caller supplied bad data rather than hitting an internal failure
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidInput(_)
                | Self::ImageError(_)
                | Self::IoError(_)
                | Self::CsvError(_)
                | Self::EmptyCatalog
                | Self::InsufficientHistory { .. }
                | Self::InvalidStationIndex { .. }
                | Self::Config(_)
        )
    }
}
