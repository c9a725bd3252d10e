#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

//! Canopy - vegetation coverage analytics for georeferenced aerial imagery
//!
//! This library turns an image and a pixel classification from an external segmentation
//! model into vegetation density statistics and visual artifacts, links the observation to
//! the nearest monitoring station, and retrieves a short coverage forecast for it.

pub mod config;
pub mod contour;
pub mod density;
pub mod error;
pub mod forecast;
pub mod frame;
pub mod geo;
pub mod indices;
pub mod mask;
pub mod pipeline;
pub mod services;
pub mod stations;
pub mod store;

pub use config::AnalysisConfig;
pub use contour::ContourExtractor;
pub use density::{DensityClassifier, DensityReport, Percentage};
pub use error::{AnalysisError, Result, Stage};
pub use forecast::{ForecastAdapter, ForecastResult, HistoricalSeries};
pub use frame::RgbFrame;
pub use geo::{haversine, Coordinate};
pub use indices::PixelIndices;
pub use mask::Mask;
pub use pipeline::{AnalysisArtifacts, AnalysisPipeline, AnalysisReport};
pub use services::{CancellationToken, ForecastService, SegmentationService};
pub use stations::{Station, StationCatalog, StationMatch};
pub use store::{ArtifactId, ArtifactKind, ArtifactRef, ArtifactStore, FsArtifactStore};

#[cfg(feature = "ml")]
pub use services::{OnnxForecastService, OnnxSegmentationService};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
