//! End-to-end analysis of one georeferenced image
//!
//! One call runs segmentation, density classification and contour extraction on the
//! image, matches the observation point to the nearest monitoring station, fetches that
//! station's coverage forecast and finally persists the visual artifacts. Everything that
//! can fail for reasons other than storage runs before the first write, so a failed or
//! cancelled request leaves nothing behind.

use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, warn};
use ndarray::Array4;
use serde::Serialize;

use crate::config::AnalysisConfig;
use crate::contour::ContourExtractor;
use crate::density::{DensityClassifier, DensityReport, Percentage};
use crate::error::{AnalysisError, Result, Stage};
use crate::forecast::{ForecastAdapter, ForecastResult, HistoricalSeries};
use crate::frame::RgbFrame;
use crate::geo::Coordinate;
use crate::indices::PixelIndices;
use crate::mask::Mask;
use crate::services::{CancellationToken, ForecastService, SegmentationService};
use crate::stations::{StationCatalog, StationMatch};
use crate::store::{ArtifactId, ArtifactKind, ArtifactRef, ArtifactStore};

/// References to the persisted images of one analysis
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisArtifacts {
    pub original: ArtifactRef,
    pub overlay: ArtifactRef,
    /// Absent when contour extraction failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contour: Option<ArtifactRef>,
    pub predict: ArtifactRef,
}

impl AnalysisArtifacts {
    pub fn iter(&self) -> impl Iterator<Item = &ArtifactRef> {
        [Some(&self.original), Some(&self.overlay), self.contour.as_ref(), Some(&self.predict)]
            .into_iter()
            .flatten()
    }
}

/// Everything produced for one image
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisReport {
    #[serde(rename = "segmentation_results")]
    pub artifacts: AnalysisArtifacts,
    #[serde(rename = "segmentation_stats")]
    pub stats: DensityReport,
    pub forecast: ForecastResult,
    pub station: StationMatch,
}

/// Frames computed before anything is persisted
struct RenderedArtifacts {
    original: RgbFrame,
    overlay: RgbFrame,
    contour: Option<RgbFrame>,
    predict: RgbFrame,
}

/// Composes segmentation, density, contour, station matching and forecasting.
///
/// All collaborators are shared read-only, so one pipeline can serve concurrent calls.
pub struct AnalysisPipeline {
    config: AnalysisConfig,
    segmentation: Arc<dyn SegmentationService>,
    forecast: ForecastAdapter,
    store: Arc<dyn ArtifactStore>,
    catalog: Arc<StationCatalog>,
    history: Arc<HistoricalSeries>,
    density: DensityClassifier,
    contour: ContourExtractor,
}

impl AnalysisPipeline {
    pub fn new(
        config: AnalysisConfig,
        segmentation: Arc<dyn SegmentationService>,
        forecast: Arc<dyn ForecastService>,
        store: Arc<dyn ArtifactStore>,
        catalog: Arc<StationCatalog>,
        history: Arc<HistoricalSeries>,
    ) -> Result<Self> {
        config.validate()?;
        // station ids index history columns; an empty catalog is reported by the lookup
        if !catalog.is_empty() && catalog.len() != history.locations().len() {
            return Err(AnalysisError::InvalidInput(format!(
                "{} stations but history has {} location columns",
                catalog.len(),
                history.locations().len()
            )));
        }
        Ok(Self {
            forecast: ForecastAdapter::new(forecast, config.forecast.window),
            density: DensityClassifier::new(config.density.clone()),
            contour: ContourExtractor::new(config.contour.clone()),
            config,
            segmentation,
            store,
            catalog,
            history,
        })
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn catalog(&self) -> &StationCatalog {
        &self.catalog
    }

    /// Analyze `frame` observed at `location`
    pub fn analyze(
        &self,
        frame: &RgbFrame,
        location: Coordinate,
        cancel: &CancellationToken,
    ) -> Result<AnalysisReport> {
        let started = Instant::now();
        if frame.is_empty() {
            return Err(AnalysisError::InvalidInput("image has no pixels".to_string()));
        }
        if !location.is_valid() {
            return Err(AnalysisError::InvalidInput(format!(
                "coordinate ({}, {}) is out of range",
                location.longitude, location.latitude
            )));
        }
        cancel.check(Stage::Input)?;

        let (width, height) = frame.dimensions();
        let seg = &self.config.segmentation;
        let resized = frame.resized(seg.input_width, seg.input_height);
        let mask = self.segment(&resized, cancel)?;
        debug!(
            "Segmented {}x{} input, {:.2}% foreground",
            seg.input_width,
            seg.input_height,
            mask.foreground_percentage()
        );

        cancel.check(Stage::Density)?;
        let foreground = mask.apply_to(&resized)?;
        let indices = PixelIndices::compute(&foreground);
        let valid = foreground.non_black_mask();
        let (colorized, stats) = self.density.classify(&foreground, &indices, &valid)?;
        let stats = stats.with_green_percentage(Percentage::new(mask.foreground_percentage()));

        cancel.check(Stage::Contour)?;
        let contour = contour_or_skip(self.contour.extract(&mask, &resized))?;

        let rendered = RenderedArtifacts {
            original: frame.clone(),
            overlay: colorized.resized(width, height),
            contour: contour.map(|c| c.resized(width, height)),
            predict: mask.to_frame().resized_nearest(width, height),
        };

        cancel.check(Stage::StationMatch)?;
        let station = self.catalog.nearest(location)?;
        let forecast = self
            .forecast
            .forecast(station.station.id, &self.history, cancel)?;

        cancel.check(Stage::Storage)?;
        let artifacts = self.persist(rendered)?;

        info!(
            "Analysis complete in {:.2?}: NDVI {:.2}, station #{} ({:.2} km)",
            started.elapsed(),
            stats.ndvi_score,
            station.station.id,
            station.distance_km
        );

        Ok(AnalysisReport {
            artifacts,
            stats,
            forecast,
            station,
        })
    }

    fn segment(&self, resized: &RgbFrame, cancel: &CancellationToken) -> Result<Mask> {
        let input = normalize(resized);
        cancel.check(Stage::Segmentation)?;
        let probabilities = self.segmentation.segment(input.view(), cancel)?;
        cancel.check(Stage::Segmentation)?;

        let (rows, cols, _) = probabilities.dim();
        let expected = resized.shape();
        if (rows, cols) != expected {
            return Err(AnalysisError::ShapeMismatch {
                stage: Stage::Segmentation,
                expected,
                actual: (rows, cols),
            });
        }
        Mask::from_probabilities(probabilities.view(), self.config.segmentation.foreground_class)
    }

    /// Persist every artifact, removing the ones already written if any write fails
    fn persist(&self, rendered: RenderedArtifacts) -> Result<AnalysisArtifacts> {
        let mut written = Vec::with_capacity(ArtifactKind::ALL.len());
        let result = self.write_all(&rendered, &mut written);

        if let Err(err) = &result {
            warn!(
                "Persisting artifacts failed ({err}), removing {} written",
                written.len()
            );
            for artifact in &written {
                if let Err(e) = self.store.remove(artifact) {
                    warn!("Could not remove {artifact}: {e}");
                }
            }
        }
        result
    }

    fn write_all(
        &self,
        rendered: &RenderedArtifacts,
        written: &mut Vec<ArtifactRef>,
    ) -> Result<AnalysisArtifacts> {
        let mut write = |kind: ArtifactKind, frame: &RgbFrame| -> Result<ArtifactRef> {
            let artifact = self.store.persist(&ArtifactId::new(kind), frame)?;
            written.push(artifact.clone());
            Ok(artifact)
        };

        let original = write(ArtifactKind::Original, &rendered.original)?;
        let overlay = write(ArtifactKind::Overlay, &rendered.overlay)?;
        let contour = match &rendered.contour {
            Some(frame) => Some(write(ArtifactKind::Contour, frame)?),
            None => None,
        };
        let predict = write(ArtifactKind::Predict, &rendered.predict)?;

        Ok(AnalysisArtifacts {
            original,
            overlay,
            contour,
            predict,
        })
    }
}

/// Keep a failed contour step from failing the analysis
fn contour_or_skip(result: Result<RgbFrame>) -> Result<Option<RgbFrame>> {
    match result {
        Ok(frame) => Ok(Some(frame)),
        Err(err) if err.is_recoverable() => {
            warn!("Skipping contour artifact: {err}");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

/// `(1, H, W, 3)` tensor min-max scaled over all samples; a constant image maps to zeros
pub fn normalize(frame: &RgbFrame) -> Array4<f32> {
    let raw = frame.as_raw();
    let (rows, cols) = frame.shape();
    let (min, max) = raw
        .iter()
        .fold((u8::MAX, u8::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    if min == max {
        return Array4::zeros((1, rows, cols, 3));
    }
    let range = f32::from(max - min);

    Array4::from_shape_fn((1, rows, cols, 3), |(_, r, c, ch)| {
        let v = raw[(r * cols + c) * 3 + ch];
        f32::from(v - min) / range
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryArtifactStore;
    use ndarray::{Array2, Array3, ArrayView3, ArrayView4, Axis};
    use std::collections::HashSet;

    /// Foreground wherever green dominates red in the normalized input
    struct GreenSegmentation;

    impl SegmentationService for GreenSegmentation {
        fn segment(
            &self,
            input: ArrayView4<'_, f32>,
            _cancel: &CancellationToken,
        ) -> Result<Array3<f32>> {
            let image = input.index_axis(Axis(0), 0);
            let (h, w, _) = image.dim();
            Ok(Array3::from_shape_fn((h, w, 2), |(r, c, class)| {
                let green = image[[r, c, 1]] > image[[r, c, 0]];
                if green == (class == 1) {
                    0.9
                } else {
                    0.1
                }
            }))
        }
    }

    /// Cancels the shared token while "inferring"
    struct CancellingSegmentation;

    impl SegmentationService for CancellingSegmentation {
        fn segment(
            &self,
            input: ArrayView4<'_, f32>,
            cancel: &CancellationToken,
        ) -> Result<Array3<f32>> {
            cancel.cancel();
            let (_, h, w, _) = input.dim();
            Ok(Array3::zeros((h, w, 2)))
        }
    }

    /// Returns an output that is too small
    struct WrongShapeSegmentation;

    impl SegmentationService for WrongShapeSegmentation {
        fn segment(
            &self,
            _input: ArrayView4<'_, f32>,
            _cancel: &CancellationToken,
        ) -> Result<Array3<f32>> {
            Ok(Array3::zeros((2, 2, 2)))
        }
    }

    struct StepForecast;

    impl ForecastService for StepForecast {
        fn forecast(
            &self,
            input: ArrayView3<'_, f32>,
            _cancel: &CancellationToken,
        ) -> Result<Array2<f32>> {
            let (_, _, locations) = input.dim();
            Ok(Array2::from_shape_fn((3, locations), |(step, loc)| {
                10.0 * (loc + 1) as f32 + step as f32
            }))
        }
    }

    fn config() -> AnalysisConfig {
        let mut config = AnalysisConfig::default();
        config.segmentation.input_width = 32;
        config.segmentation.input_height = 32;
        config
    }

    fn catalog() -> Arc<StationCatalog> {
        Arc::new(StationCatalog::new([
            Coordinate::new(106.80, -6.20),
            Coordinate::new(107.60, -6.90),
        ]))
    }

    fn history(rows: usize) -> Arc<HistoricalSeries> {
        let values = Array2::from_elem((rows, 2), 50.0);
        Arc::new(HistoricalSeries::new(vec!["a".into(), "b".into()], values).unwrap())
    }

    fn pipeline_with(
        segmentation: Arc<dyn SegmentationService>,
        store: Arc<MemoryArtifactStore>,
        history_rows: usize,
    ) -> AnalysisPipeline {
        AnalysisPipeline::new(
            config(),
            segmentation,
            Arc::new(StepForecast),
            store,
            catalog(),
            history(history_rows),
        )
        .unwrap()
    }

    /// Left half leafy green, right half red roof
    fn scene() -> RgbFrame {
        RgbFrame::from_rgb_image(image::RgbImage::from_fn(64, 48, |x, _| {
            if x < 32 {
                image::Rgb([30, 160, 40])
            } else {
                image::Rgb([180, 40, 30])
            }
        }))
    }

    #[test]
    fn test_pipeline_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<AnalysisPipeline>();
    }

    #[test]
    fn test_full_analysis() {
        let store = Arc::new(MemoryArtifactStore::new());
        let pipeline = pipeline_with(Arc::new(GreenSegmentation), store.clone(), 12);

        let report = pipeline
            .analyze(&scene(), Coordinate::new(107.5, -6.8), &CancellationToken::new())
            .unwrap();

        assert_eq!(report.station.station.id, 1);
        assert_eq!(report.forecast.month1.value(), 20.0);
        assert_eq!(report.forecast.month3.value(), 22.0);

        let green = report.stats.green_percentage.unwrap().value();
        assert!((green - 50.0).abs() < 5.0, "green {green}");
        let total = report.stats.high_pct.value()
            + report.stats.medium_pct.value()
            + report.stats.low_pct.value();
        assert!(total > 0.0 && total <= 100.01);
        assert!(report.stats.ndvi_score > 0.0);

        assert_eq!(store.len(), 4);
        for artifact in report.artifacts.iter() {
            let frame = store.get(&artifact.id).unwrap();
            assert_eq!(frame.dimensions(), (64, 48));
        }
        let original = store.get(&report.artifacts.original.id).unwrap();
        assert_eq!(original, scene());
    }

    #[test]
    fn test_report_uses_response_keys() {
        let store = Arc::new(MemoryArtifactStore::new());
        let pipeline = pipeline_with(Arc::new(GreenSegmentation), store, 12);
        let report = pipeline
            .analyze(&scene(), Coordinate::new(106.8, -6.2), &CancellationToken::new())
            .unwrap();

        let json = serde_json::to_value(&report).unwrap();
        let results = &json["segmentation_results"];
        for key in ["original", "overlay", "contour", "predict"] {
            assert!(results.get(key).is_some(), "missing {key}");
        }
        assert!(json["segmentation_stats"]["NDVI Score"].is_number());
        assert_eq!(json["forecast"]["month 2"], "11.00 %");
    }

    #[test]
    fn test_cancelled_before_start_persists_nothing() {
        let store = Arc::new(MemoryArtifactStore::new());
        let pipeline = pipeline_with(Arc::new(GreenSegmentation), store.clone(), 12);
        let token = CancellationToken::new();
        token.cancel();

        let err = pipeline
            .analyze(&scene(), Coordinate::new(106.8, -6.2), &token)
            .unwrap_err();
        assert!(matches!(err, AnalysisError::Cancelled { stage: Stage::Input }));
        assert!(store.is_empty());
    }

    #[test]
    fn test_cancelled_during_segmentation() {
        let store = Arc::new(MemoryArtifactStore::new());
        let pipeline = pipeline_with(Arc::new(CancellingSegmentation), store.clone(), 12);

        let err = pipeline
            .analyze(&scene(), Coordinate::new(106.8, -6.2), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(
            err,
            AnalysisError::Cancelled {
                stage: Stage::Segmentation
            }
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn test_wrong_segmentation_shape_aborts() {
        let store = Arc::new(MemoryArtifactStore::new());
        let pipeline = pipeline_with(Arc::new(WrongShapeSegmentation), store.clone(), 12);

        let err = pipeline
            .analyze(&scene(), Coordinate::new(106.8, -6.2), &CancellationToken::new())
            .unwrap_err();
        assert_eq!(err.stage(), Stage::Segmentation);
        assert!(!err.is_recoverable());
        assert!(store.is_empty());
    }

    #[test]
    fn test_forecast_failure_persists_nothing() {
        let store = Arc::new(MemoryArtifactStore::new());
        let pipeline = pipeline_with(Arc::new(GreenSegmentation), store.clone(), 11);

        let err = pipeline
            .analyze(&scene(), Coordinate::new(106.8, -6.2), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, AnalysisError::InsufficientHistory { .. }));
        assert!(store.is_empty());
    }

    #[test]
    fn test_storage_failure_rolls_back() {
        let store = Arc::new(MemoryArtifactStore::with_limit(2));
        let pipeline = pipeline_with(Arc::new(GreenSegmentation), store.clone(), 12);

        let err = pipeline
            .analyze(&scene(), Coordinate::new(106.8, -6.2), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, AnalysisError::Storage(_)));
        assert!(store.is_empty());
    }

    #[test]
    fn test_empty_catalog_aborts() {
        let store = Arc::new(MemoryArtifactStore::new());
        let pipeline = AnalysisPipeline::new(
            config(),
            Arc::new(GreenSegmentation),
            Arc::new(StepForecast),
            store.clone(),
            Arc::new(StationCatalog::default()),
            history(12),
        )
        .unwrap();

        let err = pipeline
            .analyze(&scene(), Coordinate::new(0.0, 0.0), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, AnalysisError::EmptyCatalog));
        assert!(store.is_empty());
    }

    #[test]
    fn test_catalog_history_mismatch_rejected() {
        let values = Array2::from_elem((12, 3), 50.0);
        let history =
            HistoricalSeries::new(vec!["a".into(), "b".into(), "c".into()], values).unwrap();
        let result = AnalysisPipeline::new(
            config(),
            Arc::new(GreenSegmentation),
            Arc::new(StepForecast),
            Arc::new(MemoryArtifactStore::new()),
            catalog(),
            Arc::new(history),
        );
        assert!(matches!(result, Err(AnalysisError::InvalidInput(_))));
    }

    #[test]
    fn test_rejects_bad_inputs() {
        let store = Arc::new(MemoryArtifactStore::new());
        let pipeline = pipeline_with(Arc::new(GreenSegmentation), store, 12);
        let token = CancellationToken::new();

        let err = pipeline
            .analyze(&RgbFrame::black(0, 0), Coordinate::new(0.0, 0.0), &token)
            .unwrap_err();
        assert!(err.is_input_error());
        let err = pipeline
            .analyze(&scene(), Coordinate::new(0.0, 120.0), &token)
            .unwrap_err();
        assert!(err.is_input_error());
    }

    #[test]
    fn test_concurrent_analyses_get_distinct_ids() {
        const RUNS: usize = 8;
        let store = Arc::new(MemoryArtifactStore::new());
        let pipeline = Arc::new(pipeline_with(Arc::new(GreenSegmentation), store.clone(), 12));
        let frame = scene();

        let reports: Vec<AnalysisReport> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..RUNS)
                .map(|_| {
                    let pipeline = Arc::clone(&pipeline);
                    let frame = &frame;
                    scope.spawn(move || {
                        pipeline
                            .analyze(frame, Coordinate::new(106.8, -6.2), &CancellationToken::new())
                            .unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        fn distinct(
            reports: &[AnalysisReport],
            pick: fn(&AnalysisReport) -> Option<&ArtifactRef>,
        ) -> usize {
            reports
                .iter()
                .filter_map(pick)
                .map(|a| a.id.uuid)
                .collect::<HashSet<_>>()
                .len()
        }
        assert_eq!(distinct(&reports, |r| Some(&r.artifacts.original)), RUNS);
        assert_eq!(distinct(&reports, |r| Some(&r.artifacts.overlay)), RUNS);
        assert_eq!(distinct(&reports, |r| r.artifacts.contour.as_ref()), RUNS);
        assert_eq!(distinct(&reports, |r| Some(&r.artifacts.predict)), RUNS);
        assert_eq!(store.len(), RUNS * 4);
    }

    #[test]
    fn test_recoverable_contour_failure_is_skipped() {
        let contour_err = AnalysisError::ShapeMismatch {
            stage: Stage::Contour,
            expected: (2, 2),
            actual: (1, 1),
        };
        assert!(contour_or_skip(Err(contour_err)).unwrap().is_none());
        assert!(contour_or_skip(Ok(RgbFrame::black(1, 1))).unwrap().is_some());
        assert!(contour_or_skip(Err(AnalysisError::segmentation("boom"))).is_err());
    }

    #[test]
    fn test_normalize() {
        let frame = RgbFrame::from_rgb_bytes(2, 1, vec![10, 20, 30, 110, 60, 10]).unwrap();
        let tensor = normalize(&frame);
        assert_eq!(tensor.dim(), (1, 1, 2, 3));
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
        assert_eq!(tensor[[0, 0, 1, 0]], 1.0);
        assert!((tensor[[0, 0, 0, 1]] - 0.1).abs() < 1e-6);

        let constant = normalize(&RgbFrame::from_rgb_bytes(1, 1, vec![7, 7, 7]).unwrap());
        assert!(constant.iter().all(|&v| v == 0.0));
    }
}
