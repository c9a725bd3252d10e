//! External inference services and cooperative cancellation
//!
//! The segmentation and forecasting networks are opaque collaborators. The pipeline only
//! depends on the traits here; ONNX Runtime backends are available behind the `ml` feature.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ndarray::{Array2, Array3, ArrayView3, ArrayView4};

use crate::error::{AnalysisError, Result, Stage};

/// Pixel classification model.
///
/// Input is `(1, H, W, 3)` RGB scaled to `[0, 1]`; output is `(H, W, classes)` scores.
pub trait SegmentationService: Send + Sync {
    fn segment(&self, input: ArrayView4<'_, f32>, cancel: &CancellationToken)
        -> Result<Array3<f32>>;
}

/// Coverage forecasting model.
///
/// Input is `(1, window, features)`; output is `(steps, locations)`.
pub trait ForecastService: Send + Sync {
    fn forecast(&self, input: ArrayView3<'_, f32>, cancel: &CancellationToken)
        -> Result<Array2<f32>>;
}

/// Shared cancellation flag with an optional deadline.
///
/// Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that expires at `deadline`
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            cancelled: Arc::default(),
            deadline: Some(deadline),
        }
    }

    /// Token that expires `timeout` from now
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
            || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Error out with `Cancelled { stage }` once cancelled or past the deadline
    pub fn check(&self, stage: Stage) -> Result<()> {
        if self.is_cancelled() {
            return Err(AnalysisError::Cancelled { stage });
        }
        Ok(())
    }
}

#[cfg(feature = "ml")]
pub use onnx::{OnnxForecastService, OnnxSegmentationService};

#[cfg(feature = "ml")]
mod onnx {
    use std::path::Path;
    use std::sync::Mutex;

    use log::{debug, info};
    use ndarray::{Array2, Array3, ArrayView3, ArrayView4};
    use ort::session::builder::GraphOptimizationLevel;
    use ort::session::Session;
    use ort::value::Tensor;

    use super::{CancellationToken, ForecastService, SegmentationService};
    use crate::error::{AnalysisError, Result, Stage};

    fn load_session(path: &Path, stage: Stage) -> Result<Session> {
        let fail = |what: &str, e: &dyn std::fmt::Display| AnalysisError::ExternalInference {
            stage,
            message: format!("{what} for {}: {e}", path.display()),
        };

        if !path.exists() {
            return Err(AnalysisError::Config(format!(
                "model file {} does not exist",
                path.display()
            )));
        }

        let threads = std::thread::available_parallelism().map_or(1, |n| n.get());
        let session = Session::builder()
            .map_err(|e| fail("Failed to create session builder", &e))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| fail("Failed to set optimization", &e))?
            .with_intra_threads(threads)
            .map_err(|e| fail("Failed to set threads", &e))?
            .commit_from_file(path)
            .map_err(|e| fail("Failed to load model", &e))?;

        info!("Loaded {stage} model from {}", path.display());
        Ok(session)
    }

    /// Run the session on one input and flatten its first output
    fn run_flat(session: &Mutex<Session>, input: ndarray::ArrayD<f32>, stage: Stage) -> Result<Vec<f32>> {
        let fail = |message: String| AnalysisError::ExternalInference { stage, message };

        let tensor =
            Tensor::from_array(input).map_err(|e| fail(format!("Failed to create input tensor: {e}")))?;
        let mut session = session
            .lock()
            .map_err(|_| fail("Session lock poisoned".to_string()))?;
        let outputs = session
            .run(ort::inputs![tensor])
            .map_err(|e| fail(format!("Inference failed: {e}")))?;
        let output = outputs[0]
            .try_extract_array::<f32>()
            .map_err(|e| fail(format!("Failed to extract output: {e}")))?;

        debug!("{stage} model produced output of shape {:?}", output.shape());
        Ok(output.iter().copied().collect())
    }

    /// Segmentation network loaded from an ONNX file
    pub struct OnnxSegmentationService {
        session: Mutex<Session>,
    }

    impl OnnxSegmentationService {
        pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
            let session = load_session(path.as_ref(), Stage::Segmentation)?;
            Ok(Self {
                session: Mutex::new(session),
            })
        }
    }

    impl SegmentationService for OnnxSegmentationService {
        fn segment(
            &self,
            input: ArrayView4<'_, f32>,
            cancel: &CancellationToken,
        ) -> Result<Array3<f32>> {
            cancel.check(Stage::Segmentation)?;
            let (_, height, width, _) = input.dim();
            let flat = run_flat(&self.session, input.to_owned().into_dyn(), Stage::Segmentation)?;
            cancel.check(Stage::Segmentation)?;

            // accepts (1, H, W, C) as well as the flattened (1, H*W, C) layout
            let pixels = height * width;
            if pixels == 0 || flat.len() % pixels != 0 {
                return Err(AnalysisError::segmentation(format!(
                    "output of {} values does not cover {height}x{width} pixels",
                    flat.len()
                )));
            }
            let classes = flat.len() / pixels;
            Array3::from_shape_vec((height, width, classes), flat)
                .map_err(|e| AnalysisError::segmentation(e.to_string()))
        }
    }

    /// Forecasting network loaded from an ONNX file
    pub struct OnnxForecastService {
        session: Mutex<Session>,
    }

    impl OnnxForecastService {
        pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
            let session = load_session(path.as_ref(), Stage::Forecast)?;
            Ok(Self {
                session: Mutex::new(session),
            })
        }
    }

    impl ForecastService for OnnxForecastService {
        fn forecast(
            &self,
            input: ArrayView3<'_, f32>,
            cancel: &CancellationToken,
        ) -> Result<Array2<f32>> {
            cancel.check(Stage::Forecast)?;
            let (_, _, locations) = input.dim();
            let flat = run_flat(&self.session, input.to_owned().into_dyn(), Stage::Forecast)?;
            cancel.check(Stage::Forecast)?;

            // one prediction per input location and step, batch and unit axes squeezed
            if locations == 0 || flat.len() % locations != 0 {
                return Err(AnalysisError::forecast(format!(
                    "output of {} values does not split into {locations} locations",
                    flat.len()
                )));
            }
            let steps = flat.len() / locations;
            Array2::from_shape_vec((steps, locations), flat)
                .map_err(|e| AnalysisError::forecast(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_token_is_live() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check(Stage::Segmentation).is_ok());
    }

    #[test]
    fn test_cancel_is_shared_by_clones() {
        let token = CancellationToken::new();
        let observer = token.clone();
        token.cancel();
        assert!(observer.is_cancelled());
        assert!(matches!(
            observer.check(Stage::Storage),
            Err(AnalysisError::Cancelled {
                stage: Stage::Storage
            })
        ));
    }

    #[test]
    fn test_expired_deadline() {
        let token = CancellationToken::with_deadline(Instant::now());
        assert!(token.is_cancelled());
        let token = CancellationToken::with_timeout(Duration::from_secs(3600));
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_token_crosses_threads() {
        let token = CancellationToken::new();
        std::thread::scope(|scope| {
            scope.spawn(|| token.cancel());
        });
        assert!(token.is_cancelled());
    }
}
