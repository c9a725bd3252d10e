//! Historical coverage series and the three-step forecast adapter

use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use log::debug;
use ndarray::{s, Array2, ArrayView2, Axis};
use serde::Serialize;

use crate::density::{round2, Percentage};
use crate::error::{AnalysisError, Result, Stage};
use crate::services::{CancellationToken, ForecastService};

/// Steps returned to the caller
pub const FORECAST_STEPS: usize = 3;

/// Time-ordered coverage observations, one column per location
#[derive(Debug, Clone, PartialEq)]
pub struct HistoricalSeries {
    locations: Vec<String>,
    values: Array2<f32>,
}

impl HistoricalSeries {
    pub fn new(locations: Vec<String>, values: Array2<f32>) -> Result<Self> {
        if locations.len() != values.ncols() {
            return Err(AnalysisError::InvalidInput(format!(
                "{} location names for {} columns",
                locations.len(),
                values.ncols()
            )));
        }
        Ok(Self { locations, values })
    }

    pub fn from_csv_path(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        Self::from_reader(file)
    }

    /// Parse a CSV table, dropping `Timestamp` and text columns.
    ///
    /// A location column with some unparsable cells is an error: dropping it would shift
    /// every later location onto the wrong station.
    pub fn from_reader(reader: impl Read) -> Result<Self> {
        let mut csv = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);
        let headers = csv.headers()?.clone();
        let records = csv.records().collect::<std::result::Result<Vec<_>, _>>()?;

        let mut locations = Vec::new();
        let mut columns: Vec<Vec<f32>> = Vec::new();
        for (index, header) in headers.iter().enumerate() {
            if header.eq_ignore_ascii_case("timestamp") {
                continue;
            }
            let cells: Vec<Option<f32>> = records
                .iter()
                .map(|record| record.get(index).and_then(|v| v.parse().ok()))
                .collect();
            if !cells.is_empty() && cells.iter().all(Option::is_none) {
                debug!("Dropping non-numeric history column '{header}'");
                continue;
            }
            if let Some(row) = cells.iter().position(Option::is_none) {
                return Err(AnalysisError::InvalidInput(format!(
                    "history column '{header}' has a missing or non-numeric value in row {}",
                    row + 1
                )));
            }
            locations.push(header.to_string());
            columns.push(cells.into_iter().flatten().collect());
        }

        let rows = records.len();
        let values = Array2::from_shape_fn((rows, columns.len()), |(r, c)| columns[c][r]);
        debug!("Loaded history with {} rows and {} locations", rows, locations.len());
        Self::new(locations, values)
    }

    pub fn locations(&self) -> &[String] {
        &self.locations
    }

    pub fn values(&self) -> ArrayView2<'_, f32> {
        self.values.view()
    }

    pub fn rows(&self) -> usize {
        self.values.nrows()
    }

    /// Last `window` rows
    pub fn trailing_window(&self, window: usize) -> Result<ArrayView2<'_, f32>> {
        let available = self.rows();
        if window == 0 || available < window {
            return Err(AnalysisError::InsufficientHistory {
                required: window.max(1),
                available,
            });
        }
        Ok(self.values.slice(s![available - window.., ..]))
    }
}

/// Predicted coverage for the next three months
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ForecastResult {
    #[serde(rename = "month 1")]
    pub month1: Percentage,
    #[serde(rename = "month 2")]
    pub month2: Percentage,
    #[serde(rename = "month 3")]
    pub month3: Percentage,
}

impl ForecastResult {
    pub fn months(&self) -> [Percentage; FORECAST_STEPS] {
        [self.month1, self.month2, self.month3]
    }
}

/// Feeds the trailing history window to a forecast service
#[derive(Clone)]
pub struct ForecastAdapter {
    service: Arc<dyn ForecastService>,
    window: usize,
}

impl ForecastAdapter {
    pub fn new(service: Arc<dyn ForecastService>, window: usize) -> Self {
        Self { service, window }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn forecast(
        &self,
        station: usize,
        history: &HistoricalSeries,
        cancel: &CancellationToken,
    ) -> Result<ForecastResult> {
        let window = history.trailing_window(self.window)?;
        let input = window.insert_axis(Axis(0));
        debug!("Forecasting station {station} from input {:?}", input.dim());

        cancel.check(Stage::Forecast)?;
        let output = self.service.forecast(input, cancel)?;
        cancel.check(Stage::Forecast)?;

        let (steps, locations) = output.dim();
        if steps < FORECAST_STEPS {
            return Err(AnalysisError::forecast(format!(
                "expected at least {FORECAST_STEPS} steps, service returned {steps}"
            )));
        }
        if station >= locations {
            return Err(AnalysisError::InvalidStationIndex {
                index: station,
                locations,
            });
        }

        let month = |step: usize| Percentage::new(round2(f64::from(output[[step, station]])));
        Ok(ForecastResult {
            month1: month(0),
            month2: month(1),
            month3: month(2),
        })
    }
}

impl std::fmt::Debug for ForecastAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForecastAdapter")
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}
