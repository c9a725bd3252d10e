//! Monitoring station catalog and nearest-station lookup

use std::io::Read;
use std::path::Path;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{AnalysisError, Result};
use crate::geo::{haversine, Coordinate};

/// A historical monitoring location.
///
/// `id` is the station's row in the catalog, which is also its column in the historical
/// series and in the forecast output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Station {
    pub id: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub coordinate: Coordinate,
}

/// Nearest station to a query point
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StationMatch {
    pub distance_km: f64,
    pub station: Station,
}

#[derive(Debug, Deserialize)]
struct StationRow {
    #[serde(rename = "Longitude", alias = "longitude", alias = "lon")]
    longitude: f64,
    #[serde(rename = "Latitude", alias = "latitude", alias = "lat")]
    latitude: f64,
    #[serde(rename = "Name", alias = "Station", alias = "name", default)]
    name: Option<String>,
}

/// Immutable list of stations, loaded once and shared
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StationCatalog {
    stations: Vec<Station>,
}

impl StationCatalog {
    /// Build a catalog from coordinates; ids follow input order
    pub fn new(coordinates: impl IntoIterator<Item = Coordinate>) -> Self {
        let stations = coordinates
            .into_iter()
            .enumerate()
            .map(|(id, coordinate)| Station {
                id,
                coordinate,
                name: None,
            })
            .collect();
        Self { stations }
    }

    pub fn from_stations(stations: Vec<Station>) -> Self {
        Self { stations }
    }

    pub fn from_csv_path(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        Self::from_reader(file)
    }

    /// Parse a CSV table with `Longitude` and `Latitude` columns and an optional `Name`
    pub fn from_reader(reader: impl Read) -> Result<Self> {
        let mut csv = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);

        let mut stations = Vec::new();
        for (id, row) in csv.deserialize::<StationRow>().enumerate() {
            let row = row?;
            let coordinate = Coordinate::new(row.longitude, row.latitude);
            if !coordinate.is_valid() {
                return Err(AnalysisError::InvalidInput(format!(
                    "station {id} has out-of-range coordinate ({}, {})",
                    row.longitude, row.latitude
                )));
            }
            stations.push(Station {
                id,
                coordinate,
                name: row.name.filter(|n| !n.is_empty()),
            });
        }

        debug!("Loaded {} stations", stations.len());
        Ok(Self { stations })
    }

    pub fn len(&self) -> usize {
        self.stations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }

    pub fn get(&self, id: usize) -> Option<&Station> {
        self.stations.get(id)
    }

    pub fn stations(&self) -> &[Station] {
        &self.stations
    }

    /// Station with the smallest haversine distance; ties keep the earliest station
    pub fn nearest(&self, target: Coordinate) -> Result<StationMatch> {
        let mut best: Option<(&Station, f64)> = None;
        for station in &self.stations {
            let distance = haversine(station.coordinate, target);
            match best {
                Some((_, d)) if d <= distance => {}
                _ => best = Some((station, distance)),
            }
        }

        let (station, distance_km) = best.ok_or(AnalysisError::EmptyCatalog)?;
        debug!(
            "Nearest station to ({:.4}, {:.4}) is #{} at {:.3} km",
            target.longitude, target.latitude, station.id, distance_km
        );
        Ok(StationMatch {
            station: station.clone(),
            distance_km,
        })
    }
}
