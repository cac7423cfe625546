//! Historical series providers.
//!
//! The orchestrator only sees the [`HistoricalSeriesProvider`] trait.
//! [`InMemorySeriesProvider`] backs tests and embedding callers;
//! [`CsvSeriesProvider`] loads a surveillance export with one row per
//! region per day.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::NaiveDate;
use serde::Deserialize;
use thiserror::Error;
use vcom_forecast_models::TimeSeriesPoint;

/// Errors a series provider may return.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The region does not exist.
    #[error("Region {region_id} not found")]
    RegionNotFound {
        /// Requested region.
        region_id: i64,
    },

    /// The region exists but has no observations.
    #[error("No data for region {region_id}")]
    NoData {
        /// Requested region.
        region_id: i64,
    },

    /// Reading the backing store failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The backing data could not be parsed.
    #[error("Parse error: {message}")]
    Parse {
        /// Description of the parse failure.
        message: String,
    },
}

impl From<csv::Error> for ProviderError {
    fn from(e: csv::Error) -> Self {
        Self::Parse {
            message: e.to_string(),
        }
    }
}

/// A region's observations as returned by a provider.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionSeries {
    /// Human-readable region name.
    pub region_name: String,
    /// Observations in date order.
    pub points: Vec<TimeSeriesPoint>,
}

/// Source of per-region density history.
#[async_trait::async_trait]
pub trait HistoricalSeriesProvider: Send + Sync {
    /// Fetches the region's observations, ordered by date.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::RegionNotFound`] for an unknown region or
    /// [`ProviderError::NoData`] when the region has no observations.
    async fn fetch(&self, region_id: i64) -> Result<RegionSeries, ProviderError>;
}

/// A provider backed by a map held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemorySeriesProvider {
    regions: BTreeMap<i64, RegionSeries>,
}

impl InMemorySeriesProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a region.
    #[must_use]
    pub fn with_region(
        mut self,
        region_id: i64,
        region_name: impl Into<String>,
        points: Vec<TimeSeriesPoint>,
    ) -> Self {
        self.insert(region_id, region_name, points);
        self
    }

    /// Adds or replaces a region in place.
    pub fn insert(
        &mut self,
        region_id: i64,
        region_name: impl Into<String>,
        mut points: Vec<TimeSeriesPoint>,
    ) {
        points.sort_by_key(|p| p.date);
        self.regions.insert(
            region_id,
            RegionSeries {
                region_name: region_name.into(),
                points,
            },
        );
    }

    /// Region ids with their names and observation counts.
    #[must_use]
    pub fn summary(&self) -> Vec<(i64, String, usize)> {
        self.regions
            .iter()
            .map(|(id, series)| (*id, series.region_name.clone(), series.points.len()))
            .collect()
    }
}

#[async_trait::async_trait]
impl HistoricalSeriesProvider for InMemorySeriesProvider {
    async fn fetch(&self, region_id: i64) -> Result<RegionSeries, ProviderError> {
        let series = self
            .regions
            .get(&region_id)
            .ok_or(ProviderError::RegionNotFound { region_id })?;
        if series.points.is_empty() {
            return Err(ProviderError::NoData { region_id });
        }
        Ok(series.clone())
    }
}

/// One row of a surveillance CSV export.
#[derive(Debug, Deserialize)]
struct CsvRow {
    region_id: i64,
    region_name: String,
    date: NaiveDate,
    density: f64,
}

/// A provider loaded from a CSV file with the header
/// `region_id,region_name,date,density`.
#[derive(Debug, Clone)]
pub struct CsvSeriesProvider {
    inner: InMemorySeriesProvider,
}

impl CsvSeriesProvider {
    /// Loads every row of the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] if the file cannot be read or a row does
    /// not parse.
    pub fn from_path(path: &Path) -> Result<Self, ProviderError> {
        let reader = csv::Reader::from_path(path)?;
        Self::from_reader(reader)
    }

    /// Loads every row from CSV text.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Parse`] if a row does not parse.
    pub fn from_csv_str(data: &str) -> Result<Self, ProviderError> {
        Self::from_reader(csv::Reader::from_reader(data.as_bytes()))
    }

    fn from_reader<R: std::io::Read>(mut reader: csv::Reader<R>) -> Result<Self, ProviderError> {
        let mut grouped: BTreeMap<i64, (String, Vec<TimeSeriesPoint>)> = BTreeMap::new();
        let mut rows = 0usize;

        for record in reader.deserialize::<CsvRow>() {
            let row = record?;
            rows += 1;
            grouped
                .entry(row.region_id)
                .or_insert_with(|| (row.region_name.clone(), Vec::new()))
                .1
                .push(TimeSeriesPoint::new(row.date, row.density));
        }

        log::debug!("Loaded {rows} surveillance rows for {} regions", grouped.len());

        let mut inner = InMemorySeriesProvider::new();
        for (region_id, (name, points)) in grouped {
            inner.insert(region_id, name, points);
        }
        Ok(Self { inner })
    }

    /// Region ids with their names and observation counts.
    #[must_use]
    pub fn summary(&self) -> Vec<(i64, String, usize)> {
        self.inner.summary()
    }
}

#[async_trait::async_trait]
impl HistoricalSeriesProvider for CsvSeriesProvider {
    async fn fetch(&self, region_id: i64) -> Result<RegionSeries, ProviderError> {
        self.inner.fetch(region_id).await
    }
}
