#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Multi-model mosquito density forecasting engine.
//!
//! The [`orchestrator::ModelOrchestrator`] is the entry point. It validates
//! the request, fetches the region's history from a
//! [`provider::HistoricalSeriesProvider`], and runs a fallback chain over
//! four model families:
//!
//! 1. **Primary** ([`primary::PrimaryModelAdapter`]): in-process additive
//!    trend + yearly seasonality.
//! 2. **Secondary** ([`bridge::SecondaryModelBridge`]): an out-of-process
//!    ARIMA (R by default) spoken to over a JSON stdin/stdout protocol,
//!    which heals itself with an in-process [`arima`] fit when the external
//!    process fails.
//! 3. **Hybrid** ([`ensemble::combine`]): point-wise mean of primary and
//!    secondary with the union of their intervals.
//! 4. **Statistical** ([`statistical::StatisticalFallbackModel`]):
//!    exponential decay toward the mean; cannot fail on a non-empty series.
//!
//! Backend failures never reach the caller. Only request errors and total
//! exhaustion of the chain are surfaced as [`ForecastError`].

pub mod arima;
pub mod bridge;
pub mod config;
pub mod ensemble;
mod linalg;
pub mod orchestrator;
pub mod primary;
pub mod provider;
pub mod statistical;

use thiserror::Error;
use vcom_forecast_models::{RequestError, SeriesError};

use crate::provider::ProviderError;

pub use vcom_forecast_models as models;

/// Caller-facing errors from [`orchestrator::ModelOrchestrator::generate_forecast`].
#[derive(Debug, Error)]
pub enum ForecastError {
    /// The requested model family is not recognized.
    #[error("Invalid model: '{value}' (expected primary, secondary, or hybrid)")]
    InvalidModel {
        /// The rejected model name.
        value: String,
    },

    /// The requested horizon is outside the allowed range.
    #[error("Invalid horizon: {horizon} days (expected 7-365)")]
    InvalidHorizon {
        /// The rejected horizon.
        horizon: i64,
    },

    /// The region does not exist.
    #[error("Region {region_id} not found")]
    RegionNotFound {
        /// Requested region.
        region_id: i64,
    },

    /// The region exists but has no observations.
    #[error("No surveillance data for region {region_id}")]
    NoData {
        /// Requested region.
        region_id: i64,
    },

    /// The region's history is malformed.
    #[error("Invalid series for region {region_id}: {source}")]
    InvalidSeries {
        /// Requested region.
        region_id: i64,
        /// What was wrong with the series.
        source: SeriesError,
    },

    /// Too few observations to fit any model.
    #[error("Insufficient data for region {region_id}: {observed} points (need {required}+)")]
    InsufficientData {
        /// Requested region.
        region_id: i64,
        /// Number of observations available.
        observed: usize,
        /// Minimum number required.
        required: usize,
    },

    /// The series provider failed for a reason other than a missing region.
    #[error("Series provider error: {0}")]
    Provider(ProviderError),

    /// Every model family in the fallback chain failed.
    #[error("Forecast unavailable for region {region_id}: {message}")]
    ForecastUnavailable {
        /// Requested region.
        region_id: i64,
        /// Description of the last failure.
        message: String,
    },
}

impl From<RequestError> for ForecastError {
    fn from(e: RequestError) -> Self {
        match e {
            RequestError::InvalidModel { value } => Self::InvalidModel { value },
            RequestError::InvalidHorizon { horizon } => Self::InvalidHorizon { horizon },
        }
    }
}

impl ForecastError {
    /// Maps a provider failure onto the caller-facing taxonomy.
    #[must_use]
    pub fn from_provider(region_id: i64, e: ProviderError) -> Self {
        match e {
            ProviderError::RegionNotFound { .. } => Self::RegionNotFound { region_id },
            ProviderError::NoData { .. } => Self::NoData { region_id },
            other => Self::Provider(other),
        }
    }
}

/// Fit failures from the in-process models.
///
/// Always recovered by the fallback chain.
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    /// Fewer observations than the model needs.
    #[error("insufficient data: got {n} observations, need at least {min}")]
    InsufficientData {
        /// Observations provided.
        n: usize,
        /// Observations required.
        min: usize,
    },

    /// The fit did not produce a usable model.
    #[error("{model} fit did not converge: {message}")]
    NonConvergence {
        /// Which model failed.
        model: &'static str,
        /// What went wrong.
        message: String,
    },

    /// The blocking fit task panicked or was cancelled.
    #[error("{model} fit task failed: {message}")]
    Task {
        /// Which model was running.
        model: &'static str,
        /// Join error description.
        message: String,
    },
}

/// Runs a CPU-bound fit on the blocking thread pool so it does not stall
/// the async executor.
pub(crate) async fn run_blocking<T, F>(model: &'static str, f: F) -> Result<T, ModelError>
where
    F: FnOnce() -> Result<T, ModelError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ModelError::Task {
            model,
            message: e.to_string(),
        })?
}
