#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Data types shared by the mosquito density forecasting engine.
//!
//! A [`HistoricalSeries`] is the validated input to every model, a
//! [`ForecastPoint`] is one day of model output, and a [`ForecastResult`]
//! is what callers receive. All output values pass through
//! [`clamp_round`] so they are non-negative and rounded to two decimals
//! no matter which model produced them.

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Shortest forecast horizon a caller may request, in days.
pub const MIN_HORIZON_DAYS: u32 = 7;

/// Longest forecast horizon a caller may request, in days.
pub const MAX_HORIZON_DAYS: u32 = 365;

/// Horizon used when the caller does not specify one.
pub const DEFAULT_HORIZON_DAYS: u32 = 30;

/// Rounds to two decimal places.
#[must_use]
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Rounds to two decimal places and clamps to a minimum of zero.
///
/// Non-finite inputs collapse to `0.0`. Negative zero is normalized so
/// it serializes as `0.0`.
#[must_use]
pub fn clamp_round(value: f64) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    round2(value).max(0.0) + 0.0
}

/// Returns the `horizon` consecutive dates following `last`.
pub fn forecast_dates(last: NaiveDate, horizon: usize) -> impl Iterator<Item = NaiveDate> {
    (1..=horizon as u64).map(move |offset| last + Days::new(offset))
}

/// A single dated density observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSeriesPoint {
    /// Observation date.
    pub date: NaiveDate,
    /// Mosquito density (trap-night count).
    pub value: f64,
}

impl TimeSeriesPoint {
    /// Creates a point.
    #[must_use]
    pub const fn new(date: NaiveDate, value: f64) -> Self {
        Self { date, value }
    }
}

/// Why a sequence of points was rejected as a [`HistoricalSeries`].
#[derive(Debug, Clone, PartialEq)]
pub enum SeriesError {
    /// No points at all.
    Empty,
    /// A date did not strictly follow its predecessor.
    NotIncreasing {
        /// Position of the offending point.
        index: usize,
        /// Date of the preceding point.
        previous: NaiveDate,
        /// Date of the offending point.
        date: NaiveDate,
    },
    /// A density was negative, NaN, or infinite.
    InvalidValue {
        /// Date of the offending point.
        date: NaiveDate,
        /// The rejected value.
        value: f64,
    },
}

impl std::fmt::Display for SeriesError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "series is empty"),
            Self::NotIncreasing {
                index,
                previous,
                date,
            } => write!(
                f,
                "date {date} at position {index} does not follow {previous}"
            ),
            Self::InvalidValue { date, value } => {
                write!(f, "invalid density {value} on {date}")
            }
        }
    }
}

impl std::error::Error for SeriesError {}

/// A chronologically ordered density series with strictly increasing,
/// non-duplicated dates and finite, non-negative values.
///
/// Built once per request from the series provider and dropped after
/// the forecast is produced.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoricalSeries {
    points: Vec<TimeSeriesPoint>,
}

impl HistoricalSeries {
    /// Validates `points` and wraps them.
    ///
    /// # Errors
    ///
    /// Returns [`SeriesError`] if the points are empty, out of order,
    /// duplicated, or contain a negative or non-finite density.
    pub fn new(points: Vec<TimeSeriesPoint>) -> Result<Self, SeriesError> {
        if points.is_empty() {
            return Err(SeriesError::Empty);
        }

        for (index, point) in points.iter().enumerate() {
            if !point.value.is_finite() || point.value < 0.0 {
                return Err(SeriesError::InvalidValue {
                    date: point.date,
                    value: point.value,
                });
            }
            if index > 0 && point.date <= points[index - 1].date {
                return Err(SeriesError::NotIncreasing {
                    index,
                    previous: points[index - 1].date,
                    date: point.date,
                });
            }
        }

        Ok(Self { points })
    }

    /// Number of observations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Always `false`; construction rejects empty input.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// The observations in date order.
    #[must_use]
    pub fn points(&self) -> &[TimeSeriesPoint] {
        &self.points
    }

    /// Observation dates in order.
    #[must_use]
    pub fn dates(&self) -> Vec<NaiveDate> {
        self.points.iter().map(|p| p.date).collect()
    }

    /// Observed densities in order.
    #[must_use]
    pub fn values(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.value).collect()
    }

    /// Date of the most recent observation.
    #[must_use]
    pub fn last_date(&self) -> NaiveDate {
        self.points[self.points.len() - 1].date
    }

    /// Density of the most recent observation.
    #[must_use]
    pub fn last_value(&self) -> f64 {
        self.points[self.points.len() - 1].value
    }

    /// Arithmetic mean of the densities.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn mean(&self) -> f64 {
        self.points.iter().map(|p| p.value).sum::<f64>() / self.points.len() as f64
    }

    /// Population standard deviation of the densities.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn std_dev(&self) -> f64 {
        let mean = self.mean();
        let variance = self
            .points
            .iter()
            .map(|p| (p.value - mean).powi(2))
            .sum::<f64>()
            / self.points.len() as f64;
        variance.sqrt()
    }

    /// The `horizon` dates immediately after the last observation.
    #[must_use]
    pub fn future_dates(&self, horizon: usize) -> Vec<NaiveDate> {
        forecast_dates(self.last_date(), horizon).collect()
    }
}

/// One forecasted day.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForecastPoint {
    /// Forecast date.
    pub date: NaiveDate,
    /// Point estimate.
    pub predicted_value: f64,
    /// Lower interval bound.
    pub lower_bound: f64,
    /// Upper interval bound.
    pub upper_bound: f64,
}

impl ForecastPoint {
    /// Creates a point from raw model output, rounding every value to two
    /// decimals and clamping it at zero.
    #[must_use]
    pub fn new(date: NaiveDate, predicted: f64, lower: f64, upper: f64) -> Self {
        Self {
            date,
            predicted_value: clamp_round(predicted),
            lower_bound: clamp_round(lower),
            upper_bound: clamp_round(upper),
        }
    }
}

/// Model family a caller may request.
///
/// `prophet` and `arima` are accepted as aliases for the seasonal and
/// statistical families.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum ModelKind {
    /// In-process seasonal trend model.
    #[strum(to_string = "primary", serialize = "prophet")]
    Primary,
    /// Out-of-process ARIMA model with in-process fallback.
    #[strum(to_string = "secondary", serialize = "arima")]
    Secondary,
    /// Ensemble of primary and secondary.
    Hybrid,
}

/// Model that actually produced a [`ForecastResult`].
///
/// May differ from the requested [`ModelKind`] after fallback.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ModelLabel {
    /// Seasonal trend model.
    Primary,
    /// ARIMA family (bridge or its in-process fallback).
    Secondary,
    /// Ensemble of primary and secondary.
    Hybrid,
    /// Terminal exponential-decay fallback.
    Statistical,
}

impl From<ModelKind> for ModelLabel {
    fn from(kind: ModelKind) -> Self {
        match kind {
            ModelKind::Primary => Self::Primary,
            ModelKind::Secondary => Self::Secondary,
            ModelKind::Hybrid => Self::Hybrid,
        }
    }
}

/// A validated forecast request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRequest {
    /// Requested model family.
    pub model_kind: ModelKind,
    /// Days to forecast, within [`MIN_HORIZON_DAYS`]..=[`MAX_HORIZON_DAYS`].
    pub horizon_days: u32,
}

/// Why a [`ModelRequest`] could not be built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// The model name is not one of the recognized families.
    InvalidModel {
        /// The rejected name.
        value: String,
    },
    /// The horizon is outside the allowed range.
    InvalidHorizon {
        /// The rejected horizon.
        horizon: i64,
    },
}

impl std::fmt::Display for RequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidModel { value } => write!(
                f,
                "unknown model type '{value}': expected primary, secondary, or hybrid"
            ),
            Self::InvalidHorizon { horizon } => write!(
                f,
                "horizon {horizon} days is outside {MIN_HORIZON_DAYS}-{MAX_HORIZON_DAYS}"
            ),
        }
    }
}

impl std::error::Error for RequestError {}

impl ModelRequest {
    /// Parses a model name and checks the horizon range.
    ///
    /// The model name is checked first.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::InvalidModel`] for an unrecognized model
    /// name, or [`RequestError::InvalidHorizon`] if `horizon_days` is
    /// outside the allowed range.
    pub fn parse(model_kind: &str, horizon_days: i64) -> Result<Self, RequestError> {
        let model_kind = model_kind
            .trim()
            .parse::<ModelKind>()
            .map_err(|_| RequestError::InvalidModel {
                value: model_kind.to_string(),
            })?;

        let horizon_days = u32::try_from(horizon_days)
            .ok()
            .filter(|h| (MIN_HORIZON_DAYS..=MAX_HORIZON_DAYS).contains(h))
            .ok_or(RequestError::InvalidHorizon {
                horizon: horizon_days,
            })?;

        Ok(Self {
            model_kind,
            horizon_days,
        })
    }

    /// Horizon as a `usize` for indexing.
    #[must_use]
    pub const fn horizon(&self) -> usize {
        self.horizon_days as usize
    }
}

/// The forecast returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForecastResult {
    /// Region identifier.
    pub region_id: i64,
    /// Human-readable region name.
    pub region_name: String,
    /// Model that actually produced `points`.
    pub effective_model_label: ModelLabel,
    /// Number of forecasted days.
    pub horizon_days: u32,
    /// One point per day, starting the day after the last observation.
    pub points: Vec<ForecastPoint>,
}
