//! JSON wire format spoken with the external model process.
//!
//! Request (stdin): `{"dates": [...], "values": [...], "horizon": n}`.
//! Response (stdout): `{"forecasts": [{"date", "forecast", "lower", "upper"}, ...]}`.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use vcom_forecast_models::{ForecastPoint, HistoricalSeries};

use super::BridgeError;

/// Message written to the process's stdin.
#[derive(Debug, Serialize)]
pub struct BridgeRequest {
    /// ISO-8601 observation dates.
    pub dates: Vec<String>,
    /// Observed densities, aligned with `dates`.
    pub values: Vec<f64>,
    /// Days to forecast.
    pub horizon: usize,
}

impl BridgeRequest {
    /// Builds the request for `series`, with dates as `YYYY-MM-DD`.
    #[must_use]
    pub fn from_series(series: &HistoricalSeries, horizon: usize) -> Self {
        Self {
            dates: series
                .points()
                .iter()
                .map(|p| p.date.format("%Y-%m-%d").to_string())
                .collect(),
            values: series.values(),
            horizon,
        }
    }
}

/// Message read from the process's stdout.
#[derive(Debug, Deserialize)]
pub struct BridgeResponse {
    /// One entry per forecasted day, in date order.
    pub forecasts: Vec<BridgeForecast>,
}

/// One forecasted day.
#[derive(Debug, Deserialize)]
pub struct BridgeForecast {
    /// ISO-8601 date of the forecasted day.
    pub date: String,
    /// Point forecast.
    pub forecast: f64,
    /// Lower interval bound.
    pub lower: f64,
    /// Upper interval bound.
    pub upper: f64,
}

/// Serializes the request for `series`.
///
/// # Errors
///
/// Returns [`BridgeError::Protocol`] if the request cannot be encoded.
pub fn encode_request(series: &HistoricalSeries, horizon: usize) -> Result<Vec<u8>, BridgeError> {
    serde_json::to_vec(&BridgeRequest::from_series(series, horizon)).map_err(|e| {
        BridgeError::Protocol {
            message: format!("failed to encode request: {e}"),
        }
    })
}

/// Parses and validates a response.
///
/// The response must hold exactly `horizon` forecasts whose dates are the
/// consecutive days after the series' last observation.
///
/// # Errors
///
/// Returns [`BridgeError::Protocol`] if the output is not valid JSON of
/// the expected shape, has the wrong length, or carries unexpected dates.
pub fn decode_response(
    stdout: &[u8],
    series: &HistoricalSeries,
    horizon: usize,
) -> Result<Vec<ForecastPoint>, BridgeError> {
    let response: BridgeResponse =
        serde_json::from_slice(stdout).map_err(|e| BridgeError::Protocol {
            message: format!("failed to parse output: {e}"),
        })?;

    if response.forecasts.len() != horizon {
        return Err(BridgeError::Protocol {
            message: format!(
                "expected {horizon} forecasts, got {}",
                response.forecasts.len()
            ),
        });
    }

    response
        .forecasts
        .into_iter()
        .zip(series.future_dates(horizon))
        .map(|(row, expected)| {
            let date = parse_date(&row.date)?;
            if date != expected {
                return Err(BridgeError::Protocol {
                    message: format!("expected date {expected}, got {}", row.date),
                });
            }
            Ok(ForecastPoint::new(date, row.forecast, row.lower, row.upper))
        })
        .collect()
}

/// Accepts a plain date or a timestamp whose first ten characters are one.
fn parse_date(raw: &str) -> Result<NaiveDate, BridgeError> {
    raw.get(..10)
        .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
        .ok_or_else(|| BridgeError::Protocol {
            message: format!("invalid date '{raw}'"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::series;

    fn response_json(dates: &[&str]) -> String {
        let rows: Vec<String> = dates
            .iter()
            .map(|d| format!(r#"{{"date":"{d}","forecast":12.346,"lower":-1.0,"upper":20.0}}"#))
            .collect();
        format!(r#"{{"forecasts":[{}]}}"#, rows.join(","))
    }

    #[test]
    fn request_carries_dates_values_and_horizon() {
        let bytes = encode_request(&series(&[1.0, 2.5]), 7).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["dates"][0], "2023-01-01");
        assert_eq!(value["dates"][1], "2023-01-02");
        assert_eq!(value["values"][1], 2.5);
        assert_eq!(value["horizon"], 7);
    }

    #[test]
    fn decodes_rounds_and_clamps() {
        let history = series(&[1.0, 2.0]);
        let json = response_json(&["2023-01-03", "2023-01-04"]);
        let points = decode_response(json.as_bytes(), &history, 2).unwrap();
        assert_eq!(points.len(), 2);
        assert!((points[0].predicted_value - 12.35).abs() < 1e-9);
        assert!((points[0].lower_bound - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn accepts_timestamp_dates() {
        let history = series(&[1.0, 2.0]);
        let json = response_json(&["2023-01-03T00:00:00Z"]);
        assert!(decode_response(json.as_bytes(), &history, 1).is_ok());
    }

    #[test]
    fn rejects_wrong_length() {
        let history = series(&[1.0, 2.0]);
        let json = response_json(&["2023-01-03"]);
        let err = decode_response(json.as_bytes(), &history, 2).unwrap_err();
        assert!(matches!(err, BridgeError::Protocol { .. }));
    }

    #[test]
    fn rejects_misaligned_dates() {
        let history = series(&[1.0, 2.0]);
        let json = response_json(&["2023-01-04"]);
        let err = decode_response(json.as_bytes(), &history, 1).unwrap_err();
        assert!(matches!(err, BridgeError::Protocol { .. }));
    }

    #[test]
    fn rejects_garbage() {
        let history = series(&[1.0, 2.0]);
        for bad in ["not json", "{}", r#"{"forecasts":"nope"}"#, ""] {
            let err = decode_response(bad.as_bytes(), &history, 1).unwrap_err();
            assert!(matches!(err, BridgeError::Protocol { .. }), "{bad}");
        }
    }
}
