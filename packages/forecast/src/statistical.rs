//! Terminal fallback: exponential decay from the last observation toward
//! the historical mean.

use std::sync::Arc;

use vcom_forecast_models::{ForecastPoint, HistoricalSeries};

use crate::config::StatisticalConfig;
use crate::{ModelError, run_blocking};

const MODEL: &str = "statistical";

/// Deterministic forecaster that cannot fail on a non-empty series.
///
/// ```text
/// predicted_i = last * (1 - alpha)^i + mean * (1 - (1 - alpha)^i)
/// ```
///
/// The interval is a flat `predicted +/- z * std_dev` over the whole
/// horizon.
#[derive(Debug, Clone, Default)]
pub struct StatisticalFallbackModel {
    config: StatisticalConfig,
}

impl StatisticalFallbackModel {
    /// Creates the model with the given decay settings.
    #[must_use]
    pub const fn new(config: StatisticalConfig) -> Self {
        Self { config }
    }

    /// Forecasts `horizon` days past the last observation.
    #[must_use]
    pub fn fit_predict(&self, series: &HistoricalSeries, horizon: usize) -> Vec<ForecastPoint> {
        let last = series.last_value();
        let mean = series.mean();
        let half_width = self.config.interval_z * series.std_dev();
        let retain = 1.0 - self.config.alpha;

        let mut weight = 1.0;
        series
            .future_dates(horizon)
            .into_iter()
            .map(|date| {
                weight *= retain;
                let predicted = last.mul_add(weight, mean * (1.0 - weight));
                ForecastPoint::new(date, predicted, predicted - half_width, predicted + half_width)
            })
            .collect()
    }

    /// Runs [`Self::fit_predict`] on the blocking thread pool.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Task`] only if the blocking task itself is
    /// lost.
    pub async fn forecast(
        &self,
        series: Arc<HistoricalSeries>,
        horizon: usize,
    ) -> Result<Vec<ForecastPoint>, ModelError> {
        let model = self.clone();
        run_blocking(MODEL, move || Ok(model.fit_predict(&series, horizon))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::series;

    #[test]
    fn flat_series_forecasts_its_level() {
        let points = StatisticalFallbackModel::default().fit_predict(&series(&[50.0; 20]), 30);
        assert_eq!(points.len(), 30);
        for p in &points {
            assert!((p.predicted_value - 50.0).abs() < 0.01);
            assert!((p.lower_bound - 50.0).abs() < 0.01);
            assert!((p.upper_bound - 50.0).abs() < 0.01);
        }
    }

    #[test]
    fn decays_from_last_value_toward_mean() {
        // mean = 20, last = 40
        let history = series(&[10.0, 10.0, 20.0, 40.0]);
        let points = StatisticalFallbackModel::default().fit_predict(&history, 10);
        // 40 * 0.7 + 20 * 0.3
        assert!((points[0].predicted_value - 34.0).abs() < 1e-9);
        // 40 * 0.49 + 20 * 0.51
        assert!((points[1].predicted_value - 29.8).abs() < 1e-9);
        assert!(points.windows(2).all(|w| w[1].predicted_value <= w[0].predicted_value));
        assert!((points[9].predicted_value - 20.0).abs() < 1.0);
    }

    #[test]
    fn interval_is_flat_width() {
        let history = series(&[10.0, 30.0, 10.0, 30.0, 20.0]);
        let points = StatisticalFallbackModel::default().fit_predict(&history, 7);
        let width = |p: &ForecastPoint| p.upper_bound - p.lower_bound;
        for p in &points {
            assert!((width(p) - width(&points[0])).abs() < 0.02);
        }
    }

    #[test]
    fn lower_bound_clamps_at_zero() {
        let history = series(&[0.0, 100.0, 0.0, 100.0, 1.0]);
        let points = StatisticalFallbackModel::default().fit_predict(&history, 7);
        assert!(points.iter().all(|p| p.lower_bound >= 0.0));
        assert!((points[0].lower_bound - 0.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn forecast_runs_off_the_executor() {
        let points = StatisticalFallbackModel::default()
            .forecast(Arc::new(series(&[5.0; 12])), 14)
            .await
            .unwrap();
        assert_eq!(points.len(), 14);
    }
}
