//! In-process seasonal point-forecast model.
//!
//! An additive model of piecewise-linear trend plus yearly Fourier
//! seasonality, fitted as a penalized least-squares problem:
//!
//! ```text
//! y(t) = k*t + m + sum_j delta_j * max(0, t - c_j) + sum_k (a_k sin + b_k cos)(2 pi k d / 365.25)
//! ```
//!
//! The changepoint slopes `delta_j` carry a Gaussian prior with scale
//! `changepoint_prior_scale`, so small values give a stiff trend. Weekly
//! and daily seasonality are deliberately absent: the input is one
//! observation per day.

use std::f64::consts::PI;
use std::sync::Arc;

use vcom_forecast_models::{ForecastPoint, HistoricalSeries};

use crate::config::PrimaryConfig;
use crate::{ModelError, linalg, run_blocking};

const MODEL: &str = "seasonal";

/// Days in the yearly seasonal period.
const YEAR_DAYS: f64 = 365.25;

/// Floor on the scaled residual variance used to derive penalties.
const MIN_SCALED_VARIANCE: f64 = 1e-4;

/// Largest forecast magnitude accepted, in multiples of the history's
/// maximum.
const MAX_SCALED_FORECAST: f64 = 10.0;

/// Fits and forecasts the seasonal trend model.
#[derive(Debug, Clone, Default)]
pub struct PrimaryModelAdapter {
    config: PrimaryConfig,
}

impl PrimaryModelAdapter {
    /// Creates an adapter with the given settings.
    #[must_use]
    pub const fn new(config: PrimaryConfig) -> Self {
        Self { config }
    }

    /// The adapter's settings.
    #[must_use]
    pub const fn config(&self) -> &PrimaryConfig {
        &self.config
    }

    /// Fits the model and forecasts `horizon` days past the last
    /// observation.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError`] if the series is too short or the fit is
    /// numerically degenerate.
    pub fn fit_predict(
        &self,
        series: &HistoricalSeries,
        horizon: usize,
    ) -> Result<Vec<ForecastPoint>, ModelError> {
        let fitted = SeasonalFit::fit(&self.config, series)?;
        fitted.predict(series, horizon)
    }

    /// Runs [`Self::fit_predict`] on the blocking thread pool.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError`] if the fit fails or the task is cancelled.
    pub async fn forecast(
        &self,
        series: Arc<HistoricalSeries>,
        horizon: usize,
    ) -> Result<Vec<ForecastPoint>, ModelError> {
        let adapter = self.clone();
        run_blocking(MODEL, move || adapter.fit_predict(&series, horizon)).await
    }
}

/// A fitted seasonal model, in scaled units.
struct SeasonalFit {
    changepoints: Vec<f64>,
    fourier_order: usize,
    beta: Vec<f64>,
    /// Day span of the history; `t = days / span`.
    span_days: f64,
    y_scale: f64,
    sigma: f64,
    mean_abs_delta: f64,
    interval_z: f64,
    n_obs: usize,
}

impl SeasonalFit {
    fn fit(config: &PrimaryConfig, series: &HistoricalSeries) -> Result<Self, ModelError> {
        let n = series.len();
        if n < 3 {
            return Err(ModelError::InsufficientData { n, min: 3 });
        }

        let dates = series.dates();
        let first = dates[0];
        #[allow(clippy::cast_precision_loss)]
        let days: Vec<f64> = dates
            .iter()
            .map(|d| (*d - first).num_days() as f64)
            .collect();
        let span_days = days[n - 1];
        if span_days <= 0.0 {
            return Err(non_convergence("history spans zero days"));
        }
        let t: Vec<f64> = days.iter().map(|d| d / span_days).collect();

        let values = series.values();
        let max_value = values.iter().copied().fold(0.0_f64, f64::max);
        let y_scale = if max_value > 0.0 { max_value } else { 1.0 };
        let y: Vec<f64> = values.iter().map(|v| v / y_scale).collect();

        let changepoints = select_changepoints(&t, config.n_changepoints, config.changepoint_range);
        let fourier_order = effective_fourier_order(config.yearly_fourier_order, span_days);

        // Stage one: plain linear trend, to size the noise for the priors.
        let trend_rows: Vec<Vec<f64>> = t.iter().map(|&ti| vec![1.0, ti]).collect();
        let trend = linalg::ridge(&trend_rows, &y, &[0.0, 0.0])
            .ok_or_else(|| non_convergence("linear trend is singular"))?;
        let noise = residual_variance(&trend_rows, &y, &trend).max(MIN_SCALED_VARIANCE);

        // Stage two: full model with Gaussian priors expressed as ridge penalties.
        let rows: Vec<Vec<f64>> = t
            .iter()
            .zip(&days)
            .map(|(&ti, &di)| design_row(ti, di, &changepoints, fourier_order))
            .collect();
        let cp_penalty = noise / config.changepoint_prior_scale.powi(2);
        let season_penalty = noise / config.seasonality_prior_scale.powi(2);
        let mut penalty = vec![0.0, 0.0];
        penalty.extend(std::iter::repeat_n(cp_penalty, changepoints.len()));
        penalty.extend(std::iter::repeat_n(season_penalty, 2 * fourier_order));

        let beta = linalg::ridge(&rows, &y, &penalty)
            .ok_or_else(|| non_convergence("penalized normal equations are singular"))?;

        let sigma = residual_variance(&rows, &y, &beta).sqrt();
        if !sigma.is_finite() {
            return Err(non_convergence("residual variance is not finite"));
        }

        let deltas = &beta[2..2 + changepoints.len()];
        #[allow(clippy::cast_precision_loss)]
        let mean_abs_delta = if deltas.is_empty() {
            0.0
        } else {
            deltas.iter().map(|d| d.abs()).sum::<f64>() / deltas.len() as f64
        };

        log::debug!(
            "Seasonal fit: {n} obs, {} changepoints, {fourier_order} harmonics, sigma={sigma:.4} (scaled)",
            changepoints.len()
        );

        Ok(Self {
            changepoints,
            fourier_order,
            beta,
            span_days,
            y_scale,
            sigma,
            mean_abs_delta,
            interval_z: config.interval_z,
            n_obs: n,
        })
    }

    /// Forecasts `horizon` days after the series' last date.
    ///
    /// The interval combines observation noise with trend uncertainty
    /// that grows linearly past the end of the history.
    #[allow(clippy::cast_precision_loss)]
    fn predict(
        &self,
        series: &HistoricalSeries,
        horizon: usize,
    ) -> Result<Vec<ForecastPoint>, ModelError> {
        let mut points = Vec::with_capacity(horizon);

        for (step, date) in series.future_dates(horizon).into_iter().enumerate() {
            let h = (step + 1) as f64;
            let day = self.span_days + h;
            let t = day / self.span_days;
            let row = design_row(t, day, &self.changepoints, self.fourier_order);
            let yhat: f64 = row.iter().zip(&self.beta).map(|(x, b)| x * b).sum();

            let trend_sd = self.mean_abs_delta * (t - 1.0);
            let obs_sd = self.sigma * (1.0 + h / self.n_obs as f64).sqrt();
            let half_width = self.interval_z * (obs_sd + trend_sd);

            if !yhat.is_finite() || !half_width.is_finite() {
                return Err(non_convergence("forecast is not finite"));
            }
            if yhat.abs() > MAX_SCALED_FORECAST {
                return Err(non_convergence(&format!(
                    "forecast diverges to {:.1} on {date}",
                    yhat * self.y_scale
                )));
            }

            points.push(ForecastPoint::new(
                date,
                yhat * self.y_scale,
                (yhat - half_width) * self.y_scale,
                (yhat + half_width) * self.y_scale,
            ));
        }

        Ok(points)
    }
}

/// Places changepoints uniformly over the first `range` fraction of the
/// history, at observed time positions.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn select_changepoints(t: &[f64], requested: usize, range: f64) -> Vec<f64> {
    let hist_size = ((t.len() as f64) * range).floor() as usize;
    let count = requested.min(hist_size.saturating_sub(1));
    if count == 0 {
        return Vec::new();
    }

    (1..=count)
        .map(|i| {
            let idx = ((hist_size - 1) as f64 * i as f64 / count as f64).round() as usize;
            t[idx]
        })
        .collect()
}

/// Yearly harmonics the history can support: the requested order scaled
/// by the fraction of a year observed, so a few weeks of data fit no
/// seasonality at all.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn effective_fourier_order(requested: usize, span_days: f64) -> usize {
    let supported = (requested as f64 * span_days / YEAR_DAYS).floor();
    if supported <= 0.0 {
        0
    } else {
        (supported as usize).min(requested)
    }
}

/// One row of the design matrix: intercept, slope, changepoint hinges,
/// then sine/cosine pairs for each yearly harmonic.
fn design_row(t: f64, day: f64, changepoints: &[f64], fourier_order: usize) -> Vec<f64> {
    let mut row = Vec::with_capacity(2 + changepoints.len() + 2 * fourier_order);
    row.push(1.0);
    row.push(t);
    row.extend(changepoints.iter().map(|&c| (t - c).max(0.0)));
    for k in 1..=fourier_order {
        #[allow(clippy::cast_precision_loss)]
        let angle = 2.0 * PI * k as f64 * day / YEAR_DAYS;
        row.push(angle.sin());
        row.push(angle.cos());
    }
    row
}

#[allow(clippy::cast_precision_loss)]
fn residual_variance(rows: &[Vec<f64>], y: &[f64], beta: &[f64]) -> f64 {
    rows.iter()
        .zip(y)
        .map(|(row, target)| {
            let fitted: f64 = row.iter().zip(beta).map(|(x, b)| x * b).sum();
            (target - fitted).powi(2)
        })
        .sum::<f64>()
        / y.len() as f64
}

fn non_convergence(message: &str) -> ModelError {
    ModelError::NonConvergence {
        model: MODEL,
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{noise, seasonal_series, series};

    #[test]
    fn forecasts_requested_horizon_with_contiguous_dates() {
        let history = seasonal_series(365);
        let points = PrimaryModelAdapter::default()
            .fit_predict(&history, 30)
            .unwrap();
        assert_eq!(points.len(), 30);
        assert_eq!(points[0].date, history.last_date() + chrono::Days::new(1));
        for pair in points.windows(2) {
            assert_eq!(pair[1].date, pair[0].date + chrono::Days::new(1));
        }
    }

    #[test]
    fn outputs_are_non_negative_and_ordered() {
        let history = seasonal_series(200);
        let points = PrimaryModelAdapter::default()
            .fit_predict(&history, 60)
            .unwrap();
        for p in &points {
            assert!(p.lower_bound >= 0.0);
            assert!(p.predicted_value >= 0.0);
            assert!(p.lower_bound <= p.predicted_value);
            assert!(p.predicted_value <= p.upper_bound);
        }
    }

    #[test]
    fn tracks_a_linear_trend() {
        let values: Vec<f64> = (0..120).map(|i| 10.0 + 0.5 * f64::from(i)).collect();
        let history = series(&values);
        let points = PrimaryModelAdapter::default()
            .fit_predict(&history, 7)
            .unwrap();
        // Next value on the line is 70.0.
        assert!(
            (points[0].predicted_value - 70.0).abs() < 3.0,
            "got {}",
            points[0].predicted_value
        );
    }

    #[test]
    fn near_zero_series_clamps_to_zero() {
        let values: Vec<f64> = (0..60).map(|i| if i % 2 == 0 { 0.0 } else { 0.01 }).collect();
        let points = PrimaryModelAdapter::default()
            .fit_predict(&series(&values), 14)
            .unwrap();
        assert!(points.iter().all(|p| p.lower_bound >= 0.0));
    }

    #[test]
    fn too_short_series_is_an_error() {
        let err = PrimaryModelAdapter::default()
            .fit_predict(&series(&[1.0, 2.0]), 7)
            .unwrap_err();
        assert!(matches!(err, ModelError::InsufficientData { n: 2, min: 3 }));
    }

    #[test]
    fn changepoints_stay_within_range() {
        let t: Vec<f64> = (0..100).map(|i| f64::from(i) / 99.0).collect();
        let cps = select_changepoints(&t, 25, 0.8);
        assert_eq!(cps.len(), 25);
        assert!(cps.iter().all(|&c| c > 0.0 && c <= 0.8));
        assert!(select_changepoints(&t[..2], 25, 0.8).is_empty());
    }

    #[test]
    fn harmonics_scale_with_observed_span() {
        assert_eq!(effective_fourier_order(10, 9.0), 0);
        assert_eq!(effective_fourier_order(10, 24.0), 0);
        assert_eq!(effective_fourier_order(10, 89.0), 2);
        assert_eq!(effective_fourier_order(10, 364.0), 9);
        assert_eq!(effective_fourier_order(10, 3.0 * 365.0), 10);
        assert_eq!(effective_fourier_order(0, 1000.0), 0);
    }

    #[test]
    fn short_history_stays_near_observed_range() {
        let values: Vec<f64> = noise(25, 5).iter().map(|e| 30.0 + 20.0 * e).collect();
        let max_observed = values.iter().copied().fold(0.0, f64::max);
        match PrimaryModelAdapter::default().fit_predict(&series(&values), 365) {
            Ok(points) => {
                assert_eq!(points.len(), 365);
                assert!(points
                    .iter()
                    .all(|p| p.predicted_value <= MAX_SCALED_FORECAST * max_observed));
            }
            Err(e) => assert!(matches!(e, ModelError::NonConvergence { .. })),
        }
    }

    #[test]
    fn diverging_extrapolation_is_non_convergence() {
        let values: Vec<f64> = (1..=10).map(f64::from).collect();
        let history = series(&values);
        let adapter = PrimaryModelAdapter::default();
        assert_eq!(adapter.fit_predict(&history, 7).unwrap().len(), 7);
        let err = adapter.fit_predict(&history, 365).unwrap_err();
        assert!(matches!(err, ModelError::NonConvergence { .. }));
        assert!(err.to_string().contains("diverges"));
    }

    #[tokio::test]
    async fn forecast_runs_off_the_executor() {
        let history = Arc::new(seasonal_series(90));
        let points = PrimaryModelAdapter::default()
            .forecast(history, 10)
            .await
            .unwrap();
        assert_eq!(points.len(), 10);
    }
}
