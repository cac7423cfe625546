//! In-process ARIMA fallback for the secondary model family.
//!
//! Fitting follows Hannan-Rissanen:
//!
//! 1. Difference the series `d` times and center it.
//! 2. Fit a long autoregression by Levinson-Durbin and keep its residuals
//!    as estimates of the innovations.
//! 3. Regress the centered series on its own `p` lags and the `q` lagged
//!    innovation estimates.
//!
//! Coefficients outside the stationary (AR) or invertible (MA) region are
//! shrunk geometrically until they are inside it; a fit that still cannot
//! be brought inside is rejected as non-convergent. [`InProcessArima`]
//! tries the configured order and degrades to the fallback order before
//! giving up.

use std::sync::Arc;

use vcom_forecast_models::{ForecastPoint, HistoricalSeries};

use crate::config::ArimaConfig;
use crate::{ModelError, linalg, run_blocking};

const MODEL: &str = "arima";

/// Autocovariances below this are treated as a constant series.
const MIN_VARIANCE: f64 = 1e-12;

/// Per-lag shrink factor applied to an unstable polynomial.
const SHRINK: f64 = 0.95;

/// Shrink rounds before an unstable polynomial is rejected.
const MAX_SHRINK_ROUNDS: usize = 200;

/// A `(p, d, q)` model order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArimaOrder {
    /// Autoregressive order.
    pub p: usize,
    /// Differencing order.
    pub d: usize,
    /// Moving-average order.
    pub q: usize,
}

impl ArimaOrder {
    /// Creates an order.
    #[must_use]
    pub const fn new(p: usize, d: usize, q: usize) -> Self {
        Self { p, d, q }
    }

    /// Length of the long autoregression used to estimate innovations.
    const fn long_ar_order(self) -> usize {
        if self.q == 0 { 0 } else { self.p + self.q + 2 }
    }

    /// Minimum number of observations this order can be fitted on: enough
    /// that the ARMA regression keeps one more row than it has regressors
    /// once differencing and the long autoregression have consumed theirs.
    #[must_use]
    pub const fn min_observations(self) -> usize {
        let warmup = if self.p > self.q { self.p } else { self.q };
        self.d + self.long_ar_order() + warmup + self.p + self.q + 1
    }
}

impl From<[usize; 3]> for ArimaOrder {
    fn from([p, d, q]: [usize; 3]) -> Self {
        Self::new(p, d, q)
    }
}

impl std::fmt::Display for ArimaOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{},{})", self.p, self.d, self.q)
    }
}

/// A fitted ARIMA model.
#[derive(Debug, Clone)]
pub struct FittedArima {
    order: ArimaOrder,
    ar: Vec<f64>,
    ma: Vec<f64>,
    /// Mean of the differenced series (drift when `d > 0`).
    mean: f64,
    sigma2: f64,
    /// Last value at each differencing level `0..d`.
    level_tails: Vec<f64>,
    /// Centered differenced series.
    centered: Vec<f64>,
    residuals: Vec<f64>,
}

impl FittedArima {
    /// Fits `order` to `values`.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InsufficientData`] when the series is too
    /// short for the order, or [`ModelError::NonConvergence`] when the fit
    /// is singular, non-stationary, or non-invertible.
    pub fn fit(values: &[f64], order: ArimaOrder) -> Result<Self, ModelError> {
        let min = order.min_observations();
        if values.len() < min {
            return Err(ModelError::InsufficientData {
                n: values.len(),
                min,
            });
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(non_convergence(order, "series contains non-finite values"));
        }

        let mut level_tails = Vec::with_capacity(order.d);
        let mut diffed = values.to_vec();
        for _ in 0..order.d {
            level_tails.push(diffed[diffed.len() - 1]);
            diffed = difference(&diffed);
        }

        #[allow(clippy::cast_precision_loss)]
        let mean = diffed.iter().sum::<f64>() / diffed.len() as f64;
        let centered: Vec<f64> = diffed.iter().map(|w| w - mean).collect();

        let (ar, ma) = if autocovariance(&centered, 0) < MIN_VARIANCE {
            (vec![0.0; order.p], vec![0.0; order.q])
        } else {
            estimate_coefficients(&centered, order)?
        };

        let ar = shrink_to_stable(ar)
            .ok_or_else(|| non_convergence(order, "AR polynomial is non-stationary"))?;
        let neg_ma: Vec<f64> = ma.iter().map(|t| -t).collect();
        let ma: Vec<f64> = shrink_to_stable(neg_ma)
            .ok_or_else(|| non_convergence(order, "MA polynomial is non-invertible"))?
            .into_iter()
            .map(|t| -t)
            .collect();

        let residuals = arma_residuals(&centered, &ar, &ma);
        let warmup = order.p.max(order.q);
        let tail = &residuals[warmup.min(residuals.len())..];
        #[allow(clippy::cast_precision_loss)]
        let sigma2 = if tail.is_empty() {
            0.0
        } else {
            tail.iter().map(|e| e * e).sum::<f64>() / tail.len() as f64
        };
        if !sigma2.is_finite() {
            return Err(non_convergence(order, "innovation variance is not finite"));
        }

        Ok(Self {
            order,
            ar,
            ma,
            mean,
            sigma2,
            level_tails,
            centered,
            residuals,
        })
    }

    /// The fitted order.
    #[must_use]
    pub const fn order(&self) -> ArimaOrder {
        self.order
    }

    /// Fitted AR coefficients.
    #[must_use]
    pub fn ar_coefficients(&self) -> &[f64] {
        &self.ar
    }

    /// Fitted MA coefficients.
    #[must_use]
    pub fn ma_coefficients(&self) -> &[f64] {
        &self.ma
    }

    /// Forecasts `steps` values as `(mean, lower, upper)` with a symmetric
    /// interval of `z` standard errors.
    #[must_use]
    pub fn forecast(&self, steps: usize, z: f64) -> Vec<(f64, f64, f64)> {
        let mut centered = self.centered.clone();
        let mut residuals = self.residuals.clone();
        let mut tails = self.level_tails.clone();
        let psi = integrated_psi_weights(&self.ar, &self.ma, self.order.d, steps);

        let mut out = Vec::with_capacity(steps);
        let mut cumulative_var = 0.0;

        for (h, psi_h) in psi.iter().enumerate().take(steps) {
            let ar_part: f64 = self
                .ar
                .iter()
                .enumerate()
                .map(|(i, phi)| phi * centered[centered.len() - 1 - i])
                .sum();
            let ma_part: f64 = self
                .ma
                .iter()
                .enumerate()
                .filter(|(j, _)| *j < residuals.len())
                .map(|(j, theta)| theta * residuals[residuals.len() - 1 - j])
                .sum();
            let next_centered = ar_part + ma_part;
            centered.push(next_centered);
            residuals.push(0.0);

            let mut value = next_centered + self.mean;
            for tail in tails.iter_mut().rev() {
                value += *tail;
                *tail = value;
            }

            cumulative_var += self.sigma2 * psi_h * psi_h;
            let half_width = z * cumulative_var.sqrt();
            log::trace!("arima step {}: {value:.4} +/- {half_width:.4}", h + 1);
            out.push((value, value - half_width, value + half_width));
        }

        out
    }
}

/// Fits the configured ARIMA order in-process, degrading to the fallback
/// order when the preferred one fails.
#[derive(Debug, Clone, Default)]
pub struct InProcessArima {
    config: ArimaConfig,
}

impl InProcessArima {
    /// Creates the fallback with the given settings.
    #[must_use]
    pub const fn new(config: ArimaConfig) -> Self {
        Self { config }
    }

    /// Fits and forecasts `horizon` days past the last observation.
    ///
    /// # Errors
    ///
    /// Returns the fallback order's [`ModelError`] when both orders fail.
    pub fn fit_predict(
        &self,
        series: &HistoricalSeries,
        horizon: usize,
    ) -> Result<Vec<ForecastPoint>, ModelError> {
        let values = series.values();
        let preferred = ArimaOrder::from(self.config.order);
        let fallback = ArimaOrder::from(self.config.fallback_order);

        let fitted = match FittedArima::fit(&values, preferred) {
            Ok(fitted) => fitted,
            Err(e) => {
                log::warn!("ARIMA{preferred} failed ({e}), retrying with ARIMA{fallback}");
                FittedArima::fit(&values, fallback)?
            }
        };

        log::debug!(
            "ARIMA{} fitted: ar={:?} ma={:?}",
            fitted.order(),
            fitted.ar_coefficients(),
            fitted.ma_coefficients()
        );

        Ok(series
            .future_dates(horizon)
            .into_iter()
            .zip(fitted.forecast(horizon, self.config.interval_z))
            .map(|(date, (mean, lower, upper))| ForecastPoint::new(date, mean, lower, upper))
            .collect())
    }

    /// Runs [`Self::fit_predict`] on the blocking thread pool.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError`] if both orders fail or the task is cancelled.
    pub async fn forecast(
        &self,
        series: Arc<HistoricalSeries>,
        horizon: usize,
    ) -> Result<Vec<ForecastPoint>, ModelError> {
        let model = self.clone();
        run_blocking(MODEL, move || model.fit_predict(&series, horizon)).await
    }
}

fn difference(values: &[f64]) -> Vec<f64> {
    values.windows(2).map(|w| w[1] - w[0]).collect()
}

#[allow(clippy::cast_precision_loss)]
fn autocovariance(centered: &[f64], lag: usize) -> f64 {
    let n = centered.len();
    if lag >= n {
        return 0.0;
    }
    centered[lag..]
        .iter()
        .zip(centered)
        .map(|(a, b)| a * b)
        .sum::<f64>()
        / n as f64
}

/// Yule-Walker AR coefficients by Levinson-Durbin recursion.
fn levinson_durbin(centered: &[f64], order: usize) -> Option<Vec<f64>> {
    let gamma: Vec<f64> = (0..=order).map(|k| autocovariance(centered, k)).collect();
    let mut phi: Vec<f64> = Vec::with_capacity(order);
    let mut error = gamma[0];

    for k in 0..order {
        if error.abs() < MIN_VARIANCE {
            return None;
        }
        let acc: f64 = phi
            .iter()
            .enumerate()
            .map(|(j, p)| p * gamma[k - j])
            .sum();
        let kappa = (gamma[k + 1] - acc) / error;
        let previous = phi.clone();
        for j in 0..k {
            phi[j] = previous[j] - kappa * previous[k - 1 - j];
        }
        phi.push(kappa);
        error *= 1.0 - kappa * kappa;
    }

    Some(phi)
}

/// Hannan-Rissanen estimation of the ARMA coefficients.
fn estimate_coefficients(
    centered: &[f64],
    order: ArimaOrder,
) -> Result<(Vec<f64>, Vec<f64>), ModelError> {
    let (p, q) = (order.p, order.q);
    if p + q == 0 {
        return Ok((Vec::new(), Vec::new()));
    }

    let long = order.long_ar_order();
    let innovations = if q == 0 {
        vec![0.0; centered.len()]
    } else {
        let long_ar = levinson_durbin(centered, long)
            .ok_or_else(|| non_convergence(order, "long autoregression is singular"))?;
        arma_residuals(centered, &long_ar, &[])
    };

    let start = long + q.max(p);
    let mut rows = Vec::with_capacity(centered.len().saturating_sub(start));
    let mut targets = Vec::with_capacity(rows.capacity());
    for t in start..centered.len() {
        let mut row = Vec::with_capacity(p + q);
        row.extend((1..=p).map(|i| centered[t - i]));
        row.extend((1..=q).map(|j| innovations[t - j]));
        rows.push(row);
        targets.push(centered[t]);
    }
    if rows.len() < p + q + 1 {
        return Err(ModelError::InsufficientData {
            n: rows.len(),
            min: p + q + 1,
        });
    }

    let beta = linalg::ridge(&rows, &targets, &vec![0.0; p + q])
        .ok_or_else(|| non_convergence(order, "ARMA regression is singular"))?;
    let ma = beta[p..].to_vec();
    let mut ar = beta;
    ar.truncate(p);
    Ok((ar, ma))
}

/// One-step-ahead residuals of an ARMA model, with pre-sample values
/// taken as zero.
fn arma_residuals(centered: &[f64], ar: &[f64], ma: &[f64]) -> Vec<f64> {
    let mut residuals = vec![0.0; centered.len()];
    for t in 0..centered.len() {
        let ar_part: f64 = ar
            .iter()
            .enumerate()
            .filter(|(i, _)| *i < t)
            .map(|(i, phi)| phi * centered[t - 1 - i])
            .sum();
        let ma_part: f64 = ma
            .iter()
            .enumerate()
            .filter(|(j, _)| *j < t)
            .map(|(j, theta)| theta * residuals[t - 1 - j])
            .sum();
        residuals[t] = centered[t] - ar_part - ma_part;
    }
    residuals
}

/// Psi weights of the ARIMA process, integrated `d` times.
fn integrated_psi_weights(ar: &[f64], ma: &[f64], d: usize, steps: usize) -> Vec<f64> {
    let mut psi = vec![0.0; steps];
    for j in 0..steps {
        psi[j] = if j == 0 {
            1.0
        } else {
            let theta = ma.get(j - 1).copied().unwrap_or(0.0);
            let ar_part: f64 = ar
                .iter()
                .enumerate()
                .filter(|(i, _)| *i < j)
                .map(|(i, phi)| phi * psi[j - 1 - i])
                .sum();
            theta + ar_part
        };
    }
    for _ in 0..d {
        let mut running = 0.0;
        for weight in &mut psi {
            running += *weight;
            *weight = running;
        }
    }
    psi
}

/// Whether `1 - sum(phi_i z^i)` has all roots outside the unit circle,
/// checked by stepping the Levinson recursion down.
fn is_stable(phi: &[f64]) -> bool {
    let mut a = phi.to_vec();
    while let Some(&kappa) = a.last() {
        if !kappa.is_finite() || kappa.abs() >= 1.0 {
            return false;
        }
        let m = a.len() - 1;
        let denom = kappa.mul_add(-kappa, 1.0);
        a = (0..m).map(|i| kappa.mul_add(a[m - 1 - i], a[i]) / denom).collect();
    }
    true
}

/// Scales lag `i` by `SHRINK^i` until the polynomial is stable, which
/// pushes every root outward. `None` if it never gets there.
fn shrink_to_stable(mut phi: Vec<f64>) -> Option<Vec<f64>> {
    for round in 0..MAX_SHRINK_ROUNDS {
        if is_stable(&phi) {
            if round > 0 {
                log::debug!("Shrunk polynomial into the stable region after {round} rounds");
            }
            return Some(phi);
        }
        if phi.iter().any(|c| !c.is_finite()) {
            return None;
        }
        let mut factor = 1.0;
        for c in &mut phi {
            factor *= SHRINK;
            *c *= factor;
        }
    }
    None
}

fn non_convergence(order: ArimaOrder, message: &str) -> ModelError {
    ModelError::NonConvergence {
        model: MODEL,
        message: format!("ARIMA{order}: {message}"),
    }
}
