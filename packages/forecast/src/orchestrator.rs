//! Entry point: request validation, history fetch, and the fallback
//! chain across model families.

use std::sync::Arc;

use vcom_forecast_models::{
    ForecastPoint, ForecastResult, HistoricalSeries, ModelKind, ModelLabel, ModelRequest,
    SeriesError,
};

use crate::bridge::SecondaryModelBridge;
use crate::config::ForecastConfig;
use crate::ensemble;
use crate::primary::PrimaryModelAdapter;
use crate::provider::HistoricalSeriesProvider;
use crate::statistical::StatisticalFallbackModel;
use crate::ForecastError;

/// Output of one link of the chain, or the cause of its failure.
type ChainOutcome = Result<(ModelLabel, Vec<ForecastPoint>), String>;

/// Selects a model family, runs the fallback chain, and labels the result
/// with the model that actually produced it.
///
/// Holds no per-request state, so one orchestrator can serve concurrent
/// requests.
#[derive(Clone)]
pub struct ModelOrchestrator {
    provider: Arc<dyn HistoricalSeriesProvider>,
    primary: PrimaryModelAdapter,
    secondary: SecondaryModelBridge,
    statistical: StatisticalFallbackModel,
    min_history_points: usize,
}

impl ModelOrchestrator {
    /// Builds every model from `config`.
    #[must_use]
    pub fn new(provider: Arc<dyn HistoricalSeriesProvider>, config: &ForecastConfig) -> Self {
        Self {
            provider,
            primary: PrimaryModelAdapter::new(config.primary.clone()),
            secondary: SecondaryModelBridge::from_config(config),
            statistical: StatisticalFallbackModel::new(config.statistical.clone()),
            min_history_points: config.min_history_points,
        }
    }

    /// Replaces the secondary model family.
    #[must_use]
    pub fn with_secondary(mut self, secondary: SecondaryModelBridge) -> Self {
        self.secondary = secondary;
        self
    }

    /// Replaces the primary model.
    #[must_use]
    pub fn with_primary(mut self, primary: PrimaryModelAdapter) -> Self {
        self.primary = primary;
        self
    }

    /// Forecasts `horizon_days` days for `region_id` with `model_kind`.
    ///
    /// The request is validated before any data is fetched. Model failures
    /// are absorbed by the fallback chain and show up only as a different
    /// [`ForecastResult::effective_model_label`].
    ///
    /// # Errors
    ///
    /// * [`ForecastError::InvalidModel`] / [`ForecastError::InvalidHorizon`]
    ///   for a bad request
    /// * [`ForecastError::RegionNotFound`] / [`ForecastError::NoData`] from
    ///   the provider
    /// * [`ForecastError::InvalidSeries`] if the history is malformed
    /// * [`ForecastError::InsufficientData`] if the history is shorter than
    ///   the configured minimum
    /// * [`ForecastError::ForecastUnavailable`] if every model failed
    pub async fn generate_forecast(
        &self,
        region_id: i64,
        horizon_days: i64,
        model_kind: &str,
    ) -> Result<ForecastResult, ForecastError> {
        let request = ModelRequest::parse(model_kind, horizon_days)?;
        let horizon = request.horizon();

        let region = self
            .provider
            .fetch(region_id)
            .await
            .map_err(|e| ForecastError::from_provider(region_id, e))?;

        let series = HistoricalSeries::new(region.points).map_err(|source| match source {
            SeriesError::Empty => ForecastError::NoData { region_id },
            source => ForecastError::InvalidSeries { region_id, source },
        })?;

        if series.len() < self.min_history_points {
            return Err(ForecastError::InsufficientData {
                region_id,
                observed: series.len(),
                required: self.min_history_points,
            });
        }

        log::debug!(
            "Region {region_id}: forecasting {horizon} days with {} from {} observations",
            request.model_kind,
            series.len()
        );

        let (label, points) = self
            .run_chain(region_id, request.model_kind, Arc::new(series), horizon)
            .await?;

        log::info!(
            "Region {region_id}: {horizon}-day forecast produced by {label} (requested {})",
            request.model_kind
        );

        Ok(ForecastResult {
            region_id,
            region_name: region.region_name,
            effective_model_label: label,
            horizon_days: request.horizon_days,
            points,
        })
    }

    async fn run_chain(
        &self,
        region_id: i64,
        kind: ModelKind,
        series: Arc<HistoricalSeries>,
        horizon: usize,
    ) -> Result<(ModelLabel, Vec<ForecastPoint>), ForecastError> {
        let outcome: ChainOutcome = match kind {
            ModelKind::Primary => self
                .primary
                .forecast(Arc::clone(&series), horizon)
                .await
                .map(|points| (ModelLabel::Primary, points))
                .map_err(|e| e.to_string()),
            ModelKind::Secondary => self
                .secondary
                .forecast(Arc::clone(&series), horizon)
                .await
                .map(|points| (ModelLabel::Secondary, points))
                .map_err(|e| e.to_string()),
            ModelKind::Hybrid => self.run_hybrid(region_id, &series, horizon).await,
        };

        let cause = match outcome {
            Ok(result) => return Ok(result),
            Err(cause) => cause,
        };

        log::warn!(
            "Region {region_id}: {kind} forecast failed ({cause}), falling back to {}",
            ModelLabel::Statistical
        );

        let points = self
            .statistical
            .forecast(series, horizon)
            .await
            .map_err(|e| {
                log::error!("Region {region_id}: statistical fallback failed: {e}");
                ForecastError::ForecastUnavailable {
                    region_id,
                    message: format!("{cause}; statistical fallback: {e}"),
                }
            })?;

        Ok((ModelLabel::Statistical, points))
    }

    /// Runs both branches concurrently. A failed branch never cancels the
    /// other.
    async fn run_hybrid(
        &self,
        region_id: i64,
        series: &Arc<HistoricalSeries>,
        horizon: usize,
    ) -> ChainOutcome {
        let (primary, secondary) = tokio::join!(
            self.primary.forecast(Arc::clone(series), horizon),
            self.secondary.forecast(Arc::clone(series), horizon),
        );

        match (primary, secondary) {
            (Ok(a), Ok(b)) => Ok((ModelLabel::Hybrid, ensemble::combine(&a, &b))),
            (Ok(a), Err(e)) => {
                log::warn!(
                    "Region {region_id}: hybrid secondary branch failed ({e}), using {} only",
                    ModelLabel::Primary
                );
                Ok((ModelLabel::Primary, a))
            }
            (Err(e), Ok(b)) => {
                log::warn!(
                    "Region {region_id}: hybrid primary branch failed ({e}), using {} only",
                    ModelLabel::Secondary
                );
                Ok((ModelLabel::Secondary, b))
            }
            (Err(pe), Err(se)) => Err(format!("primary: {pe}; secondary: {se}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Days;
    use vcom_forecast_models::TimeSeriesPoint;

    use super::*;
    use crate::arima::InProcessArima;
    use crate::bridge::{BridgeError, ForecastBackend};
    use crate::config::ArimaConfig;
    use crate::provider::{InMemorySeriesProvider, ProviderError, RegionSeries};
    use crate::test_support::{seasonal_series, series, start_date};

    const REGION: i64 = 7;

    struct RecordingProvider {
        inner: InMemorySeriesProvider,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl HistoricalSeriesProvider for RecordingProvider {
        async fn fetch(&self, region_id: i64) -> Result<RegionSeries, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.fetch(region_id).await
        }
    }

    /// Always fails, so the secondary family falls through to its
    /// in-process fit.
    struct FailingBackend;

    #[async_trait::async_trait]
    impl ForecastBackend for FailingBackend {
        fn name(&self) -> &str {
            "failing"
        }

        async fn forecast(
            &self,
            _: &HistoricalSeries,
            _: usize,
        ) -> Result<Vec<ForecastPoint>, BridgeError> {
            Err(BridgeError::Unavailable {
                program: "failing".to_string(),
                message: "not installed".to_string(),
            })
        }
    }

    /// Returns a constant forecast.
    struct FixedBackend(f64);

    #[async_trait::async_trait]
    impl ForecastBackend for FixedBackend {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn forecast(
            &self,
            series: &HistoricalSeries,
            horizon: usize,
        ) -> Result<Vec<ForecastPoint>, BridgeError> {
            Ok(series
                .future_dates(horizon)
                .into_iter()
                .map(|d| ForecastPoint::new(d, self.0, self.0 - 1.0, self.0 + 1.0))
                .collect())
        }
    }

    fn provider_with(values: &HistoricalSeries) -> Arc<RecordingProvider> {
        Arc::new(RecordingProvider {
            inner: InMemorySeriesProvider::new().with_region(
                REGION,
                "Kisumu",
                values.points().to_vec(),
            ),
            calls: AtomicUsize::new(0),
        })
    }

    fn orchestrator(provider: Arc<RecordingProvider>, config: &ForecastConfig) -> ModelOrchestrator {
        ModelOrchestrator::new(provider, config).with_secondary(SecondaryModelBridge::new(
            Arc::new(FailingBackend),
            InProcessArima::new(config.arima.clone()),
        ))
    }

    /// An ARIMA configuration no realistic test series can satisfy.
    fn impossible_arima() -> SecondaryModelBridge {
        let config = ArimaConfig {
            order: [50, 2, 50],
            fallback_order: [50, 2, 50],
            ..ArimaConfig::default()
        };
        SecondaryModelBridge::new(Arc::new(FailingBackend), InProcessArima::new(config))
    }

    #[tokio::test]
    async fn bogus_model_fails_before_any_fetch() {
        let provider = provider_with(&seasonal_series(60));
        let orch = orchestrator(Arc::clone(&provider), &ForecastConfig::default());
        let err = orch.generate_forecast(REGION, 30, "bogus").await.unwrap_err();
        assert!(matches!(err, ForecastError::InvalidModel { ref value } if value == "bogus"));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn bad_horizon_fails_before_any_fetch() {
        let provider = provider_with(&seasonal_series(60));
        let orch = orchestrator(Arc::clone(&provider), &ForecastConfig::default());
        for horizon in [0, 6, 366, -30] {
            let err = orch
                .generate_forecast(REGION, horizon, "primary")
                .await
                .unwrap_err();
            assert!(matches!(err, ForecastError::InvalidHorizon { horizon: h } if h == horizon));
        }
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn short_history_is_insufficient() {
        let provider = provider_with(&series(&[1.0, 2.0, 3.0, 4.0, 5.0]));
        let orch = orchestrator(provider, &ForecastConfig::default());
        let err = orch.generate_forecast(REGION, 30, "primary").await.unwrap_err();
        assert!(matches!(
            err,
            ForecastError::InsufficientData {
                region_id: REGION,
                observed: 5,
                required: 10,
            }
        ));
        assert!(err.to_string().contains("5 points"));
    }

    #[tokio::test]
    async fn unknown_region_is_not_found() {
        let provider = provider_with(&seasonal_series(60));
        let orch = orchestrator(provider, &ForecastConfig::default());
        let err = orch.generate_forecast(99, 30, "primary").await.unwrap_err();
        assert!(matches!(err, ForecastError::RegionNotFound { region_id: 99 }));
    }

    #[tokio::test]
    async fn empty_region_is_no_data() {
        let provider = Arc::new(RecordingProvider {
            inner: InMemorySeriesProvider::new().with_region(REGION, "Empty", vec![]),
            calls: AtomicUsize::new(0),
        });
        let orch = orchestrator(provider, &ForecastConfig::default());
        let err = orch.generate_forecast(REGION, 30, "primary").await.unwrap_err();
        assert!(matches!(err, ForecastError::NoData { region_id: REGION }));
    }

    #[tokio::test]
    async fn duplicate_dates_are_invalid_series() {
        let mut points: Vec<TimeSeriesPoint> = seasonal_series(20).points().to_vec();
        points.push(points[19]);
        let provider = Arc::new(RecordingProvider {
            inner: InMemorySeriesProvider::new().with_region(REGION, "Dup", points),
            calls: AtomicUsize::new(0),
        });
        let orch = orchestrator(provider, &ForecastConfig::default());
        let err = orch.generate_forecast(REGION, 30, "primary").await.unwrap_err();
        assert!(matches!(err, ForecastError::InvalidSeries { region_id: REGION, .. }));
    }

    #[tokio::test]
    async fn every_kind_yields_contiguous_non_negative_points() {
        let history = seasonal_series(150);
        let last = history.last_date();
        let orch = orchestrator(provider_with(&history), &ForecastConfig::default());

        for kind in ["primary", "secondary", "hybrid", "prophet", "ARIMA"] {
            let result = orch.generate_forecast(REGION, 45, kind).await.unwrap();
            assert_eq!(result.horizon_days, 45);
            assert_eq!(result.points.len(), 45, "{kind}");
            assert_eq!(result.region_name, "Kisumu");
            for (i, p) in result.points.iter().enumerate() {
                assert_eq!(p.date, last + Days::new(i as u64 + 1), "{kind}");
                assert!(p.predicted_value >= 0.0);
                assert!(p.lower_bound >= 0.0);
                assert!(p.upper_bound >= 0.0);
            }
        }
    }

    #[tokio::test]
    async fn secondary_self_heals_without_relabel() {
        let orch = orchestrator(provider_with(&seasonal_series(150)), &ForecastConfig::default());
        let result = orch.generate_forecast(REGION, 14, "secondary").await.unwrap();
        assert_eq!(result.effective_model_label, ModelLabel::Secondary);
    }

    #[tokio::test]
    async fn secondary_at_minimum_history_stays_secondary() {
        let config = ForecastConfig::default();
        let history = seasonal_series(config.min_history_points);
        let orch = orchestrator(provider_with(&history), &config);
        let result = orch.generate_forecast(REGION, 14, "secondary").await.unwrap();
        assert_eq!(result.points.len(), 14);
        assert_eq!(result.effective_model_label, ModelLabel::Secondary);
    }

    #[tokio::test]
    async fn hybrid_with_exhausted_secondary_uses_primary_only() {
        let history = seasonal_series(150);
        let orch = orchestrator(provider_with(&history), &ForecastConfig::default())
            .with_secondary(impossible_arima());

        let result = orch.generate_forecast(REGION, 30, "hybrid").await.unwrap();
        assert_eq!(result.effective_model_label, ModelLabel::Primary);

        let primary_only = PrimaryModelAdapter::default().fit_predict(&history, 30).unwrap();
        assert_eq!(result.points, primary_only);
    }

    #[tokio::test]
    async fn hybrid_with_both_branches_combines() {
        let history = seasonal_series(150);
        let orch = orchestrator(provider_with(&history), &ForecastConfig::default())
            .with_secondary(SecondaryModelBridge::new(
                Arc::new(FixedBackend(500.0)),
                InProcessArima::default(),
            ));

        let result = orch.generate_forecast(REGION, 10, "hybrid").await.unwrap();
        assert_eq!(result.effective_model_label, ModelLabel::Hybrid);

        let primary_only = PrimaryModelAdapter::default().fit_predict(&history, 10).unwrap();
        for (p, a) in result.points.iter().zip(&primary_only) {
            let expected = vcom_forecast_models::round2(f64::midpoint(a.predicted_value, 500.0));
            assert!((p.predicted_value - expected).abs() < 1e-9);
            assert!((p.upper_bound - 501.0).abs() < f64::EPSILON);
            assert!((p.lower_bound - a.lower_bound).abs() < f64::EPSILON);
        }
    }

    #[tokio::test]
    async fn hybrid_with_failed_primary_uses_secondary() {
        let history = seasonal_series(150);
        let broken_primary = PrimaryModelAdapter::new(crate::config::PrimaryConfig {
            changepoint_prior_scale: f64::NAN,
            ..crate::config::PrimaryConfig::default()
        });
        let orch = orchestrator(provider_with(&history), &ForecastConfig::default())
            .with_primary(broken_primary)
            .with_secondary(SecondaryModelBridge::new(
                Arc::new(FixedBackend(12.0)),
                InProcessArima::default(),
            ));

        let result = orch.generate_forecast(REGION, 10, "hybrid").await.unwrap();
        assert_eq!(result.effective_model_label, ModelLabel::Secondary);
        assert!(result.points.iter().all(|p| (p.predicted_value - 12.0).abs() < f64::EPSILON));
    }

    #[tokio::test]
    async fn primary_failure_falls_back_to_statistical() {
        let config = ForecastConfig {
            min_history_points: 2,
            ..ForecastConfig::default()
        };
        let orch = orchestrator(provider_with(&series(&[50.0, 50.0])), &config);
        let result = orch.generate_forecast(REGION, 7, "primary").await.unwrap();
        assert_eq!(result.effective_model_label, ModelLabel::Statistical);
        assert_eq!(result.points.len(), 7);
        assert!(result
            .points
            .iter()
            .all(|p| (p.predicted_value - 50.0).abs() < 0.01));
    }

    #[tokio::test]
    async fn exhausted_secondary_falls_back_to_statistical() {
        let orch = orchestrator(provider_with(&seasonal_series(60)), &ForecastConfig::default())
            .with_secondary(impossible_arima());
        let result = orch.generate_forecast(REGION, 7, "secondary").await.unwrap();
        assert_eq!(result.effective_model_label, ModelLabel::Statistical);
    }

    #[tokio::test]
    async fn hybrid_with_both_failed_is_statistical() {
        let config = ForecastConfig {
            min_history_points: 2,
            ..ForecastConfig::default()
        };
        let orch = orchestrator(provider_with(&series(&[10.0, 12.0])), &config);
        let result = orch.generate_forecast(REGION, 7, "hybrid").await.unwrap();
        assert_eq!(result.effective_model_label, ModelLabel::Statistical);
    }

    #[tokio::test]
    async fn result_serializes_with_effective_label() {
        let orch = orchestrator(provider_with(&seasonal_series(60)), &ForecastConfig::default());
        let result = orch.generate_forecast(REGION, 7, "prophet").await.unwrap();
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["effectiveModelLabel"], "primary");
        assert_eq!(json["regionId"], REGION);
        assert_eq!(json["points"].as_array().unwrap().len(), 7);
        assert_eq!(
            json["points"][0]["date"],
            (start_date() + Days::new(60)).to_string()
        );
    }

    #[tokio::test]
    async fn concurrent_requests_do_not_interfere() {
        let orch = orchestrator(provider_with(&seasonal_series(120)), &ForecastConfig::default());
        let (a, b, c) = tokio::join!(
            orch.generate_forecast(REGION, 7, "primary"),
            orch.generate_forecast(REGION, 14, "secondary"),
            orch.generate_forecast(REGION, 21, "hybrid"),
        );
        assert_eq!(a.unwrap().points.len(), 7);
        assert_eq!(b.unwrap().points.len(), 14);
        assert_eq!(c.unwrap().points.len(), 21);
    }
}
