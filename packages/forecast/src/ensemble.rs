//! Point-wise combination of two forecasts.

use vcom_forecast_models::ForecastPoint;

/// Combines two forecasts aligned by position.
///
/// The predicted value is the mean of the pair. The interval is the union
/// of both intervals, so disagreement between the models shows up as
/// extra width. When the inputs differ in length the output stops at the
/// shorter one. Dates come from `a`.
#[must_use]
pub fn combine(a: &[ForecastPoint], b: &[ForecastPoint]) -> Vec<ForecastPoint> {
    if a.len() != b.len() {
        log::debug!(
            "Ensemble inputs differ in length ({} vs {}), truncating",
            a.len(),
            b.len()
        );
    }

    a.iter()
        .zip(b)
        .map(|(x, y)| {
            ForecastPoint::new(
                x.date,
                f64::midpoint(x.predicted_value, y.predicted_value),
                x.lower_bound.min(y.lower_bound),
                x.upper_bound.max(y.upper_bound),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::Days;

    use super::*;
    use crate::test_support::start_date;

    fn constant(n: u64, predicted: f64, lower: f64, upper: f64) -> Vec<ForecastPoint> {
        (1..=n)
            .map(|i| ForecastPoint::new(start_date() + Days::new(i), predicted, lower, upper))
            .collect()
    }

    #[test]
    fn averages_and_widens() {
        let a = constant(5, 100.0, 80.0, 120.0);
        let b = constant(5, 90.0, 70.0, 110.0);
        let combined = combine(&a, &b);
        assert_eq!(combined.len(), 5);
        for (p, src) in combined.iter().zip(&a) {
            assert_eq!(p.date, src.date);
            assert!((p.predicted_value - 95.0).abs() < f64::EPSILON);
            assert!((p.lower_bound - 70.0).abs() < f64::EPSILON);
            assert!((p.upper_bound - 120.0).abs() < f64::EPSILON);
        }
    }

    #[test]
    fn truncates_to_shorter_input() {
        let combined = combine(&constant(7, 1.0, 0.0, 2.0), &constant(3, 3.0, 1.0, 4.0));
        assert_eq!(combined.len(), 3);
        assert!(combine(&[], &constant(3, 1.0, 0.0, 2.0)).is_empty());
    }

    #[test]
    fn rounds_the_mean() {
        let combined = combine(&constant(1, 1.0, 0.5, 3.0), &constant(1, 2.25, 0.5, 3.0));
        assert!((combined[0].predicted_value - 1.63).abs() < 1e-9);
    }
}
