use chrono::{DateTime, Utc};

use crate::config::TrendConfig;
use crate::models::{Trend, TrendPoint, TrendReport, TrendSegment};

const SECONDS_PER_DAY: f64 = 86_400.0;

fn days_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_seconds() as f64 / SECONDS_PER_DAY
}

/// Least-squares slope of `value` against elapsed days. Zero when every point
/// shares a timestamp.
pub fn slope_per_day(points: &[TrendPoint]) -> f64 {
    let Some(first) = points.first() else {
        return 0.0;
    };
    let n = points.len() as f64;
    let xs: Vec<f64> = points
        .iter()
        .map(|p| days_between(first.timestamp, p.timestamp))
        .collect();
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.value).sum::<f64>() / n;

    let mut sxy = 0.0;
    let mut sxx = 0.0;
    for (x, p) in xs.iter().zip(points) {
        sxy += (x - mean_x) * (p.value - mean_y);
        sxx += (x - mean_x).powi(2);
    }
    if sxx == 0.0 {
        0.0
    } else {
        sxy / sxx
    }
}

pub fn classify(rate: f64, significance: f64) -> Trend {
    if rate > significance {
        Trend::Improving
    } else if rate < -significance {
        Trend::Declining
    } else {
        Trend::Steady
    }
}

/// Relative change from one point to the next. Falls back to the absolute
/// delta when the previous value is zero.
fn local_rate(previous: f64, current: f64) -> f64 {
    if previous == 0.0 {
        current - previous
    } else {
        (current - previous) / previous.abs()
    }
}

/// Splits the series wherever a single step moves more than `significance`.
pub fn segments(points: &[TrendPoint], significance: f64) -> Vec<TrendSegment> {
    if points.len() < 2 {
        return Vec::new();
    }
    let close = |from: usize, to: usize| TrendSegment {
        start: points[from].timestamp,
        end: points[to].timestamp,
        net_change: points[to].value - points[from].value,
        points: to - from + 1,
    };

    let mut out = Vec::new();
    let mut start = 0;
    for i in 1..points.len() {
        let rate = local_rate(points[i - 1].value, points[i].value);
        if rate.abs() > significance && i - 1 > start {
            out.push(close(start, i - 1));
            start = i - 1;
        }
    }
    out.push(close(start, points.len() - 1));
    out
}

fn sign_consistency(points: &[TrendPoint]) -> f64 {
    let signs: Vec<f64> = points
        .windows(2)
        .map(|w| w[1].value - w[0].value)
        .filter(|d| *d != 0.0)
        .map(f64::signum)
        .collect();
    let flips = signs.windows(2).filter(|w| w[0] != w[1]).count();
    0.8_f64.powi(flips as i32)
}

#[derive(Debug, Clone, Default)]
pub struct TrendAnalyzer {
    config: TrendConfig,
}

impl TrendAnalyzer {
    pub fn new(config: TrendConfig) -> Self {
        Self { config }
    }

    pub fn analyze(&self, series: &[TrendPoint]) -> TrendReport {
        if series.len() < self.config.min_samples.max(2) {
            return TrendReport::insufficient();
        }
        let mut points = series.to_vec();
        points.sort_by_key(|p| p.timestamp);

        let rate = slope_per_day(&points);
        let significance = self.config.significance_threshold;
        TrendReport {
            trend: classify(rate, significance),
            rate,
            confidence: self.confidence(&points),
            segments: segments(&points, significance),
        }
    }

    /// Mean of sample adequacy, direction consistency and time coverage.
    fn confidence(&self, points: &[TrendPoint]) -> f64 {
        let n = points.len() as f64;
        let adequacy = (n / (2.0 * self.config.min_samples as f64)).min(1.0);
        let span = match (points.first(), points.last()) {
            (Some(first), Some(last)) => days_between(first.timestamp, last.timestamp),
            _ => 0.0,
        };
        let coverage = (span / self.config.full_coverage_days).clamp(0.0, 1.0);
        ((adequacy + sign_consistency(points) + coverage) / 3.0).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;

    fn weekly(values: &[f64]) -> Vec<TrendPoint> {
        let start = Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap();
        values
            .iter()
            .enumerate()
            .map(|(i, &value)| TrendPoint {
                timestamp: start + Duration::weeks(i as i64),
                value,
            })
            .collect()
    }

    #[test]
    fn weekly_scores_improve_with_a_late_jump() {
        let report = TrendAnalyzer::default().analyze(&weekly(&[70.0, 72.0, 75.0, 90.0]));

        assert_eq!(report.trend, Trend::Improving);
        assert!((report.rate - 0.9).abs() < 1e-9);
        assert_eq!(report.segments.len(), 2);
        assert_eq!(report.segments[0].points, 3);
        assert_eq!(report.segments[1].net_change, 15.0);

        let expected = (4.0 / 6.0 + 1.0 + 21.0 / 30.0) / 3.0;
        assert!((report.confidence - expected).abs() < 1e-9);
    }

    #[test]
    fn too_few_points_is_steady_with_no_confidence() {
        let report = TrendAnalyzer::default().analyze(&weekly(&[1.0, 9.0]));
        assert_eq!(report, TrendReport::insufficient());
    }

    #[test]
    fn declining_and_flat_series() {
        let analyzer = TrendAnalyzer::default();
        assert_eq!(
            analyzer.analyze(&weekly(&[90.0, 80.0, 70.0])).trend,
            Trend::Declining
        );
        assert_eq!(
            analyzer.analyze(&weekly(&[5.0, 5.0, 5.0, 5.0])).trend,
            Trend::Steady
        );
    }

    #[test]
    fn unordered_input_is_sorted_first() {
        let mut points = weekly(&[70.0, 72.0, 75.0, 90.0]);
        points.reverse();
        let report = TrendAnalyzer::default().analyze(&points);
        assert!((report.rate - 0.9).abs() < 1e-9);
    }

    #[test]
    fn sign_flips_reduce_confidence() {
        let steady = weekly(&[1.0, 2.0, 3.0, 4.0]);
        let zigzag = weekly(&[1.0, 3.0, 2.0, 4.0]);
        assert_eq!(sign_consistency(&steady), 1.0);
        assert!((sign_consistency(&zigzag) - 0.64).abs() < 1e-12);
    }

    #[test]
    fn shared_timestamps_have_zero_slope() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let points: Vec<TrendPoint> = [1.0, 5.0, 9.0]
            .into_iter()
            .map(|value| TrendPoint { timestamp: at, value })
            .collect();
        assert_eq!(slope_per_day(&points), 0.0);
    }
}
