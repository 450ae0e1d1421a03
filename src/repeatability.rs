//! Cross-run dispersion of the quality metrics
//!
//! Repeatability is the population standard deviation of a metric across
//! the most recent runs: the run set is the entire population under study,
//! not a sample from one. Runs where a metric is undefined are excluded
//! from that metric's series; fewer than two defined values leave the
//! dispersion undefined rather than zero.

use std::collections::BTreeMap;

use crate::models::RunMetrics;

/// Metrics analyzed when the caller does not name any
pub const DEFAULT_METRICS: &[&str] = &[
    "tpr",
    "fpr",
    "accuracy",
    "detection_seconds_mean",
    "blocking_seconds_mean",
];

/// Per-metric population standard deviation over the last `window` runs
/// (all runs when `window` is `None`).
pub fn analyze(
    history: &[RunMetrics],
    metric_names: &[&str],
    window: Option<usize>,
) -> BTreeMap<String, Option<f64>> {
    let start = window
        .map(|w| history.len().saturating_sub(w))
        .unwrap_or(0);
    let recent = &history[start..];

    metric_names
        .iter()
        .map(|name| {
            let values: Vec<f64> = recent
                .iter()
                .filter_map(|run| metric_value(run, name))
                .collect();
            (name.to_string(), population_std(&values))
        })
        .collect()
}

fn metric_value(run: &RunMetrics, name: &str) -> Option<f64> {
    match name {
        "tpr" => run.tpr,
        "fpr" => run.fpr,
        "accuracy" => run.accuracy,
        "detection_seconds_mean" => run.detection_seconds.as_ref().map(|s| s.mean),
        "blocking_seconds_mean" => run.blocking_seconds.as_ref().map(|s| s.mean),
        _ => None,
    }
}

fn population_std(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    Some(variance.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DurationSummary, RunCounts, RunWarnings};
    use chrono::Utc;
    use std::collections::BTreeMap as Map;

    fn run(tpr: Option<f64>, detection_mean: Option<f64>) -> RunMetrics {
        RunMetrics {
            run_id: "r".to_string(),
            recorded_at: Utc::now(),
            notes: String::new(),
            lines_ingested: 0,
            lines_skipped: 0,
            tpr,
            fpr: None,
            accuracy: tpr,
            counts: RunCounts::default(),
            detection_seconds: detection_mean.map(|mean| DurationSummary {
                count: 1,
                mean,
                median: mean,
                min: mean,
                max: mean,
                p95: mean,
            }),
            blocking_seconds: None,
            detection_by_ip: Map::new(),
            blocking_by_ip: Map::new(),
            warnings: RunWarnings::default(),
        }
    }

    #[test]
    fn test_single_run_is_undefined() {
        let history = vec![run(Some(0.8), Some(10.0))];
        let result = analyze(&history, DEFAULT_METRICS, None);
        assert!(result.values().all(|v| v.is_none()));
    }

    #[test]
    fn test_two_runs_population_std() {
        let history = vec![run(Some(0.8), None), run(Some(0.9), None)];
        let result = analyze(&history, &["tpr"], None);
        let std = result.get("tpr").unwrap().unwrap();
        assert!((std - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_undefined_runs_excluded_per_metric() {
        let history = vec![
            run(Some(0.8), Some(10.0)),
            run(None, Some(20.0)),
            run(Some(0.8), None),
        ];
        let result = analyze(&history, &["tpr", "detection_seconds_mean"], None);
        // two defined tpr values, both 0.8
        assert_eq!(result.get("tpr").unwrap().unwrap(), 0.0);
        // two defined detection means: 10 and 20 -> std 5
        assert!((result.get("detection_seconds_mean").unwrap().unwrap() - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_window_limits_to_recent_runs() {
        let history = vec![
            run(Some(0.0), None),
            run(Some(0.8), None),
            run(Some(0.9), None),
        ];
        let all = analyze(&history, &["tpr"], None);
        let windowed = analyze(&history, &["tpr"], Some(2));
        assert!(all.get("tpr").unwrap().unwrap() > 0.3);
        assert!((windowed.get("tpr").unwrap().unwrap() - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_unknown_metric_name_is_undefined() {
        let history = vec![run(Some(0.8), None), run(Some(0.9), None)];
        let result = analyze(&history, &["f1"], None);
        assert_eq!(result.get("f1"), Some(&None));
    }
}
