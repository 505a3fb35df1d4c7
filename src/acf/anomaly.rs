//! C5 — ML Anomaly Detection.
//!
//! Z-score, IQR, moving-average, isolation-forest-with-percentile-fallback, and ensemble
//! detectors over a named metric's value series. Grounded on
//! `examples/original_source/backend/agents/monitoring/ml_anomaly.py`'s
//! `AnomalyDetector` hierarchy; the isolation-forest fallback keeps the original's
//! `percentile(contamination*50)` / `percentile(100 - contamination*50)` two-sided bound
//! formula per §A.3-6 — the bool-array contract is what matters, not numeric agreement
//! with a real isolation forest (§9).

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, Distribution, OrderStatistics};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    ZScore,
    Iqr,
    MovingAverage,
    IsolationForest,
    Ensemble,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalySeverity {
    Low,
    Medium,
    High,
    Critical,
}

fn severity_from_score(score: f64) -> AnomalySeverity {
    let abs = score.abs();
    if abs >= 5.0 {
        AnomalySeverity::Critical
    } else if abs >= 4.0 {
        AnomalySeverity::High
    } else if abs >= 3.0 {
        AnomalySeverity::Medium
    } else {
        AnomalySeverity::Low
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyPoint {
    pub index: usize,
    pub value: f64,
    pub score: f64,
    pub severity: AnomalySeverity,
    pub confidence: f64,
    pub detector: DetectorKind,
}

/// Population mean/std-dev via `statrs`, matching the original's numpy-backed moments.
fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let data = Data::new(values.to_vec());
    let mean = data.mean().unwrap_or(0.0);
    let std_dev = data.population_std_dev().unwrap_or(0.0);
    (mean, std_dev)
}

/// Linear-interpolated percentile via `statrs::statistics::OrderStatistics`, the same
/// interpolation convention `numpy.percentile` uses in the original Python detector.
fn percentile(values: &[f64], pct: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    Data::new(values.to_vec()).percentile(pct.round().clamp(0.0, 100.0) as usize)
}

fn make_point(index: usize, value: f64, score: f64, detector: DetectorKind) -> AnomalyPoint {
    AnomalyPoint {
        index,
        value,
        score,
        severity: severity_from_score(score),
        confidence: (score.abs() / 5.0).clamp(0.0, 1.0),
        detector,
    }
}

fn z_score_detect(values: &[f64], threshold: f64) -> Vec<AnomalyPoint> {
    let (mean, std_dev) = mean_std(values);
    if std_dev == 0.0 {
        return Vec::new();
    }
    values
        .iter()
        .enumerate()
        .filter_map(|(i, &v)| {
            let z = (v - mean) / std_dev;
            (z.abs() > threshold).then(|| make_point(i, v, z, DetectorKind::ZScore))
        })
        .collect()
}

fn iqr_detect(values: &[f64]) -> Vec<AnomalyPoint> {
    if values.len() < 4 {
        return Vec::new();
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let q1 = percentile(&sorted, 25.0);
    let q3 = percentile(&sorted, 75.0);
    let iqr = q3 - q1;
    if iqr == 0.0 {
        return Vec::new();
    }
    let lower = q1 - 1.5 * iqr;
    let upper = q3 + 1.5 * iqr;
    values
        .iter()
        .enumerate()
        .filter_map(|(i, &v)| {
            if v < lower || v > upper {
                let score = ((v - (q1 + q3) / 2.0) / iqr).abs() * 1.5;
                Some(make_point(i, v, score, DetectorKind::Iqr))
            } else {
                None
            }
        })
        .collect()
}

fn moving_average_detect(values: &[f64], window: usize, threshold: f64) -> Vec<AnomalyPoint> {
    let mut out = Vec::new();
    for i in window..values.len() {
        let slice = &values[i - window..i];
        let (mean, std_dev) = mean_std(slice);
        if std_dev == 0.0 {
            continue;
        }
        let deviation = (values[i] - mean) / std_dev;
        if deviation.abs() > threshold {
            out.push(make_point(i, values[i], deviation, DetectorKind::MovingAverage));
        }
    }
    out
}

/// Percentile-based fallback for isolation forest per §A.3-6: flags values outside the
/// two-sided `[percentile(contamination*50), percentile(100 - contamination*50)]` band.
fn isolation_forest_fallback(values: &[f64], contamination: f64) -> Vec<AnomalyPoint> {
    if values.len() < 4 {
        return Vec::new();
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let lower_pct = contamination * 50.0;
    let upper_pct = 100.0 - contamination * 50.0;
    let lower = percentile(&sorted, lower_pct);
    let upper = percentile(&sorted, upper_pct);
    let (mean, std_dev) = mean_std(values);
    values
        .iter()
        .enumerate()
        .filter_map(|(i, &v)| {
            if v < lower || v > upper {
                let score = if std_dev > 0.0 { ((v - mean) / std_dev).abs() } else { 3.0 };
                Some(make_point(i, v, score.max(3.0), DetectorKind::IsolationForest))
            } else {
                None
            }
        })
        .collect()
}

/// Majority-vote ensemble over z-score / IQR / moving-average, threshold 0.5 of voters.
fn ensemble_detect(values: &[f64]) -> Vec<AnomalyPoint> {
    let votes: Vec<Vec<AnomalyPoint>> = vec![
        z_score_detect(values, 3.0),
        iqr_detect(values),
        moving_average_detect(values, 10.min(values.len().saturating_sub(1)).max(1), 3.0),
    ];

    let mut counts: HashMap<usize, Vec<&AnomalyPoint>> = HashMap::new();
    for detector_points in &votes {
        for point in detector_points {
            counts.entry(point.index).or_default().push(point);
        }
    }

    let voter_count = votes.len() as f64;
    let mut out = Vec::new();
    for (index, points) in counts {
        if points.len() as f64 / voter_count >= 0.5 {
            let avg_score = points.iter().map(|p| p.score).sum::<f64>() / points.len() as f64;
            out.push(make_point(index, points[0].value, avg_score, DetectorKind::Ensemble));
        }
    }
    out.sort_by_key(|p| p.index);
    out
}

#[derive(Default)]
struct TrainedSeries {
    values: Vec<f64>,
}

/// Per-metric detector state. `detect` auto-trains on the supplied values if no prior
/// `train` call happened for that metric name, per §4.4.
pub struct MlAnomalyDetector {
    trained: RwLock<HashMap<String, TrainedSeries>>,
}

impl MlAnomalyDetector {
    pub fn new() -> Self {
        Self {
            trained: RwLock::new(HashMap::new()),
        }
    }

    pub fn train(&self, metric_name: &str, values: &[f64]) {
        self.trained
            .write()
            .insert(metric_name.to_string(), TrainedSeries { values: values.to_vec() });
    }

    pub fn detect(&self, metric_name: &str, values: &[f64], detector: DetectorKind) -> Vec<AnomalyPoint> {
        if !self.trained.read().contains_key(metric_name) {
            self.train(metric_name, values);
        }
        match detector {
            DetectorKind::ZScore => z_score_detect(values, 3.0),
            DetectorKind::Iqr => iqr_detect(values),
            DetectorKind::MovingAverage => {
                moving_average_detect(values, 10.min(values.len().saturating_sub(1)).max(1), 3.0)
            }
            DetectorKind::IsolationForest => isolation_forest_fallback(values, 0.1),
            DetectorKind::Ensemble => ensemble_detect(values),
        }
    }
}

impl Default for MlAnomalyDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn z_score_flags_outlier() {
        let values: Vec<f64> = (0..50).map(|_| 10.0).collect();
        let mut values = values;
        values.push(1000.0);
        let detector = MlAnomalyDetector::new();
        let anomalies = detector.detect("latency", &values, DetectorKind::ZScore);
        assert!(anomalies.iter().any(|a| a.index == values.len() - 1));
    }

    #[test]
    fn ensemble_requires_majority_vote() {
        let mut values: Vec<f64> = (0..60).map(|i| 50.0 + (i % 5) as f64).collect();
        values.push(500.0);
        let detector = MlAnomalyDetector::new();
        let anomalies = detector.detect("orders", &values, DetectorKind::Ensemble);
        assert!(anomalies.iter().any(|a| a.index == values.len() - 1));
    }

    #[test]
    fn severity_bands_match_thresholds() {
        assert_eq!(severity_from_score(2.5), AnomalySeverity::Low);
        assert_eq!(severity_from_score(3.2), AnomalySeverity::Medium);
        assert_eq!(severity_from_score(4.1), AnomalySeverity::High);
        assert_eq!(severity_from_score(6.0), AnomalySeverity::Critical);
    }
}
