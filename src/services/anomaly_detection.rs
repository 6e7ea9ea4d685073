//! Z-score classification over a window of samples.
//!
//! Everything here is pure: no I/O, no clock. Statistics are population
//! statistics, the window being the whole population.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::telemetry_event::Model as TelemetryModel;

/// Population mean and standard deviation of a window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowStats {
    pub mean: f64,
    pub std_dev: f64,
    pub count: usize,
}

impl WindowStats {
    /// Returns `None` for an empty slice.
    pub fn from_values(values: &[f64]) -> Option<Self> {
        let first = *values.first()?;
        let count = values.len();

        // Exact zero for constant windows; summation error would otherwise
        // leave a tiny non-zero spread.
        if values.iter().all(|v| *v == first) {
            return Some(Self {
                mean: first,
                std_dev: 0.0,
                count,
            });
        }

        let n = count as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;

        Some(Self {
            mean,
            std_dev: variance.sqrt(),
            count,
        })
    }

    /// Signed z-score of `value`; only meaningful when `std_dev > 0`.
    pub fn z_score(&self, value: f64) -> f64 {
        (value - self.mean) / self.std_dev
    }
}

/// Window statistics stored alongside each finding.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnomalyDetails {
    pub mean: f64,
    pub std_dev: f64,
    pub window_size: usize,
}

impl From<WindowStats> for AnomalyDetails {
    fn from(stats: WindowStats) -> Self {
        Self {
            mean: stats.mean,
            std_dev: stats.std_dev,
            window_size: stats.count,
        }
    }
}

/// A sample classified as anomalous, not yet persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyCandidate {
    pub telemetry_id: Option<Uuid>,
    pub asset_id: String,
    pub metric: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    /// |z|
    pub score: f64,
    pub explanation: String,
    pub details: AnomalyDetails,
}

/// Result of evaluating one window.
#[derive(Debug, Clone, PartialEq)]
pub enum DetectionOutcome {
    /// Fewer samples than the configured minimum
    InsufficientData { count: usize, required: usize },
    /// Every sample has the same value, so no z-score exists
    DegenerateWindow { mean: f64, count: usize },
    /// Statistics were computed; `candidates` may be empty
    Evaluated {
        stats: WindowStats,
        candidates: Vec<AnomalyCandidate>,
    },
}

impl DetectionOutcome {
    pub fn candidates(&self) -> &[AnomalyCandidate] {
        match self {
            DetectionOutcome::Evaluated { candidates, .. } => candidates,
            _ => &[],
        }
    }
}

/// Explanation text stored with a finding.
pub fn explain(asset_id: &str, metric: &str, value: f64, score: f64, mean: f64) -> String {
    format!(
        "Anomaly detected for {}/{}: Value {} is {:.2} standard deviations from the mean of {:.2}.",
        asset_id, metric, value, score, mean
    )
}

/// Classifies the samples of one window.
///
/// `samples` must be ordered by timestamp; candidates keep that order. A
/// sample is a candidate when `|z| > threshold`, strictly.
pub fn detect_anomalies(
    samples: &[TelemetryModel],
    threshold: f64,
    min_sample_count: usize,
) -> DetectionOutcome {
    if samples.len() < min_sample_count || samples.is_empty() {
        return DetectionOutcome::InsufficientData {
            count: samples.len(),
            required: min_sample_count,
        };
    }

    let values: Vec<f64> = samples.iter().map(|s| s.value).collect();
    let stats = match WindowStats::from_values(&values) {
        Some(stats) => stats,
        None => {
            return DetectionOutcome::InsufficientData {
                count: 0,
                required: min_sample_count,
            }
        }
    };

    if stats.std_dev == 0.0 {
        return DetectionOutcome::DegenerateWindow {
            mean: stats.mean,
            count: stats.count,
        };
    }

    let candidates = samples
        .iter()
        .filter_map(|sample| {
            let score = stats.z_score(sample.value).abs();
            if score > threshold {
                Some(AnomalyCandidate {
                    telemetry_id: Some(sample.id),
                    asset_id: sample.asset_id.clone(),
                    metric: sample.metric.clone(),
                    timestamp: sample.timestamp,
                    value: sample.value,
                    score,
                    explanation: explain(
                        &sample.asset_id,
                        &sample.metric,
                        sample.value,
                        score,
                        stats.mean,
                    ),
                    details: stats.into(),
                })
            } else {
                None
            }
        })
        .collect();

    DetectionOutcome::Evaluated { stats, candidates }
}
