use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use sea_orm::Set;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, instrument};

use crate::config::DetectionConfig;
use crate::db::DbPool;
use crate::entities::anomaly_record::{ActiveModel as AnomalyActiveModel, Model as AnomalyModel};
use crate::entities::telemetry_event::Model as TelemetryModel;
use crate::errors::{is_unique_violation, ServiceError};
use crate::repositories::{AnomalyRepository, ScanPair, TelemetryRepository};
use crate::services::anomaly_detection::{detect_anomalies, AnomalyCandidate, DetectionOutcome};

/// A finding returned by the persister, with whether this call created it.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedFinding {
    pub record: AnomalyModel,
    pub created: bool,
}

/// What one detection run did for its pair.
#[derive(Debug, Clone, PartialEq)]
pub enum DetectionSummary {
    InsufficientData { count: usize },
    DegenerateWindow,
    Completed {
        findings: Vec<AnomalyModel>,
        created: usize,
    },
}

impl DetectionSummary {
    /// Label used for the outcome metric
    pub fn label(&self) -> &'static str {
        match self {
            DetectionSummary::InsufficientData { .. } => "insufficient_data",
            DetectionSummary::DegenerateWindow => "degenerate_window",
            DetectionSummary::Completed { findings, .. } if findings.is_empty() => "clean",
            DetectionSummary::Completed { .. } => "anomalous",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectionReport {
    pub pair: ScanPair,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub summary: DetectionSummary,
}

impl DetectionReport {
    pub fn findings(&self) -> &[AnomalyModel] {
        match &self.summary {
            DetectionSummary::Completed { findings, .. } => findings,
            _ => &[],
        }
    }

    /// Short human-readable status for the task result.
    pub fn status(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for DetectionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.summary {
            DetectionSummary::InsufficientData { .. } => {
                write!(f, "Not enough data points for {} in the last window.", self.pair)
            }
            DetectionSummary::DegenerateWindow => {
                write!(f, "Standard deviation is zero for {}.", self.pair)
            }
            DetectionSummary::Completed { findings, .. } if findings.is_empty() => {
                write!(f, "No anomalies detected for {}.", self.pair)
            }
            DetectionSummary::Completed { findings, .. } => {
                write!(f, "Detected {} anomalies for {}.", findings.len(), self.pair)
            }
        }
    }
}

/// Window fetch, classification and persistence for one pair at a time.
#[derive(Debug, Clone)]
pub struct DetectionService {
    telemetry: TelemetryRepository,
    anomalies: AnomalyRepository,
    config: DetectionConfig,
}

impl DetectionService {
    pub fn new(db: Arc<DbPool>, config: DetectionConfig) -> Self {
        Self {
            telemetry: TelemetryRepository::new(db.clone()),
            anomalies: AnomalyRepository::new(db),
            config,
        }
    }

    /// Samples for the pair in `[window_end - window_size, window_end]`, oldest first.
    pub async fn fetch_window(
        &self,
        asset_id: &str,
        metric: &str,
        window_end: DateTime<Utc>,
        window_size: Duration,
    ) -> Result<Vec<TelemetryModel>, ServiceError> {
        self.telemetry
            .query_samples(asset_id, metric, window_end - window_size, window_end)
            .await
    }

    /// Stores a candidate unless a finding for its source sample already exists.
    pub async fn persist_candidate(
        &self,
        candidate: &AnomalyCandidate,
    ) -> Result<PersistedFinding, ServiceError> {
        if let Some(telemetry_id) = candidate.telemetry_id {
            if let Some(existing) = self.anomalies.find_by_source_sample(telemetry_id).await? {
                debug!(%telemetry_id, "Finding already recorded for sample");
                counter!("anomaly_scanner.findings.duplicate", 1);
                return Ok(PersistedFinding {
                    record: existing,
                    created: false,
                });
            }
        }

        self.insert_resolving_conflict(candidate).await
    }

    /// Insert half of [`Self::persist_candidate`]. A unique violation means a
    /// concurrent worker won the race; its row is returned instead.
    pub(crate) async fn insert_resolving_conflict(
        &self,
        candidate: &AnomalyCandidate,
    ) -> Result<PersistedFinding, ServiceError> {
        let finding = AnomalyActiveModel {
            telemetry_id: Set(candidate.telemetry_id),
            asset_id: Set(candidate.asset_id.clone()),
            timestamp: Set(candidate.timestamp),
            metric: Set(candidate.metric.clone()),
            score: Set(candidate.score),
            explanation: Set(Some(candidate.explanation.clone())),
            details: Set(Some(serde_json::to_value(candidate.details)?)),
            ..Default::default()
        };

        match self.anomalies.insert(finding).await {
            Ok(record) => {
                counter!("anomaly_scanner.findings.created", 1);
                Ok(PersistedFinding {
                    record,
                    created: true,
                })
            }
            Err(ServiceError::DatabaseError(err)) if is_unique_violation(&err) => {
                let existing = match candidate.telemetry_id {
                    Some(telemetry_id) => self.anomalies.find_by_source_sample(telemetry_id).await?,
                    None => None,
                };
                counter!("anomaly_scanner.findings.duplicate", 1);
                existing
                    .map(|record| PersistedFinding {
                        record,
                        created: false,
                    })
                    .ok_or(ServiceError::DatabaseError(err))
            }
            Err(e) => Err(e),
        }
    }

    /// Runs detection for the pair over the window ending now.
    pub async fn detect(
        &self,
        asset_id: &str,
        metric: &str,
    ) -> Result<DetectionReport, ServiceError> {
        self.detect_at(asset_id, metric, Utc::now()).await
    }

    /// Runs detection for the pair over the window ending at `window_end`.
    #[instrument(skip(self), fields(window_secs = self.config.window_size_secs))]
    pub async fn detect_at(
        &self,
        asset_id: &str,
        metric: &str,
        window_end: DateTime<Utc>,
    ) -> Result<DetectionReport, ServiceError> {
        let window_start = window_end - self.config.window_span();

        let summary = self
            .run_window(asset_id, metric, window_end)
            .await
            .map_err(|e| {
                error!(
                    component = "anomaly",
                    asset_id,
                    metric,
                    %window_start,
                    %window_end,
                    error = %e,
                    "Detection failed"
                );
                counter!("anomaly_scanner.detect.outcome", 1, "outcome" => e.kind());
                e
            })?;

        let report = DetectionReport {
            pair: ScanPair::new(asset_id, metric),
            window_start,
            window_end,
            summary,
        };

        counter!("anomaly_scanner.detect.outcome", 1, "outcome" => report.summary.label());
        info!(component = "anomaly", "summary {}", report);
        Ok(report)
    }

    async fn run_window(
        &self,
        asset_id: &str,
        metric: &str,
        window_end: DateTime<Utc>,
    ) -> Result<DetectionSummary, ServiceError> {
        let samples = self
            .fetch_window(asset_id, metric, window_end, self.config.window_span())
            .await?;

        let outcome = detect_anomalies(
            &samples,
            self.config.z_score_threshold,
            self.config.min_sample_count,
        );

        match outcome {
            DetectionOutcome::InsufficientData { count, required } => {
                info!(
                    component = "anomaly",
                    asset_id,
                    metric,
                    count,
                    required,
                    window_seconds = self.config.window_size_secs,
                    "insufficient data"
                );
                Ok(DetectionSummary::InsufficientData { count })
            }
            DetectionOutcome::DegenerateWindow { mean, count } => {
                info!(
                    component = "anomaly",
                    asset_id,
                    metric,
                    mean,
                    values = count,
                    "zero std_dev"
                );
                Ok(DetectionSummary::DegenerateWindow)
            }
            DetectionOutcome::Evaluated { stats, candidates } => {
                info!(
                    component = "anomaly",
                    asset_id,
                    metric,
                    count = stats.count,
                    mean = stats.mean,
                    std = stats.std_dev,
                    threshold = self.config.z_score_threshold,
                    "evaluating"
                );

                let mut findings = Vec::with_capacity(candidates.len());
                let mut created = 0;
                for candidate in &candidates {
                    let persisted = self.persist_candidate(candidate).await?;
                    if persisted.created {
                        created += 1;
                        info!(
                            component = "anomaly",
                            asset_id,
                            metric,
                            telemetry_id = ?candidate.telemetry_id,
                            z = candidate.score,
                            value = candidate.value,
                            "persisted"
                        );
                    }
                    findings.push(persisted.record);
                }

                Ok(DetectionSummary::Completed { findings, created })
            }
        }
    }
}
