use chrono::{DateTime, Duration, Utc};
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::entities::telemetry_event::{
    ActiveModel as TelemetryActiveModel, Column, Entity as TelemetryEvent,
    Model as TelemetryModel,
};
use crate::errors::ServiceError;

use super::BaseRepository;

/// One `(asset_id, metric)` combination with recent activity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScanPair {
    pub asset_id: String,
    pub metric: String,
}

impl ScanPair {
    pub fn new(asset_id: impl Into<String>, metric: impl Into<String>) -> Self {
        Self {
            asset_id: asset_id.into(),
            metric: metric.into(),
        }
    }
}

impl fmt::Display for ScanPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.asset_id, self.metric)
    }
}

impl From<(String, String)> for ScanPair {
    fn from((asset_id, metric): (String, String)) -> Self {
        Self { asset_id, metric }
    }
}

/// Read access to stored telemetry, plus the batch write used by ingestion.
#[derive(Debug, Clone)]
pub struct TelemetryRepository {
    base: BaseRepository,
}

impl TelemetryRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            base: BaseRepository::new(db),
        }
    }

    /// Samples for one exact pair with `start <= timestamp <= end`, oldest first.
    pub async fn query_samples(
        &self,
        asset_id: &str,
        metric: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TelemetryModel>, ServiceError> {
        let asset_id = asset_id.to_string();
        let metric = metric.to_string();
        self.base
            .access()
            .execute("telemetry.query_samples", move |db| {
                TelemetryEvent::find()
                    .filter(Column::AssetId.eq(asset_id))
                    .filter(Column::Metric.eq(metric))
                    .filter(Column::Timestamp.gte(start))
                    .filter(Column::Timestamp.lte(end))
                    .order_by_asc(Column::Timestamp)
                    .all(db)
            })
            .await
    }

    /// Distinct pairs with at least one sample in `[start, end]`.
    pub async fn distinct_pairs_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ScanPair>, ServiceError> {
        let rows = self
            .base
            .access()
            .execute("telemetry.distinct_pairs", move |db| {
                TelemetryEvent::find()
                    .select_only()
                    .column(Column::AssetId)
                    .column(Column::Metric)
                    .distinct()
                    .filter(Column::Timestamp.gte(start))
                    .filter(Column::Timestamp.lte(end))
                    .into_tuple::<(String, String)>()
                    .all(db)
            })
            .await?;

        Ok(rows.into_iter().map(ScanPair::from).collect())
    }

    /// Distinct pairs active within the trailing `window` ending now.
    pub async fn distinct_pairs_since(
        &self,
        window: Duration,
    ) -> Result<Vec<ScanPair>, ServiceError> {
        let now = Utc::now();
        self.distinct_pairs_between(now - window, now).await
    }

    /// Appends a batch of samples. Returns the number of rows written.
    pub async fn insert_samples(&self, batch: Vec<TelemetryModel>) -> Result<u64, ServiceError> {
        if batch.is_empty() {
            return Ok(0);
        }

        let rows: Vec<TelemetryActiveModel> = batch
            .into_iter()
            .map(|sample| TelemetryActiveModel {
                id: Set(sample.id),
                asset_id: Set(sample.asset_id),
                timestamp: Set(sample.timestamp),
                metric: Set(sample.metric),
                value: Set(sample.value),
                unit: Set(sample.unit),
                tags: Set(sample.tags),
            })
            .collect();
        let count = rows.len();

        let written = self
            .base
            .access()
            .execute("telemetry.insert_samples", move |db| {
                TelemetryEvent::insert_many(rows).exec_without_returning(db)
            })
            .await?;

        debug!(requested = count, written, "Inserted telemetry samples");
        Ok(written)
    }
}
