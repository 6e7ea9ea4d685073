use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::entities::anomaly_record::{
    ActiveModel as AnomalyActiveModel, Column, Entity as AnomalyRecord, Model as AnomalyModel,
};
use crate::errors::ServiceError;

use super::BaseRepository;

/// Repository for stored anomaly findings
#[derive(Debug, Clone)]
pub struct AnomalyRepository {
    base: BaseRepository,
}

impl AnomalyRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            base: BaseRepository::new(db),
        }
    }

    /// Finding recorded for a given source sample, if any
    pub async fn find_by_source_sample(
        &self,
        telemetry_id: Uuid,
    ) -> Result<Option<AnomalyModel>, ServiceError> {
        self.base
            .access()
            .execute("anomaly.find_by_source_sample", move |db| {
                AnomalyRecord::find()
                    .filter(Column::TelemetryId.eq(telemetry_id))
                    .one(db)
            })
            .await
    }

    /// Inserts a finding.
    ///
    /// Errors are returned unlogged: a unique violation here is an expected
    /// race that the caller resolves.
    pub async fn insert(&self, finding: AnomalyActiveModel) -> Result<AnomalyModel, ServiceError> {
        self.base
            .access()
            .execute_quiet("anomaly.insert", move |db| finding.insert(db))
            .await
    }

    /// Findings for an asset with `start <= timestamp <= end`, newest first
    pub async fn find_by_asset(
        &self,
        asset_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<AnomalyModel>, ServiceError> {
        let asset_id = asset_id.to_string();
        self.base
            .access()
            .execute("anomaly.find_by_asset", move |db| {
                AnomalyRecord::find()
                    .filter(Column::AssetId.eq(asset_id))
                    .filter(Column::Timestamp.gte(start))
                    .filter(Column::Timestamp.lte(end))
                    .order_by_desc(Column::Timestamp)
                    .all(db)
            })
            .await
    }

    /// Total number of stored findings
    pub async fn count(&self) -> Result<u64, ServiceError> {
        self.base
            .access()
            .execute("anomaly.count", |db| AnomalyRecord::find().count(db))
            .await
    }
}
