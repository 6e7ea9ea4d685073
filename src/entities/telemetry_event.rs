use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One stored metric sample. Rows are append-only.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "telemetry_events")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub asset_id: String,
    pub timestamp: DateTime<Utc>,
    pub metric: String,
    pub value: f64,
    pub unit: Option<String>,
    pub tags: Option<Json>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::anomaly_record::Entity")]
    AnomalyRecords,
}

impl Related<super::anomaly_record::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::AnomalyRecords.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Builds an unsaved sample with a fresh id.
    pub fn new(
        asset_id: impl Into<String>,
        metric: impl Into<String>,
        timestamp: DateTime<Utc>,
        value: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            asset_id: asset_id.into(),
            timestamp,
            metric: metric.into(),
            value,
            unit: None,
            tags: None,
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }
}
