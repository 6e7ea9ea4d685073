use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{entity::prelude::*, ActiveValue};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A persisted finding. At most one row exists per non-null `telemetry_id`
/// (enforced by `idx_anomaly_records_telemetry_id`).
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "anomaly_records")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub telemetry_id: Option<Uuid>,
    pub asset_id: String,
    pub timestamp: DateTime<Utc>,
    pub metric: String,
    pub score: f64,
    pub explanation: Option<String>,
    pub details: Option<Json>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::telemetry_event::Entity",
        from = "Column::TelemetryId",
        to = "super::telemetry_event::Column::Id"
    )]
    TelemetryEvent,
}

impl Related<super::telemetry_event::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::TelemetryEvent.def()
    }
}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {
    async fn before_save<C: ConnectionTrait>(self, _db: &C, insert: bool) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        let mut active_model = self;

        if insert {
            if let ActiveValue::NotSet = active_model.id {
                active_model.id = ActiveValue::Set(Uuid::new_v4());
            }
        }

        Ok(active_model)
    }
}
