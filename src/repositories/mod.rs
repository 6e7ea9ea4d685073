use sea_orm::DatabaseConnection;
use std::sync::Arc;

use crate::db::DatabaseAccess;

pub mod anomaly_repository;
pub mod telemetry_repository;

pub use anomaly_repository::AnomalyRepository;
pub use telemetry_repository::{ScanPair, TelemetryRepository};

#[derive(Debug, Clone)]
pub struct BaseRepository {
    access: DatabaseAccess,
}

impl BaseRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            access: DatabaseAccess::new(db),
        }
    }

    /// Metric-wrapped access used by every query
    pub fn access(&self) -> &DatabaseAccess {
        &self.access
    }
}
