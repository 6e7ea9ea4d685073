use std::fmt;
use std::sync::Arc;

use crate::config::DetectionConfig;
use crate::db::DbPool;
use crate::repositories::{AnomalyRepository, TelemetryRepository};
use crate::services::{DetectionService, PairScanner};
use crate::task_queue::TaskQueue;

/// Process-wide handles, built once at startup and shared by the scheduler
/// and every worker.
#[derive(Clone)]
pub struct DetectionContext {
    pub db: Arc<DbPool>,
    pub queue: Arc<dyn TaskQueue>,
    pub config: DetectionConfig,
}

impl DetectionContext {
    pub fn new(db: Arc<DbPool>, queue: Arc<dyn TaskQueue>, config: DetectionConfig) -> Self {
        Self { db, queue, config }
    }

    pub fn detection_service(&self) -> DetectionService {
        DetectionService::new(self.db.clone(), self.config.clone())
    }

    pub fn pair_scanner(&self) -> PairScanner {
        PairScanner::new(self.db.clone(), self.config.window_span())
    }

    pub fn telemetry(&self) -> TelemetryRepository {
        TelemetryRepository::new(self.db.clone())
    }

    pub fn anomalies(&self) -> AnomalyRepository {
        AnomalyRepository::new(self.db.clone())
    }
}

impl fmt::Debug for DetectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetectionContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
