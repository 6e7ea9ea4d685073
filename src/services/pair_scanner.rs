use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::debug;

use crate::db::DbPool;
use crate::errors::ServiceError;
use crate::repositories::{ScanPair, TelemetryRepository};

/// Enumerates `(asset_id, metric)` pairs with at least one sample in the
/// trailing window. Results are unordered.
#[derive(Debug, Clone)]
pub struct PairScanner {
    telemetry: TelemetryRepository,
    window: Duration,
}

impl PairScanner {
    pub fn new(db: Arc<DbPool>, window: Duration) -> Self {
        Self {
            telemetry: TelemetryRepository::new(db),
            window,
        }
    }

    pub async fn scan(&self) -> Result<Vec<ScanPair>, ServiceError> {
        let pairs = self.telemetry.distinct_pairs_since(self.window).await?;
        debug!(pairs = pairs.len(), "Scanned for active pairs");
        Ok(pairs)
    }

    /// Same as [`Self::scan`] for a window ending at `now`.
    pub async fn scan_at(&self, now: DateTime<Utc>) -> Result<Vec<ScanPair>, ServiceError> {
        let pairs = self
            .telemetry
            .distinct_pairs_between(now - self.window, now)
            .await?;
        debug!(pairs = pairs.len(), %now, "Scanned for active pairs");
        Ok(pairs)
    }
}
