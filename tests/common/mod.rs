use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use telemetry_anomaly::config::{AppConfig, DetectionConfig};
use telemetry_anomaly::db;
use telemetry_anomaly::entities::telemetry_event::Model as TelemetryModel;
use telemetry_anomaly::repositories::{AnomalyRepository, TelemetryRepository};
use telemetry_anomaly::{DetectionContext, InMemoryTaskQueue};

/// Context backed by a fresh in-memory SQLite database and an in-memory queue.
pub struct TestHarness {
    pub ctx: DetectionContext,
    pub queue: Arc<InMemoryTaskQueue>,
    pub telemetry: TelemetryRepository,
    pub anomalies: AnomalyRepository,
}

impl TestHarness {
    pub async fn new(detection: DetectionConfig) -> Self {
        let mut cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            "redis://127.0.0.1:6379".to_string(),
            "test".to_string(),
        );
        // Every pooled connection to sqlite::memory: is its own database
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        cfg.anomaly = detection;

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations");
        let pool = Arc::new(pool);

        let queue = Arc::new(InMemoryTaskQueue::new());
        let ctx = DetectionContext::new(pool, queue.clone(), cfg.anomaly.clone());

        Self {
            telemetry: ctx.telemetry(),
            anomalies: ctx.anomalies(),
            ctx,
            queue,
        }
    }

    /// One sample per value, spaced `step_secs` apart and ending at `end`.
    #[allow(dead_code)]
    pub async fn seed_series(
        &self,
        asset_id: &str,
        metric: &str,
        end: DateTime<Utc>,
        step_secs: i64,
        values: &[f64],
    ) -> Vec<TelemetryModel> {
        let last = values.len() as i64 - 1;
        let samples: Vec<TelemetryModel> = values
            .iter()
            .enumerate()
            .map(|(i, value)| {
                let offset = (last - i as i64) * step_secs;
                TelemetryModel::new(asset_id, metric, end - Duration::seconds(offset), *value)
                    .with_unit("C")
            })
            .collect();

        self.telemetry
            .insert_samples(samples.clone())
            .await
            .expect("failed to seed telemetry");
        samples
    }
}
