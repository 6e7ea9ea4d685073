/*!
 * Periodic scanner that turns recently active pairs into detection tasks.
 *
 * The scheduler is either `Disabled` or `Armed`, chosen once from
 * configuration. An armed scheduler ticks every `schedule_interval`; a tick
 * that fires while the previous scan is still running is skipped.
 */

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::context::DetectionContext;
use crate::errors::ServiceError;
use crate::services::PairScanner;
use crate::task_queue::{TaskEnvelope, TaskQueue};

/// Longest accepted tick period: one year
const MAX_TICK_PERIOD: Duration = Duration::from_secs(31_536_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Disabled,
    Armed { interval: Duration },
}

/// Result of one scan: pairs discovered vs. tasks successfully enqueued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub pairs_found: usize,
    pub enqueued: usize,
}

impl ScanSummary {
    pub fn failed(&self) -> usize {
        self.pairs_found - self.enqueued
    }

    pub fn status(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ScanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.pairs_found == 0 {
            write!(f, "No recent asset/metric pairs to scan.")
        } else {
            write!(
                f,
                "Enqueued {} anomaly detection tasks from {} distinct pairs.",
                self.enqueued, self.pairs_found
            )
        }
    }
}

/// Clears the in-flight flag when a scan finishes, including on panic.
struct ScanGuard<'a>(&'a AtomicBool);

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Clone)]
pub struct Scheduler {
    state: SchedulerState,
    scanner: PairScanner,
    queue: Arc<dyn TaskQueue>,
    window_secs: u64,
    scanning: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(
        state: SchedulerState,
        scanner: PairScanner,
        queue: Arc<dyn TaskQueue>,
        window_secs: u64,
    ) -> Self {
        Self {
            state,
            scanner,
            queue,
            window_secs,
            scanning: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn from_context(ctx: &DetectionContext) -> Self {
        let state = if ctx.config.schedule_enabled {
            SchedulerState::Armed {
                interval: ctx.config.schedule_interval(),
            }
        } else {
            SchedulerState::Disabled
        };
        Self::new(state, ctx.pair_scanner(), ctx.queue.clone(), ctx.config.window_size_secs)
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// One scan over the window ending now.
    pub async fn scan_once(&self) -> Result<ScanSummary, ServiceError> {
        self.scan_once_at(Utc::now()).await
    }

    /// Enqueues one `detect` task per active pair. A failed enqueue is logged
    /// and skipped; only a failed scan is an error.
    pub async fn scan_once_at(&self, now: DateTime<Utc>) -> Result<ScanSummary, ServiceError> {
        let pairs = self.scanner.scan_at(now).await?;
        let mut summary = ScanSummary {
            pairs_found: pairs.len(),
            enqueued: 0,
        };
        gauge!("anomaly_scanner.scan.pairs", pairs.len() as f64);

        if pairs.is_empty() {
            info!(
                component = "scheduler",
                window_seconds = self.window_secs,
                "no distinct asset/metric pairs found in recent window"
            );
            return Ok(summary);
        }

        for pair in pairs {
            match self
                .queue
                .enqueue(TaskEnvelope::detect(pair.asset_id.clone(), pair.metric.clone()))
                .await
            {
                Ok(()) => {
                    summary.enqueued += 1;
                    counter!("anomaly_scanner.enqueue.success", 1);
                }
                Err(e) => {
                    warn!(
                        component = "scheduler",
                        asset_id = %pair.asset_id,
                        metric = %pair.metric,
                        error = %e,
                        "failed enqueue"
                    );
                    counter!("anomaly_scanner.enqueue.failure", 1);
                }
            }
        }

        info!(
            component = "scheduler",
            enqueued = summary.enqueued,
            pairs = summary.pairs_found,
            window_seconds = self.window_secs,
            "{}",
            summary
        );
        Ok(summary)
    }

    /// Runs a scan unless one is already in progress, in which case `None`
    /// is returned.
    pub async fn tick(&self) -> Option<Result<ScanSummary, ServiceError>> {
        if self
            .scanning
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!(component = "scheduler", "previous scan still running; skipping tick");
            counter!("anomaly_scanner.scan.skipped", 1);
            return None;
        }
        let _guard = ScanGuard(&self.scanning);

        counter!("anomaly_scanner.scan.started", 1);
        let result = self.scan_once().await;
        if let Err(e) = &result {
            error!(component = "scheduler", error = %e, "scan failed");
            counter!("anomaly_scanner.scan.failed", 1);
        }
        Some(result)
    }

    /// Starts the periodic loop. Returns `None` when disabled.
    pub fn start(self, mut shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        let period = match self.state {
            SchedulerState::Disabled => {
                info!(component = "scheduler", "periodic scanning disabled");
                return None;
            }
            SchedulerState::Armed { interval } => interval.min(MAX_TICK_PERIOD),
        };
        info!(
            component = "scheduler",
            interval_secs = period.as_secs(),
            "periodic scanning enabled"
        );

        Some(tokio::spawn(async move {
            let now = Instant::now();
            let first = now.checked_add(period).unwrap_or(now);
            let mut ticker = interval_at(first, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // Scans run detached so an overrunning one is observed
                        // by the guard in `tick` on the next beat
                        let scheduler = self.clone();
                        tokio::spawn(async move {
                            scheduler.tick().await;
                        });
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!(component = "scheduler", "stopping");
                            break;
                        }
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DetectionConfig;
    use crate::db::{establish_connection_with_config, run_migrations, DbConfig, DbPool};
    use crate::entities::telemetry_event::Model as TelemetryModel;
    use crate::repositories::TelemetryRepository;
    use crate::task_queue::{InMemoryTaskQueue, TaskKind, TaskQueueError};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use mockall::mock;

    mock! {
        pub Queue {}

        #[async_trait]
        impl TaskQueue for Queue {
            async fn enqueue(&self, task: TaskEnvelope) -> Result<(), TaskQueueError>;
            async fn dequeue(
                &self,
                timeout: Duration,
            ) -> Result<Option<TaskEnvelope>, TaskQueueError>;
            async fn ack(&self, task: &TaskEnvelope) -> Result<(), TaskQueueError>;
            async fn nack(&self, task: &TaskEnvelope) -> Result<bool, TaskQueueError>;
            async fn len(&self) -> Result<usize, TaskQueueError>;
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_750_000_000, 0).unwrap()
    }

    async fn seeded_pool() -> Arc<DbPool> {
        let pool = Arc::new(
            establish_connection_with_config(&DbConfig::in_memory_sqlite())
                .await
                .unwrap(),
        );
        run_migrations(&pool).await.unwrap();
        TelemetryRepository::new(pool.clone())
            .insert_samples(vec![
                TelemetryModel::new("rocket-1", "engine_temp", now(), 1.0),
                TelemetryModel::new("rocket-2", "engine_temp", now(), 1.0),
                TelemetryModel::new("rocket-3", "engine_temp", now(), 1.0),
            ])
            .await
            .unwrap();
        pool
    }

    fn armed_config() -> DetectionConfig {
        DetectionConfig {
            schedule_enabled: true,
            ..DetectionConfig::default()
        }
    }

    #[tokio::test]
    async fn enqueue_failure_for_one_pair_does_not_stop_the_scan() {
        let pool = seeded_pool().await;

        let mut queue = MockQueue::new();
        queue.expect_enqueue().times(3).returning(|task| match &task.kind {
            TaskKind::Detect { asset_id, .. } if asset_id == "rocket-2" => {
                Err(TaskQueueError::ConnectionError("broker down".into()))
            }
            _ => Ok(()),
        });

        let config = armed_config();
        let ctx = DetectionContext::new(pool, Arc::new(queue), config);
        let scheduler = Scheduler::from_context(&ctx);

        let summary = scheduler.scan_once_at(now()).await.unwrap();
        assert_eq!(summary, ScanSummary { pairs_found: 3, enqueued: 2 });
        assert_eq!(summary.failed(), 1);
        assert_eq!(
            summary.status(),
            "Enqueued 2 anomaly detection tasks from 3 distinct pairs."
        );
    }

    #[tokio::test]
    async fn empty_window_enqueues_nothing() {
        let pool = Arc::new(
            establish_connection_with_config(&DbConfig::in_memory_sqlite())
                .await
                .unwrap(),
        );
        run_migrations(&pool).await.unwrap();

        let mut queue = MockQueue::new();
        queue.expect_enqueue().never();

        let ctx = DetectionContext::new(pool, Arc::new(queue), armed_config());
        let summary = Scheduler::from_context(&ctx).scan_once().await.unwrap();
        assert_eq!(summary.status(), "No recent asset/metric pairs to scan.");
    }

    #[tokio::test]
    async fn tick_is_skipped_while_a_scan_is_in_flight() {
        let pool = seeded_pool().await;
        let queue = Arc::new(InMemoryTaskQueue::new());
        let ctx = DetectionContext::new(pool, queue.clone(), armed_config());
        let scheduler = Scheduler::from_context(&ctx);

        scheduler.scanning.store(true, Ordering::SeqCst);
        assert!(scheduler.tick().await.is_none());
        assert_eq!(queue.len().await.unwrap(), 0);

        scheduler.scanning.store(false, Ordering::SeqCst);
        assert!(scheduler.tick().await.is_some());
        assert!(!scheduler.scanning.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn disabled_scheduler_does_not_start() {
        let pool = seeded_pool().await;
        let ctx = DetectionContext::new(
            pool,
            Arc::new(InMemoryTaskQueue::new()),
            DetectionConfig::default(),
        );
        let scheduler = Scheduler::from_context(&ctx);
        assert_eq!(scheduler.state(), SchedulerState::Disabled);

        let (_tx, rx) = watch::channel(false);
        assert!(scheduler.start(rx).is_none());
    }

    #[tokio::test]
    async fn oversized_interval_is_clamped_and_stops_cleanly() {
        let pool = seeded_pool().await;
        let queue = Arc::new(InMemoryTaskQueue::new());
        let scheduler = Scheduler::new(
            SchedulerState::Armed {
                interval: Duration::MAX,
            },
            PairScanner::new(pool, chrono::Duration::seconds(600)),
            queue.clone(),
            600,
        );

        let (tx, rx) = watch::channel(false);
        let handle = scheduler.start(rx).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.len().await.unwrap(), 0);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn armed_scheduler_scans_each_interval_until_shutdown() {
        let pool = seeded_pool().await;
        let queue = Arc::new(InMemoryTaskQueue::new());
        let scheduler = Scheduler::new(
            SchedulerState::Armed {
                interval: Duration::from_millis(50),
            },
            PairScanner::new(pool, chrono::Duration::days(365 * 100)),
            queue.clone(),
            600,
        );

        let (tx, rx) = watch::channel(false);
        let handle = scheduler.start(rx).unwrap();

        for _ in 0..100 {
            if queue.len().await.unwrap() >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(queue.len().await.unwrap() >= 3);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
