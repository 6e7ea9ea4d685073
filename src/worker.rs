use metrics::{counter, histogram};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::context::DetectionContext;
use crate::errors::ServiceError;
use crate::services::DetectionService;
use crate::task_queue::{TaskEnvelope, TaskKind, TaskQueue};

/// How a dequeued task ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed { task_id: Uuid, status: String },
    Failed {
        task_id: Uuid,
        error: String,
        requeued: bool,
    },
}

/// Runs `fut`, failing with [`ServiceError::Timeout`] once `deadline` passes.
pub async fn with_deadline<T, F>(deadline: Duration, fut: F) -> Result<T, ServiceError>
where
    F: Future<Output = Result<T, ServiceError>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(ServiceError::Timeout(deadline)),
    }
}

/// Fixed-size pool of detection workers draining the task queue.
#[derive(Clone)]
pub struct WorkerPool {
    queue: Arc<dyn TaskQueue>,
    detection: DetectionService,
    concurrency: usize,
    poll_timeout: Duration,
    task_timeout: Duration,
    window_secs: u64,
}

impl WorkerPool {
    pub fn from_context(ctx: &DetectionContext) -> Self {
        Self {
            queue: ctx.queue.clone(),
            detection: ctx.detection_service(),
            concurrency: ctx.config.worker_concurrency.max(1),
            poll_timeout: ctx.config.queue_poll_timeout(),
            task_timeout: ctx.config.task_timeout(),
            window_secs: ctx.config.window_size_secs,
        }
    }

    /// Spawns the workers. Each exits once `shutdown` carries `true`, after
    /// finishing its current task.
    pub fn start(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        info!(
            workers = self.concurrency,
            task_timeout_secs = self.task_timeout.as_secs(),
            "Starting detection workers"
        );

        (0..self.concurrency)
            .map(|worker_id| {
                let pool = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { pool.run_worker(worker_id, shutdown).await })
            })
            .collect()
    }

    async fn run_worker(self, worker_id: usize, shutdown: watch::Receiver<bool>) {
        debug!(worker_id, "Worker started");
        while !*shutdown.borrow() {
            if let Err(e) = self.process_next().await {
                error!(worker_id, error = %e, "Worker failed to talk to the queue");
                tokio::time::sleep(self.poll_timeout).await;
            }
        }
        debug!(worker_id, "Worker stopped");
    }

    /// Dequeues and runs at most one task. `Ok(None)` means the queue stayed
    /// empty for the poll timeout.
    pub async fn process_next(&self) -> Result<Option<TaskOutcome>, ServiceError> {
        let Some(task) = self.queue.dequeue(self.poll_timeout).await? else {
            return Ok(None);
        };

        let started = Instant::now();
        let result = self.execute(&task).await;
        histogram!("anomaly_scanner.task.duration", started.elapsed().as_secs_f64());

        let outcome = match result {
            Ok(status) => {
                self.queue.ack(&task).await?;
                counter!("anomaly_scanner.task.completed", 1);
                TaskOutcome::Completed {
                    task_id: task.id,
                    status,
                }
            }
            Err(e) => {
                let TaskKind::Detect { asset_id, metric } = &task.kind;
                error!(
                    task_id = %task.id,
                    task = task.name(),
                    asset_id = %asset_id,
                    metric = %metric,
                    window_seconds = self.window_secs,
                    retry = task.retry_count,
                    store_unavailable = e.is_store_unavailable(),
                    error = %e,
                    "Task failed"
                );
                counter!("anomaly_scanner.task.failed", 1, "kind" => e.kind());

                let requeued = self.queue.nack(&task).await?;
                if !requeued {
                    warn!(
                        task_id = %task.id,
                        asset_id = %asset_id,
                        metric = %metric,
                        "Task abandoned"
                    );
                }
                TaskOutcome::Failed {
                    task_id: task.id,
                    error: e.to_string(),
                    requeued,
                }
            }
        };

        Ok(Some(outcome))
    }

    async fn execute(&self, task: &TaskEnvelope) -> Result<String, ServiceError> {
        match &task.kind {
            TaskKind::Detect { asset_id, metric } => {
                let report =
                    with_deadline(self.task_timeout, self.detection.detect(asset_id, metric))
                        .await?;
                Ok(report.status())
            }
        }
    }
}
