/*!
 * # Task Queue
 *
 * Work distribution between the scheduler (producer) and the detection
 * workers (consumers). Each task is scoped to one `(asset_id, metric)` pair.
 *
 * Two backends are provided: an in-process queue and a Redis list queue with
 * a processing list for at-least-once delivery. Redelivery after a `nack` is
 * the queue's own policy, bounded by the envelope's `max_retries`.
 */

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use strum::{Display, EnumString};
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::AppConfig;

/// Name under which detection tasks are registered.
pub const DETECT_TASK: &str = "detect";

const DEFAULT_MAX_RETRIES: u32 = 3;

/// Task queue errors
#[derive(Error, Debug)]
pub enum TaskQueueError {
    #[error("Queue is full")]
    QueueFull,
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Connection error: {0}")]
    ConnectionError(String),
}

impl From<redis::RedisError> for TaskQueueError {
    fn from(err: redis::RedisError) -> Self {
        TaskQueueError::ConnectionError(err.to_string())
    }
}

impl From<serde_json::Error> for TaskQueueError {
    fn from(err: serde_json::Error) -> Self {
        TaskQueueError::SerializationError(err.to_string())
    }
}

/// The unit of work a worker knows how to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "task", content = "args", rename_all = "snake_case")]
pub enum TaskKind {
    /// Window fetch, detection and persistence for one pair
    Detect { asset_id: String, metric: String },
}

impl TaskKind {
    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::Detect { .. } => DETECT_TASK,
        }
    }
}

/// Envelope for queued tasks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub id: Uuid,
    pub kind: TaskKind,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl TaskEnvelope {
    pub fn new(kind: TaskKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            enqueued_at: Utc::now(),
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// `detect(asset_id, metric)`
    pub fn detect(asset_id: impl Into<String>, metric: impl Into<String>) -> Self {
        Self::new(TaskKind::Detect {
            asset_id: asset_id.into(),
            metric: metric.into(),
        })
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// Copy of this envelope for redelivery, or `None` once retries are spent.
    fn redelivery(&self) -> Option<Self> {
        if self.retry_count >= self.max_retries {
            return None;
        }
        let mut next = self.clone();
        next.retry_count += 1;
        Some(next)
    }
}

/// Task queue trait for different implementations
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Submits a task for execution.
    async fn enqueue(&self, task: TaskEnvelope) -> Result<(), TaskQueueError>;

    /// Waits up to `timeout` for the next task.
    async fn dequeue(&self, timeout: Duration) -> Result<Option<TaskEnvelope>, TaskQueueError>;

    /// Marks a dequeued task as done.
    async fn ack(&self, task: &TaskEnvelope) -> Result<(), TaskQueueError>;

    /// Marks a dequeued task as failed. Returns whether it was requeued.
    async fn nack(&self, task: &TaskEnvelope) -> Result<bool, TaskQueueError>;

    /// Number of tasks waiting to be dequeued.
    async fn len(&self) -> Result<usize, TaskQueueError>;
}

/// Supported queue backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum QueueBackend {
    InMemory,
    Redis,
}

/// In-memory task queue implementation
#[derive(Debug)]
pub struct InMemoryTaskQueue {
    pending: Mutex<VecDeque<TaskEnvelope>>,
    in_flight: DashMap<Uuid, TaskEnvelope>,
    notify: Notify,
    max_size: usize,
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::with_max_size(10_000)
    }

    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            in_flight: DashMap::new(),
            notify: Notify::new(),
            max_size,
        }
    }

    /// Tasks handed to a worker and not yet acked or nacked.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

impl Default for InMemoryTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, task: TaskEnvelope) -> Result<(), TaskQueueError> {
        {
            let mut pending = self.pending.lock().await;
            if pending.len() >= self.max_size {
                return Err(TaskQueueError::QueueFull);
            }
            pending.push_back(task);
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<TaskEnvelope>, TaskQueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            // Enabled before the check so an enqueue in between wakes us
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(task) = self.pending.lock().await.pop_front() {
                self.in_flight.insert(task.id, task.clone());
                return Ok(Some(task));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || tokio::time::timeout(remaining, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, task: &TaskEnvelope) -> Result<(), TaskQueueError> {
        self.in_flight.remove(&task.id);
        Ok(())
    }

    async fn nack(&self, task: &TaskEnvelope) -> Result<bool, TaskQueueError> {
        // The task stays in flight if the redelivery cannot be queued
        let requeued = match task.redelivery() {
            Some(next) => {
                self.enqueue(next).await?;
                true
            }
            None => {
                warn!(
                    task_id = %task.id,
                    task = task.name(),
                    retries = task.retry_count,
                    "Dropping task after max retries"
                );
                false
            }
        };
        self.in_flight.remove(&task.id);
        Ok(requeued)
    }

    async fn len(&self) -> Result<usize, TaskQueueError> {
        Ok(self.pending.lock().await.len())
    }
}

/// Redis list-backed task queue.
///
/// Producers `LPUSH` onto `{namespace}:pending`; consumers `BRPOPLPUSH` into
/// `{namespace}:processing` and remove the entry on ack/nack, so a crashed
/// worker leaves its task visible in the processing list.
#[derive(Debug)]
pub struct RedisTaskQueue {
    client: Arc<redis::Client>,
    pending_key: String,
    processing_key: String,
    // Raw payloads of dequeued tasks, needed for LREM on ack/nack
    in_flight: DashMap<Uuid, String>,
}

impl RedisTaskQueue {
    /// Creates the queue and verifies the broker is reachable.
    pub async fn new(
        client: Arc<redis::Client>,
        namespace: String,
    ) -> Result<Self, TaskQueueError> {
        let mut conn = client.get_async_connection().await?;
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;

        Ok(Self {
            client,
            pending_key: format!("{}:pending", namespace),
            processing_key: format!("{}:processing", namespace),
            in_flight: DashMap::new(),
        })
    }

    async fn release(&self, task: &TaskEnvelope) -> Result<(), TaskQueueError> {
        if let Some((_, raw)) = self.in_flight.remove(&task.id) {
            let mut conn = self.client.get_async_connection().await?;
            redis::cmd("LREM")
                .arg(&self.processing_key)
                .arg(1)
                .arg(raw)
                .query_async::<_, i64>(&mut conn)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn enqueue(&self, task: TaskEnvelope) -> Result<(), TaskQueueError> {
        let payload = serde_json::to_string(&task)?;
        let mut conn = self.client.get_async_connection().await?;
        redis::cmd("LPUSH")
            .arg(&self.pending_key)
            .arg(payload)
            .query_async::<_, i64>(&mut conn)
            .await?;
        debug!(task_id = %task.id, task = task.name(), "Enqueued task to Redis");
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<TaskEnvelope>, TaskQueueError> {
        let mut conn = self.client.get_async_connection().await?;
        let block_secs = timeout.as_secs().max(1);
        let raw: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(&self.pending_key)
            .arg(&self.processing_key)
            .arg(block_secs)
            .query_async(&mut conn)
            .await?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        match serde_json::from_str::<TaskEnvelope>(&raw) {
            Ok(task) => {
                self.in_flight.insert(task.id, raw);
                Ok(Some(task))
            }
            Err(err) => {
                error!("Discarding undecodable task payload: {}", err);
                redis::cmd("LREM")
                    .arg(&self.processing_key)
                    .arg(1)
                    .arg(&raw)
                    .query_async::<_, i64>(&mut conn)
                    .await?;
                Err(err.into())
            }
        }
    }

    async fn ack(&self, task: &TaskEnvelope) -> Result<(), TaskQueueError> {
        self.release(task).await
    }

    async fn nack(&self, task: &TaskEnvelope) -> Result<bool, TaskQueueError> {
        // Redelivery goes out first so a failed LPUSH leaves the original in
        // the processing list
        let requeued = match task.redelivery() {
            Some(next) => {
                self.enqueue(next).await?;
                true
            }
            None => {
                warn!(
                    task_id = %task.id,
                    task = task.name(),
                    retries = task.retry_count,
                    "Dropping task after max retries"
                );
                false
            }
        };
        self.release(task).await?;
        Ok(requeued)
    }

    async fn len(&self) -> Result<usize, TaskQueueError> {
        let mut conn = self.client.get_async_connection().await?;
        let len: usize = redis::cmd("LLEN")
            .arg(&self.pending_key)
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }
}

/// Builds the queue selected by configuration, falling back to the in-memory
/// backend when Redis cannot be reached.
pub async fn from_config(cfg: &AppConfig) -> Arc<dyn TaskQueue> {
    let backend = QueueBackend::from_str(&cfg.task_queue.backend).unwrap_or(QueueBackend::InMemory);
    match backend {
        QueueBackend::Redis => {
            let client = match redis::Client::open(cfg.redis_url.clone()) {
                Ok(client) => Arc::new(client),
                Err(err) => {
                    error!(
                        "Invalid Redis URL for task queue (falling back to in-memory): {}",
                        err
                    );
                    return Arc::new(InMemoryTaskQueue::with_max_size(cfg.task_queue.capacity));
                }
            };
            match RedisTaskQueue::new(client, cfg.task_queue.namespace.clone()).await {
                Ok(queue) => Arc::new(queue),
                Err(err) => {
                    error!(
                        "Failed to initialize Redis task queue (falling back to in-memory): {}",
                        err
                    );
                    Arc::new(InMemoryTaskQueue::with_max_size(cfg.task_queue.capacity))
                }
            }
        }
        QueueBackend::InMemory => {
            Arc::new(InMemoryTaskQueue::with_max_size(cfg.task_queue.capacity))
        }
    }
}
