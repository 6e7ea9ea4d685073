use sea_orm::error::{DbErr, SqlErr};
use std::time::Duration;

use crate::task_queue::TaskQueueError;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sea_orm::error::DbErr),

    #[error("Queue error: {0}")]
    QueueError(#[from] TaskQueueError),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Task timed out after {0:?}")]
    Timeout(Duration),

    #[error("Migration error: {0}")]
    MigrationError(String),
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::SerializationError(err.to_string())
    }
}

pub trait IntoDbErr {
    fn into_db_err(self) -> DbErr;
}

impl IntoDbErr for DbErr {
    fn into_db_err(self) -> DbErr {
        self
    }
}

impl IntoDbErr for String {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self)
    }
}

impl IntoDbErr for &str {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self.to_string())
    }
}

impl ServiceError {
    /// Generic constructor that normalizes any supported database error input.
    pub fn db_error<E: IntoDbErr>(error: E) -> Self {
        ServiceError::DatabaseError(error.into_db_err())
    }

    /// True when the store could not be reached or failed the round-trip.
    /// Workers log these with enough context to replay the pair manually.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Self::DatabaseError(_))
    }

    /// Short machine-friendly label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DatabaseError(_) => "store_unavailable",
            Self::QueueError(_) => "queue",
            Self::SerializationError(_) => "serialization",
            Self::Timeout(_) => "timeout",
            Self::MigrationError(_) => "migration",
        }
    }
}

/// Whether a database error is a unique-constraint violation.
///
/// Drivers disagree on how they surface these, so the structured
/// [`SqlErr`] classification is tried first and the message text second.
pub fn is_unique_violation(err: &DbErr) -> bool {
    if let Some(SqlErr::UniqueConstraintViolation(_)) = err.sql_err() {
        return true;
    }
    let message = err.to_string();
    message.contains("UNIQUE constraint failed")
        || message.contains("duplicate key value violates unique constraint")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_error_wraps_strings() {
        let err = ServiceError::db_error("connection refused");
        assert!(err.is_store_unavailable());
        assert_eq!(err.kind(), "store_unavailable");
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn timeout_is_not_a_store_error() {
        let err = ServiceError::Timeout(Duration::from_secs(5));
        assert!(!err.is_store_unavailable());
        assert_eq!(err.kind(), "timeout");
        assert_eq!(err.to_string(), "Task timed out after 5s");
    }

    #[test]
    fn unique_violation_detected_from_message() {
        let sqlite = DbErr::Custom("UNIQUE constraint failed: anomaly_records.telemetry_id".into());
        let postgres = DbErr::Custom(
            "duplicate key value violates unique constraint \"idx_anomaly_records_telemetry_id\""
                .into(),
        );
        assert!(is_unique_violation(&sqlite));
        assert!(is_unique_violation(&postgres));
        assert!(!is_unique_violation(&DbErr::Custom("connection reset".into())));
    }

    #[test]
    fn json_errors_convert() {
        let err: ServiceError = serde_json::from_str::<u32>("not json").unwrap_err().into();
        assert_eq!(err.kind(), "serialization");
        assert!(!err.is_store_unavailable());
    }

    #[test]
    fn queue_errors_convert() {
        let err: ServiceError = TaskQueueError::QueueFull.into();
        assert_eq!(err.kind(), "queue");
    }
}
