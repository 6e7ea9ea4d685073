use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const CONFIG_DIR: &str = "config";
const DEFAULT_Z_SCORE_THRESHOLD: f64 = 3.0;
const DEFAULT_WINDOW_SIZE_SECS: u64 = 600; // 10 minutes
const DEFAULT_MIN_SAMPLE_COUNT: usize = 10;
const DEFAULT_SCHEDULE_INTERVAL_SECS: u64 = 300;
const DEFAULT_WORKER_CONCURRENCY: usize = 4;
const DEFAULT_QUEUE_POLL_TIMEOUT_SECS: u64 = 1;
const DEFAULT_TASK_QUEUE_BACKEND: &str = "in-memory";
const DEFAULT_TASK_QUEUE_NAMESPACE: &str = "telemetry:tasks";
const DEFAULT_TASK_QUEUE_CAPACITY: usize = 10_000;
/// Upper bound for window and interval settings: one year
const MAX_PERIOD_SECS: u64 = 31_536_000;

/// Anomaly detection and scheduling settings.
///
/// Read once at process start; components receive it through
/// [`crate::context::DetectionContext`] and never mutate it.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct DetectionConfig {
    /// |z| strictly above this value is an anomaly
    #[serde(default = "default_z_score_threshold")]
    #[validate(custom = "validate_threshold")]
    pub z_score_threshold: f64,

    /// Trailing window for both detection and pair discovery (seconds)
    #[serde(default = "default_window_size_secs")]
    #[validate(range(min = 1, max = 31536000))]
    pub window_size_secs: u64,

    /// Windows with fewer samples are skipped as insufficient data
    #[serde(default = "default_min_sample_count")]
    #[validate(range(min = 2))]
    pub min_sample_count: usize,

    /// Arms the periodic scanner
    #[serde(default)]
    pub schedule_enabled: bool,

    /// Seconds between scheduler ticks
    #[serde(default = "default_schedule_interval_secs")]
    #[validate(range(min = 1, max = 31536000))]
    pub schedule_interval_secs: u64,

    /// Number of concurrent detection workers
    #[serde(default = "default_worker_concurrency")]
    #[validate(range(min = 1))]
    pub worker_concurrency: usize,

    /// Per-task deadline (seconds); unset derives it from window and interval
    #[serde(default)]
    pub task_timeout_secs: Option<u64>,

    /// How long an idle worker waits on the queue before re-checking shutdown
    #[serde(default = "default_queue_poll_timeout_secs")]
    #[validate(range(min = 1, max = 3600))]
    pub queue_poll_timeout_secs: u64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            z_score_threshold: default_z_score_threshold(),
            window_size_secs: default_window_size_secs(),
            min_sample_count: default_min_sample_count(),
            schedule_enabled: false,
            schedule_interval_secs: default_schedule_interval_secs(),
            worker_concurrency: default_worker_concurrency(),
            task_timeout_secs: None,
            queue_poll_timeout_secs: default_queue_poll_timeout_secs(),
        }
    }
}

impl DetectionConfig {
    /// Window length, clamped to one year for configs that skipped validation.
    pub fn window_size(&self) -> Duration {
        Duration::from_secs(self.window_size_secs.min(MAX_PERIOD_SECS))
    }

    /// Tick period, clamped like [`Self::window_size`].
    pub fn schedule_interval(&self) -> Duration {
        Duration::from_secs(self.schedule_interval_secs.min(MAX_PERIOD_SECS))
    }

    pub fn queue_poll_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_poll_timeout_secs)
    }

    /// Deadline for one detection task.
    ///
    /// Falls back to the shorter of the window and the schedule interval so a
    /// slow pair can never hold a worker past the next scan.
    pub fn task_timeout(&self) -> Duration {
        match self.task_timeout_secs {
            Some(secs) if secs > 0 => Duration::from_secs(secs),
            _ => self.window_size().min(self.schedule_interval()),
        }
    }

    /// Window length as a chrono duration for timestamp arithmetic.
    pub fn window_span(&self) -> chrono::Duration {
        i64::try_from(self.window_size_secs.min(MAX_PERIOD_SECS))
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or_else(chrono::Duration::zero)
    }
}

/// Task queue backend settings
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct TaskQueueConfig {
    /// Backend selection ("in-memory" or "redis")
    #[serde(default = "default_task_queue_backend")]
    #[validate(custom = "validate_task_queue_backend")]
    pub backend: String,

    /// Namespace prefix for Redis keys
    #[serde(default = "default_task_queue_namespace")]
    pub namespace: String,

    /// Maximum pending tasks held by the in-memory backend
    #[serde(default = "default_task_queue_capacity")]
    #[validate(range(min = 1))]
    pub capacity: usize,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            backend: default_task_queue_backend(),
            namespace: default_task_queue_namespace(),
            capacity: default_task_queue_capacity(),
        }
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Redis connection URL (task queue broker)
    pub redis_url: String,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB timeouts (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Anomaly detection settings
    #[serde(default)]
    pub anomaly: DetectionConfig,

    /// Task queue settings
    #[serde(default)]
    pub task_queue: TaskQueueConfig,
}

impl AppConfig {
    /// Creates a new configuration with default detection settings
    pub fn new(database_url: String, redis_url: String, environment: String) -> Self {
        Self {
            database_url,
            redis_url,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            anomaly: DetectionConfig::default(),
            task_queue: TaskQueueConfig::default(),
        }
    }

    /// Gets log level reference
    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    /// Runs field validation on the top level and every nested section.
    pub fn validate_all(&self) -> Result<(), ValidationErrors> {
        self.validate()?;
        self.anomaly.validate()?;
        self.task_queue.validate()?;
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Default value functions
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_z_score_threshold() -> f64 {
    DEFAULT_Z_SCORE_THRESHOLD
}

fn default_window_size_secs() -> u64 {
    DEFAULT_WINDOW_SIZE_SECS
}

fn default_min_sample_count() -> usize {
    DEFAULT_MIN_SAMPLE_COUNT
}

fn default_schedule_interval_secs() -> u64 {
    DEFAULT_SCHEDULE_INTERVAL_SECS
}

fn default_worker_concurrency() -> usize {
    DEFAULT_WORKER_CONCURRENCY
}

fn default_queue_poll_timeout_secs() -> u64 {
    DEFAULT_QUEUE_POLL_TIMEOUT_SECS
}

fn default_task_queue_backend() -> String {
    DEFAULT_TASK_QUEUE_BACKEND.to_string()
}

fn default_task_queue_namespace() -> String {
    DEFAULT_TASK_QUEUE_NAMESPACE.to_string()
}

fn default_task_queue_capacity() -> usize {
    DEFAULT_TASK_QUEUE_CAPACITY
}

fn default_db_max_connections() -> u32 {
    16
}
fn default_db_min_connections() -> u32 {
    2
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}

fn validate_threshold(value: f64) -> Result<(), ValidationError> {
    if !value.is_finite() || value <= 0.0 {
        let mut err = ValidationError::new("z_score_threshold");
        err.message = Some("z_score_threshold must be a finite value greater than 0".into());
        return Err(err);
    }
    Ok(())
}

fn validate_task_queue_backend(value: &str) -> Result<(), ValidationError> {
    match value.to_ascii_lowercase().as_str() {
        "in-memory" | "redis" => Ok(()),
        _ => {
            let mut err = ValidationError::new("backend");
            err.message = Some("Must be one of: in-memory, redis".into());
            Err(err)
        }
    }
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

/// Initializes tracing using the provided log level as the default filter.
///
/// `json` switches the formatter to newline-delimited JSON so the same
/// events can feed a log pipeline without a second code path.
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("telemetry_anomaly={},sea_orm=warn", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .json()
            .try_init();
    } else {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*, nested with `__`, e.g. APP__ANOMALY__Z_SCORE_THRESHOLD)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    load_config_from(Path::new(CONFIG_DIR))
}

/// Same as [`load_config`] with an explicit config directory.
pub fn load_config_from(config_dir: &Path) -> Result<AppConfig, AppConfigError> {
    // Support both RUN_ENV and APP_ENV for selecting config profile
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !config_dir.exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            config_dir.display()
        );
    }

    let config = Config::builder()
        .set_default("database_url", "sqlite://telemetry.db?mode=rwc")?
        .set_default("redis_url", "redis://localhost:6379/0")?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(
            File::with_name(&config_dir.join("default").to_string_lossy()).required(false),
        )
        .add_source(File::with_name(&config_dir.join(&run_env).to_string_lossy()).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate_all().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!(
        threshold = app_config.anomaly.z_score_threshold,
        window_secs = app_config.anomaly.window_size_secs,
        min_samples = app_config.anomaly.min_sample_count,
        schedule_enabled = app_config.anomaly.schedule_enabled,
        interval_secs = app_config.anomaly.schedule_interval_secs,
        "Configuration loaded successfully"
    );
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detection_defaults_match_documented_values() {
        let cfg = DetectionConfig::default();
        assert_eq!(cfg.z_score_threshold, 3.0);
        assert_eq!(cfg.window_size(), Duration::from_secs(600));
        assert_eq!(cfg.min_sample_count, 10);
        assert!(!cfg.schedule_enabled);
        assert_eq!(cfg.schedule_interval(), Duration::from_secs(300));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn task_timeout_defaults_to_shorter_of_window_and_interval() {
        let mut cfg = DetectionConfig::default();
        assert_eq!(cfg.task_timeout(), Duration::from_secs(300));

        cfg.window_size_secs = 120;
        assert_eq!(cfg.task_timeout(), Duration::from_secs(120));

        cfg.task_timeout_secs = Some(15);
        assert_eq!(cfg.task_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn rejects_non_positive_threshold() {
        let mut cfg = DetectionConfig::default();
        cfg.z_score_threshold = 0.0;
        assert!(cfg.validate().is_err());

        cfg.z_score_threshold = f64::NAN;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_min_sample_count_below_two() {
        let mut cfg = DetectionConfig::default();
        cfg.min_sample_count = 1;
        let errors = cfg.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("min_sample_count"));
    }

    #[test]
    fn rejects_periods_longer_than_a_year() {
        let mut cfg = DetectionConfig::default();
        cfg.window_size_secs = u64::MAX;
        let errors = cfg.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("window_size_secs"));

        let mut cfg = DetectionConfig::default();
        cfg.schedule_interval_secs = 1 << 62;
        let errors = cfg.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("schedule_interval_secs"));

        let mut cfg = DetectionConfig::default();
        cfg.queue_poll_timeout_secs = u64::MAX;
        let errors = cfg.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("queue_poll_timeout_secs"));

        let mut cfg = DetectionConfig::default();
        cfg.window_size_secs = MAX_PERIOD_SECS;
        cfg.schedule_interval_secs = MAX_PERIOD_SECS;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn spans_stay_positive_for_unvalidated_values() {
        let mut cfg = DetectionConfig::default();
        cfg.window_size_secs = u64::MAX;
        cfg.schedule_interval_secs = 1 << 62;

        let year = MAX_PERIOD_SECS as i64;
        assert_eq!(cfg.window_span(), chrono::Duration::seconds(year));
        assert_eq!(cfg.window_size(), Duration::from_secs(MAX_PERIOD_SECS));
        assert_eq!(cfg.schedule_interval(), Duration::from_secs(MAX_PERIOD_SECS));
    }

    #[test]
    fn rejects_unknown_queue_backend() {
        let mut cfg = AppConfig::new(
            "sqlite::memory:".into(),
            "redis://127.0.0.1:6379".into(),
            "test".into(),
        );
        assert!(cfg.validate_all().is_ok());

        cfg.task_queue.backend = "rabbitmq".into();
        assert!(cfg.validate_all().is_err());
    }

    #[test]
    fn loads_detection_section_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("default.toml"),
            r#"
                database_url = "sqlite::memory:"
                log_level = "debug"

                [anomaly]
                z_score_threshold = 2.5
                window_size_secs = 60
                schedule_enabled = true
                schedule_interval_secs = 30
            "#,
        )
        .unwrap();

        let cfg = load_config_from(dir.path()).unwrap();
        assert_eq!(cfg.database_url, "sqlite::memory:");
        assert_eq!(cfg.log_level(), "debug");
        assert_eq!(cfg.anomaly.z_score_threshold, 2.5);
        assert_eq!(cfg.anomaly.window_size_secs, 60);
        assert_eq!(cfg.anomaly.min_sample_count, 10);
        assert!(cfg.anomaly.schedule_enabled);
        assert_eq!(cfg.anomaly.schedule_interval_secs, 30);
        assert_eq!(cfg.task_queue.backend, "in-memory");
    }
}
