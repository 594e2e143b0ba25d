//! Server configuration, loaded from environment variables.

use std::time::Duration;

use oxbow_core::{Error, Result};

/// Configuration for the Oxbow API server and its embedded worker pool.
#[derive(Clone)]
pub struct Config {
    /// HTTP server port (`OXBOW_HTTP_PORT`).
    pub http_port: u16,

    /// Enable debug mode (`OXBOW_DEBUG`).
    ///
    /// When enabled:
    /// - logs are pretty-printed instead of JSON
    /// - requests without an `Authorization` header are treated as admin
    ///   (dev/tests only)
    /// - `API_KEY_SALT` and `WEBHOOK_SECRET` may be omitted
    pub debug: bool,

    /// CORS allowlist (`OXBOW_CORS_ALLOWED_ORIGINS`, comma-separated).
    /// Empty means CORS headers are not emitted.
    pub cors_allowed_origins: Vec<String>,

    /// Concurrent worker slots per process (`MAX_CONCURRENCY`).
    pub max_concurrency: usize,

    /// Dispatcher loops spawned in this process (`WORKER_REPLICAS`).
    pub worker_replicas: usize,

    /// Lock TTL and heartbeat base (`TASK_LEASE_SECONDS`).
    pub task_lease: Duration,

    /// Retry budget per task (`TASK_MAX_RETRIES`).
    pub task_max_retries: u32,

    /// Backoff cap (`TASK_BACKOFF_MAX_SEC`).
    pub task_backoff_max: Duration,

    /// Per-provider daily budget (`MODEL_DAILY_BUDGET_USD`).
    pub daily_budget_usd: f64,

    /// Admission cap on queue depth (`MAX_QUEUE_DEPTH`).
    pub max_queue_depth: usize,

    /// Failure rate tripping a circuit (`CIRCUIT_BREAKER_THRESHOLD`).
    pub circuit_breaker_threshold: f64,

    /// Initial circuit open duration (`CIRCUIT_BREAKER_TIMEOUT`, seconds).
    pub circuit_breaker_timeout: Duration,

    /// Salt for API key hashing (`API_KEY_SALT`). Required unless debug.
    pub api_key_salt: String,

    /// Shared secret for webhook HMAC (`WEBHOOK_SECRET`). Required unless
    /// debug.
    pub webhook_secret: String,

    /// Grace for in-flight handlers at shutdown
    /// (`OXBOW_SHUTDOWN_GRACE_SECONDS`); defaults to the task lease.
    pub shutdown_grace: Option<Duration>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("http_port", &self.http_port)
            .field("debug", &self.debug)
            .field("cors_allowed_origins", &self.cors_allowed_origins)
            .field("max_concurrency", &self.max_concurrency)
            .field("worker_replicas", &self.worker_replicas)
            .field("task_lease", &self.task_lease)
            .field("task_max_retries", &self.task_max_retries)
            .field("task_backoff_max", &self.task_backoff_max)
            .field("daily_budget_usd", &self.daily_budget_usd)
            .field("max_queue_depth", &self.max_queue_depth)
            .field("circuit_breaker_threshold", &self.circuit_breaker_threshold)
            .field("circuit_breaker_timeout", &self.circuit_breaker_timeout)
            .field("api_key_salt", &"[REDACTED]")
            .field("webhook_secret", &"[REDACTED]")
            .field("shutdown_grace", &self.shutdown_grace)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 8080,
            debug: false,
            cors_allowed_origins: Vec::new(),
            max_concurrency: 8,
            worker_replicas: 1,
            task_lease: Duration::from_secs(900),
            task_max_retries: 3,
            task_backoff_max: Duration::from_secs(60),
            daily_budget_usd: 100.0,
            max_queue_depth: 10_000,
            circuit_breaker_threshold: 0.1,
            circuit_breaker_timeout: Duration::from_secs(600),
            api_key_salt: String::new(),
            webhook_secret: String::new(),
            shutdown_grace: None,
        }
    }
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `OXBOW_HTTP_PORT` (default: 8080)
    /// - `OXBOW_DEBUG` (default: false)
    /// - `OXBOW_CORS_ALLOWED_ORIGINS` (comma-separated)
    /// - `MAX_CONCURRENCY` (default: 8)
    /// - `WORKER_REPLICAS` (default: 1)
    /// - `TASK_LEASE_SECONDS` (default: 900)
    /// - `TASK_MAX_RETRIES` (default: 3)
    /// - `TASK_BACKOFF_MAX_SEC` (default: 60)
    /// - `MODEL_DAILY_BUDGET_USD` (default: 100.0)
    /// - `MAX_QUEUE_DEPTH` (default: 10000)
    /// - `CIRCUIT_BREAKER_THRESHOLD` (default: 0.1)
    /// - `CIRCUIT_BREAKER_TIMEOUT` (seconds, default: 600)
    /// - `API_KEY_SALT` (required when `OXBOW_DEBUG=false`)
    /// - `WEBHOOK_SECRET` (required when `OXBOW_DEBUG=false`)
    /// - `OXBOW_SHUTDOWN_GRACE_SECONDS` (default: the task lease)
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is present but unparseable, or if a
    /// required secret is missing outside debug mode.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(port) = env_u16("OXBOW_HTTP_PORT")? {
            config.http_port = port;
        }
        if let Some(debug) = env_bool("OXBOW_DEBUG")? {
            config.debug = debug;
        }
        if let Some(origins) = env_string("OXBOW_CORS_ALLOWED_ORIGINS") {
            config.cors_allowed_origins = origins
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(value) = env_u64("MAX_CONCURRENCY")? {
            config.max_concurrency = value as usize;
        }
        if let Some(value) = env_u64("WORKER_REPLICAS")? {
            config.worker_replicas = (value as usize).max(1);
        }
        if let Some(value) = env_u64("TASK_LEASE_SECONDS")? {
            config.task_lease = Duration::from_secs(value);
        }
        if let Some(value) = env_u64("TASK_MAX_RETRIES")? {
            config.task_max_retries = value as u32;
        }
        if let Some(value) = env_u64("TASK_BACKOFF_MAX_SEC")? {
            config.task_backoff_max = Duration::from_secs(value);
        }
        if let Some(value) = env_f64("MODEL_DAILY_BUDGET_USD")? {
            config.daily_budget_usd = value;
        }
        if let Some(value) = env_u64("MAX_QUEUE_DEPTH")? {
            config.max_queue_depth = value as usize;
        }
        if let Some(value) = env_f64("CIRCUIT_BREAKER_THRESHOLD")? {
            config.circuit_breaker_threshold = value;
        }
        if let Some(value) = env_u64("CIRCUIT_BREAKER_TIMEOUT")? {
            config.circuit_breaker_timeout = Duration::from_secs(value);
        }
        if let Some(salt) = env_string("API_KEY_SALT") {
            config.api_key_salt = salt;
        }
        if let Some(secret) = env_string("WEBHOOK_SECRET") {
            config.webhook_secret = secret;
        }
        if let Some(value) = env_u64("OXBOW_SHUTDOWN_GRACE_SECONDS")? {
            config.shutdown_grace = Some(Duration::from_secs(value));
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates configuration sanity.
    ///
    /// # Errors
    ///
    /// Returns an error when required secrets are missing outside debug
    /// mode, or when numeric settings are out of range.
    pub fn validate(&self) -> Result<()> {
        if !self.debug {
            if self.api_key_salt.trim().is_empty() {
                return Err(Error::InvalidInput(
                    "API_KEY_SALT is required when OXBOW_DEBUG=false".to_string(),
                ));
            }
            if self.webhook_secret.trim().is_empty() {
                return Err(Error::InvalidInput(
                    "WEBHOOK_SECRET is required when OXBOW_DEBUG=false".to_string(),
                ));
            }
        }
        if self.max_concurrency == 0 {
            return Err(Error::InvalidInput(
                "MAX_CONCURRENCY must be greater than zero".to_string(),
            ));
        }
        if self.task_lease.is_zero() {
            return Err(Error::InvalidInput(
                "TASK_LEASE_SECONDS must be greater than zero".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.circuit_breaker_threshold) {
            return Err(Error::InvalidInput(
                "CIRCUIT_BREAKER_THRESHOLD must be between 0 and 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn env_u16(name: &str) -> Result<Option<u16>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be a port number: {e}")))
}

fn env_u64(name: &str) -> Result<Option<u64>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be an integer: {e}")))
}

fn env_f64(name: &str) -> Result<Option<f64>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be a number: {e}")))
}

fn env_bool(name: &str) -> Result<Option<bool>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(Some(true)),
        "0" | "false" | "no" => Ok(Some(false)),
        other => Err(Error::InvalidInput(format!(
            "{name} must be a boolean, got '{other}'"
        ))),
    }
}
