//! Configuration management with environment variable support and validation.

use anyhow::{anyhow, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_request_size_mb: usize,
    pub rate_limit_per_minute: u32,
    pub enable_cors: bool,
    pub cors_origins: Vec<String>,
    /// Seconds to wait for in-flight batches after shutdown is signaled.
    pub shutdown_grace_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            max_request_size_mb: 5,
            rate_limit_per_minute: 1_000,
            enable_cors: true,
            cors_origins: vec!["*".to_string()],
            shutdown_grace_seconds: 5,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "text"
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

/// Batch formation and dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    /// Upper bound of one batch.
    pub max_batch_size: usize,
    /// Max seconds to wait growing a partial batch, measured from the first
    /// drained task.
    pub batch_wait_timeout_seconds: f64,
    /// Dispatcher parallelism.
    pub max_concurrent_batches: usize,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 32,
            batch_wait_timeout_seconds: 0.1,
            max_concurrent_batches: 4,
        }
    }
}

impl BatchingConfig {
    pub fn batch_wait_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.batch_wait_timeout_seconds)
    }
}

/// Priority queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_depth: usize,
    /// Hint returned in `Retry-After` when the queue is full.
    pub retry_after_seconds: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_depth: 10_000,
            retry_after_seconds: 1,
        }
    }
}

/// Engine adapter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Choose the real upstream adapter instead of the deterministic mock.
    pub use_real_vllm: bool,
    pub real_vllm_url: Option<String>,
    /// Default model name forwarded to the upstream and stamped on tasks
    /// that do not name one.
    pub real_vllm_model: String,
    /// Per-task upstream call timeout.
    pub request_timeout_seconds: u64,
    /// Substitute a mock response when an individual upstream call fails.
    pub mock_fallback: bool,
    pub mock_base_latency_ms: u64,
    pub mock_per_item_latency_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            use_real_vllm: false,
            real_vllm_url: None,
            real_vllm_model: "mock-model".to_string(),
            request_timeout_seconds: 60,
            mock_fallback: true,
            mock_base_latency_ms: 500,
            mock_per_item_latency_ms: 50,
        }
    }
}

impl EngineConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

/// A seeded credential: username plus argon2 PHC password hash
/// (generate hashes with `batchgate hash-password`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserCredential {
    pub username: String,
    pub password_hash: String,
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub jwt_secret: Option<String>,
    pub jwt_algorithm: String,
    pub jwt_expiration_minutes: i64,
    pub users: Vec<UserCredential>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            jwt_algorithm: "HS256".to_string(),
            jwt_expiration_minutes: 30,
            users: Vec::new(),
        }
    }
}

/// Task store retention configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub task_retention_seconds: u64,
    pub task_max_retained: usize,
    pub evict_interval_seconds: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            task_retention_seconds: 3_600,
            task_max_retained: 100_000,
            evict_interval_seconds: 30,
        }
    }
}

/// Request validation bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_prompt_chars: usize,
    pub max_batch_request_items: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_prompt_chars: 8_192,
            max_batch_request_items: 100,
        }
    }
}

/// Main settings structure with all configuration sections
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub batching: BatchingConfig,
    pub queue: QueueConfig,
    pub engine: EngineConfig,
    pub auth: AuthConfig,
    pub retention: RetentionConfig,
    pub limits: LimitsConfig,
}

impl Settings {
    /// Load settings from the optional `batchgate.toml` file and the
    /// documented environment variables.
    pub fn load() -> Result<Self> {
        let config = Config::builder()
            .add_source(File::with_name("batchgate").required(false))
            .add_source(
                Environment::with_prefix("BATCHGATE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut settings: Settings = config.try_deserialize()?;

        Self::apply_env_overrides(&mut settings)?;
        settings.validate()?;

        Ok(settings)
    }

    /// Apply the flat environment keys that predate the sectioned config.
    fn apply_env_overrides(settings: &mut Settings) -> Result<()> {
        if let Ok(v) = std::env::var("VLLM_MAX_BATCH_SIZE") {
            settings.batching.max_batch_size = v
                .parse()
                .map_err(|_| anyhow!("VLLM_MAX_BATCH_SIZE must be an integer, got '{v}'"))?;
        }
        if let Ok(v) = std::env::var("VLLM_BATCH_WAIT_TIMEOUT") {
            settings.batching.batch_wait_timeout_seconds = v
                .parse()
                .map_err(|_| anyhow!("VLLM_BATCH_WAIT_TIMEOUT must be seconds, got '{v}'"))?;
        }
        if let Ok(v) = std::env::var("VLLM_MAX_CONCURRENT_BATCHES") {
            settings.batching.max_concurrent_batches = v
                .parse()
                .map_err(|_| anyhow!("VLLM_MAX_CONCURRENT_BATCHES must be an integer, got '{v}'"))?;
        }
        if let Ok(v) = std::env::var("USE_REAL_VLLM") {
            settings.engine.use_real_vllm = matches!(v.as_str(), "1" | "true" | "True" | "TRUE");
        }
        if let Ok(v) = std::env::var("REAL_VLLM_URL") {
            settings.engine.real_vllm_url = Some(v);
        }
        if let Ok(v) = std::env::var("REAL_VLLM_MODEL") {
            settings.engine.real_vllm_model = v;
        }
        if let Ok(v) = std::env::var("JWT_SECRET_KEY") {
            settings.auth.jwt_secret = Some(v);
        }
        if let Ok(v) = std::env::var("JWT_ALGORITHM") {
            settings.auth.jwt_algorithm = v;
        }
        if let Ok(v) = std::env::var("JWT_EXPIRATION_MINUTES") {
            settings.auth.jwt_expiration_minutes = v
                .parse()
                .map_err(|_| anyhow!("JWT_EXPIRATION_MINUTES must be an integer, got '{v}'"))?;
        }
        if let Ok(v) = std::env::var("QUEUE_MAX_DEPTH") {
            settings.queue.max_depth = v
                .parse()
                .map_err(|_| anyhow!("QUEUE_MAX_DEPTH must be an integer, got '{v}'"))?;
        }
        if let Ok(v) = std::env::var("TASK_RETENTION_SECONDS") {
            settings.retention.task_retention_seconds = v
                .parse()
                .map_err(|_| anyhow!("TASK_RETENTION_SECONDS must be an integer, got '{v}'"))?;
        }
        if let Ok(v) = std::env::var("TASK_MAX_RETAINED") {
            settings.retention.task_max_retained = v
                .parse()
                .map_err(|_| anyhow!("TASK_MAX_RETAINED must be an integer, got '{v}'"))?;
        }

        Ok(())
    }

    /// Validate settings for consistency and security
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow!("server port cannot be 0"));
        }

        if self.batching.max_batch_size == 0 {
            return Err(anyhow!("max_batch_size must be at least 1"));
        }
        if self.batching.max_concurrent_batches == 0 {
            return Err(anyhow!("max_concurrent_batches must be at least 1"));
        }
        if self.batching.batch_wait_timeout_seconds < 0.0 {
            return Err(anyhow!("batch_wait_timeout cannot be negative"));
        }

        if self.queue.max_depth == 0 {
            return Err(anyhow!("queue max_depth must be at least 1"));
        }

        if self.engine.use_real_vllm && self.engine.real_vllm_url.is_none() {
            return Err(anyhow!(
                "USE_REAL_VLLM is set but REAL_VLLM_URL is not configured"
            ));
        }

        let jwt_secret = self
            .auth
            .jwt_secret
            .as_deref()
            .ok_or_else(|| anyhow!("JWT_SECRET_KEY must be provided"))?;
        if jwt_secret.len() < 32 {
            return Err(anyhow!("JWT secret must be at least 32 characters long"));
        }
        let weak_secrets = ["secret", "jwt_secret", "change_me", "insecure"];
        if weak_secrets.contains(&jwt_secret) {
            return Err(anyhow!(
                "JWT secret is using a known weak value. Set JWT_SECRET_KEY to a strong, random secret."
            ));
        }
        crate::auth::parse_algorithm(&self.auth.jwt_algorithm)
            .map_err(|_| anyhow!("unsupported JWT_ALGORITHM '{}'", self.auth.jwt_algorithm))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_settings() -> Settings {
        Settings {
            auth: AuthConfig {
                jwt_secret: Some("0123456789abcdef0123456789abcdef".to_string()),
                ..AuthConfig::default()
            },
            ..Settings::default()
        }
    }

    #[test]
    fn defaults_match_documented_values() {
        let settings = Settings::default();
        assert_eq!(settings.batching.max_batch_size, 32);
        assert_eq!(settings.batching.batch_wait_timeout_seconds, 0.1);
        assert_eq!(settings.batching.max_concurrent_batches, 4);
        assert_eq!(settings.queue.max_depth, 10_000);
        assert_eq!(settings.retention.task_retention_seconds, 3_600);
        assert_eq!(settings.retention.task_max_retained, 100_000);
        assert_eq!(settings.auth.jwt_expiration_minutes, 30);
        assert!(!settings.engine.use_real_vllm);
    }

    #[test]
    fn validation_requires_jwt_secret() {
        let settings = Settings::default();
        assert!(settings.validate().is_err());
        assert!(valid_settings().validate().is_ok());
    }

    #[test]
    fn validation_rejects_weak_or_short_secret() {
        let mut settings = valid_settings();
        settings.auth.jwt_secret = Some("short".to_string());
        assert!(settings.validate().is_err());
    }

    #[test]
    fn validation_requires_upstream_url_in_real_mode() {
        let mut settings = valid_settings();
        settings.engine.use_real_vllm = true;
        assert!(settings.validate().is_err());

        settings.engine.real_vllm_url = Some("http://localhost:8001".to_string());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn validation_rejects_zero_bounds() {
        let mut settings = valid_settings();
        settings.batching.max_batch_size = 0;
        assert!(settings.validate().is_err());

        let mut settings = valid_settings();
        settings.server.port = 0;
        assert!(settings.validate().is_err());
    }
}
