use crate::errors::{AppError, Result};
use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub protection: ProtectionConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    /// How long SQLite itself keeps retrying a locked write before failing
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProtectionConfig {
    pub max_requests: u32,
    pub window_seconds: f64,
    pub dedup_window_seconds: f64,
    /// 0 disables the background sweep
    pub sweep_interval_seconds: u64,
    pub max_tracked_clients: usize,
    pub max_tracked_fingerprints: usize,
    pub trust_forwarded_headers: bool,
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_format: String,
}

impl ProtectionConfig {
    /// Only meaningful once [`ProtectionConfig::validate`] has passed
    pub fn window(&self) -> Duration {
        Duration::from_secs_f64(self.window_seconds)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs_f64(self.dedup_window_seconds)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_seconds > 0).then(|| Duration::from_secs(self.sweep_interval_seconds))
    }
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            max_requests: 10,
            window_seconds: 1.0,
            dedup_window_seconds: 5.0,
            sweep_interval_seconds: 60,
            max_tracked_clients: 100_000,
            max_tracked_fingerprints: 100_000,
            trust_forwarded_headers: false,
            max_body_bytes: 1024 * 1024,
        }
    }
}

impl Config {
    /// Load configuration from files and environment variables
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let environment =
            env::var("LEAD_DASHBOARD_ENV").unwrap_or_else(|_| "development".to_string());

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            .add_source(
                config::File::with_name(&format!("config/{}", environment)).required(false),
            )
            // e.g., LEAD_DASHBOARD__PROTECTION__MAX_REQUESTS=20
            .add_source(
                config::Environment::with_prefix("LEAD_DASHBOARD")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| AppError::Configuration(e.to_string()))?;

        config
            .try_deserialize()
            .map_err(|e| AppError::Configuration(e.to_string()))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(AppError::Configuration("Invalid port number".to_string()));
        }

        if self.database.url.is_empty() {
            return Err(AppError::Configuration(
                "Database URL is required".to_string(),
            ));
        }

        self.protection.validate()
    }
}

impl ProtectionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_requests == 0 {
            return Err(AppError::Configuration(
                "protection.max_requests must be positive".to_string(),
            ));
        }

        for (name, value) in [
            ("window_seconds", self.window_seconds),
            ("dedup_window_seconds", self.dedup_window_seconds),
        ] {
            positive_seconds(name, value)?;
        }

        if self.max_tracked_clients == 0 || self.max_tracked_fingerprints == 0 {
            return Err(AppError::Configuration(
                "protection table caps must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

fn positive_seconds(name: &str, value: f64) -> Result<Duration> {
    match Duration::try_from_secs_f64(value) {
        Ok(duration) if !duration.is_zero() => Ok(duration),
        _ => Err(AppError::Configuration(format!(
            "protection.{} must be a positive number of seconds, got {}",
            name, value
        ))),
    }
}
