use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

/// Main configuration for the file bot
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Telegram configuration
    pub telegram: TelegramConfig,
    /// S3 configuration
    pub s3: S3Config,
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Upload pipeline configuration
    #[serde(default)]
    pub upload: UploadConfig,
    /// Web API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (json or pretty)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Telegram bot configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    /// Bot token issued by BotFather
    #[serde(default)]
    pub bot_token: String,
    /// Custom Bot API server (a local server lifts the 20MB download cap)
    pub api_url: Option<String>,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Bucket that receives uploaded files
    #[serde(default)]
    pub bucket: String,
    /// Storage region
    #[serde(default)]
    pub region: String,
    /// Access key ID
    #[serde(default)]
    pub access_key: String,
    /// Secret access key
    #[serde(default)]
    pub secret_key: String,
    /// Custom endpoint URL (Wasabi, MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Direct download URL expiration in seconds
    #[serde(default = "default_presigned_url_expiry_secs")]
    pub presigned_url_expiry_secs: u64,
    /// Concurrent part uploads per file
    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,
    /// Multipart upload threshold in bytes (5MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: u64,
    /// Part size for multipart uploads in bytes (5MB default); progress
    /// is reported once per finished part
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL; metadata is kept in memory when unset
    pub url: Option<String>,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Upload pipeline configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Directory for staged files (system temp dir when unset)
    pub scratch_dir: Option<PathBuf>,
    /// Uploads allowed to run at the same time
    #[serde(default = "default_max_concurrent_uploads")]
    pub max_concurrent_uploads: usize,
}

/// API configuration for the stream/player endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Public domain the API is reachable at (e.g. mybot.onrender.com)
    pub public_domain: Option<String>,
}

// Default value functions
fn default_service_name() -> String {
    "filebot".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_presigned_url_expiry_secs() -> u64 {
    3600
}

fn default_upload_concurrency() -> usize {
    10
}

fn default_multipart_threshold() -> u64 {
    MIN_PART_SIZE as u64
}

fn default_part_size() -> usize {
    MIN_PART_SIZE
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_max_concurrent_uploads() -> usize {
    4
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    5000
}

/// Smallest part size S3 accepts for every part but the last
const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

impl Config {
    /// Load configuration from `.env`, config files and environment
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/filebot").required(false))
            .add_source(config::File::with_name("/etc/filebot/filebot").required(false))
            // Override with environment variables
            // FILEBOT__S3__BUCKET -> s3.bucket
            .add_source(
                config::Environment::with_prefix("FILEBOT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the service cannot start with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("telegram.bot_token", &self.telegram.bot_token),
            ("s3.bucket", &self.s3.bucket),
            ("s3.region", &self.s3.region),
            ("s3.access_key", &self.s3.access_key),
            ("s3.secret_key", &self.s3.secret_key),
        ];

        for (key, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingRequired(key.to_string()));
            }
        }

        if self.s3.part_size_bytes < MIN_PART_SIZE {
            return Err(ConfigError::InvalidValue {
                key: "s3.part_size_bytes".to_string(),
                message: format!("must be at least {} bytes", MIN_PART_SIZE),
            });
        }

        if self.s3.upload_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "s3.upload_concurrency".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        if self.upload.max_concurrent_uploads == 0 {
            return Err(ConfigError::InvalidValue {
                key: "upload.max_concurrent_uploads".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        Ok(())
    }

    /// Get direct download URL expiry as Duration
    pub fn presigned_url_expiry(&self) -> Duration {
        Duration::from_secs(self.s3.presigned_url_expiry_secs)
    }

    /// Directory staged files are written to
    pub fn scratch_dir(&self) -> PathBuf {
        self.upload
            .scratch_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            run_migrations: true,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            scratch_dir: None,
            max_concurrent_uploads: default_max_concurrent_uploads(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
            public_domain: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load_from(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let mut builder = config::Config::builder();
        for (key, value) in pairs {
            builder = builder.set_override(*key, *value)?;
        }
        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn complete() -> Vec<(&'static str, &'static str)> {
        vec![
            ("telegram.bot_token", "123:abc"),
            ("s3.bucket", "files"),
            ("s3.region", "eu-central-1"),
            ("s3.access_key", "AKIA"),
            ("s3.secret_key", "secret"),
        ]
    }

    #[test]
    fn test_default_values() {
        assert_eq!(default_presigned_url_expiry_secs(), 3600);
        assert_eq!(default_multipart_threshold(), 5 * 1024 * 1024);
        assert_eq!(default_part_size(), 5 * 1024 * 1024);
        assert_eq!(default_api_port(), 5000);
    }

    #[test]
    fn test_complete_config_loads_with_defaults() {
        let config = load_from(&complete()).unwrap();

        assert_eq!(config.s3.bucket, "files");
        assert_eq!(config.service.name, "filebot");
        assert!(config.database.url.is_none());
        assert!(config.api.public_domain.is_none());
        assert_eq!(config.presigned_url_expiry(), Duration::from_secs(3600));
        assert_eq!(config.upload.max_concurrent_uploads, 4);
    }

    #[test]
    fn test_missing_storage_credentials_fail_fast() {
        let pairs: Vec<_> = complete()
            .into_iter()
            .filter(|(key, _)| *key != "s3.secret_key")
            .collect();

        match load_from(&pairs) {
            Err(ConfigError::MissingRequired(key)) => assert_eq!(key, "s3.secret_key"),
            other => panic!("expected missing secret key, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_blank_bot_token_is_rejected() {
        let mut pairs = complete();
        pairs[0] = ("telegram.bot_token", "   ");

        assert!(matches!(
            load_from(&pairs),
            Err(ConfigError::MissingRequired(key)) if key == "telegram.bot_token"
        ));
    }

    #[test]
    fn test_part_size_below_s3_minimum_is_rejected() {
        let mut pairs = complete();
        pairs.push(("s3.part_size_bytes", "1024"));

        assert!(matches!(
            load_from(&pairs),
            Err(ConfigError::InvalidValue { key, .. }) if key == "s3.part_size_bytes"
        ));
    }
}
