use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub node: NodeConfig,
    pub shards: ShardConfig,
    pub storage: StorageConfig,
    pub bus: BusConfig,
    pub scanner: ScannerConfig,
    /// Maximum upload size in bytes
    pub max_upload_size: u64,
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub bind_address: String,
    /// Root for shard files (`shards/`) and the event log (`bus/`)
    pub data_dir: String,
}

#[derive(Debug, Clone)]
pub struct ShardConfig {
    pub count: usize,
    /// Upper bound on a single shard call made by a bus consumer
    pub deadline_ms: u64,
}

#[derive(Debug, Clone)]
pub enum StorageBackend {
    Gcs,
    Local,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Directory for local storage backend
    pub local_storage_path: String,
    /// GCS bucket name (required when backend is gcs)
    pub gcs_bucket: Option<String>,
    /// Path to GCS service account JSON (optional, defaults to ADC)
    pub gcs_credentials_file: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    /// How long a delivery may stay unacknowledged before it is redelivered
    pub ack_wait_ms: u64,
    /// Delay before a nak'd delivery is offered again
    pub retry_delay_ms: u64,
    pub poll_interval_ms: u64,
    /// Window in which a repeated idempotency key is collapsed
    pub dedup_window_secs: u64,
    /// Minimum age before a message every group has settled is compacted away
    pub retention_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ScannerConfig {
    pub clamav_host: String,
    pub clamav_port: u16,
    pub timeout_secs: u64,
}

impl ShardConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

impl BusConfig {
    pub fn ack_wait(&self) -> Duration {
        Duration::from_millis(self.ack_wait_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            count: 4,
            deadline_ms: 3000,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Local,
            local_storage_path: "./files".to_string(),
            gcs_bucket: None,
            gcs_credentials_file: None,
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            ack_wait_ms: 30_000,
            retry_delay_ms: 5_000,
            poll_interval_ms: 500,
            dedup_window_secs: 120,
            retention_secs: 86_400,
        }
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            clamav_host: "localhost".to_string(),
            clamav_port: 3310,
            timeout_secs: 30,
        }
    }
}

/// Parse an optional numeric variable, falling back to `default` when unset.
fn env_parse<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let data_dir = std::env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string());

        let shard_defaults = ShardConfig::default();
        let shards = ShardConfig {
            count: env_parse("SHARD_COUNT", shard_defaults.count)?,
            deadline_ms: env_parse("SHARD_DEADLINE_MS", shard_defaults.deadline_ms)?,
        };

        let storage_backend = match std::env::var("STORAGE_BACKEND")
            .unwrap_or_else(|_| "local".to_string())
            .to_lowercase()
            .as_str()
        {
            "gcs" => StorageBackend::Gcs,
            "local" => StorageBackend::Local,
            other => {
                return Err(ConfigError::InvalidValue {
                    name: "STORAGE_BACKEND",
                    value: other.to_string(),
                })
            }
        };

        let storage = StorageConfig {
            backend: storage_backend,
            local_storage_path: std::env::var("LOCAL_STORAGE_PATH")
                .unwrap_or_else(|_| "./files".to_string()),
            gcs_bucket: std::env::var("GCS_BUCKET").ok(),
            gcs_credentials_file: std::env::var("GCS_CREDENTIALS_FILE").ok(),
        };

        let bus_defaults = BusConfig::default();
        let bus = BusConfig {
            ack_wait_ms: env_parse("BUS_ACK_WAIT_MS", bus_defaults.ack_wait_ms)?,
            retry_delay_ms: env_parse("BUS_RETRY_DELAY_MS", bus_defaults.retry_delay_ms)?,
            poll_interval_ms: env_parse("BUS_POLL_INTERVAL_MS", bus_defaults.poll_interval_ms)?,
            dedup_window_secs: env_parse(
                "BUS_DEDUP_WINDOW_SECS",
                bus_defaults.dedup_window_secs,
            )?,
            retention_secs: env_parse("BUS_RETENTION_SECS", bus_defaults.retention_secs)?,
        };

        let scanner_defaults = ScannerConfig::default();
        let scanner = ScannerConfig {
            clamav_host: std::env::var("CLAMAV_HOST").unwrap_or(scanner_defaults.clamav_host),
            clamav_port: env_parse("CLAMAV_PORT", scanner_defaults.clamav_port)?,
            timeout_secs: env_parse("CLAMAV_TIMEOUT_SECS", scanner_defaults.timeout_secs)?,
        };

        let config = Config {
            node: NodeConfig {
                bind_address,
                data_dir,
            },
            shards,
            storage,
            bus,
            scanner,
            max_upload_size: env_parse("MAX_UPLOAD_SIZE", 200 * 1024 * 1024)?, // 200MB
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shards.count == 0 {
            return Err(ConfigError::ValidationError(
                "SHARD_COUNT must be at least 1".to_string(),
            ));
        }

        if self.shards.deadline_ms == 0 {
            return Err(ConfigError::ValidationError(
                "SHARD_DEADLINE_MS must be greater than 0".to_string(),
            ));
        }

        if matches!(self.storage.backend, StorageBackend::Gcs) && self.storage.gcs_bucket.is_none()
        {
            return Err(ConfigError::ValidationError(
                "GCS_BUCKET is required when STORAGE_BACKEND=gcs".to_string(),
            ));
        }

        if self.bus.poll_interval_ms == 0 || self.bus.ack_wait_ms == 0 {
            return Err(ConfigError::ValidationError(
                "BUS_POLL_INTERVAL_MS and BUS_ACK_WAIT_MS must be greater than 0".to_string(),
            ));
        }

        if self.bus.retry_delay_ms > self.bus.ack_wait_ms {
            tracing::warn!(
                retry_delay_ms = self.bus.retry_delay_ms,
                ack_wait_ms = self.bus.ack_wait_ms,
                "Retry delay exceeds ack wait; nak'd messages wait longer than unacked ones"
            );
        }

        Ok(())
    }
}
