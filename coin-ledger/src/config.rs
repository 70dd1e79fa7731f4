//! Configuration for the coin ledger

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Side-effect dispatcher configuration
    pub dispatcher: DispatcherConfig,

    /// Balance cache configuration
    pub cache: CacheConfig,

    /// Economy rules
    pub economy: EconomyConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/coin-ledger"),
            service_name: "coin-ledger".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            rocksdb: RocksDBConfig::default(),
            dispatcher: DispatcherConfig::default(),
            cache: CacheConfig::default(),
            economy: EconomyConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 3,
            max_background_jobs: 2,
            enable_statistics: false,
        }
    }
}

/// Side-effect dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Poll the outbox every N milliseconds even without a wake-up
    pub poll_interval_ms: u64,

    /// Maximum records delivered per drain
    pub batch_size: usize,

    /// Attempts before a record is parked as failed
    pub max_attempts: u32,

    /// First retry delay (milliseconds)
    pub initial_retry_delay_ms: u64,

    /// Retry delay ceiling (milliseconds)
    pub max_retry_delay_ms: u64,

    /// Mailbox capacity
    pub mailbox_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            batch_size: 100,
            max_attempts: 5,
            initial_retry_delay_ms: 500,
            max_retry_delay_ms: 60_000,
            mailbox_capacity: 1_000,
        }
    }
}

/// Balance cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Refresh tracked balances from the bank every N milliseconds
    pub refresh_interval_ms: u64,

    /// Start the refresh poller with the service
    pub poller_enabled: bool,

    /// Subscriber channel capacity
    pub channel_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            refresh_interval_ms: 10_000,
            poller_enabled: true,
            channel_capacity: 256,
        }
    }
}

/// Economy rules applied by the balance mutator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EconomyConfig {
    /// Share of a fungible credit accrued to the earner's family
    pub family_share: Decimal,
}

impl Default for EconomyConfig {
    fn default() -> Self {
        Self {
            family_share: Decimal::new(10, 2), // 10%
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("COIN_LEDGER_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(ms) = std::env::var("COIN_LEDGER_CACHE_REFRESH_MS") {
            config.cache.refresh_interval_ms = ms
                .parse()
                .map_err(|e| crate::Error::Config(format!("COIN_LEDGER_CACHE_REFRESH_MS: {}", e)))?;
        }

        if let Ok(ms) = std::env::var("COIN_LEDGER_DISPATCH_POLL_MS") {
            config.dispatcher.poll_interval_ms = ms
                .parse()
                .map_err(|e| crate::Error::Config(format!("COIN_LEDGER_DISPATCH_POLL_MS: {}", e)))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> crate::Result<()> {
        if self.economy.family_share < Decimal::ZERO || self.economy.family_share > Decimal::ONE {
            return Err(crate::Error::Config(format!(
                "family_share must be within [0, 1], got {}",
                self.economy.family_share
            )));
        }

        if self.dispatcher.max_attempts == 0 {
            return Err(crate::Error::Config(
                "dispatcher.max_attempts must be at least 1".to_string(),
            ));
        }

        if self.dispatcher.poll_interval_ms == 0 || self.cache.refresh_interval_ms == 0 {
            return Err(crate::Error::Config(
                "intervals must be non-zero".to_string(),
            ));
        }

        Ok(())
    }
}
