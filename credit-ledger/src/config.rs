use config::{ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub sweeper: SweeperConfig,
    pub ledger: LedgerConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    pub lock_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    Memory,
    Redis,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CacheConfig {
    pub backend: CacheBackend,
    #[serde(default)]
    pub redis_url: String,
    pub ttl_secs: u64,
    pub max_entries: u64,
    pub key_prefix: String,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SweeperConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl SweeperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LedgerConfig {
    /// Decimal string, parsed by [`LedgerConfig::max_credit_amount`]
    pub max_credit_amount: String,
    pub operation_timeout_ms: u64,
    pub max_page_size: u32,
}

impl LedgerConfig {
    pub fn max_credit_amount(&self) -> Result<Decimal, String> {
        Decimal::from_str(&self.max_credit_amount)
            .map_err(|e| format!("Invalid ledger.max_credit_amount: {}", e))
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        let mut builder = config::Config::builder()
            // Start with default configuration
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("server.workers", 4)?
            .set_default("database.url", "")?
            .set_default("database.max_connections", 10)?
            .set_default("database.min_connections", 2)?
            .set_default("database.acquire_timeout_secs", 5)?
            .set_default("database.lock_timeout_ms", 5000)?
            .set_default("cache.backend", "memory")?
            .set_default("cache.redis_url", "")?
            .set_default("cache.ttl_secs", 600)?
            .set_default("cache.max_entries", 10_000)?
            .set_default("cache.key_prefix", "activity")?
            .set_default("sweeper.enabled", true)?
            .set_default("sweeper.interval_secs", 43_200)?
            .set_default("ledger.max_credit_amount", "1000000000")?
            .set_default("ledger.operation_timeout_ms", 10_000)?
            .set_default("ledger.max_page_size", 1000)?;

        // Add environment-specific config file if it exists
        if let Ok(config_file) = env::var("CONFIG_FILE") {
            builder = builder.add_source(File::with_name(&config_file).required(false));
        } else {
            builder = builder.add_source(
                File::with_name(&format!("config/{}", environment)).required(false),
            );
        }

        // Override with environment variables
        builder = builder.add_source(
            Environment::with_prefix("CREDIT_LEDGER")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        // Special handling for common env vars
        if let Ok(db_url) = env::var("DATABASE_URL") {
            builder = builder.set_override("database.url", db_url)?;
        }

        if let Ok(redis_url) = env::var("REDIS_URL") {
            builder = builder.set_override("cache.redis_url", redis_url)?;
        }

        if let Ok(port) = env::var("CREDIT_LEDGER_PORT") {
            builder = builder.set_override("server.port", port)?;
        }

        builder.build()?.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("Server port cannot be 0".to_string());
        }

        if self.database.url.is_empty() {
            return Err("Database URL is required".to_string());
        }

        if self.cache.backend == CacheBackend::Redis && self.cache.redis_url.is_empty() {
            return Err("Redis URL is required for the redis cache backend".to_string());
        }

        if self.cache.ttl_secs == 0 {
            return Err("Cache TTL must be positive".to_string());
        }

        if self.sweeper.interval_secs == 0 {
            return Err("Sweeper interval must be positive".to_string());
        }

        if self.ledger.operation_timeout_ms == 0 {
            return Err("Operation timeout must be positive".to_string());
        }

        if self.ledger.max_page_size == 0 {
            return Err("Max page size must be positive".to_string());
        }

        if self.ledger.max_credit_amount()? <= Decimal::ZERO {
            return Err("Max credit amount must be positive".to_string());
        }

        Ok(())
    }
}
