//! Configuration management for the gateway
//!
//! Loads configuration from environment variables with the gateway's defaults.
//! A `.env` file in the working directory is honoured for local development.

use anyhow::{anyhow, bail, Result};
use gateway_store::{
    RetentionConfig, SnapshotConfig, StoreConfig, StoreMode, DEFAULT_QUEUE_CAPACITY,
};
use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Upper bound for every configured interval or timeout (ten years)
const MAX_DURATION_SECS: u64 = 10 * 365 * 24 * 3600;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,

    pub kbs_url: String,
    pub attestation_service_url: String,
    /// `None` disables the RVPS routes (they answer 501)
    pub rvps_grpc_addr: Option<String>,

    pub database_mode: StoreMode,
    /// Database file on disk, or the snapshot file in memory mode
    pub database_path: PathBuf,
    pub backup_interval_secs: u64,
    pub backup_on_shutdown: bool,
    /// Redis holding the migration lock, required in shared mode
    pub migration_lock_redis_url: Option<String>,

    /// `<= 0` disables count-based retention
    pub audit_max_records: i64,
    /// `<= 0` disables time-based retention
    pub audit_retention_days: i64,
    pub audit_cleanup_interval_hours: u64,
    pub audit_queue_capacity: usize,

    pub heartbeat_timeout_minutes: u64,
    pub shutdown_grace_secs: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists (for local development)
        dotenvy::dotenv().ok();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from any key lookup, then validate it
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str, default: &str| -> String {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        let optional = |key: &str| -> Option<String> {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let config = Config {
            host: text("GATEWAY_HOST", "0.0.0.0"),
            port: parse(&text("GATEWAY_PORT", "8081"), "GATEWAY_PORT")?,

            kbs_url: text("KBS_URL", "http://localhost:8080"),
            attestation_service_url: text("ATTESTATION_SERVICE_URL", "http://localhost:50005"),
            // Explicitly empty means disabled, unset means the default endpoint
            rvps_grpc_addr: match lookup("RVPS_GRPC_ADDR") {
                Some(addr) => Some(addr.trim().to_string()).filter(|a| !a.is_empty()),
                None => Some("http://localhost:50003".to_string()),
            },

            database_mode: parse(&text("DATABASE_MODE", "memory"), "DATABASE_MODE")?,
            database_path: text("DATABASE_PATH", "./trustee-gateway.db").into(),
            backup_interval_secs: parse(
                &text("DATABASE_BACKUP_INTERVAL_SECS", "120"),
                "DATABASE_BACKUP_INTERVAL_SECS",
            )?,
            backup_on_shutdown: parse_flag(
                &text("DATABASE_BACKUP_ON_SHUTDOWN", "true"),
                "DATABASE_BACKUP_ON_SHUTDOWN",
            )?,
            migration_lock_redis_url: optional("MIGRATION_LOCK_REDIS_URL"),

            audit_max_records: parse(&text("AUDIT_MAX_RECORDS", "1000"), "AUDIT_MAX_RECORDS")?,
            audit_retention_days: parse(
                &text("AUDIT_RETENTION_DAYS", "3"),
                "AUDIT_RETENTION_DAYS",
            )?,
            audit_cleanup_interval_hours: parse(
                &text("AUDIT_CLEANUP_INTERVAL_HOURS", "24"),
                "AUDIT_CLEANUP_INTERVAL_HOURS",
            )?,
            audit_queue_capacity: parse(
                &text("AUDIT_QUEUE_CAPACITY", &DEFAULT_QUEUE_CAPACITY.to_string()),
                "AUDIT_QUEUE_CAPACITY",
            )?,

            heartbeat_timeout_minutes: parse(
                &text("HEARTBEAT_TIMEOUT_MINUTES", "10"),
                "HEARTBEAT_TIMEOUT_MINUTES",
            )?,
            shutdown_grace_secs: parse(&text("SHUTDOWN_GRACE_SECS", "30"), "SHUTDOWN_GRACE_SECS")?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            bail!("GATEWAY_PORT must be greater than 0");
        }
        if self.backup_interval_secs == 0 {
            bail!("DATABASE_BACKUP_INTERVAL_SECS must be greater than 0");
        }
        if self.audit_cleanup_interval_hours == 0 {
            bail!("AUDIT_CLEANUP_INTERVAL_HOURS must be greater than 0");
        }
        if self.heartbeat_timeout_minutes == 0 {
            bail!("HEARTBEAT_TIMEOUT_MINUTES must be greater than 0");
        }
        if self.audit_queue_capacity == 0 {
            bail!("AUDIT_QUEUE_CAPACITY must be greater than 0");
        }
        for (key, secs) in [
            ("DATABASE_BACKUP_INTERVAL_SECS", self.backup_interval_secs),
            (
                "AUDIT_CLEANUP_INTERVAL_HOURS",
                self.audit_cleanup_interval_hours.saturating_mul(3600),
            ),
            (
                "HEARTBEAT_TIMEOUT_MINUTES",
                self.heartbeat_timeout_minutes.saturating_mul(60),
            ),
            ("SHUTDOWN_GRACE_SECS", self.shutdown_grace_secs),
        ] {
            if secs > MAX_DURATION_SECS {
                bail!("{} must not exceed ten years", key);
            }
        }
        if self.database_mode == StoreMode::Shared && self.migration_lock_redis_url.is_none() {
            bail!("MIGRATION_LOCK_REDIS_URL is required when DATABASE_MODE is shared");
        }

        Ok(())
    }

    /// Get the listen address
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn store_config(&self) -> StoreConfig {
        match self.database_mode {
            StoreMode::Memory => StoreConfig::memory(&self.database_path),
            StoreMode::Disk => StoreConfig::disk(&self.database_path),
            StoreMode::Shared => StoreConfig::shared(&self.database_path),
        }
    }

    pub fn snapshot_config(&self) -> SnapshotConfig {
        SnapshotConfig {
            path: self.database_path.clone(),
            interval: Duration::from_secs(self.backup_interval_secs),
            on_shutdown: self.backup_on_shutdown,
        }
    }

    pub fn retention_config(&self) -> RetentionConfig {
        RetentionConfig {
            max_records: self.audit_max_records,
            retention_days: self.audit_retention_days,
            interval: Duration::from_secs(self.audit_cleanup_interval_hours.saturating_mul(3600)),
        }
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_minutes.saturating_mul(60))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn parse<T>(value: &str, key: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .parse()
        .map_err(|e| anyhow!("Invalid {} {:?}: {}", key, value, e))
}

fn parse_flag(value: &str, key: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => bail!("Invalid {} {:?}: expected a boolean", key, value),
    }
}
