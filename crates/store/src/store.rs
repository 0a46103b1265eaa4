//! Backing store
//!
//! One SQLite connection shared by request handlers and background tasks.
//! Every statement runs on the blocking pool behind a mutex; the store's
//! own transactions provide isolation. Snapshot copies and retention sweeps
//! additionally take their own per-store lock so each runs at most once at
//! a time.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};
use crate::migration::{migrate_heartbeat_index, MigrationLock};
use crate::{schema, snapshot};

/// Name of the shared-cache in-memory database
pub const DEFAULT_MEMORY_NAME: &str = "trustee_gateway";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Physical layout of the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// Shared-cache in-memory database, made durable by snapshots
    Memory,
    /// Single file owned by this process
    Disk,
    /// Single file on a volume shared by cooperating gateway processes
    Shared,
}

impl StoreMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreMode::Memory => "memory",
            StoreMode::Disk => "disk",
            StoreMode::Shared => "shared",
        }
    }
}

impl fmt::Display for StoreMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoreMode {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreMode::Memory),
            "disk" => Ok(StoreMode::Disk),
            "shared" => Ok(StoreMode::Shared),
            other => Err(StoreError::InvalidInput(format!(
                "unsupported database mode: {}",
                other
            ))),
        }
    }
}

/// Where and how to open the store
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub mode: StoreMode,
    /// Database file for disk/shared mode, snapshot file for memory mode
    pub path: PathBuf,
    /// Shared-cache name, only used in memory mode
    pub memory_name: String,
}

impl StoreConfig {
    pub fn memory(snapshot_path: impl Into<PathBuf>) -> Self {
        Self {
            mode: StoreMode::Memory,
            path: snapshot_path.into(),
            memory_name: DEFAULT_MEMORY_NAME.to_string(),
        }
    }

    pub fn disk(path: impl Into<PathBuf>) -> Self {
        Self {
            mode: StoreMode::Disk,
            path: path.into(),
            memory_name: DEFAULT_MEMORY_NAME.to_string(),
        }
    }

    pub fn shared(path: impl Into<PathBuf>) -> Self {
        Self {
            mode: StoreMode::Shared,
            path: path.into(),
            memory_name: DEFAULT_MEMORY_NAME.to_string(),
        }
    }

    pub fn with_memory_name(mut self, name: impl Into<String>) -> Self {
        self.memory_name = name.into();
        self
    }
}

struct Inner {
    conn: Mutex<Option<Connection>>,
    config: StoreConfig,
    snapshot_lock: tokio::sync::Mutex<()>,
    retention_lock: tokio::sync::Mutex<()>,
}

/// Handle to the shared database; cheap to clone
#[derive(Clone)]
pub struct BackingStore {
    inner: Arc<Inner>,
}

impl BackingStore {
    /// Open the store, restore a memory store from its snapshot, create the
    /// schema and run the heartbeat index migration
    ///
    /// Shared mode requires a migration lock. A failed migration is logged and
    /// does not prevent the store from opening.
    pub async fn open(config: StoreConfig, lock: Option<&dyn MigrationLock>) -> Result<Self> {
        if config.mode == StoreMode::Shared && lock.is_none() {
            return Err(StoreError::InvalidInput(
                "shared mode requires a migration lock".to_string(),
            ));
        }

        let connect_config = config.clone();
        let conn = tokio::task::spawn_blocking(move || connect(&connect_config))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))??;

        let store = Self {
            inner: Arc::new(Inner {
                conn: Mutex::new(Some(conn)),
                config,
                snapshot_lock: tokio::sync::Mutex::new(()),
                retention_lock: tokio::sync::Mutex::new(()),
            }),
        };

        info!("Migrating database schema");
        store
            .call(|conn| schema::create(conn).map_err(StoreError::from))
            .await?;

        // Single-process modes need no distributed lock.
        let lock = if store.mode() == StoreMode::Shared {
            lock
        } else {
            None
        };
        match migrate_heartbeat_index(&store, lock).await {
            Ok(outcome) => debug!("Heartbeat index migration: {:?}", outcome),
            Err(e) => warn!("Failed to migrate heartbeat index: {}", e),
        }

        Ok(store)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub fn mode(&self) -> StoreMode {
        self.inner.config.mode
    }

    /// Run `f` against the connection on the blocking pool
    pub async fn call<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut guard = inner.conn.lock().unwrap_or_else(PoisonError::into_inner);
            let conn = guard.as_mut().ok_or(StoreError::Closed)?;
            f(conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    pub(crate) fn snapshot_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.inner.snapshot_lock
    }

    pub(crate) fn retention_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.inner.retention_lock
    }

    /// Close the connection; later calls fail with [`StoreError::Closed`]
    ///
    /// In memory mode this discards the in-memory image, so the snapshot
    /// scheduler must be shut down first.
    pub async fn close(&self) -> Result<()> {
        info!("Shutting down database...");

        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let conn = inner
                .conn
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            match conn {
                Some(conn) => conn.close().map_err(|(_, e)| StoreError::from(e)),
                None => Ok(()),
            }
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))??;

        info!("Database shutdown completed");
        Ok(())
    }
}

fn connect(config: &StoreConfig) -> Result<Connection> {
    match config.mode {
        StoreMode::Memory => {
            let uri = format!("file:{}?mode=memory&cache=shared", config.memory_name);
            let mut conn = Connection::open_with_flags(
                &uri,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_URI
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            info!("Created in-memory SQLite database with shared cache");

            match snapshot::restore_from_file(&mut conn, &config.path) {
                Ok(true) => info!(
                    "Successfully restored database from snapshot: {}",
                    config.path.display()
                ),
                Ok(false) => info!("No snapshot file found, starting with empty database"),
                Err(e) => warn!("Failed to restore from snapshot (starting fresh): {}", e),
            }

            Ok(conn)
        }
        StoreMode::Disk | StoreMode::Shared => {
            ensure_parent_dir(&config.path)?;
            let conn = Connection::open(&config.path)?;
            conn.busy_timeout(BUSY_TIMEOUT)?;
            info!(
                "Using file-based SQLite database ({} mode): {}",
                config.mode,
                config.path.display()
            );
            Ok(conn)
        }
    }
}

/// Create the parent directory of `path`, owner-only on unix
pub(crate) fn ensure_parent_dir(path: &Path) -> Result<()> {
    let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) else {
        return Ok(());
    };

    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir)?;
    Ok(())
}

pub(crate) fn to_micros(ts: &DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

pub(crate) fn from_micros(value: i64, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(value)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(column, value))
}
