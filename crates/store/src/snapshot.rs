//! Snapshots of a memory-resident store
//!
//! A snapshot is a page-level SQLite backup written to `<path>.tmp` and
//! renamed over `<path>`, so the snapshot file is either absent or a
//! complete database image.

use rusqlite::backup::Backup;
use rusqlite::{Connection, OpenFlags};
use std::ffi::OsString;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::error::{Result, StoreError};
use crate::store::{ensure_parent_dir, BackingStore, StoreMode};

const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// Pages copied per backup step; the connection mutex is held throughout
const PAGES_PER_STEP: std::os::raw::c_int = 256;

/// Copy the snapshot at `path` into `dst`
///
/// Returns `Ok(false)` when there is no snapshot to restore.
pub fn restore_from_file(dst: &mut Connection, path: &Path) -> Result<bool> {
    if !path.exists() {
        return Ok(false);
    }

    let src = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    let backup = Backup::new(&src, dst)?;
    backup.run_to_completion(PAGES_PER_STEP, Duration::ZERO, None)?;
    Ok(true)
}

/// Write a consistent copy of `src` to `path`
pub fn snapshot_to_file(src: &Connection, path: &Path) -> Result<()> {
    let staging = staging_path(path);

    // Leftover from an interrupted attempt
    match fs::remove_file(&staging) {
        Ok(()) => debug!("Removed stale snapshot staging file {}", staging.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    ensure_parent_dir(path)?;

    let result = write_and_swap(src, &staging, path);
    if result.is_err() {
        let _ = fs::remove_file(&staging);
    }
    result
}

fn write_and_swap(src: &Connection, staging: &Path, path: &Path) -> Result<()> {
    let mut dst = Connection::open(staging)?;
    {
        let backup = Backup::new(src, &mut dst)?;
        backup.run_to_completion(PAGES_PER_STEP, Duration::ZERO, None)?;
    }
    dst.close().map_err(|(_, e)| StoreError::from(e))?;

    fs::rename(staging, path)
        .map_err(|e| StoreError::Snapshot(format!("failed to replace snapshot file: {}", e)))?;
    Ok(())
}

fn staging_path(path: &Path) -> PathBuf {
    let mut staging = OsString::from(path.as_os_str());
    staging.push(".tmp");
    PathBuf::from(staging)
}

#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    pub path: PathBuf,
    pub interval: Duration,
    /// Take a final snapshot when the scheduler is shut down
    pub on_shutdown: bool,
}

/// Periodic snapshotter for a memory-mode [`BackingStore`]
pub struct SnapshotManager {
    store: BackingStore,
    config: SnapshotConfig,
}

impl SnapshotManager {
    pub fn new(store: BackingStore, config: SnapshotConfig) -> Result<Self> {
        if store.mode() != StoreMode::Memory {
            return Err(StoreError::InvalidInput(format!(
                "snapshots are only taken in memory mode, store is in {} mode",
                store.mode()
            )));
        }
        Ok(Self { store, config })
    }

    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    /// Take one snapshot; concurrent callers are serialized
    pub async fn snapshot(&self) -> Result<()> {
        let _guard = self.store.snapshot_lock().lock().await;

        let path = self.config.path.clone();
        self.store
            .call(move |conn| snapshot_to_file(conn, &path))
            .await?;

        debug!("Database snapshot written to: {}", self.config.path.display());
        Ok(())
    }

    /// Spawn the scheduler loop
    ///
    /// The loop ends on [`SnapshotHandle::shutdown`] or when `shutdown`
    /// flips to true.
    pub fn start(self, mut shutdown: watch::Receiver<bool>) -> SnapshotHandle {
        let manager = Arc::new(self);
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let period = manager.config.interval.max(MIN_INTERVAL);

        let worker = Arc::clone(&manager);
        let task = tokio::spawn(async move {
            if *shutdown.borrow_and_update() {
                return;
            }

            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("Started snapshot scheduler with interval: {:?}", period);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match worker.snapshot().await {
                            Ok(()) => debug!("Scheduled snapshot completed successfully"),
                            Err(e) => error!("Scheduled snapshot failed: {}", e),
                        }
                    }
                    _ = &mut stop_rx => {
                        info!("Snapshot scheduler stopped");
                        break;
                    }
                    _ = shutdown.changed() => {
                        info!("Snapshot scheduler stopped due to shutdown signal");
                        break;
                    }
                }
            }
        });

        SnapshotHandle {
            manager,
            stop: stop_tx,
            task,
        }
    }
}

/// Running snapshot scheduler
pub struct SnapshotHandle {
    manager: Arc<SnapshotManager>,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl SnapshotHandle {
    pub async fn snapshot_now(&self) -> Result<()> {
        self.manager.snapshot().await
    }

    /// Take the final snapshot (if enabled), then stop and join the loop
    ///
    /// Must complete before the store is closed.
    pub async fn shutdown(self) {
        if self.manager.config.on_shutdown {
            match self.manager.snapshot().await {
                Ok(()) => info!("Final snapshot completed successfully"),
                Err(e) => error!("Final snapshot failed: {}", e),
            }
        }

        // The loop may already have exited on the shutdown signal.
        let _ = self.stop.send(());
        if let Err(e) = self.task.await {
            error!("Snapshot scheduler task failed: {}", e);
        }
    }
}
