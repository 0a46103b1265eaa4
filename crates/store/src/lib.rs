//! Gateway Store
//!
//! SQLite persistence for the Trustee gateway.
//!
//! **Components:**
//! - `store`: the shared connection, physical modes and open/close lifecycle
//! - `snapshot`: page-level snapshots of a memory-resident store
//! - `migration`: the heartbeat unique-index migration and its advisory lock
//! - `audit`: the audit ledger (save, filtered queries, retention)
//! - `retention`: background retention sweeps
//! - `heartbeat`: attestation agent liveness
//! - `sink`: the bounded fire-and-forget audit queue
//!
//! Memory mode keeps the database in a shared-cache in-memory SQLite image
//! and relies on snapshots for durability; disk and shared modes use a
//! single file.

pub mod audit;
pub mod error;
pub mod heartbeat;
pub mod migration;
pub mod retention;
mod schema;
pub mod sink;
pub mod snapshot;
pub mod store;

pub use audit::{AuditLedger, AuditStats, CleanupReport};
pub use error::{Result, StoreError};
pub use heartbeat::HeartbeatRegistry;
pub use migration::{
    migrate_heartbeat_index, MigrationLock, MigrationOutcome, RedisMigrationLock,
    MIGRATION_LOCK_NAME, MIGRATION_LOCK_TTL,
};
pub use retention::{RetentionConfig, RetentionHandle, RetentionScheduler};
pub use sink::{AuditSink, AuditWriter, DEFAULT_QUEUE_CAPACITY};
pub use snapshot::{SnapshotConfig, SnapshotHandle, SnapshotManager};
pub use store::{BackingStore, StoreConfig, StoreMode};
