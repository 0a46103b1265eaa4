//! Heartbeat unique-index migration
//!
//! Older databases may hold several heartbeat rows per `instance_id`. Before
//! the unique index can be created those duplicates are collapsed onto the
//! highest-id row. In shared mode several gateway processes may open the
//! same file at once, so the migration runs under a named advisory lock.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::schema::HEARTBEAT_UNIQUE_INDEX;
use crate::store::BackingStore;

pub const MIGRATION_LOCK_NAME: &str = "trustee_gateway_migrate_lock";
pub const MIGRATION_LOCK_TTL: Duration = Duration::from_secs(30);

// Delete the key only if it still holds our token
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// A named lock that expires on its own if the holder dies
#[async_trait]
pub trait MigrationLock: Send + Sync {
    /// Returns a token when acquired, `None` when another holder has it
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<String>>;

    /// Returns false if the lock had already expired or changed hands
    async fn release(&self, name: &str, token: &str) -> Result<bool>;
}

/// [`MigrationLock`] backed by `SET NX EX` in Redis
///
/// The connection is opened on first use, so an unreachable Redis surfaces
/// as a failed acquire (and a skipped migration) rather than a startup error.
pub struct RedisMigrationLock {
    client: redis::Client,
    conn: OnceCell<MultiplexedConnection>,
}

impl RedisMigrationLock {
    /// Parse the Redis URL; no connection is made yet
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            conn: OnceCell::new(),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                info!("Connecting to migration lock Redis");
                let conn = self.client.get_multiplexed_tokio_connection().await?;
                info!("Successfully connected to Redis");
                Ok::<_, StoreError>(conn)
            })
            .await?;
        Ok(conn.clone())
    }
}

fn lock_key(name: &str) -> String {
    format!("lock:{}", name)
}

#[async_trait]
impl MigrationLock for RedisMigrationLock {
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<String>> {
        let mut conn = self.connection().await?;
        let token = Uuid::new_v4().to_string();

        let set_result: Option<String> = redis::cmd("SET")
            .arg(lock_key(name))
            .arg(&token)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;

        Ok(set_result.map(|_| token))
    }

    async fn release(&self, name: &str, token: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        let script = redis::Script::new(RELEASE_SCRIPT);

        let deleted: i64 = script
            .key(lock_key(name))
            .arg(token)
            .invoke_async(&mut conn)
            .await?;

        Ok(deleted == 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    AlreadyPresent,
    Created { duplicates_removed: usize },
    /// Another process holds the lock
    Skipped,
}

/// Ensure `idx_aa_heartbeat_instance_id` exists, deduplicating first
///
/// With a lock, the existence check and the migration run while the lock is
/// held and the lock is released on every exit path.
pub async fn migrate_heartbeat_index(
    store: &BackingStore,
    lock: Option<&dyn MigrationLock>,
) -> Result<MigrationOutcome> {
    let Some(lock) = lock else {
        return create_unique_index(store).await;
    };

    let token = match lock.try_acquire(MIGRATION_LOCK_NAME, MIGRATION_LOCK_TTL).await {
        Ok(Some(token)) => token,
        Ok(None) => {
            info!("Another instance is running migration, skipping");
            return Ok(MigrationOutcome::Skipped);
        }
        Err(e) => {
            info!("Could not acquire migration lock, skipping: {}", e);
            return Ok(MigrationOutcome::Skipped);
        }
    };

    info!("Acquired migration lock, proceeding with index migration");
    let result = create_unique_index(store).await;

    match lock.release(MIGRATION_LOCK_NAME, &token).await {
        Ok(true) => debug!("Released migration lock"),
        Ok(false) => warn!("Migration lock expired before it was released"),
        Err(e) => warn!("Failed to release migration lock: {}", e),
    }

    result
}

async fn create_unique_index(store: &BackingStore) -> Result<MigrationOutcome> {
    let outcome = store
        .call(|conn| {
            let tx = conn.transaction()?;

            let existing: i64 = tx.query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = ?1",
                [HEARTBEAT_UNIQUE_INDEX],
                |row| row.get(0),
            )?;
            if existing > 0 {
                return Ok(MigrationOutcome::AlreadyPresent);
            }

            let duplicates_removed = tx.execute(
                "DELETE FROM aa_instance_heartbeats
                 WHERE id NOT IN (
                     SELECT MAX(id) FROM aa_instance_heartbeats GROUP BY instance_id
                 )",
                [],
            )?;
            tx.execute_batch(&format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {} ON aa_instance_heartbeats(instance_id)",
                HEARTBEAT_UNIQUE_INDEX
            ))?;
            tx.commit()?;

            Ok(MigrationOutcome::Created { duplicates_removed })
        })
        .await?;

    match outcome {
        MigrationOutcome::AlreadyPresent => {
            info!("Unique index on instance_id already exists, skipping")
        }
        MigrationOutcome::Created { duplicates_removed } => info!(
            "Created unique index on aa_instance_heartbeats.instance_id ({} duplicate rows removed)",
            duplicates_removed
        ),
        MigrationOutcome::Skipped => {}
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::memory_store;
    use crate::store::{StoreConfig, StoreMode};
    use rusqlite::params;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-process lock with the same token semantics as the Redis one
    #[derive(Default)]
    struct LocalLock {
        held: Mutex<HashMap<String, String>>,
        releases: AtomicUsize,
    }

    #[async_trait]
    impl MigrationLock for LocalLock {
        async fn try_acquire(&self, name: &str, _ttl: Duration) -> Result<Option<String>> {
            let mut held = self.held.lock().unwrap();
            if held.contains_key(name) {
                return Ok(None);
            }
            let token = Uuid::new_v4().to_string();
            held.insert(name.to_string(), token.clone());
            Ok(Some(token))
        }

        async fn release(&self, name: &str, token: &str) -> Result<bool> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            let mut held = self.held.lock().unwrap();
            if held.get(name).map(String::as_str) == Some(token) {
                held.remove(name);
                return Ok(true);
            }
            Ok(false)
        }
    }

    async fn drop_index_and_insert_duplicates(store: &BackingStore) {
        store
            .call(|conn| {
                conn.execute_batch("DROP INDEX IF EXISTS idx_aa_heartbeat_instance_id")?;
                for (instance, ts) in [("a", 1), ("a", 2), ("b", 3), ("a", 4), ("b", 5)] {
                    conn.execute(
                        "INSERT INTO aa_instance_heartbeats
                            (instance_id, client_ip, last_heartbeat, created_at, updated_at)
                         VALUES (?1, '', ?2, ?2, ?2)",
                        params![instance, ts],
                    )?;
                }
                Ok(())
            })
            .await
            .unwrap();
    }

    async fn surviving_rows(store: &BackingStore) -> Vec<(String, i64)> {
        store
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT instance_id, last_heartbeat FROM aa_instance_heartbeats ORDER BY instance_id",
                )?;
                let rows: Vec<(String, i64)> = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<rusqlite::Result<_>>()?;
                Ok(rows)
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_open_creates_index() {
        let (store, _dir) = memory_store().await;
        let outcome = migrate_heartbeat_index(&store, None).await.unwrap();
        assert_eq!(outcome, MigrationOutcome::AlreadyPresent);
    }

    #[tokio::test]
    async fn test_dedup_keeps_highest_id() {
        let (store, _dir) = memory_store().await;
        drop_index_and_insert_duplicates(&store).await;

        let outcome = migrate_heartbeat_index(&store, None).await.unwrap();
        assert_eq!(outcome, MigrationOutcome::Created { duplicates_removed: 3 });
        assert_eq!(
            surviving_rows(&store).await,
            vec![("a".to_string(), 4), ("b".to_string(), 5)]
        );
    }

    #[tokio::test]
    async fn test_lock_is_released_after_migration() {
        let (store, _dir) = memory_store().await;
        drop_index_and_insert_duplicates(&store).await;
        let lock = LocalLock::default();

        let outcome = migrate_heartbeat_index(&store, Some(&lock as &dyn MigrationLock)).await.unwrap();
        assert!(matches!(outcome, MigrationOutcome::Created { .. }));
        assert_eq!(lock.releases.load(Ordering::SeqCst), 1);
        assert!(lock.held.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lock_is_released_on_failure() {
        let (store, _dir) = memory_store().await;
        let lock = LocalLock::default();
        store.close().await.unwrap();

        let result = migrate_heartbeat_index(&store, Some(&lock as &dyn MigrationLock)).await;
        assert!(matches!(result, Err(StoreError::Closed)));
        assert_eq!(lock.releases.load(Ordering::SeqCst), 1);
        assert!(lock.held.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_skips_when_lock_is_held() {
        let (store, _dir) = memory_store().await;
        drop_index_and_insert_duplicates(&store).await;

        let lock = LocalLock::default();
        let other = lock
            .try_acquire(MIGRATION_LOCK_NAME, MIGRATION_LOCK_TTL)
            .await
            .unwrap();
        assert!(other.is_some());

        let outcome = migrate_heartbeat_index(&store, Some(&lock as &dyn MigrationLock)).await.unwrap();
        assert_eq!(outcome, MigrationOutcome::Skipped);
        assert_eq!(lock.releases.load(Ordering::SeqCst), 0);
        // Nothing was deduplicated
        assert_eq!(surviving_rows(&store).await.len(), 5);
    }

    #[tokio::test]
    async fn test_unreachable_redis_skips_migration() {
        let (store, _dir) = memory_store().await;
        drop_index_and_insert_duplicates(&store).await;

        // Nothing listens on port 1
        let lock = RedisMigrationLock::new("redis://127.0.0.1:1/").unwrap();
        let outcome = migrate_heartbeat_index(&store, Some(&lock as &dyn MigrationLock))
            .await
            .unwrap();
        assert_eq!(outcome, MigrationOutcome::Skipped);
        assert_eq!(surviving_rows(&store).await.len(), 5);
    }

    #[tokio::test]
    async fn test_shared_store_opens_with_unreachable_redis() {
        let dir = tempfile::tempdir().unwrap();
        let lock = RedisMigrationLock::new("redis://127.0.0.1:1/").unwrap();

        let store = BackingStore::open(
            StoreConfig::shared(dir.path().join("shared.db")),
            Some(&lock as &dyn MigrationLock),
        )
        .await
        .unwrap();
        assert_eq!(store.mode(), StoreMode::Shared);
        assert!(surviving_rows(&store).await.is_empty());
        store.close().await.unwrap();
    }

    #[test]
    fn test_invalid_redis_url_is_rejected() {
        assert!(matches!(
            RedisMigrationLock::new("not a redis url"),
            Err(StoreError::Redis(_))
        ));
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_redis_lock_exclusive() {
        let lock = RedisMigrationLock::new("redis://localhost:6379").unwrap();
        let name = format!("test_lock_{}", Uuid::new_v4().simple());

        let token = lock
            .try_acquire(&name, Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert!(lock
            .try_acquire(&name, Duration::from_secs(5))
            .await
            .unwrap()
            .is_none());

        assert!(!lock.release(&name, "someone-else").await.unwrap());
        assert!(lock.release(&name, &token).await.unwrap());
        assert!(lock
            .try_acquire(&name, Duration::from_secs(5))
            .await
            .unwrap()
            .is_some());
    }
}
