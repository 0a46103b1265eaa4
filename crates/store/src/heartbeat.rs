//! Attestation agent liveness registry
//!
//! One row per `instance_id`, written with a single `INSERT .. ON CONFLICT`
//! so racing heartbeats for the same instance never create a second row.
//! A late-arriving older heartbeat does not overwrite a newer one.

use chrono::{DateTime, Utc};
use gateway_common::{Heartbeat, InstanceInfo};
use rusqlite::{params, Row};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Result, StoreError};
use crate::store::{from_micros, to_micros, BackingStore};

#[derive(Clone)]
pub struct HeartbeatRegistry {
    store: BackingStore,
    timeout: Duration,
}

impl HeartbeatRegistry {
    pub fn new(store: BackingStore, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Heartbeats older than this are inactive
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.timeout)
            .ok()
            .and_then(|window| now.checked_sub_signed(window))
            .unwrap_or_default()
    }

    pub async fn upsert(&self, heartbeat: &Heartbeat) -> Result<()> {
        if heartbeat.instance_id().is_empty() {
            return Err(StoreError::InvalidInput(
                "heartbeat requires an instance_id".to_string(),
            ));
        }

        let heartbeat = heartbeat.clone();
        let now = to_micros(&Utc::now());
        self.store
            .call(move |conn| {
                let info = &heartbeat.instance_info;
                conn.execute(
                    "INSERT INTO aa_instance_heartbeats
                        (instance_id, instance_image_id, instance_name, instance_owner_account_id,
                         client_ip, last_heartbeat, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                     ON CONFLICT(instance_id) DO UPDATE SET
                        instance_image_id = excluded.instance_image_id,
                        instance_name = excluded.instance_name,
                        instance_owner_account_id = excluded.instance_owner_account_id,
                        client_ip = excluded.client_ip,
                        last_heartbeat = excluded.last_heartbeat,
                        updated_at = excluded.updated_at
                     WHERE excluded.last_heartbeat >= aa_instance_heartbeats.last_heartbeat",
                    params![
                        info.instance_id,
                        info.image_id,
                        info.instance_name,
                        info.owner_account_id,
                        heartbeat.client_ip,
                        to_micros(&heartbeat.last_heartbeat),
                        now,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Rows with `last_heartbeat >= cutoff`, newest first
    pub async fn list_active(&self, cutoff: DateTime<Utc>) -> Result<Vec<Heartbeat>> {
        let cutoff = to_micros(&cutoff);
        self.store
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, instance_id, instance_image_id, instance_name,
                            instance_owner_account_id, client_ip, last_heartbeat
                     FROM aa_instance_heartbeats
                     WHERE last_heartbeat >= ?1
                     ORDER BY last_heartbeat DESC",
                )?;
                let rows = stmt
                    .query_map([cutoff], heartbeat_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
    }

    /// Hard-delete rows older than `cutoff`
    pub async fn expire(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let cutoff = to_micros(&cutoff);
        self.store
            .call(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM aa_instance_heartbeats WHERE last_heartbeat < ?1",
                    [cutoff],
                )?)
            })
            .await
    }

    /// List active instances, then expire stale ones
    ///
    /// An expiry failure is logged; the listed rows are still returned.
    pub async fn active_instances(&self) -> Result<Vec<Heartbeat>> {
        let cutoff = self.cutoff(Utc::now());
        let active = self.list_active(cutoff).await?;

        match self.expire(cutoff).await {
            Ok(0) => {}
            Ok(expired) => debug!("Expired {} stale heartbeats", expired),
            Err(e) => warn!("Failed to cleanup expired heartbeats: {}", e),
        }

        Ok(active)
    }
}

fn heartbeat_from_row(row: &Row<'_>) -> rusqlite::Result<Heartbeat> {
    Ok(Heartbeat {
        id: row.get(0)?,
        instance_info: InstanceInfo {
            instance_id: row.get(1)?,
            image_id: row.get(2)?,
            instance_name: row.get(3)?,
            owner_account_id: row.get(4)?,
        },
        client_ip: row.get(5)?,
        last_heartbeat: from_micros(row.get(6)?, 6)?,
    })
}
