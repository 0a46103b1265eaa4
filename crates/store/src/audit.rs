//! Audit ledger
//!
//! Append-only attestation and resource request rows with filtered,
//! timestamp-descending queries and a retention policy. Rows are only ever
//! removed by retention, and removal is a hard delete.

use chrono::{DateTime, Utc};
use gateway_common::{
    AttestationFilter, AttestationRecord, AuditRecord, InstanceInfo, Pagination, ResourceFilter,
    ResourceRequest,
};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, Row};
use serde::Serialize;
use tracing::debug;

use crate::error::Result;
use crate::store::{from_micros, to_micros, BackingStore};

const ATTESTATION_TABLE: &str = "attestation_records";
const RESOURCE_TABLE: &str = "resource_requests";

const ATTESTATION_COLUMNS: &str = "id, client_ip, session_id, request_body, claims, status, \
     successful, timestamp, source_service, instance_id, instance_image_id, instance_name, \
     instance_owner_account_id";

const RESOURCE_COLUMNS: &str = "id, client_ip, session_id, repository, type, tag, method, \
     status, successful, timestamp, instance_id, instance_image_id, instance_name, \
     instance_owner_account_id";

/// Unfiltered row counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AuditStats {
    pub attestation_records: i64,
    pub resource_requests: i64,
}

/// Rows removed by one retention sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub attestation_deleted: usize,
    pub resource_deleted: usize,
}

impl CleanupReport {
    pub fn total(&self) -> usize {
        self.attestation_deleted + self.resource_deleted
    }
}

#[derive(Clone)]
pub struct AuditLedger {
    store: BackingStore,
}

impl AuditLedger {
    pub fn new(store: BackingStore) -> Self {
        Self { store }
    }

    /// Persist a record and return its id
    pub async fn save(&self, record: AuditRecord) -> Result<i64> {
        match record {
            AuditRecord::Attestation(record) => self.save_attestation(&record).await,
            AuditRecord::Resource(request) => self.save_resource_request(&request).await,
        }
    }

    pub async fn save_attestation(&self, record: &AttestationRecord) -> Result<i64> {
        let record = record.clone();
        self.store
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO attestation_records
                        (client_ip, session_id, request_body, claims, status, successful,
                         timestamp, source_service, instance_id, instance_image_id,
                         instance_name, instance_owner_account_id)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    params![
                        record.client_ip,
                        record.session_id,
                        record.request_body,
                        record.claims,
                        record.http_status,
                        record.successful,
                        to_micros(&record.timestamp),
                        record.source_service.as_str(),
                        record.instance_info.instance_id,
                        record.instance_info.image_id,
                        record.instance_info.instance_name,
                        record.instance_info.owner_account_id,
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
    }

    pub async fn save_resource_request(&self, request: &ResourceRequest) -> Result<i64> {
        let request = request.clone();
        self.store
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO resource_requests
                        (client_ip, session_id, repository, type, tag, method, status,
                         successful, timestamp, instance_id, instance_image_id,
                         instance_name, instance_owner_account_id)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                    params![
                        request.client_ip,
                        request.session_id,
                        request.repository,
                        request.resource_type,
                        request.tag,
                        request.method,
                        request.http_status,
                        request.successful,
                        to_micros(&request.timestamp),
                        request.instance_info.instance_id,
                        request.instance_info.image_id,
                        request.instance_info.instance_name,
                        request.instance_info.owner_account_id,
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
    }

    pub async fn list_attestation_records(
        &self,
        filter: &AttestationFilter,
        page: Pagination,
    ) -> Result<Vec<AttestationRecord>> {
        let conditions = Conditions::for_attestation(filter);
        self.store
            .call(move |conn| {
                select_page(
                    conn,
                    ATTESTATION_COLUMNS,
                    ATTESTATION_TABLE,
                    conditions,
                    page,
                    attestation_from_row,
                )
            })
            .await
    }

    pub async fn count_attestation_records(&self, filter: &AttestationFilter) -> Result<i64> {
        let conditions = Conditions::for_attestation(filter);
        self.store
            .call(move |conn| count_where(conn, ATTESTATION_TABLE, &conditions))
            .await
    }

    pub async fn list_resource_requests(
        &self,
        filter: &ResourceFilter,
        page: Pagination,
    ) -> Result<Vec<ResourceRequest>> {
        let conditions = Conditions::for_resource(filter);
        self.store
            .call(move |conn| {
                select_page(
                    conn,
                    RESOURCE_COLUMNS,
                    RESOURCE_TABLE,
                    conditions,
                    page,
                    resource_from_row,
                )
            })
            .await
    }

    pub async fn count_resource_requests(&self, filter: &ResourceFilter) -> Result<i64> {
        let conditions = Conditions::for_resource(filter);
        self.store
            .call(move |conn| count_where(conn, RESOURCE_TABLE, &conditions))
            .await
    }

    pub async fn stats(&self) -> Result<AuditStats> {
        self.store
            .call(|conn| {
                Ok(AuditStats {
                    attestation_records: count_where(
                        conn,
                        ATTESTATION_TABLE,
                        &Conditions::default(),
                    )?,
                    resource_requests: count_where(conn, RESOURCE_TABLE, &Conditions::default())?,
                })
            })
            .await
    }

    /// Apply time-based then count-based retention
    ///
    /// `retention_days <= 0` disables the time policy and `max_records <= 0`
    /// disables the count policy. Only one sweep runs per store at a time.
    pub async fn cleanup_old_records(
        &self,
        max_records: i64,
        retention_days: i64,
    ) -> Result<CleanupReport> {
        let _guard = self.store.retention_lock().lock().await;

        let cutoff = retention_cutoff(Utc::now(), retention_days);
        let report = self
            .store
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut report = CleanupReport::default();

                if let Some(cutoff) = cutoff {
                    let cutoff = to_micros(&cutoff);
                    report.attestation_deleted += tx.execute(
                        "DELETE FROM attestation_records WHERE timestamp < ?1",
                        [cutoff],
                    )?;
                    report.resource_deleted += tx.execute(
                        "DELETE FROM resource_requests WHERE timestamp < ?1",
                        [cutoff],
                    )?;
                }

                if max_records > 0 {
                    report.attestation_deleted +=
                        keep_newest(&tx, ATTESTATION_TABLE, max_records)?;
                    report.resource_deleted += keep_newest(&tx, RESOURCE_TABLE, max_records)?;
                }

                tx.commit()?;
                Ok(report)
            })
            .await?;

        debug!(
            "Retention sweep removed {} attestation records, {} resource requests",
            report.attestation_deleted, report.resource_deleted
        );
        Ok(report)
    }
}

fn retention_cutoff(now: DateTime<Utc>, retention_days: i64) -> Option<DateTime<Utc>> {
    if retention_days <= 0 {
        return None;
    }
    chrono::Duration::try_days(retention_days).and_then(|window| now.checked_sub_signed(window))
}

/// Delete every row outside the `max_records` most recent of `table`
fn keep_newest(conn: &Connection, table: &str, max_records: i64) -> rusqlite::Result<usize> {
    let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
        row.get(0)
    })?;
    if count <= max_records {
        return Ok(0);
    }

    // An empty keep set deletes everything, which NOT IN handles directly.
    conn.execute(
        &format!(
            "DELETE FROM {table} WHERE id NOT IN (
                 SELECT id FROM {table} ORDER BY timestamp DESC, id DESC LIMIT ?1
             )"
        ),
        [max_records],
    )
}

/// WHERE clause under construction
#[derive(Debug, Default)]
struct Conditions {
    clauses: Vec<&'static str>,
    params: Vec<Value>,
}

impl Conditions {
    fn for_attestation(filter: &AttestationFilter) -> Self {
        let mut conditions = Self::default();
        conditions.text("session_id = ?", &filter.session_id);
        conditions.text("source_service = ?", &filter.source_service);
        conditions.text("instance_id = ?", &filter.instance_id);
        conditions.flag("successful = ?", filter.successful);
        conditions.time_range(filter.start_time, filter.end_time);
        conditions
    }

    fn for_resource(filter: &ResourceFilter) -> Self {
        let mut conditions = Self::default();
        conditions.text("session_id = ?", &filter.session_id);
        conditions.text("repository = ?", &filter.repository);
        conditions.text("type = ?", &filter.resource_type);
        conditions.text("tag = ?", &filter.tag);
        conditions.text("method = ?", &filter.method);
        conditions.text("instance_id = ?", &filter.instance_id);
        conditions.flag("successful = ?", filter.successful);
        conditions.time_range(filter.start_time, filter.end_time);
        conditions
    }

    fn text(&mut self, clause: &'static str, value: &Option<String>) {
        if let Some(value) = value.as_ref().filter(|v| !v.is_empty()) {
            self.clauses.push(clause);
            self.params.push(Value::Text(value.clone()));
        }
    }

    fn flag(&mut self, clause: &'static str, value: Option<bool>) {
        if let Some(value) = value {
            self.clauses.push(clause);
            self.params.push(Value::Integer(i64::from(value)));
        }
    }

    fn time_range(&mut self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) {
        if let Some(start) = start {
            self.clauses.push("timestamp >= ?");
            self.params.push(Value::Integer(to_micros(&start)));
        }
        if let Some(end) = end {
            self.clauses.push("timestamp <= ?");
            self.params.push(Value::Integer(to_micros(&end)));
        }
    }

    fn sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }
}

fn select_page<T>(
    conn: &Connection,
    columns: &str,
    table: &str,
    mut conditions: Conditions,
    page: Pagination,
    map_row: fn(&Row<'_>) -> rusqlite::Result<T>,
) -> Result<Vec<T>> {
    let sql = format!(
        "SELECT {} FROM {}{} ORDER BY timestamp DESC, id DESC LIMIT ? OFFSET ?",
        columns,
        table,
        conditions.sql()
    );
    conditions.params.push(Value::Integer(page.limit));
    conditions.params.push(Value::Integer(page.offset));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(conditions.params.iter()), map_row)?
        .collect::<rusqlite::Result<Vec<T>>>()?;
    Ok(rows)
}

fn count_where(conn: &Connection, table: &str, conditions: &Conditions) -> Result<i64> {
    let sql = format!("SELECT COUNT(*) FROM {}{}", table, conditions.sql());
    let count = conn.query_row(&sql, params_from_iter(conditions.params.iter()), |row| {
        row.get(0)
    })?;
    Ok(count)
}

fn instance_from_row(row: &Row<'_>, first: usize) -> rusqlite::Result<InstanceInfo> {
    Ok(InstanceInfo {
        instance_id: row.get(first)?,
        image_id: row.get(first + 1)?,
        instance_name: row.get(first + 2)?,
        owner_account_id: row.get(first + 3)?,
    })
}

fn attestation_from_row(row: &Row<'_>) -> rusqlite::Result<AttestationRecord> {
    let source: String = row.get(8)?;
    Ok(AttestationRecord {
        id: row.get(0)?,
        client_ip: row.get(1)?,
        session_id: row.get(2)?,
        request_body: row.get(3)?,
        claims: row.get(4)?,
        http_status: row.get(5)?,
        successful: row.get(6)?,
        timestamp: from_micros(row.get(7)?, 7)?,
        source_service: source
            .parse()
            .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(8, Type::Text, e.into()))?,
        instance_info: instance_from_row(row, 9)?,
    })
}

fn resource_from_row(row: &Row<'_>) -> rusqlite::Result<ResourceRequest> {
    Ok(ResourceRequest {
        id: row.get(0)?,
        client_ip: row.get(1)?,
        session_id: row.get(2)?,
        repository: row.get(3)?,
        resource_type: row.get(4)?,
        tag: row.get(5)?,
        method: row.get(6)?,
        http_status: row.get(7)?,
        successful: row.get(8)?,
        timestamp: from_micros(row.get(9)?, 9)?,
        instance_info: instance_from_row(row, 10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::memory_store;
    use chrono::Duration;
    use gateway_common::SourceService;

    fn attestation_at(ts: DateTime<Utc>, session: &str, status: u16) -> AttestationRecord {
        let mut record = AttestationRecord::new(
            SourceService::Kbs,
            "10.0.0.1",
            session,
            "{\"tee\":\"sample\"}",
            "{}",
            status,
            InstanceInfo {
                instance_id: format!("inst-{}", session),
                ..Default::default()
            },
        );
        record.timestamp = ts;
        record
    }

    fn resource_at(ts: DateTime<Utc>, method: &str, status: u16) -> ResourceRequest {
        let mut request = ResourceRequest::new(
            "10.0.0.2",
            "sess",
            "default",
            "key",
            "1",
            method,
            status,
            InstanceInfo::default(),
        );
        request.timestamp = ts;
        request
    }

    #[tokio::test]
    async fn test_save_and_list_round_trip() {
        let (store, _dir) = memory_store().await;
        let ledger = AuditLedger::new(store);

        let record = attestation_at(Utc::now(), "s1", 200);
        let id = ledger.save(record.clone().into()).await.unwrap();
        assert!(id > 0);

        let listed = ledger
            .list_attestation_records(&AttestationFilter::default(), Pagination::default())
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        let saved = &listed[0];
        assert_eq!(saved.id, id);
        assert_eq!(saved.session_id, "s1");
        assert_eq!(saved.request_body, record.request_body);
        assert_eq!(saved.source_service, SourceService::Kbs);
        assert_eq!(saved.instance_info.instance_id, "inst-s1");
        assert_eq!(saved.timestamp.timestamp_micros(), record.timestamp.timestamp_micros());
        assert!(saved.successful);
    }

    #[tokio::test]
    async fn test_pagination_boundary() {
        let (store, _dir) = memory_store().await;
        let ledger = AuditLedger::new(store);
        let now = Utc::now();

        for (offset, session) in [(3, "oldest"), (2, "middle"), (1, "newest")] {
            ledger
                .save_attestation(&attestation_at(now - Duration::minutes(offset), session, 200))
                .await
                .unwrap();
        }

        let page = ledger
            .list_attestation_records(&AttestationFilter::default(), Pagination::new(1, 1))
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].session_id, "middle");

        let all = ledger
            .list_attestation_records(&AttestationFilter::default(), Pagination::default())
            .await
            .unwrap();
        let sessions: Vec<_> = all.iter().map(|r| r.session_id.as_str()).collect();
        assert_eq!(sessions, vec!["newest", "middle", "oldest"]);
    }

    #[tokio::test]
    async fn test_attestation_filters() {
        let (store, _dir) = memory_store().await;
        let ledger = AuditLedger::new(store);
        let now = Utc::now();

        ledger
            .save_attestation(&attestation_at(now - Duration::hours(2), "a", 200))
            .await
            .unwrap();
        ledger
            .save_attestation(&attestation_at(now - Duration::hours(1), "b", 401))
            .await
            .unwrap();
        let mut from_as = attestation_at(now, "c", 200);
        from_as.source_service = SourceService::AttestationService;
        ledger.save_attestation(&from_as).await.unwrap();

        let failed = AttestationFilter {
            successful: Some(false),
            ..Default::default()
        };
        assert_eq!(ledger.count_attestation_records(&failed).await.unwrap(), 1);

        let by_source = AttestationFilter {
            source_service: Some("attestation-service".to_string()),
            ..Default::default()
        };
        let listed = ledger
            .list_attestation_records(&by_source, Pagination::default())
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].session_id, "c");

        let recent = AttestationFilter {
            start_time: Some(now - Duration::minutes(90)),
            ..Default::default()
        };
        assert_eq!(ledger.count_attestation_records(&recent).await.unwrap(), 2);

        let window = AttestationFilter {
            start_time: Some(now - Duration::minutes(90)),
            end_time: Some(now - Duration::minutes(30)),
            ..Default::default()
        };
        assert_eq!(ledger.count_attestation_records(&window).await.unwrap(), 1);

        let by_instance = AttestationFilter {
            instance_id: Some("inst-a".to_string()),
            ..Default::default()
        };
        assert_eq!(ledger.count_attestation_records(&by_instance).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_resource_filters() {
        let (store, _dir) = memory_store().await;
        let ledger = AuditLedger::new(store);
        let now = Utc::now();

        ledger
            .save(resource_at(now - Duration::seconds(3), "GET", 200).into())
            .await
            .unwrap();
        ledger
            .save(resource_at(now - Duration::seconds(2), "POST", 201).into())
            .await
            .unwrap();
        ledger
            .save(resource_at(now - Duration::seconds(1), "DELETE", 500).into())
            .await
            .unwrap();

        let posts = ResourceFilter {
            method: Some("POST".to_string()),
            ..Default::default()
        };
        let listed = ledger
            .list_resource_requests(&posts, Pagination::default())
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].successful);
        assert_eq!(listed[0].http_status, 201);

        let ok = ResourceFilter {
            successful: Some(true),
            resource_type: Some("key".to_string()),
            ..Default::default()
        };
        assert_eq!(ledger.count_resource_requests(&ok).await.unwrap(), 2);

        let other_repo = ResourceFilter {
            repository: Some("other".to_string()),
            ..Default::default()
        };
        assert_eq!(ledger.count_resource_requests(&other_repo).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_time_based_retention() {
        let (store, _dir) = memory_store().await;
        let ledger = AuditLedger::new(store.clone());
        let now = Utc::now();

        for (days, session) in [(5, "old"), (2, "recent"), (0, "now")] {
            ledger
                .save_attestation(&attestation_at(now - Duration::days(days), session, 200))
                .await
                .unwrap();
            ledger
                .save_resource_request(&resource_at(now - Duration::days(days), "GET", 200))
                .await
                .unwrap();
        }

        let report = ledger.cleanup_old_records(0, 3).await.unwrap();
        assert_eq!(
            report,
            CleanupReport {
                attestation_deleted: 1,
                resource_deleted: 1
            }
        );

        let remaining = ledger
            .list_attestation_records(&AttestationFilter::default(), Pagination::default())
            .await
            .unwrap();
        let sessions: Vec<_> = remaining.iter().map(|r| r.session_id.as_str()).collect();
        assert_eq!(sessions, vec!["now", "recent"]);

        // Hard delete: the row is gone from the raw table too
        let raw_count: i64 = store
            .call(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM attestation_records WHERE session_id = 'old'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(raw_count, 0);
        assert_eq!(
            ledger.stats().await.unwrap(),
            AuditStats {
                attestation_records: 2,
                resource_requests: 2
            }
        );
    }

    #[tokio::test]
    async fn test_count_based_retention() {
        let (store, _dir) = memory_store().await;
        let ledger = AuditLedger::new(store);
        let now = Utc::now();

        // Inserted out of timestamp order so ids and timestamps disagree
        for minutes in [30, 10, 70, 50, 20, 60, 40] {
            ledger
                .save_attestation(&attestation_at(
                    now - Duration::minutes(minutes),
                    &format!("m{}", minutes),
                    200,
                ))
                .await
                .unwrap();
        }
        ledger
            .save_resource_request(&resource_at(now, "GET", 200))
            .await
            .unwrap();

        let report = ledger.cleanup_old_records(3, 0).await.unwrap();
        assert_eq!(report.attestation_deleted, 4);
        assert_eq!(report.resource_deleted, 0);

        let remaining = ledger
            .list_attestation_records(&AttestationFilter::default(), Pagination::default())
            .await
            .unwrap();
        let sessions: Vec<_> = remaining.iter().map(|r| r.session_id.as_str()).collect();
        assert_eq!(sessions, vec!["m10", "m20", "m30"]);
    }

    #[tokio::test]
    async fn test_count_retention_keeps_highest_ids_on_equal_timestamps() {
        let (store, _dir) = memory_store().await;
        let ledger = AuditLedger::new(store);
        let ts = Utc::now();

        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(
                ledger
                    .save_attestation(&attestation_at(ts, &format!("t{}", i), 200))
                    .await
                    .unwrap(),
            );
        }

        let report = ledger.cleanup_old_records(2, 0).await.unwrap();
        assert_eq!(report.attestation_deleted, 3);

        let mut kept: Vec<i64> = ledger
            .list_attestation_records(&AttestationFilter::default(), Pagination::default())
            .await
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        kept.sort_unstable();
        assert_eq!(kept, ids[3..].to_vec());
    }

    #[tokio::test]
    async fn test_concurrent_sweeps_run_one_at_a_time() {
        let (store, _dir) = memory_store().await;
        let ledger = AuditLedger::new(store.clone());
        let now = Utc::now();
        for i in 0..20 {
            ledger
                .save_attestation(&attestation_at(
                    now - Duration::seconds(i),
                    &format!("c{}", i),
                    200,
                ))
                .await
                .unwrap();
        }

        // While the sweep lock is held, no sweep may make progress
        let guard = store.retention_lock().lock().await;
        let sweeps: Vec<_> = (0..4)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.cleanup_old_records(5, 0).await })
            })
            .collect();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(sweeps.iter().all(|sweep| !sweep.is_finished()));
        assert_eq!(ledger.stats().await.unwrap().attestation_records, 20);
        drop(guard);

        let mut total_deleted = 0;
        for sweep in sweeps {
            total_deleted += sweep.await.unwrap().unwrap().attestation_deleted;
        }

        // The first sweep does all the work; the rest find nothing to delete
        assert_eq!(total_deleted, 15);
        let remaining = ledger
            .list_attestation_records(&AttestationFilter::default(), Pagination::default())
            .await
            .unwrap();
        let sessions: Vec<_> = remaining.iter().map(|r| r.session_id.as_str()).collect();
        assert_eq!(sessions, vec!["c0", "c1", "c2", "c3", "c4"]);
    }

    #[tokio::test]
    async fn test_disabled_policies_delete_nothing() {
        let (store, _dir) = memory_store().await;
        let ledger = AuditLedger::new(store);

        ledger
            .save_attestation(&attestation_at(Utc::now() - Duration::days(400), "ancient", 200))
            .await
            .unwrap();

        let report = ledger.cleanup_old_records(0, -1).await.unwrap();
        assert_eq!(report.total(), 0);
        assert_eq!(ledger.stats().await.unwrap().attestation_records, 1);
    }
}
