//! Table and index definitions

use rusqlite::Connection;

pub(crate) const HEARTBEAT_UNIQUE_INDEX: &str = "idx_aa_heartbeat_instance_id";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS attestation_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    client_ip TEXT NOT NULL DEFAULT '',
    session_id TEXT NOT NULL DEFAULT '',
    request_body TEXT NOT NULL DEFAULT '',
    claims TEXT NOT NULL DEFAULT '',
    status INTEGER NOT NULL,
    successful INTEGER NOT NULL,
    timestamp INTEGER NOT NULL,
    source_service TEXT NOT NULL,
    instance_id TEXT NOT NULL DEFAULT '',
    instance_image_id TEXT NOT NULL DEFAULT '',
    instance_name TEXT NOT NULL DEFAULT '',
    instance_owner_account_id TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_attestation_records_timestamp ON attestation_records(timestamp);
CREATE INDEX IF NOT EXISTS idx_attestation_records_session_id ON attestation_records(session_id);
CREATE INDEX IF NOT EXISTS idx_attestation_records_instance_id ON attestation_records(instance_id);

CREATE TABLE IF NOT EXISTS resource_requests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    client_ip TEXT NOT NULL DEFAULT '',
    session_id TEXT NOT NULL DEFAULT '',
    repository TEXT NOT NULL DEFAULT '',
    type TEXT NOT NULL DEFAULT '',
    tag TEXT NOT NULL DEFAULT '',
    method TEXT NOT NULL DEFAULT '',
    status INTEGER NOT NULL,
    successful INTEGER NOT NULL,
    timestamp INTEGER NOT NULL,
    instance_id TEXT NOT NULL DEFAULT '',
    instance_image_id TEXT NOT NULL DEFAULT '',
    instance_name TEXT NOT NULL DEFAULT '',
    instance_owner_account_id TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_resource_requests_timestamp ON resource_requests(timestamp);
CREATE INDEX IF NOT EXISTS idx_resource_requests_session_id ON resource_requests(session_id);
CREATE INDEX IF NOT EXISTS idx_resource_requests_instance_id ON resource_requests(instance_id);

CREATE TABLE IF NOT EXISTS aa_instance_heartbeats (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    instance_id TEXT NOT NULL,
    instance_image_id TEXT NOT NULL DEFAULT '',
    instance_name TEXT NOT NULL DEFAULT '',
    instance_owner_account_id TEXT NOT NULL DEFAULT '',
    client_ip TEXT NOT NULL DEFAULT '',
    last_heartbeat INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_aa_heartbeat_last_heartbeat ON aa_instance_heartbeats(last_heartbeat);
"#;

/// Create every table and non-unique index; safe to run on an existing database
pub(crate) fn create(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA)
}
