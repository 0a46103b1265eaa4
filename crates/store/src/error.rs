use gateway_common::GatewayError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Blocking task failed: {0}")]
    Task(String),

    #[error("Store is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Snapshot(msg) => GatewayError::Snapshot(msg),
            StoreError::Migration(msg) => GatewayError::Migration(msg),
            StoreError::InvalidInput(msg) => GatewayError::InvalidInput(msg),
            StoreError::Io(e) => GatewayError::Io(e),
            other => GatewayError::Storage(other.to_string()),
        }
    }
}
