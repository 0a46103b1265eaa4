use thiserror::Error;

/// Error taxonomy shared by every gateway crate
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Backend unreachable: {0}")]
    Backend(String),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl GatewayError {
    /// Whether the error was caused by the caller rather than the gateway or a backend
    pub fn is_client_error(&self) -> bool {
        matches!(self, GatewayError::InvalidInput(_))
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
