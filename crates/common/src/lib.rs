//! Shared types for the Trustee gateway
//!
//! **Contents:**
//! - `models`: audit and heartbeat rows plus the embedded instance identity
//! - `query`: audit filters and pagination
//! - `identity`: parsing of the per-request instance identity header
//! - `claims`: best-effort claims extraction from token-shaped bodies
//! - `error`: the gateway error taxonomy

pub mod claims;
pub mod error;
pub mod identity;
pub mod models;
pub mod query;

pub use claims::extract_claims;
pub use error::{GatewayError, Result};
pub use identity::{instance_info_or_default, parse_instance_info, INSTANCE_INFO_HEADER};
pub use models::{
    resource_request_succeeded, AttestationRecord, AuditRecord, Heartbeat, InstanceInfo,
    ResourceRequest, SourceService,
};
pub use query::{AttestationFilter, Pagination, ResourceFilter};
