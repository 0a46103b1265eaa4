//! Audit query filters and pagination
//!
//! Filters are parsed leniently from query-string parameters: empty or
//! unparsable values are treated as absent rather than rejected.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const DEFAULT_LIMIT: i64 = 100;
pub const DEFAULT_OFFSET: i64 = 0;

/// Filters accepted by attestation record queries
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttestationFilter {
    pub session_id: Option<String>,
    pub source_service: Option<String>,
    pub instance_id: Option<String>,
    pub successful: Option<bool>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl AttestationFilter {
    pub fn from_query(params: &HashMap<String, String>) -> Self {
        Self {
            session_id: text_param(params, "session_id"),
            source_service: text_param(params, "source_service"),
            instance_id: text_param(params, "instance_id"),
            successful: params.get("successful").and_then(|v| parse_bool(v)),
            start_time: params.get("start_time").and_then(|v| parse_time(v)),
            end_time: params.get("end_time").and_then(|v| parse_time(v)),
        }
    }
}

/// Filters accepted by resource request queries
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceFilter {
    pub session_id: Option<String>,
    pub repository: Option<String>,
    pub resource_type: Option<String>,
    pub tag: Option<String>,
    pub method: Option<String>,
    pub instance_id: Option<String>,
    pub successful: Option<bool>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl ResourceFilter {
    pub fn from_query(params: &HashMap<String, String>) -> Self {
        Self {
            session_id: text_param(params, "session_id"),
            repository: text_param(params, "repository"),
            resource_type: text_param(params, "type"),
            tag: text_param(params, "tag"),
            method: text_param(params, "method"),
            instance_id: text_param(params, "instance_id"),
            successful: params.get("successful").and_then(|v| parse_bool(v)),
            start_time: params.get("start_time").and_then(|v| parse_time(v)),
            end_time: params.get("end_time").and_then(|v| parse_time(v)),
        }
    }
}

/// Page window over a timestamp-descending result set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: i64,
    pub offset: i64,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            offset: DEFAULT_OFFSET,
        }
    }
}

impl Pagination {
    /// Non-positive limits and negative offsets fall back to the defaults
    pub fn new(limit: i64, offset: i64) -> Self {
        Self {
            limit: if limit <= 0 { DEFAULT_LIMIT } else { limit },
            offset: if offset < 0 { DEFAULT_OFFSET } else { offset },
        }
    }

    /// Build from raw query-string values; anything unparsable uses the default
    pub fn from_raw(limit: Option<&str>, offset: Option<&str>) -> Self {
        let limit = limit
            .and_then(|v| v.trim().parse::<i64>().ok())
            .unwrap_or(DEFAULT_LIMIT);
        let offset = offset
            .and_then(|v| v.trim().parse::<i64>().ok())
            .unwrap_or(DEFAULT_OFFSET);
        Self::new(limit, offset)
    }

    pub fn from_query(params: &HashMap<String, String>) -> Self {
        Self::from_raw(
            params.get("limit").map(String::as_str),
            params.get("offset").map(String::as_str),
        )
    }
}

fn text_param(params: &HashMap<String, String>, key: &str) -> Option<String> {
    params.get(key).filter(|v| !v.is_empty()).cloned()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
