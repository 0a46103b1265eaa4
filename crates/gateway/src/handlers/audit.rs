//! Audit query routes

use axum::{
    extract::{Query, State},
    Json,
};
use gateway_common::{AttestationFilter, AttestationRecord, Pagination, ResourceFilter, ResourceRequest};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::error;

use crate::error::ApiError;
use crate::AppState;

/// One page of audit rows plus the total matching the filter
#[derive(Debug, Serialize)]
pub struct AuditPage<T> {
    pub data: Vec<T>,
    pub total: i64,
}

/// `GET /api/audit/attestation`
pub async fn list_attestation_records(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<AuditPage<AttestationRecord>>, ApiError> {
    let filter = AttestationFilter::from_query(&params);
    let page = Pagination::from_query(&params);

    let data = state
        .ledger
        .list_attestation_records(&filter, page)
        .await
        .map_err(|e| {
            error!("Failed to list attestation records: {}", e);
            ApiError::internal("Failed to retrieve attestation records")
        })?;
    let total = state
        .ledger
        .count_attestation_records(&filter)
        .await
        .map_err(|e| {
            error!("Failed to count attestation records: {}", e);
            ApiError::internal("Failed to count attestation records")
        })?;

    Ok(Json(AuditPage { data, total }))
}

/// `GET /api/audit/resources`
pub async fn list_resource_requests(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<AuditPage<ResourceRequest>>, ApiError> {
    let filter = ResourceFilter::from_query(&params);
    let page = Pagination::from_query(&params);

    let data = state
        .ledger
        .list_resource_requests(&filter, page)
        .await
        .map_err(|e| {
            error!("Failed to list resource requests: {}", e);
            ApiError::internal("Failed to retrieve resource requests")
        })?;
    let total = state
        .ledger
        .count_resource_requests(&filter)
        .await
        .map_err(|e| {
            error!("Failed to count resource requests: {}", e);
            ApiError::internal("Failed to count resource requests")
        })?;

    Ok(Json(AuditPage { data, total }))
}
