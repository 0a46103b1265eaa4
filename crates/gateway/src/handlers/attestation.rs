//! Attestation Service routes, served under both public prefixes

use axum::extract::State;
use gateway_common::SourceService;
use std::sync::Arc;
use tracing::error;

use super::record_attestation;
use crate::error::ApiError;
use crate::forwarder::{ForwardedResponse, InboundRequest, ServiceTarget};
use crate::AppState;

pub async fn passthrough(
    State(state): State<Arc<AppState>>,
    req: InboundRequest,
) -> Result<ForwardedResponse, ApiError> {
    Ok(state
        .forwarder
        .forward(ServiceTarget::AttestationService, &req)
        .await?)
}

/// `POST /attestation`; the Attestation Service has no session cookie
pub async fn attestation(
    State(state): State<Arc<AppState>>,
    req: InboundRequest,
) -> Result<ForwardedResponse, ApiError> {
    let result = state
        .forwarder
        .forward(ServiceTarget::AttestationService, &req)
        .await;
    if let Err(e) = &result {
        error!("Failed to forward attestation request to Attestation Service: {}", e);
    }

    record_attestation(
        &state,
        SourceService::AttestationService,
        String::new(),
        &req,
        result,
    )
}
