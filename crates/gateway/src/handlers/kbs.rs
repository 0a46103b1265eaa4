//! Key Broker Service routes

use axum::extract::{Path, State};
use gateway_common::{instance_info_or_default, ResourceRequest, SourceService, INSTANCE_INFO_HEADER};
use std::sync::Arc;
use tracing::{error, info};

use super::{record_attestation, KBS_SESSION_COOKIE};
use crate::error::ApiError;
use crate::forwarder::{ForwardedResponse, InboundRequest, ServiceTarget};
use crate::AppState;

/// Relay without auditing (auth, policies, resource listing)
pub async fn passthrough(
    State(state): State<Arc<AppState>>,
    req: InboundRequest,
) -> Result<ForwardedResponse, ApiError> {
    Ok(state.forwarder.forward(ServiceTarget::Kbs, &req).await?)
}

/// `POST /attest`, audited with the claims of the returned token
pub async fn attest(
    State(state): State<Arc<AppState>>,
    req: InboundRequest,
) -> Result<ForwardedResponse, ApiError> {
    let session_id = req.cookie(KBS_SESSION_COOKIE).unwrap_or_default();
    let result = state.forwarder.forward(ServiceTarget::Kbs, &req).await;
    if let Err(e) = &result {
        error!("Failed to forward attest request to KBS: {}", e);
    }

    record_attestation(&state, SourceService::Kbs, session_id, &req, result)
}

/// `GET|POST|DELETE /resource/{repository}/{type}/{tag}`, audited per call
pub async fn resource(
    State(state): State<Arc<AppState>>,
    Path((repository, resource_type, tag)): Path<(String, String, String)>,
    req: InboundRequest,
) -> Result<ForwardedResponse, ApiError> {
    let session_id = req.cookie(KBS_SESSION_COOKIE).unwrap_or_default();
    let instance_info = instance_info_or_default(req.header_str(INSTANCE_INFO_HEADER));

    let result = state.forwarder.forward(ServiceTarget::Kbs, &req).await;
    let status = match &result {
        Ok(response) => response.status.as_u16(),
        Err(e) => {
            error!("Failed to forward resource request to KBS: {}", e);
            500
        }
    };

    info!(
        "{} resource {}/{}/{} -> {}",
        req.method, repository, resource_type, tag, status
    );

    state.audit.submit(ResourceRequest::new(
        req.client_ip.clone(),
        session_id,
        repository,
        resource_type,
        tag,
        req.method.as_str(),
        status,
        instance_info,
    ));

    Ok(result?)
}
