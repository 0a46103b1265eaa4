//! Attestation agent liveness routes

use axum::{extract::State, Json};
use chrono::{SecondsFormat, Utc};
use gateway_common::{parse_instance_info, GatewayError, Heartbeat, INSTANCE_INFO_HEADER};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info};

use crate::error::ApiError;
use crate::forwarder::InboundRequest;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct ActiveInstances {
    pub active_aa_instances: Vec<Heartbeat>,
    pub count: usize,
    pub timestamp: String,
}

fn rfc3339_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// `POST /api/aa-instance/heartbeat`
///
/// The identity header is mandatory here, unlike on audited routes.
pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    req: InboundRequest,
) -> Result<Json<Value>, ApiError> {
    let instance_info =
        parse_instance_info(req.header_str(INSTANCE_INFO_HEADER)).map_err(|e| {
            error!("Rejected heartbeat: {}", e);
            match e {
                GatewayError::InvalidInput(message) => ApiError::bad_request(message),
                other => other.into(),
            }
        })?;

    let heartbeat = Heartbeat::new(instance_info, req.client_ip.clone());
    state.heartbeats.upsert(&heartbeat).await.map_err(|e| {
        error!("Failed to save heartbeat: {}", e);
        ApiError::internal("Failed to save heartbeat")
    })?;

    info!(
        "Heartbeat received from AA instance: {} (IP: {})",
        heartbeat.instance_id(),
        heartbeat.client_ip
    );

    Ok(Json(json!({
        "status": "ok",
        "timestamp": heartbeat
            .last_heartbeat
            .to_rfc3339_opts(SecondsFormat::Secs, true),
    })))
}

/// `GET /api/aa-instance/list`
pub async fn list_active(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ActiveInstances>, ApiError> {
    let active = state.heartbeats.active_instances().await.map_err(|e| {
        error!("Failed to get active AA instances: {}", e);
        ApiError::internal("Failed to retrieve active AA instances")
    })?;

    info!("Retrieved {} active AA instances", active.len());

    Ok(Json(ActiveInstances {
        count: active.len(),
        active_aa_instances: active,
        timestamp: rfc3339_now(),
    }))
}
