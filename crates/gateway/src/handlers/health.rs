//! Gateway and backend health

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderValue, Method, StatusCode, Uri},
    Json,
};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::error;

use crate::forwarder::{Forwarder, InboundRequest, ServiceTarget, PROBE_TIMEOUT};
use crate::AppState;

const KBS_PROBE_PATH: &str = "/api/kbs/v0/auth";
const KBS_PROBE_BODY: &str = r#"{"version":"0.4.0","tee":"sample","extra-params":"foo"}"#;
const AS_PROBE_PATH: &str = "/api/attestation-service/certificate";
const AS_NO_CERTIFICATE: &str = "No certificate configured";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: String,
}

impl ServiceStatus {
    fn ok() -> Self {
        Self {
            status: "ok".to_string(),
            message: None,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            message: Some(message.into()),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub gateway: ServiceStatus,
    pub kbs: ServiceStatus,
    #[serde(rename = "as")]
    pub attestation_service: ServiceStatus,
    pub rvps: ServiceStatus,
}

/// `GET /api/health`
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// `GET /api/services-health`, probing every backend concurrently
pub async fn services_health(State(state): State<Arc<AppState>>) -> Json<HealthStatus> {
    let forwarder = &state.forwarder;
    let (kbs, attestation_service, rvps) = tokio::join!(
        check_kbs(forwarder),
        check_attestation_service(forwarder),
        check_rvps(forwarder),
    );

    Json(HealthStatus {
        gateway: ServiceStatus::ok(),
        kbs,
        attestation_service,
        rvps,
    })
}

/// KBS is healthy when a sample `auth` request is accepted
async fn check_kbs(forwarder: &Forwarder) -> ServiceStatus {
    let mut req = InboundRequest::new(Method::POST, Uri::from_static(KBS_PROBE_PATH))
        .with_body(Bytes::from_static(KBS_PROBE_BODY.as_bytes()));
    req.headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );

    match forwarder
        .forward_with_timeout(ServiceTarget::Kbs, &req, PROBE_TIMEOUT)
        .await
    {
        Ok(response) if response.status == StatusCode::OK => ServiceStatus::ok(),
        Ok(response) => {
            error!("KBS auth probe returned {}", response.status);
            ServiceStatus::error("kbs auth request failed")
        }
        Err(e) => {
            error!("forward kbs auth request failed: {}", e);
            ServiceStatus::error("forward kbs auth request failed")
        }
    }
}

/// The Attestation Service is healthy when it serves its certificate, or
/// answers 404 because none is configured
async fn check_attestation_service(forwarder: &Forwarder) -> ServiceStatus {
    let req = InboundRequest::new(Method::GET, Uri::from_static(AS_PROBE_PATH));

    let response = match forwarder
        .forward_with_timeout(ServiceTarget::AttestationService, &req, PROBE_TIMEOUT)
        .await
    {
        Ok(response) => response,
        Err(e) => {
            error!("forward as certificate request failed: {}", e);
            return ServiceStatus::error("forward as certificate request failed");
        }
    };

    match response.status {
        StatusCode::OK => ServiceStatus::ok(),
        StatusCode::NOT_FOUND if reports_missing_certificate(&response.body) => {
            ServiceStatus::ok()
        }
        status => {
            error!("AS certificate probe returned {}", status);
            ServiceStatus::error(format!(
                "as certificate request failed with status {}",
                status.as_u16()
            ))
        }
    }
}

fn reports_missing_certificate(body: &[u8]) -> bool {
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|value| value.get("error")?.as_str().map(|e| e == AS_NO_CERTIFICATE))
        .unwrap_or(false)
}

async fn check_rvps(forwarder: &Forwarder) -> ServiceStatus {
    if !forwarder.has_rvps() {
        return ServiceStatus::error("rvps grpc client not available");
    }

    match forwarder.query_reference_values(PROBE_TIMEOUT).await {
        Ok(_) => ServiceStatus::ok(),
        Err(e) => {
            error!("rvps health check failed: {}", e);
            ServiceStatus::error(format!("rvps grpc query failed: {}", e))
        }
    }
}
