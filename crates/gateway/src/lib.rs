//! Trustee Gateway
//!
//! Single entry point in front of the confidential-computing trust stack:
//! the Key Broker Service, the Attestation Service and the Reference Value
//! Provider Service.
//!
//! ## Architecture
//!
//! - `forwarder`: HTTP passthrough to KBS and AS, RPC dispatch to RVPS
//! - `handlers`: axum handlers that forward, then queue audit records
//! - `rvps`: the gRPC client for RVPS
//! - `config`: environment-driven configuration
//!
//! Persistence (audit ledger, heartbeats, snapshots, retention) lives in
//! `gateway-store`.
//!
//! ## Endpoints
//!
//! - `/api/kbs/v0/*` - KBS passthrough; `attest` and `resource` calls are audited
//! - `/api/attestation-service/*`, `/api/as/*` - AS passthrough; `attestation` is audited
//! - `/api/rvps/{*path}` - RVPS `query`, `register` and `delete/{name}` over gRPC
//! - `GET /api/audit/attestation`, `GET /api/audit/resources` - audit queries
//! - `POST /api/aa-instance/heartbeat`, `GET /api/aa-instance/list` - agent liveness
//! - `GET /api/health`, `GET /api/services-health` - health checks

pub mod config;
pub mod error;
pub mod forwarder;
pub mod handlers;
pub mod rvps;

use axum::{
    routing::{any, get, post},
    Router,
};
use gateway_store::{AuditLedger, AuditSink, HeartbeatRegistry};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::forwarder::{Forwarder, AS_PUBLIC_PREFIXES, KBS_PUBLIC_PREFIX};
use crate::handlers::{attestation, audit, health, heartbeat, kbs};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub forwarder: Forwarder,
    /// Fire-and-forget queue in front of the ledger
    pub audit: AuditSink,
    /// Read side of the audit ledger
    pub ledger: AuditLedger,
    pub heartbeats: HeartbeatRegistry,
}

/// Create the gateway router
pub fn create_router(state: AppState) -> Router {
    let state = Arc::new(state);

    let kbs_path = |path: &str| format!("{}{}", KBS_PUBLIC_PREFIX, path);

    // Routes keep their full public path so the forwarder sees the original URI
    let mut router = Router::new()
        .route(&kbs_path("/auth"), post(kbs::passthrough))
        .route(&kbs_path("/attest"), post(kbs::attest))
        .route(&kbs_path("/attestation-policy"), post(kbs::passthrough))
        .route(
            &kbs_path("/attestation-policy/{id}"),
            get(kbs::passthrough).delete(kbs::passthrough),
        )
        .route(&kbs_path("/attestation-policies"), get(kbs::passthrough))
        .route(
            &kbs_path("/resource-policy"),
            post(kbs::passthrough).get(kbs::passthrough),
        )
        .route(
            &kbs_path("/resource/{repository}/{type}/{tag}"),
            get(kbs::resource).post(kbs::resource).delete(kbs::resource),
        )
        .route(&kbs_path("/resources"), get(kbs::passthrough));

    for prefix in AS_PUBLIC_PREFIXES {
        router = router
            .route(
                &format!("{}/attestation", prefix),
                post(attestation::attestation),
            )
            .route(
                &format!("{}/challenge", prefix),
                post(attestation::passthrough),
            )
            .route(
                &format!("{}/certificate", prefix),
                get(attestation::passthrough),
            )
            .route(&format!("{}/jwks", prefix), get(attestation::passthrough))
            .route(
                &format!("{}/.well-known/openid-configuration", prefix),
                get(attestation::passthrough),
            )
            .route(&format!("{}/policy", prefix), post(attestation::passthrough))
            .route(
                &format!("{}/policy/{{id}}", prefix),
                get(attestation::passthrough).delete(attestation::passthrough),
            )
            .route(
                &format!("{}/policies", prefix),
                get(attestation::passthrough),
            );
    }

    router
        .route("/api/rvps/{*path}", any(handlers::rvps::dispatch))
        // Audit
        .route(
            "/api/audit/attestation",
            get(audit::list_attestation_records),
        )
        .route("/api/audit/resources", get(audit::list_resource_requests))
        // Health
        .route("/api/health", get(health::health))
        .route("/api/services-health", get(health::services_health))
        // Attestation agent liveness
        .route("/api/aa-instance/heartbeat", post(heartbeat::heartbeat))
        .route("/api/aa-instance/list", get(heartbeat::list_active))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
