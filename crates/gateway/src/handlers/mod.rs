//! HTTP handlers
//!
//! Passthrough handlers relay to the [`Forwarder`](crate::forwarder::Forwarder)
//! and, for attestation and resource calls, queue an audit record once the
//! backend has answered. Audit writes never hold up the response.

pub mod attestation;
pub mod audit;
pub mod health;
pub mod heartbeat;
pub mod kbs;
pub mod rvps;

use gateway_common::{
    extract_claims, instance_info_or_default, AttestationRecord, SourceService,
    INSTANCE_INFO_HEADER,
};
use tracing::debug;

use crate::error::ApiError;
use crate::forwarder::{ForwardError, ForwardedResponse, InboundRequest};
use crate::AppState;

/// Cookie KBS uses to track an attestation session
pub const KBS_SESSION_COOKIE: &str = "kbs-session-id";

/// Queue an attestation record for a forwarded call and hand back its outcome
///
/// A failed forward is still recorded, as status 500 and unsuccessful.
fn record_attestation(
    state: &AppState,
    source: SourceService,
    session_id: String,
    req: &InboundRequest,
    result: Result<ForwardedResponse, ForwardError>,
) -> Result<ForwardedResponse, ApiError> {
    let instance_info = instance_info_or_default(req.header_str(INSTANCE_INFO_HEADER));

    let (status, claims) = match &result {
        Ok(response) => {
            let claims = extract_claims(&response.body_text());
            debug!("Attestation claims: {}", claims);
            (response.status.as_u16(), claims)
        }
        Err(_) => (500, String::new()),
    };

    state.audit.submit(AttestationRecord::new(
        source,
        req.client_ip.clone(),
        session_id,
        req.body_text(),
        claims,
        status,
        instance_info,
    ));

    Ok(result?)
}
