use axum::extract::State;
use std::sync::Arc;

use crate::error::ApiError;
use crate::forwarder::{ForwardedResponse, InboundRequest, ServiceTarget};
use crate::AppState;

/// Every `/api/rvps/*` call goes through the RPC dispatch table
pub async fn dispatch(
    State(state): State<Arc<AppState>>,
    req: InboundRequest,
) -> Result<ForwardedResponse, ApiError> {
    Ok(state.forwarder.forward(ServiceTarget::Rvps, &req).await?)
}
