//! Reference Value Provider Service client
//!
//! The gateway talks to RVPS over gRPC only. Handlers depend on the
//! [`ReferenceValueProvider`] trait so the transport can be swapped out in tests.

use anyhow::{Context, Result};
use async_trait::async_trait;
use tonic::transport::Channel;
use tonic::Status;
use tracing::{debug, error, info};

pub mod proto {
    tonic::include_proto!("reference");
}

use proto::reference_value_provider_service_client::ReferenceValueProviderServiceClient;
use proto::{
    ReferenceValueDeleteRequest, ReferenceValueQueryRequest, ReferenceValueRegisterRequest,
};

/// The three RVPS operations the gateway relays
#[async_trait]
pub trait ReferenceValueProvider: Send + Sync {
    /// All reference values as an opaque JSON document
    async fn query_reference_value(&self) -> std::result::Result<String, Status>;

    async fn register_reference_value(&self, message: String) -> std::result::Result<(), Status>;

    async fn delete_reference_value(&self, name: String) -> std::result::Result<(), Status>;
}

/// gRPC client over a lazily connected channel
#[derive(Clone)]
pub struct GrpcRvpsClient {
    client: ReferenceValueProviderServiceClient<Channel>,
}

impl GrpcRvpsClient {
    /// Build a client without dialing; the first call establishes the connection
    pub fn connect_lazy(addr: &str) -> Result<Self> {
        info!("Using RVPS gRPC endpoint {}", addr);

        let channel = Channel::from_shared(addr.to_string())
            .context("Invalid RVPS gRPC address")?
            .connect_lazy();

        Ok(Self {
            client: ReferenceValueProviderServiceClient::new(channel),
        })
    }
}

#[async_trait]
impl ReferenceValueProvider for GrpcRvpsClient {
    async fn query_reference_value(&self) -> std::result::Result<String, Status> {
        let mut client = self.client.clone();
        let response = client
            .query_reference_value(ReferenceValueQueryRequest {})
            .await
            .inspect_err(|e| error!("Failed to query reference values: {}", e))?
            .into_inner();

        debug!(
            "RVPS returned {} bytes of reference values",
            response.reference_value_results.len()
        );
        Ok(response.reference_value_results)
    }

    async fn register_reference_value(&self, message: String) -> std::result::Result<(), Status> {
        let mut client = self.client.clone();
        client
            .register_reference_value(ReferenceValueRegisterRequest { message })
            .await
            .inspect_err(|e| error!("Failed to register reference value: {}", e))?;
        Ok(())
    }

    async fn delete_reference_value(&self, name: String) -> std::result::Result<(), Status> {
        let mut client = self.client.clone();
        client
            .delete_reference_value(ReferenceValueDeleteRequest { name })
            .await
            .inspect_err(|e| error!("Failed to delete reference value: {}", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_lazy_does_not_dial() {
        // Nothing listens on this port; a lazy channel must still build
        let client = GrpcRvpsClient::connect_lazy("http://127.0.0.1:1");
        assert!(client.is_ok());
    }

    #[tokio::test]
    async fn test_connect_lazy_rejects_bad_address() {
        assert!(GrpcRvpsClient::connect_lazy("not a uri").is_err());
    }
}
