//! Audit and heartbeat rows
//!
//! Every row carries an [`InstanceInfo`] describing the attestation agent
//! that issued the request. It is a named field here; the store maps its
//! members onto `instance_*` columns and the JSON form flattens it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identity of an attestation agent instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub image_id: String,
    pub instance_name: String,
    pub owner_account_id: String,
}

impl InstanceInfo {
    pub fn is_empty(&self) -> bool {
        self.instance_id.is_empty()
            && self.image_id.is_empty()
            && self.instance_name.is_empty()
            && self.owner_account_id.is_empty()
    }
}

/// Backend that produced an attestation result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceService {
    #[serde(rename = "kbs")]
    Kbs,
    #[serde(rename = "attestation-service")]
    AttestationService,
}

impl SourceService {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceService::Kbs => "kbs",
            SourceService::AttestationService => "attestation-service",
        }
    }
}

impl fmt::Display for SourceService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceService {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "kbs" => Ok(SourceService::Kbs),
            "attestation-service" => Ok(SourceService::AttestationService),
            other => Err(format!("unknown source service: {}", other)),
        }
    }
}

/// One attestation attempt relayed to KBS or the Attestation Service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttestationRecord {
    /// Assigned by the store, zero until saved
    pub id: i64,
    pub client_ip: String,
    pub session_id: String,
    pub request_body: String,
    pub claims: String,
    #[serde(rename = "status")]
    pub http_status: u16,
    pub successful: bool,
    pub timestamp: DateTime<Utc>,
    pub source_service: SourceService,
    #[serde(flatten)]
    pub instance_info: InstanceInfo,
}

impl AttestationRecord {
    /// Build an unsaved record stamped with the current time
    pub fn new(
        source_service: SourceService,
        client_ip: impl Into<String>,
        session_id: impl Into<String>,
        request_body: impl Into<String>,
        claims: impl Into<String>,
        http_status: u16,
        instance_info: InstanceInfo,
    ) -> Self {
        Self {
            id: 0,
            client_ip: client_ip.into(),
            session_id: session_id.into(),
            request_body: request_body.into(),
            claims: claims.into(),
            http_status,
            successful: http_status == 200,
            timestamp: Utc::now(),
            source_service,
            instance_info,
        }
    }
}

/// One resource read, write or delete relayed to KBS
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub id: i64,
    pub client_ip: String,
    pub session_id: String,
    pub repository: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub tag: String,
    pub method: String,
    #[serde(rename = "status")]
    pub http_status: u16,
    pub successful: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub instance_info: InstanceInfo,
}

impl ResourceRequest {
    /// Build an unsaved record; `successful` follows the per-method rule
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client_ip: impl Into<String>,
        session_id: impl Into<String>,
        repository: impl Into<String>,
        resource_type: impl Into<String>,
        tag: impl Into<String>,
        method: impl Into<String>,
        http_status: u16,
        instance_info: InstanceInfo,
    ) -> Self {
        let method = method.into();
        Self {
            id: 0,
            client_ip: client_ip.into(),
            session_id: session_id.into(),
            repository: repository.into(),
            resource_type: resource_type.into(),
            tag: tag.into(),
            successful: resource_request_succeeded(&method, http_status),
            method,
            http_status,
            timestamp: Utc::now(),
            instance_info,
        }
    }
}

/// Whether a resource call counts as successful for its method
///
/// GET needs 200, POST accepts 200/201/204 and DELETE accepts 200/204.
/// Any other method is successful only on 200.
pub fn resource_request_succeeded(method: &str, status: u16) -> bool {
    match method.to_ascii_uppercase().as_str() {
        "POST" => matches!(status, 200 | 201 | 204),
        "DELETE" => matches!(status, 200 | 204),
        _ => status == 200,
    }
}

/// Liveness row for one attestation agent, unique per `instance_id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub id: i64,
    #[serde(flatten)]
    pub instance_info: InstanceInfo,
    pub client_ip: String,
    pub last_heartbeat: DateTime<Utc>,
}

impl Heartbeat {
    pub fn new(instance_info: InstanceInfo, client_ip: impl Into<String>) -> Self {
        Self {
            id: 0,
            instance_info,
            client_ip: client_ip.into(),
            last_heartbeat: Utc::now(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_info.instance_id
    }
}

/// Anything the audit ledger can persist
#[derive(Debug, Clone, PartialEq)]
pub enum AuditRecord {
    Attestation(AttestationRecord),
    Resource(ResourceRequest),
}

impl AuditRecord {
    pub fn kind(&self) -> &'static str {
        match self {
            AuditRecord::Attestation(_) => "attestation",
            AuditRecord::Resource(_) => "resource",
        }
    }
}

impl From<AttestationRecord> for AuditRecord {
    fn from(record: AttestationRecord) -> Self {
        AuditRecord::Attestation(record)
    }
}

impl From<ResourceRequest> for AuditRecord {
    fn from(request: ResourceRequest) -> Self {
        AuditRecord::Resource(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_success_rules() {
        assert!(resource_request_succeeded("GET", 200));
        assert!(!resource_request_succeeded("GET", 201));
        assert!(!resource_request_succeeded("GET", 204));

        assert!(resource_request_succeeded("POST", 200));
        assert!(resource_request_succeeded("POST", 201));
        assert!(resource_request_succeeded("POST", 204));
        assert!(!resource_request_succeeded("POST", 400));

        assert!(resource_request_succeeded("DELETE", 200));
        assert!(resource_request_succeeded("DELETE", 204));
        assert!(!resource_request_succeeded("DELETE", 201));

        assert!(resource_request_succeeded("delete", 204));
    }

    #[test]
    fn test_attestation_record_json_shape() {
        let info = InstanceInfo {
            instance_id: "i-1".to_string(),
            image_id: "img".to_string(),
            ..Default::default()
        };
        let record = AttestationRecord::new(
            SourceService::AttestationService,
            "10.0.0.1",
            "sess",
            "{}",
            "{\"tee\":\"tdx\"}",
            200,
            info,
        );

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["source_service"], "attestation-service");
        assert_eq!(json["status"], 200);
        assert_eq!(json["successful"], true);
        assert_eq!(json["instance_id"], "i-1");
        assert_eq!(json["image_id"], "img");
        assert_eq!(json["instance_name"], "");
        assert!(json.get("instance_info").is_none());
    }

    #[test]
    fn test_resource_request_type_field() {
        let request = ResourceRequest::new(
            "1.2.3.4",
            "",
            "default",
            "key",
            "1",
            "DELETE",
            204,
            InstanceInfo::default(),
        );
        assert!(request.successful);

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["type"], "key");
        assert_eq!(json["method"], "DELETE");
    }

    #[test]
    fn test_source_service_parse() {
        assert_eq!("kbs".parse::<SourceService>().unwrap(), SourceService::Kbs);
        assert_eq!(
            "attestation-service".parse::<SourceService>().unwrap(),
            SourceService::AttestationService
        );
        assert!("rvps".parse::<SourceService>().is_err());
    }
}
