//! Instance identity header parsing

use tracing::warn;

use crate::error::{GatewayError, Result};
use crate::models::InstanceInfo;

/// Header carrying the JSON-encoded [`InstanceInfo`] of the calling agent
pub const INSTANCE_INFO_HEADER: &str = "AAInstanceInfo";

/// Strict parse used where the identity is required (heartbeats)
///
/// Fails on a missing header, malformed JSON or an empty `instance_id`.
pub fn parse_instance_info(header: Option<&str>) -> Result<InstanceInfo> {
    let raw = match header {
        Some(raw) if !raw.trim().is_empty() => raw,
        _ => {
            return Err(GatewayError::InvalidInput(format!(
                "Missing {} header",
                INSTANCE_INFO_HEADER
            )))
        }
    };

    let info: InstanceInfo = serde_json::from_str(raw).map_err(|e| {
        GatewayError::InvalidInput(format!("Invalid {} format: {}", INSTANCE_INFO_HEADER, e))
    })?;

    if info.instance_id.is_empty() {
        return Err(GatewayError::InvalidInput(format!(
            "Missing instance_id in {}",
            INSTANCE_INFO_HEADER
        )));
    }

    Ok(info)
}

/// Lenient parse used on audited request paths
///
/// A missing header yields an empty identity; malformed JSON is logged and
/// treated the same way so the outer request never fails on it.
pub fn instance_info_or_default(header: Option<&str>) -> InstanceInfo {
    let Some(raw) = header.filter(|raw| !raw.trim().is_empty()) else {
        return InstanceInfo::default();
    };

    match serde_json::from_str(raw) {
        Ok(info) => info,
        Err(e) => {
            warn!("Failed to parse {} header: {}", INSTANCE_INFO_HEADER, e);
            InstanceInfo::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lenient_parse() {
        assert!(instance_info_or_default(None).is_empty());
        assert!(instance_info_or_default(Some("")).is_empty());
        assert!(instance_info_or_default(Some("{not json")).is_empty());

        let info = instance_info_or_default(Some(r#"{"instance_id":"i-9","instance_name":"web"}"#));
        assert_eq!(info.instance_id, "i-9");
        assert_eq!(info.instance_name, "web");
        assert_eq!(info.image_id, "");
    }

    #[test]
    fn test_strict_parse() {
        assert!(matches!(
            parse_instance_info(None),
            Err(GatewayError::InvalidInput(_))
        ));
        assert!(matches!(
            parse_instance_info(Some("[1,2]")),
            Err(GatewayError::InvalidInput(_))
        ));
        assert!(matches!(
            parse_instance_info(Some(r#"{"image_id":"img"}"#)),
            Err(GatewayError::InvalidInput(_))
        ));

        let info = parse_instance_info(Some(
            r#"{"instance_id":"i-1","image_id":"img","owner_account_id":"acct"}"#,
        ))
        .unwrap();
        assert_eq!(info.instance_id, "i-1");
        assert_eq!(info.owner_account_id, "acct");
    }
}
