//! Claims extraction from token-shaped attestation responses

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use tracing::debug;

/// Decode the payload segment of a three-part dot-delimited token
///
/// Anything else, or a payload that is not valid base64url UTF-8, is
/// returned unchanged. Extraction never fails.
pub fn extract_claims(body: &str) -> String {
    let segments: Vec<&str> = body.trim().split('.').collect();
    if segments.len() != 3 {
        debug!(
            "Response is not token-shaped ({} segments), storing raw body",
            segments.len()
        );
        return body.to_string();
    }

    let payload = segments[1].trim_end_matches('=');
    match URL_SAFE_NO_PAD
        .decode(payload)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
    {
        Some(claims) => claims,
        None => {
            debug!("Token payload could not be decoded, storing raw body");
            body.to_string()
        }
    }
}
