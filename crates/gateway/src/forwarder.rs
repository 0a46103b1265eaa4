//! Request forwarding to the trust stack backends
//!
//! KBS and the Attestation Service are reached by HTTP passthrough: method,
//! rewritten path, verbatim query, headers, cookies and the buffered body are
//! relayed and the backend response is handed back untouched. RVPS only
//! speaks gRPC, so its public paths are dispatched onto RPC calls instead.
//!
//! Both bodies are buffered in full. The handler can then inspect the exact
//! bytes the backend and the caller saw when it builds an audit record.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, FromRequest, Request},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use percent_encoding::percent_decode_str;
use reqwest::Url;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::error::ApiError;
use crate::rvps::ReferenceValueProvider;

pub const KBS_PUBLIC_PREFIX: &str = "/api/kbs/v0";
pub const KBS_BACKEND_PREFIX: &str = "/kbs/v0";
pub const AS_PUBLIC_PREFIXES: [&str; 2] = ["/api/attestation-service", "/api/as"];
pub const RVPS_PUBLIC_PREFIX: &str = "/api/rvps";

/// Client-side timeout for HTTP backends
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
/// Per-operation timeout for RVPS calls
pub const RVPS_TIMEOUT: Duration = Duration::from_secs(10);
/// Timeout used by health probes
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest inbound body the gateway buffers
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

pub const RVPS_NOT_IMPLEMENTED: &str = "RVPS HTTP proxy not implemented, gRPC client required";

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceTarget {
    Kbs,
    AttestationService,
    Rvps,
}

impl fmt::Display for ServiceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceTarget::Kbs => "KBS",
            ServiceTarget::AttestationService => "Attestation Service",
            ServiceTarget::Rvps => "RVPS",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum ForwardError {
    /// Transport failure or timeout talking to an HTTP backend
    #[error("{0}")]
    Backend(String),

    #[error("Invalid backend URL: {0}")]
    InvalidUrl(String),

    #[error("{0}")]
    Rpc(String),

    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    NotImplemented(String),
}

impl ForwardError {
    pub fn status(&self) -> StatusCode {
        match self {
            ForwardError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ForwardError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            ForwardError::Backend(_) | ForwardError::InvalidUrl(_) | ForwardError::Rpc(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// A fully buffered inbound request
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Peer address of the connection, empty when unknown
    pub client_ip: String,
}

impl InboundRequest {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            client_ip: String::new(),
        }
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Every cookie across all `Cookie` headers, in order
    pub fn cookies(&self) -> Vec<(String, String)> {
        self.headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(';'))
            .filter_map(|pair| {
                let (name, value) = pair.trim().split_once('=')?;
                let name = name.trim();
                (!name.is_empty()).then(|| (name.to_string(), value.trim().to_string()))
            })
            .collect()
    }

    pub fn cookie(&self, name: &str) -> Option<String> {
        self.cookies()
            .into_iter()
            .find(|(cookie, _)| cookie == name)
            .map(|(_, value)| value)
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

impl<S> FromRequest<S> for InboundRequest
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, _state: &S) -> Result<Self, Self::Rejection> {
        let (parts, body) = req.into_parts();

        let client_ip = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_default();

        let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
            .await
            .map_err(|e| {
                error!("Failed to read request body: {}", e);
                ApiError::bad_request("Failed to read request body")
            })?;

        Ok(Self {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            body,
            client_ip,
        })
    }
}

/// A fully buffered backend response
#[derive(Debug, Clone)]
pub struct ForwardedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ForwardedResponse {
    pub fn empty(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn json(status: StatusCode, body: impl Into<Bytes>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

impl IntoResponse for ForwardedResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;

        let headers = response.headers_mut();
        for (name, value) in self.headers.iter() {
            // The body is re-framed by the server
            if name == header::CONTENT_LENGTH || is_hop_by_hop(name) {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }

        response
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// `path` without `prefix`, only when the prefix ends on a segment boundary
fn strip_segment<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = path.strip_prefix(prefix)?;
    (rest.is_empty() || rest.starts_with('/')).then_some(rest)
}

/// Map a public gateway path onto the backend's native path
pub fn backend_path(target: ServiceTarget, path: &str) -> String {
    match target {
        ServiceTarget::Kbs => {
            if strip_segment(path, KBS_BACKEND_PREFIX).is_some() {
                path.to_string()
            } else {
                let rest = strip_segment(path, KBS_PUBLIC_PREFIX).unwrap_or(path);
                format!("{}{}", KBS_BACKEND_PREFIX, rest)
            }
        }
        ServiceTarget::AttestationService => AS_PUBLIC_PREFIXES
            .iter()
            .find_map(|prefix| strip_segment(path, prefix))
            .unwrap_or(path)
            .to_string(),
        ServiceTarget::Rvps => strip_segment(path, RVPS_PUBLIC_PREFIX)
            .unwrap_or(path)
            .to_string(),
    }
}

/// Headers for the outbound request
///
/// Inbound headers are copied except those the client re-derives. Cookies are
/// merged into a single `Cookie` header so none is sent twice.
fn outbound_headers(req: &InboundRequest) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in req.headers.iter() {
        if name == header::HOST
            || name == header::CONTENT_LENGTH
            || name == header::COOKIE
            || is_hop_by_hop(name)
            || name.as_str().starts_with("x-forwarded-")
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    let cookies = req.cookies();
    if !cookies.is_empty() {
        let joined = cookies
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join("; ");
        match HeaderValue::from_str(&joined) {
            Ok(value) => {
                headers.insert(header::COOKIE, value);
            }
            Err(e) => warn!("Dropping unencodable cookies: {}", e),
        }
    }

    if !req.client_ip.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&req.client_ip) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }
    if let Some(host) = req.headers.get(header::HOST) {
        headers.insert(X_FORWARDED_HOST, host.clone());
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    headers
}

/// RPC call selected by the RVPS dispatch table
#[derive(Debug, Clone, PartialEq, Eq)]
enum RvpsCall {
    Query,
    Register,
    Delete(String),
}

impl RvpsCall {
    fn route(method: &Method, path: &str) -> Option<Self> {
        if *method == Method::GET && path == "query" {
            Some(RvpsCall::Query)
        } else if *method == Method::POST && path == "register" {
            Some(RvpsCall::Register)
        } else if *method == Method::DELETE {
            path.strip_prefix("delete/")
                .map(|name| RvpsCall::Delete(name.to_string()))
        } else {
            None
        }
    }
}

#[derive(Debug, Deserialize)]
struct RegisterBody {
    #[serde(default)]
    message: String,
}

/// Stateless relay to KBS, the Attestation Service and RVPS
#[derive(Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    kbs_url: Url,
    as_url: Url,
    rvps: Option<Arc<dyn ReferenceValueProvider>>,
}

impl Forwarder {
    pub fn new(
        kbs_url: &str,
        as_url: &str,
        rvps: Option<Arc<dyn ReferenceValueProvider>>,
    ) -> Result<Self, ForwardError> {
        let kbs_url =
            Url::parse(kbs_url).map_err(|e| ForwardError::InvalidUrl(format!("KBS: {}", e)))?;
        let as_url = Url::parse(as_url)
            .map_err(|e| ForwardError::InvalidUrl(format!("Attestation Service: {}", e)))?;

        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| ForwardError::Backend(format!("Failed to build HTTP client: {}", e)))?;

        info!(
            "Forwarder ready (KBS: {}, AS: {}, RVPS gRPC: {})",
            kbs_url,
            as_url,
            if rvps.is_some() { "enabled" } else { "disabled" }
        );

        Ok(Self {
            client,
            kbs_url,
            as_url,
            rvps,
        })
    }

    pub fn has_rvps(&self) -> bool {
        self.rvps.is_some()
    }

    /// Relay `req` to `target` and return the buffered backend response
    pub async fn forward(
        &self,
        target: ServiceTarget,
        req: &InboundRequest,
    ) -> Result<ForwardedResponse, ForwardError> {
        let timeout = match target {
            ServiceTarget::Rvps => RVPS_TIMEOUT,
            _ => HTTP_TIMEOUT,
        };
        self.forward_with_timeout(target, req, timeout).await
    }

    /// Like [`Forwarder::forward`] with a caller-chosen bound, used by health probes
    ///
    /// For RVPS the bound applies to the RPC itself.
    pub async fn forward_with_timeout(
        &self,
        target: ServiceTarget,
        req: &InboundRequest,
        timeout: Duration,
    ) -> Result<ForwardedResponse, ForwardError> {
        match target {
            ServiceTarget::Rvps => self.dispatch_rvps(req, timeout).await,
            _ => self.forward_http(target, req, timeout).await,
        }
    }

    /// Query every reference value, bounded by `timeout`
    pub async fn query_reference_values(&self, timeout: Duration) -> Result<String, ForwardError> {
        let client = self.rvps_client()?;
        rpc_with_timeout("query", timeout, client.query_reference_value()).await
    }

    fn backend_url(&self, target: ServiceTarget, uri: &Uri) -> Result<Url, ForwardError> {
        let base = match target {
            ServiceTarget::Kbs => &self.kbs_url,
            ServiceTarget::AttestationService => &self.as_url,
            ServiceTarget::Rvps => {
                return Err(ForwardError::InvalidInput(
                    "RVPS is not reachable over HTTP".to_string(),
                ))
            }
        };

        let mut url = base.clone();
        let path = format!(
            "{}{}",
            base.path().trim_end_matches('/'),
            backend_path(target, uri.path())
        );
        url.set_path(&path);
        url.set_query(uri.query());
        Ok(url)
    }

    async fn forward_http(
        &self,
        target: ServiceTarget,
        req: &InboundRequest,
        timeout: Duration,
    ) -> Result<ForwardedResponse, ForwardError> {
        let url = self.backend_url(target, &req.uri)?;
        debug!("Forwarding {} {} to {}", req.method, req.uri.path(), url);

        let response = self
            .client
            .request(req.method.clone(), url.clone())
            .headers(outbound_headers(req))
            .body(req.body.clone())
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                error!("Failed to forward request to {}: {}", url, e);
                ForwardError::Backend(format!("Failed to forward request to {}", target))
            })?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(|e| {
            error!("Failed to read {} response: {}", target, e);
            ForwardError::Backend(format!("Failed to read {} response", target))
        })?;

        debug!("{} responded {} ({} bytes)", target, status, body.len());

        Ok(ForwardedResponse {
            status,
            headers,
            body,
        })
    }

    async fn dispatch_rvps(
        &self,
        req: &InboundRequest,
        timeout: Duration,
    ) -> Result<ForwardedResponse, ForwardError> {
        let stripped = backend_path(ServiceTarget::Rvps, req.uri.path());
        let raw = stripped.strip_prefix('/').unwrap_or(&stripped);
        let path = percent_decode_str(raw).decode_utf8().map_err(|e| {
            error!("Failed to decode RVPS path: {}", e);
            ForwardError::InvalidInput("Invalid path encoding".to_string())
        })?;

        let call = match (&self.rvps, RvpsCall::route(&req.method, &path)) {
            (Some(_), Some(call)) => call,
            _ => {
                warn!(
                    "RVPS HTTP proxy not implemented, gRPC client unavailable for {} {}",
                    req.method,
                    req.uri.path()
                );
                return Err(ForwardError::NotImplemented(RVPS_NOT_IMPLEMENTED.to_string()));
            }
        };
        let client = self.rvps_client()?;

        match call {
            RvpsCall::Query => {
                let result =
                    rpc_with_timeout("query", timeout, client.query_reference_value()).await?;
                Ok(ForwardedResponse::json(StatusCode::OK, result))
            }
            RvpsCall::Register => {
                let body: RegisterBody = serde_json::from_slice(&req.body).map_err(|e| {
                    error!("Failed to parse register request body: {}", e);
                    ForwardError::InvalidInput("Invalid request format".to_string())
                })?;
                info!("Register reference value: {}", body.message);
                rpc_with_timeout(
                    "register",
                    timeout,
                    client.register_reference_value(body.message),
                )
                .await?;
                Ok(ForwardedResponse::empty(StatusCode::OK))
            }
            RvpsCall::Delete(name) => {
                if name.is_empty() {
                    return Err(ForwardError::InvalidInput(
                        "Reference value name is required".to_string(),
                    ));
                }
                info!("Delete reference value: {}", name);
                rpc_with_timeout("delete", timeout, client.delete_reference_value(name))
                    .await?;
                Ok(ForwardedResponse::empty(StatusCode::OK))
            }
        }
    }

    fn rvps_client(&self) -> Result<&Arc<dyn ReferenceValueProvider>, ForwardError> {
        self.rvps
            .as_ref()
            .ok_or_else(|| ForwardError::NotImplemented("rvps grpc client not available".into()))
    }
}

async fn rpc_with_timeout<T>(
    operation: &str,
    timeout: Duration,
    call: impl Future<Output = Result<T, tonic::Status>>,
) -> Result<T, ForwardError> {
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(status)) => {
            error!("RVPS {} failed: {}", operation, status);
            Err(ForwardError::Rpc(format!(
                "rpc error: code = {:?} desc = {}",
                status.code(),
                status.message()
            )))
        }
        Err(_) => {
            error!("RVPS {} timed out after {:?}", operation, timeout);
            Err(ForwardError::Rpc(format!(
                "RVPS {} timed out after {:?}",
                operation, timeout
            )))
        }
    }
}
