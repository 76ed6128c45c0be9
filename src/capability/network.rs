//! Outbound HTTP for guests, behind `allow_network`.
//!
//! Guests call `__net.fetch(url, { method, headers, body })` and receive
//! `{ url, status, statusText, ok, headers, body }` with the body as text.
//! Transport is pluggable through [`NetworkBackend`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use super::{Args, Capability, CapabilityProvider, Grants};
use crate::bridge::{HostError, HostFunction, HostValue};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("network request failed: {0}")]
    Transport(String),
}

impl From<NetworkError> for HostError {
    fn from(err: NetworkError) -> Self {
        let name = match err {
            NetworkError::InvalidRequest(_) => "TypeError",
            NetworkError::Transport(_) => "Error",
        };
        HostError::new(name, err.to_string())
    }
}

/// Performs HTTP requests on behalf of the guest.
#[async_trait]
pub trait NetworkBackend: Send + Sync + fmt::Debug {
    async fn fetch(&self, request: HttpRequest) -> std::result::Result<HttpResponse, NetworkError>;
}

/// `reqwest`-backed transport, used when no backend is configured.
#[cfg(feature = "network")]
#[derive(Debug, Clone, Default)]
pub struct ReqwestBackend {
    client: reqwest::Client,
}

#[cfg(feature = "network")]
impl ReqwestBackend {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[cfg(feature = "network")]
#[async_trait]
impl NetworkBackend for ReqwestBackend {
    async fn fetch(&self, request: HttpRequest) -> std::result::Result<HttpResponse, NetworkError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| NetworkError::InvalidRequest(e.to_string()))?;
        let mut builder = self.client.request(method, request.url.as_str());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| NetworkError::Transport(e.to_string()))?;
        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| NetworkError::Transport(e.to_string()))?
            .to_vec();

        Ok(HttpResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body,
        })
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NetworkProvider;

impl CapabilityProvider for NetworkProvider {
    fn name(&self) -> &'static str {
        "network"
    }

    fn provide(&self, grants: &Grants<'_>) -> Result<Option<Capability>> {
        if !grants.options.allow_network {
            return Ok(None);
        }
        let backend = match &grants.options.network_backend {
            Some(backend) => backend.clone(),
            None => default_backend()?,
        };
        Ok(Some(network_capability(backend)))
    }
}

#[cfg(feature = "network")]
fn default_backend() -> Result<Arc<dyn NetworkBackend>> {
    Ok(Arc::new(ReqwestBackend::default()))
}

#[cfg(not(feature = "network"))]
fn default_backend() -> Result<Arc<dyn NetworkBackend>> {
    Err(crate::error::SandboxError::Config(
        "allow_network requires a network backend when the `network` feature is disabled".into(),
    ))
}

fn network_capability(backend: Arc<dyn NetworkBackend>) -> Capability {
    Capability::namespace("network", "__net").with_function(
        "fetch",
        HostFunction::asynchronous(move |args| {
            let backend = backend.clone();
            Box::pin(async move {
                let request = parse_request(&Args(&args))?;
                let url = request.url.clone();
                let response = backend.fetch(request).await?;
                Ok(response_value(url, response))
            })
        }),
    )
}

fn parse_request(args: &Args<'_>) -> std::result::Result<HttpRequest, HostError> {
    let url = args.string(0, "url")?;
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(NetworkError::InvalidRequest(format!("unsupported URL: {url}")).into());
    }
    let init = args.get(1);
    let method = init
        .get("method")
        .and_then(HostValue::as_str)
        .unwrap_or("GET")
        .to_ascii_uppercase();
    let headers = match init.get("headers") {
        Some(HostValue::Object(map)) => map
            .iter()
            .map(|(name, value)| {
                let value = match value {
                    HostValue::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (name.to_ascii_lowercase(), value)
            })
            .collect(),
        _ => BTreeMap::new(),
    };
    let body = match init.get("body") {
        None | Some(HostValue::Undefined) | Some(HostValue::Null) => None,
        Some(HostValue::String(s)) => Some(s.as_bytes().to_vec()),
        Some(HostValue::Bytes(bytes)) => Some(bytes.clone()),
        Some(other) => Some(other.to_string().into_bytes()),
    };
    Ok(HttpRequest {
        url,
        method,
        headers,
        body,
    })
}

fn response_value(url: String, response: HttpResponse) -> HostValue {
    let headers = response
        .headers
        .into_iter()
        .map(|(name, value)| (name, HostValue::String(value)))
        .collect();
    HostValue::Object(BTreeMap::from([
        ("url".to_string(), HostValue::String(url)),
        ("status".to_string(), HostValue::Number(f64::from(response.status))),
        ("statusText".to_string(), HostValue::String(response.status_text)),
        (
            "ok".to_string(),
            HostValue::Bool((200..300).contains(&response.status)),
        ),
        ("headers".to_string(), HostValue::Object(headers)),
        (
            "body".to_string(),
            HostValue::String(String::from_utf8_lossy(&response.body).into_owned()),
        ),
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_request() {
        let values = [
            HostValue::from("https://api.test/items"),
            HostValue::from(json!({
                "method": "post",
                "headers": { "Content-Type": "application/json" },
                "body": "{}"
            })),
        ];
        let request = parse_request(&Args(&values)).unwrap();
        assert_eq!(request.method, "POST");
        assert_eq!(
            request.headers.get("content-type").map(String::as_str),
            Some("application/json")
        );
        assert_eq!(request.body.as_deref(), Some(&b"{}"[..]));
    }

    #[test]
    fn test_rejects_non_http_urls() {
        let values = [HostValue::from("file:///etc/passwd")];
        let err = parse_request(&Args(&values)).unwrap_err();
        assert_eq!(err.name, "TypeError");
    }

    #[test]
    fn test_response_shape() {
        let value = response_value(
            "https://api.test".into(),
            HttpResponse {
                status: 404,
                status_text: "Not Found".into(),
                headers: BTreeMap::new(),
                body: b"missing".to_vec(),
            },
        );
        assert_eq!(value.get("ok"), Some(&HostValue::Bool(false)));
        assert_eq!(value.get("body"), Some(&HostValue::from("missing")));
    }
}
