//! HTTP plumbing to peer servers.
//!
//! The wire protocol modules work against the [`PeerTransport`] trait;
//! [`HttpPeerTransport`] is the production implementation on a blocking
//! `reqwest` client. Async requests are dispatched with the
//! `x-arango-async: store` header and tracked by the job id the peer
//! returns.

use std::fmt;

use serde_json::Value;

use osprey_common::config::ClusterSyncConfig;
use osprey_common::error::TransportError;

pub const ASYNC_STORE_HEADER: &str = "x-arango-async";
pub const ASYNC_ID_HEADER: &str = "x-arango-async-id";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Post => write!(f, "POST"),
            Method::Put => write!(f, "PUT"),
            Method::Delete => write!(f, "DELETE"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PeerRequest {
    pub method: Method,
    pub url: String,
    pub body: Option<Value>,
    /// Dispatch asynchronously on the peer; the response carries an
    /// async job id instead of the result.
    pub store_async: bool,
}

impl PeerRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            body: None,
            store_async: false,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url)
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self::new(Method::Put, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::Delete, url)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn async_store(mut self) -> Self {
        self.store_async = true;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct PeerResponse {
    pub status: u16,
    pub body: Option<Value>,
    /// Job id from the async-id header, when the request was dispatched
    /// asynchronously.
    pub async_id: Option<String>,
}

impl PeerResponse {
    pub fn is_ok(&self) -> bool {
        self.status == 200
    }
}

/// Blocking HTTP to one peer at a time.
pub trait PeerTransport: Send + Sync {
    fn execute(&self, request: &PeerRequest) -> Result<PeerResponse, TransportError>;
}

/// Derive a base URL from a cluster endpoint string:
/// `ssl://` becomes `https://`, any other scheme becomes `http`, and a
/// bare `host:port` gets `http://` prepended.
pub fn endpoint_to_url(endpoint: &str) -> String {
    if let Some(rest) = endpoint.strip_prefix("ssl://") {
        return format!("https://{rest}");
    }
    match endpoint.find("://") {
        Some(pos) => format!("http{}", &endpoint[pos..]),
        None => format!("http://{endpoint}"),
    }
}

/// Production transport on a blocking `reqwest` client.
pub struct HttpPeerTransport {
    client: reqwest::blocking::Client,
}

impl HttpPeerTransport {
    pub fn new(config: &ClusterSyncConfig) -> Result<Self, TransportError> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(config.peer_connect_timeout())
            .timeout(config.peer_request_timeout())
            .build()
            .map_err(|e| TransportError::Request {
                url: String::new(),
                reason: e.to_string(),
            })?;
        Ok(Self { client })
    }
}

impl PeerTransport for HttpPeerTransport {
    fn execute(&self, request: &PeerRequest) -> Result<PeerResponse, TransportError> {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
            Method::Put => self.client.put(&request.url),
            Method::Delete => self.client.delete(&request.url),
        };
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if request.store_async {
            builder = builder.header(ASYNC_STORE_HEADER, "store");
        }
        let response = builder.send().map_err(|e| TransportError::Request {
            url: request.url.clone(),
            reason: e.to_string(),
        })?;

        let status = response.status().as_u16();
        let async_id = response
            .headers()
            .get(ASYNC_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let text = response.text().map_err(|e| TransportError::BadBody {
            url: request.url.clone(),
            reason: e.to_string(),
        })?;
        let body = if text.is_empty() {
            None
        } else {
            serde_json::from_str(&text).ok()
        };
        Ok(PeerResponse {
            status,
            body,
            async_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_to_url_ssl() {
        assert_eq!(
            endpoint_to_url("ssl://db1.example.com:8529"),
            "https://db1.example.com:8529"
        );
    }

    #[test]
    fn test_endpoint_to_url_other_scheme() {
        assert_eq!(
            endpoint_to_url("tcp://db1.example.com:8529"),
            "http://db1.example.com:8529"
        );
    }

    #[test]
    fn test_endpoint_to_url_bare_host() {
        assert_eq!(endpoint_to_url("db1:8529"), "http://db1:8529");
    }

    #[test]
    fn test_endpoint_to_url_http_passthrough() {
        assert_eq!(endpoint_to_url("http://db1:8529"), "http://db1:8529");
    }

    #[test]
    fn test_request_builders() {
        let req = PeerRequest::post("http://x/_api/y")
            .with_body(serde_json::json!({"id": "1"}))
            .async_store();
        assert_eq!(req.method, Method::Post);
        assert!(req.store_async);
        assert_eq!(req.body.unwrap()["id"], "1");
    }
}
