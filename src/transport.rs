//! Transport seam between the pool and the network.
//!
//! The pool never talks to the network directly. Every identity owns a
//! [`Transport`] produced by a [`Connector`]; the default [`ReqwestConnector`]
//! builds one `reqwest::Client` per identity, routed through the identity's
//! SOCKS5 proxy when it has one.

use std::error::Error as StdError;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::header::{HeaderValue, IntoHeaderName, CONTENT_TYPE};
use http::{HeaderMap, Method, StatusCode};
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};
use crate::proxy::ProxyDescriptor;

/// Body of an outgoing request.
///
/// Bodies are kept in an inspectable form so the pipeline can inject
/// challenge tokens before resubmitting.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(serde_json::Value),
    Bytes(Vec<u8>),
}

/// A cloneable outgoing request. Resubmissions send a clone of it.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: RequestBody,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn header(mut self, name: impl IntoHeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set a JSON body and the matching content type.
    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.body = RequestBody::Json(body);
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = RequestBody::Bytes(body.into());
        self
    }
}

/// A fully buffered response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl IntoHeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_json(mut self, body: &serde_json::Value) -> Self {
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.body = body.to_string().into_bytes();
        self
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// A network-level failure: no response was received.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct TransportError {
    /// Message including the full source chain.
    pub message: String,
    /// System error code (`ECONNRESET`, `ETIMEDOUT`, ...) when one applies.
    pub code: Option<String>,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Whether the failure happened in the proxy or socket layer.
    pub fn is_proxy_failure(&self) -> bool {
        let message = self.message.to_lowercase();
        ["socks5", "socks", "proxy"]
            .iter()
            .any(|marker| message.contains(marker))
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        // The target URL must not leak into proxy-failure matching.
        let err = err.without_url();
        let mut message = err.to_string();
        let mut source = err.source();
        while let Some(inner) = source {
            message.push_str(": ");
            message.push_str(&inner.to_string());
            source = inner.source();
        }

        let code = if err.is_timeout() {
            Some("ETIMEDOUT")
        } else {
            system_code(&err)
        };

        Self {
            message,
            code: code.map(str::to_string),
        }
    }
}

/// Walk the source chain looking for an io error with a well-known kind.
fn system_code(err: &(dyn StdError + 'static)) -> Option<&'static str> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            return match io.kind() {
                ErrorKind::ConnectionReset | ErrorKind::UnexpectedEof => Some("ECONNRESET"),
                ErrorKind::ConnectionRefused => Some("ECONNREFUSED"),
                ErrorKind::ConnectionAborted => Some("ECONNABORTED"),
                ErrorKind::TimedOut => Some("ETIMEDOUT"),
                ErrorKind::BrokenPipe => Some("EPIPE"),
                ErrorKind::NotConnected => Some("ENOTCONN"),
                ErrorKind::AddrNotAvailable => Some("EADDRNOTAVAIL"),
                _ => None,
            };
        }
        current = e.source();
    }
    None
}

/// Sends a single request and returns whatever the server answered.
///
/// Non-success statuses are returned as `Ok`; the pipeline decides what a
/// failure is.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> std::result::Result<HttpResponse, TransportError>;
}

/// Builds the transport for an identity.
pub trait Connector: Send + Sync {
    fn connect(&self, proxy: Option<&ProxyDescriptor>) -> Result<Arc<dyn Transport>>;
}

/// Default connector backed by reqwest.
#[derive(Debug, Clone, Default)]
pub struct ReqwestConnector {
    timeout: Option<Duration>,
}

impl ReqwestConnector {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }
}

impl Connector for ReqwestConnector {
    fn connect(&self, proxy: Option<&ProxyDescriptor>) -> Result<Arc<dyn Transport>> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(proxy) = proxy {
            let url = proxy
                .to_url()
                .map_err(|e| Error::InvalidProxy(format!("{proxy}: {e}")))?;
            builder = builder.proxy(reqwest::Proxy::all(url)?);
        }

        Ok(Arc::new(ReqwestTransport {
            client: builder.build()?,
        }))
    }
}

struct ReqwestTransport {
    client: reqwest::Client,
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(&self, request: HttpRequest) -> std::result::Result<HttpResponse, TransportError> {
        let mut builder = self
            .client
            .request(request.method, &request.url)
            .headers(request.headers);
        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(&value),
            RequestBody::Bytes(bytes) => builder.body(bytes),
        };

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}
