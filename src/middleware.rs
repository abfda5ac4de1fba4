//! Middleware implementation for reqwest.

use crate::config::{ClientOptions, PoolConfig};
use crate::error::Error as PoolError;
use crate::pool::ClientPool;
use crate::transport::{HttpRequest, HttpResponse, RequestBody};

use anyhow::anyhow;
use async_trait::async_trait;
use log::{info, warn};
use reqwest::ResponseBuilderExt;
use reqwest_middleware::{Error, Middleware, Next, Result};
use std::sync::Arc;

/// Middleware that routes every request through a [`ClientPool`].
///
/// The inner client of the `ClientWithMiddleware` is never used; the request
/// is replayed on pooled identities with the full recovery pipeline.
#[derive(Clone)]
pub struct IdentityPoolMiddleware {
    /// The client pool.
    pool: Arc<ClientPool>,
    options: ClientOptions,
}

impl IdentityPoolMiddleware {
    /// Create a new middleware with a freshly initialized pool.
    pub async fn new(config: PoolConfig) -> Result<Self> {
        match ClientPool::new(config).await {
            Ok(pool) => {
                let stats = pool.stats();
                info!(
                    "Client pool middleware ready with {} proxies, {} credentials",
                    stats.active, stats.credentials
                );

                if stats.active == 0 {
                    warn!("No proxies registered, requests will go out directly");
                }

                Ok(Self::from_pool(pool))
            }
            Err(e) => Err(into_middleware_error(e)),
        }
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: Arc<ClientPool>) -> Self {
        Self {
            pool,
            options: ClientOptions::default(),
        }
    }

    /// Options used to acquire a client for each request.
    pub fn with_options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    /// The pool requests are routed through.
    pub fn pool(&self) -> &Arc<ClientPool> {
        &self.pool
    }
}

#[async_trait]
impl Middleware for IdentityPoolMiddleware {
    async fn handle(
        &self,
        req: reqwest::Request,
        _extensions: &mut http::Extensions,
        _next: Next<'_>,
    ) -> Result<reqwest::Response> {
        let url = req.url().clone();
        let request = into_pool_request(req)?;

        let client = self.pool.acquire(self.options).map_err(into_middleware_error)?;
        info!("Using client {} for {}", client.id(), url);

        match client.send(request).await {
            Ok(response) => into_reqwest_response(response, url),
            // Unrecovered statuses are still responses to reqwest callers.
            Err(PoolError::Status(response)) => into_reqwest_response(*response, url),
            Err(e) => Err(into_middleware_error(e)),
        }
    }
}

fn into_pool_request(req: reqwest::Request) -> Result<HttpRequest> {
    let body = match req.body() {
        None => RequestBody::Empty,
        Some(body) => {
            let bytes = body.as_bytes().ok_or_else(|| {
                Error::Middleware(anyhow!(
                    "Request body is a stream and cannot be replayed by the pool"
                ))
            })?;
            RequestBody::Bytes(bytes.to_vec())
        }
    };

    Ok(HttpRequest {
        method: req.method().clone(),
        url: req.url().to_string(),
        headers: req.headers().clone(),
        body,
    })
}

fn into_reqwest_response(response: HttpResponse, url: url::Url) -> Result<reqwest::Response> {
    let mut converted = http::Response::builder()
        .status(response.status)
        .url(url)
        .body(response.body)
        .map_err(|e| Error::Middleware(anyhow!(e)))?;
    *converted.headers_mut() = response.headers;
    Ok(reqwest::Response::from(converted))
}

fn into_middleware_error(err: PoolError) -> Error {
    Error::Middleware(anyhow::Error::new(err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffered_body_is_kept() {
        let mut req = reqwest::Request::new(
            reqwest::Method::POST,
            "https://example.com/login".parse().unwrap(),
        );
        *req.body_mut() = Some(reqwest::Body::from(r#"{"a":1}"#));

        let converted = into_pool_request(req).unwrap();
        assert_eq!(converted.method, http::Method::POST);
        assert_eq!(converted.url, "https://example.com/login");
        assert_eq!(converted.body, RequestBody::Bytes(br#"{"a":1}"#.to_vec()));
    }

    #[tokio::test]
    async fn response_conversion_keeps_status_headers_and_body() {
        let response = HttpResponse::new(http::StatusCode::CREATED)
            .with_json(&serde_json::json!({"ok": true}));
        let url: url::Url = "https://example.com/x".parse().unwrap();

        let converted = into_reqwest_response(response, url.clone()).unwrap();
        assert_eq!(converted.status(), reqwest::StatusCode::CREATED);
        assert_eq!(converted.url(), &url);
        assert_eq!(
            converted.headers()[http::header::CONTENT_TYPE],
            "application/json"
        );
        assert_eq!(converted.text().await.unwrap(), r#"{"ok":true}"#);
    }
}
