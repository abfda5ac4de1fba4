//! Error types for the reqwest-identity-pool crate.

use std::time::Duration;

use thiserror::Error;

use crate::transport::{HttpResponse, TransportError};

/// Errors surfaced by the pool and the interception pipeline.
#[derive(Debug, Error)]
pub enum Error {
    /// The credential pool has no tokens left.
    #[error("credential pool is empty, register credentials with add()")]
    EmptyPool,

    /// A proxy was required but the active pool is empty.
    #[error("proxy pool is empty, register proxies with register_proxies()")]
    NoProxiesAvailable,

    /// Only proxied identities can be quarantined.
    #[error("non-proxy clients cannot be quarantined")]
    NotAProxy,

    /// The challenge admission gate is saturated.
    #[error("too many pending challenge solves (limit {limit})")]
    TooManyPending { limit: usize },

    /// A challenge was demanded for a request whose body cannot carry a token.
    #[error("request body must be a JSON object when a challenge is required ({method} {url})")]
    RequestBodyMustBeObject { method: http::Method, url: String },

    #[error("no challenge solver configured")]
    SolverNotConfigured,

    #[error("challenge solve exceeded {0:?}")]
    SolveTimeout(Duration),

    #[error("challenge solver failed: {0}")]
    Solver(#[source] anyhow::Error),

    /// The server answered with a non-success status no handler could resolve.
    #[error("request failed with status {}", .0.status)]
    Status(Box<HttpResponse>),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("invalid proxy descriptor {0}")]
    InvalidProxy(String),

    /// Building an HTTP client for an identity failed.
    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("failed to decode response body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("failed to read import source: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl Error {
    /// Status code of the failed response, if the failure was a status error.
    pub fn status(&self) -> Option<http::StatusCode> {
        match self {
            Error::Status(response) => Some(response.status),
            _ => None,
        }
    }
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
