//! Request interception and the response-error retry loop.
//!
//! Every send goes through a request stage (session cookie and anti-forgery
//! token injection) and, on failure, through an ordered list of recoveries:
//!
//! 1. [`Recovery::RateLimited`]: 429, back off and resubmit on a new client.
//! 2. [`Recovery::ChallengeRequired`]: 403 matching a challenge rule, solve it
//!    and resubmit once with the token in the body.
//! 3. [`Recovery::CsrfRefresh`]: 403 carrying a fresh anti-forgery token,
//!    resubmit once with it.
//! 4. [`Recovery::ProxyFailure`]: proxy-layer transport error, quarantine the
//!    identity and resubmit on a replacement.
//! 5. [`Recovery::TransientCode`]: transport error with a system code, resubmit
//!    on the same identity unless `fail_on_code_errors` is set.
//!
//! Anything else is returned to the caller.

use std::sync::Arc;

use http::header::{HeaderValue, CONTENT_TYPE, COOKIE};
use http::StatusCode;
use log::{debug, error, info, warn};
use serde_json::{Map, Value};

use crate::challenge::{match_challenge, ChallengeMatch, CHALLENGE_PROVIDER};
use crate::config::ClientOptions;
use crate::credentials::SESSION_COOKIE_PREFIX;
use crate::csrf::{session_from_cookie, CSRF_HEADER};
use crate::error::{Error, Result};
use crate::pool::{ClientPool, QuarantineReason};
use crate::proxy::ClientIdentity;
use crate::transport::{HttpRequest, HttpResponse, RequestBody, TransportError};

/// Why a send did not produce a usable response.
#[derive(Debug)]
enum Failure {
    Status(HttpResponse),
    Transport(TransportError),
}

impl From<Failure> for Error {
    fn from(failure: Failure) -> Self {
        match failure {
            Failure::Status(response) => Error::Status(Box::new(response)),
            Failure::Transport(err) => Error::Transport(err),
        }
    }
}

/// A recoverable failure, in priority order.
#[derive(Debug)]
enum Recovery {
    RateLimited,
    ChallengeRequired {
        challenge: ChallengeMatch,
        site_key: String,
        body: Map<String, Value>,
    },
    CsrfRefresh(HeaderValue),
    ProxyFailure,
    TransientCode(String),
}

/// Handlers that fire at most once per client; reset when a new client is acquired.
#[derive(Debug, Default)]
struct Attempts {
    challenge_solved: bool,
    csrf_refreshed: bool,
}

/// A client handed out by [`ClientPool::acquire`].
///
/// The underlying identity may be shared with other callers. The handle
/// remembers the acquisition options so replacements are picked the same way.
#[derive(Clone)]
pub struct PooledClient {
    pool: Arc<ClientPool>,
    identity: Arc<ClientIdentity>,
    options: ClientOptions,
    credential: Option<String>,
}

impl PooledClient {
    pub(crate) fn new(
        pool: Arc<ClientPool>,
        identity: Arc<ClientIdentity>,
        options: ClientOptions,
        credential: Option<String>,
    ) -> Self {
        Self {
            pool,
            identity,
            options,
            credential,
        }
    }

    /// The identity requests are currently sent from.
    pub fn identity(&self) -> &Arc<ClientIdentity> {
        &self.identity
    }

    /// Id of the underlying identity.
    pub fn id(&self) -> &str {
        self.identity.id()
    }

    /// Options this client was acquired with.
    pub fn options(&self) -> ClientOptions {
        self.options
    }

    /// Credential bound for this acquisition.
    pub fn credential(&self) -> Option<&str> {
        self.credential.as_deref()
    }

    /// Send a GET through the full pipeline.
    pub async fn get(&self, url: impl Into<String>) -> Result<HttpResponse> {
        self.send(HttpRequest::get(url)).await
    }

    /// Send a request, recovering from rate limits, challenges, stale
    /// anti-forgery tokens and bad proxies along the way.
    pub async fn send(&self, mut request: HttpRequest) -> Result<HttpResponse> {
        let mut client = self.clone();
        let mut attempts = Attempts::default();

        loop {
            let failure = match client.attempt(&request).await {
                Ok(response) => return Ok(response),
                Err(failure) => failure,
            };

            let Some(recovery) = client.classify(&request, &failure, &attempts).await? else {
                return Err(failure.into());
            };

            match recovery {
                Recovery::RateLimited => {
                    let backoff = self.pool.config.rate_limit_backoff;
                    warn!("Got 429 for {}, retrying in {:?}", request.url, backoff);
                    tokio::time::sleep(backoff).await;
                    client = self.pool.acquire(self.options)?;
                    attempts = Attempts::default();
                }
                Recovery::ChallengeRequired {
                    challenge,
                    site_key,
                    mut body,
                } => {
                    info!(
                        "Challenge required for {} (code {}: \"{}\")",
                        request.url, challenge.code, challenge.message
                    );
                    attempts.challenge_solved = true;
                    let token = self
                        .pool
                        .challenges()
                        .solve(&site_key, client.identity.proxy())
                        .await?;
                    debug!("Challenge solved, resubmitting {}", request.url);
                    body.insert("captchaToken".to_string(), Value::String(token));
                    body.insert(
                        "captchaProvider".to_string(),
                        Value::String(CHALLENGE_PROVIDER.to_string()),
                    );
                    request.body = RequestBody::Json(Value::Object(body));
                    request
                        .headers
                        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                }
                Recovery::CsrfRefresh(token) => {
                    debug!("Refreshed anti-forgery token, resubmitting {}", request.url);
                    attempts.csrf_refreshed = true;
                    request.headers.insert(CSRF_HEADER, token);
                }
                Recovery::ProxyFailure => {
                    warn!(
                        "Client {} is bad, removing it from the pool and retrying {} {}",
                        client.id(),
                        request.method,
                        request.url
                    );
                    self.pool
                        .quarantine(&client.identity, QuarantineReason::default())?;
                    client = self.pool.acquire(self.options)?;
                    attempts = Attempts::default();
                }
                Recovery::TransientCode(code) => {
                    error!(
                        "Got {} while requesting {} {}, retrying",
                        code, request.method, request.url
                    );
                }
            }
        }
    }

    /// One request stage plus send, without any recovery.
    pub async fn send_once(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.attempt(&request).await.map_err(Error::from)
    }

    async fn attempt(&self, request: &HttpRequest) -> std::result::Result<HttpResponse, Failure> {
        let mut outgoing = request.clone();
        self.prepare(&mut outgoing);
        let session = session_of(&outgoing).map(str::to_string);

        let response = self
            .identity
            .execute(outgoing)
            .await
            .map_err(Failure::Transport)?;

        if let Some(token) = response
            .headers
            .get(CSRF_HEADER)
            .and_then(|value| value.to_str().ok())
        {
            self.pool.csrf().record(session.as_deref(), token);
            self.identity.set_last_known_csrf(token);
        }

        if response.is_success() {
            Ok(response)
        } else {
            Err(Failure::Status(response))
        }
    }

    /// Request stage: session cookie, then anti-forgery token.
    fn prepare(&self, request: &mut HttpRequest) {
        if let Some(credential) = &self.credential {
            let existing = request
                .headers
                .get(COOKIE)
                .and_then(|value| value.to_str().ok())
                .unwrap_or("");
            if !existing.contains(SESSION_COOKIE_PREFIX) {
                let cookie = if existing.is_empty() {
                    format!("{SESSION_COOKIE_PREFIX}{credential}")
                } else {
                    format!("{SESSION_COOKIE_PREFIX}{credential}; {existing}")
                };
                match HeaderValue::from_str(&cookie) {
                    Ok(value) => {
                        request.headers.insert(COOKIE, value);
                    }
                    Err(e) => warn!("Credential is not a valid header value: {}", e),
                }
            }
        }

        if request.headers.contains_key(CSRF_HEADER) {
            return;
        }
        let csrf = self.pool.csrf();
        let token = session_of(request)
            .and_then(|session| csrf.lookup(session))
            .or_else(|| self.identity.last_known_csrf())
            .or_else(|| csrf.fallback());
        if let Some(value) = token.and_then(|t| HeaderValue::from_str(&t).ok()) {
            request.headers.insert(CSRF_HEADER, value);
        }
    }

    async fn classify(
        &self,
        request: &HttpRequest,
        failure: &Failure,
        attempts: &Attempts,
    ) -> Result<Option<Recovery>> {
        match failure {
            Failure::Status(response) => {
                if response.status == StatusCode::TOO_MANY_REQUESTS {
                    return Ok(Some(Recovery::RateLimited));
                }
                if response.status != StatusCode::FORBIDDEN {
                    return Ok(None);
                }

                if !attempts.challenge_solved {
                    if let Some(challenge) = match_challenge(&request.url, &response.body) {
                        // A body that cannot carry the token fails before any key lookup.
                        let body = challenge_body(request)?;
                        match self.pool.site_key(challenge.key_name).await {
                            Some(site_key) => {
                                return Ok(Some(Recovery::ChallengeRequired {
                                    challenge,
                                    site_key,
                                    body,
                                }))
                            }
                            None => warn!("No site key known for challenge {}", challenge.key_name),
                        }
                    }
                }

                if !attempts.csrf_refreshed {
                    if let Some(token) = response.headers.get(CSRF_HEADER) {
                        return Ok(Some(Recovery::CsrfRefresh(token.clone())));
                    }
                }
                Ok(None)
            }
            Failure::Transport(err) => {
                if err.is_proxy_failure() && self.identity.is_proxied() {
                    return Ok(Some(Recovery::ProxyFailure));
                }
                Ok(match &err.code {
                    Some(code) if !self.pool.fail_on_code_errors() => {
                        Some(Recovery::TransientCode(code.clone()))
                    }
                    _ => None,
                })
            }
        }
    }
}

impl std::fmt::Debug for PooledClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledClient")
            .field("identity", &self.identity)
            .field("options", &self.options)
            .finish()
    }
}

fn session_of(request: &HttpRequest) -> Option<&str> {
    request
        .headers
        .get(COOKIE)
        .and_then(|value| value.to_str().ok())
        .and_then(session_from_cookie)
}

/// The request body as a JSON object able to carry a challenge token.
fn challenge_body(request: &HttpRequest) -> Result<Map<String, Value>> {
    let parsed = match &request.body {
        RequestBody::Empty => return Ok(Map::new()),
        RequestBody::Json(value) => Some(value.clone()),
        RequestBody::Bytes(bytes) => serde_json::from_slice(bytes).ok(),
    };
    match parsed {
        Some(Value::Object(map)) => Ok(map),
        _ => Err(Error::RequestBodyMustBeObject {
            method: request.method.clone(),
            url: request.url.clone(),
        }),
    }
}
