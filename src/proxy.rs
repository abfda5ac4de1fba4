//! Proxy descriptors and the client identities built from them.

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use parking_lot::RwLock;
use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;
use url::Url;

use crate::transport::{HttpRequest, HttpResponse, Transport, TransportError};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// A SOCKS5 proxy endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyDescriptor {
    /// Host or IP address, without the port.
    pub address: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxyDescriptor {
    /// A proxy without authentication.
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            username: None,
            password: None,
        }
    }

    /// Add username and password authentication.
    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Render as a `socks5://` URL with percent-encoded credentials.
    pub fn to_url(&self) -> Result<Url, url::ParseError> {
        let mut url = Url::parse(&format!("socks5://{}:{}", self.address, self.port))?;
        // socks5 URLs always have a host, so these cannot fail.
        if let Some(username) = &self.username {
            let _ = url.set_username(username);
        }
        if let Some(password) = &self.password {
            let _ = url.set_password(Some(password));
        }
        Ok(url)
    }
}

impl fmt::Display for ProxyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// A reusable outbound-request handle, proxied or direct.
///
/// Identities are shared through `Arc` and may be handed to several callers
/// at once; the bound credential and cached CSRF token are interior-mutable.
pub struct ClientIdentity {
    id: String,
    proxy: Option<ProxyDescriptor>,
    credential: RwLock<Option<String>>,
    last_known_csrf: RwLock<Option<String>>,
    transport: Arc<dyn Transport>,
    limiter: Option<Arc<DirectLimiter>>,
}

impl ClientIdentity {
    /// Create an identity with a fresh random id.
    pub(crate) fn new(
        proxy: Option<ProxyDescriptor>,
        transport: Arc<dyn Transport>,
        max_requests_per_second: Option<f64>,
    ) -> Self {
        let limiter = max_requests_per_second.map(|rps| {
            let per_second = NonZeroU32::new(rps.ceil() as u32).unwrap_or(NonZeroU32::MIN);
            Arc::new(RateLimiter::direct(Quota::per_second(per_second)))
        });

        Self {
            id: random_id(),
            proxy,
            credential: RwLock::new(None),
            last_known_csrf: RwLock::new(None),
            transport,
            limiter,
        }
    }

    /// Opaque random id, stable for the identity's lifetime.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The proxy this identity routes through, `None` for the direct identity.
    pub fn proxy(&self) -> Option<&ProxyDescriptor> {
        self.proxy.as_ref()
    }

    /// Whether requests go through a proxy.
    pub fn is_proxied(&self) -> bool {
        self.proxy.is_some()
    }

    /// The credential most recently bound to this identity.
    pub fn credential(&self) -> Option<String> {
        self.credential.read().clone()
    }

    /// Record the credential of the latest acquisition.
    pub fn bind_credential(&self, token: impl Into<String>) {
        *self.credential.write() = Some(token.into());
    }

    /// Forget the bound credential.
    pub fn clear_credential(&self) {
        *self.credential.write() = None;
    }

    /// Last anti-forgery token this identity received.
    pub fn last_known_csrf(&self) -> Option<String> {
        self.last_known_csrf.read().clone()
    }

    pub(crate) fn set_last_known_csrf(&self, token: &str) {
        *self.last_known_csrf.write() = Some(token.to_string());
    }

    /// A throwaway identity sharing this identity's transport.
    pub(crate) fn detached(&self) -> Self {
        Self {
            id: random_id(),
            proxy: self.proxy.clone(),
            credential: RwLock::new(None),
            last_known_csrf: RwLock::new(None),
            transport: Arc::clone(&self.transport),
            limiter: self.limiter.clone(),
        }
    }

    /// Send one request on the wire, honoring the rate limit.
    pub(crate) async fn execute(
        &self,
        request: HttpRequest,
    ) -> Result<HttpResponse, TransportError> {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }
        self.transport.execute(request).await
    }

    /// Liveness probe: a bare GET with no pipeline involvement.
    pub(crate) async fn probe(&self, url: &str) -> Result<HttpResponse, TransportError> {
        self.execute(HttpRequest::get(url)).await
    }
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("id", &self.id)
            .field("proxy", &self.proxy)
            .field("has_credential", &self.credential.read().is_some())
            .finish()
    }
}

fn random_id() -> String {
    let bytes: [u8; 32] = rand::random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_encodes_credentials() {
        let proxy = ProxyDescriptor::new("10.0.0.1", 1080).with_auth("user", "p@ss:word");
        let url = proxy.to_url().unwrap();
        assert_eq!(url.scheme(), "socks5");
        assert_eq!(url.username(), "user");
        assert_eq!(url.password(), Some("p%40ss%3Aword"));
        assert_eq!(url.port(), Some(1080));
    }

    #[test]
    fn display_hides_credentials() {
        let proxy = ProxyDescriptor::new("proxy.local", 9050).with_auth("u", "secret");
        assert_eq!(proxy.to_string(), "proxy.local:9050");
    }

    #[test]
    fn ids_are_unique_hex() {
        let a = random_id();
        let b = random_id();
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    struct Ok200;

    #[async_trait::async_trait]
    impl Transport for Ok200 {
        async fn execute(&self, _request: HttpRequest) -> Result<HttpResponse, TransportError> {
            Ok(HttpResponse::new(http::StatusCode::OK))
        }
    }

    #[tokio::test]
    async fn rate_limit_delays_sends_past_the_burst() {
        let identity = ClientIdentity::new(None, Arc::new(Ok200), Some(4.0));

        let started = std::time::Instant::now();
        for _ in 0..5 {
            identity.probe("https://example.com/").await.unwrap();
        }
        // Burst of 4, the fifth send waits for a cell to replenish.
        assert!(started.elapsed() >= std::time::Duration::from_millis(150));
    }

    #[test]
    fn detached_identity_shares_transport_only() {
        let identity = ClientIdentity::new(None, Arc::new(Ok200), None);
        identity.bind_credential("token");

        let detached = identity.detached();
        assert_ne!(detached.id(), identity.id());
        assert_eq!(detached.credential(), None);
        assert!(Arc::ptr_eq(&detached.transport, &identity.transport));
    }
}
