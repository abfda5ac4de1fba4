//! # reqwest-identity-pool
//!
//! A rotating pool of HTTP client identities for reqwest.
//!
//! The pool holds one direct identity plus any number of SOCKS5-proxied ones
//! and hands them out round-robin. Identities whose proxy fails are
//! quarantined and probed until they recover. Requests sent through a pooled
//! client transparently survive rate limiting (429), anti-automation
//! challenges (403 with a known error), stale anti-forgery tokens and flaky
//! connections. The pool can also be plugged into `reqwest-middleware`.

pub mod challenge;
pub mod config;
pub mod credentials;
pub mod csrf;
pub mod error;
pub mod middleware;
pub mod pipeline;
pub mod pool;
pub mod proxy;
pub mod transport;
mod utils;

pub use challenge::{ChallengeGateway, ChallengeSolver, CHALLENGE_PROVIDER};
pub use config::{ClientOptions, MapKind, PoolConfig, PoolConfigBuilder};
pub use credentials::CredentialPool;
pub use csrf::CsrfCache;
pub use error::{Error, Result};
pub use middleware::IdentityPoolMiddleware;
pub use pipeline::PooledClient;
pub use pool::{ClientPool, PoolStats, QuarantineReason};
pub use proxy::{ClientIdentity, ProxyDescriptor};
pub use transport::{
    Connector, HttpRequest, HttpResponse, ReqwestConnector, RequestBody, Transport,
    TransportError,
};
pub use utils::{parse_credential_list, parse_proxy_list};
