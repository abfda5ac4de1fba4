//! Configuration for the client pool.

use std::time::Duration;

use crate::challenge::DEFAULT_CHALLENGE_LIMIT;
use crate::credentials::DEFAULT_VALIDATION_BATCH;
use crate::proxy::ProxyDescriptor;

/// How a client should be selected on acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientOptions {
    /// Fail instead of falling back to the direct identity when no proxy is active.
    pub only_proxy: bool,
    /// Bind a credential from the credential pool.
    pub use_cookie: bool,
    /// Select from the proxied identities. Defaults to true.
    pub use_proxy: bool,
}

impl ClientOptions {
    pub fn only_proxy(mut self, only_proxy: bool) -> Self {
        self.only_proxy = only_proxy;
        self
    }

    pub fn use_cookie(mut self, use_cookie: bool) -> Self {
        self.use_cookie = use_cookie;
        self
    }

    pub fn use_proxy(mut self, use_proxy: bool) -> Self {
        self.use_proxy = use_proxy;
        self
    }

    /// Options for the direct identity.
    pub fn direct() -> Self {
        Self::default().use_proxy(false)
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            only_proxy: false,
            use_cookie: false,
            use_proxy: true,
        }
    }
}

/// Which lookup map to disable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapKind {
    /// Session to anti-forgery token.
    Csrf,
    /// Session to resolved user id.
    UserId,
    All,
}

/// Configuration for the client pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Proxies registered at construction.
    pub proxies: Vec<ProxyDescriptor>,
    /// Credentials registered at construction.
    pub credentials: Vec<String>,
    /// Cheap GET target used for identity health checks and recovery.
    pub liveness_url: String,
    /// Endpoint that answers `{ "id": n }` for a valid session.
    pub credential_probe_url: String,
    /// Endpoint serving the challenge site keys.
    pub challenge_metadata_url: String,
    /// How often site keys are refreshed; `None` disables the background task.
    pub challenge_metadata_interval: Option<Duration>,
    /// Period of the recovery probe for quarantined identities.
    pub recovery_interval: Duration,
    /// Wait after a 429 before resubmitting on a new client.
    pub rate_limit_backoff: Duration,
    /// Credentials probed concurrently per validation batch.
    pub validation_batch_size: usize,
    /// Maximum number of challenge solves in flight.
    pub challenge_limit: usize,
    /// Deadline for one challenge solve.
    pub max_solve_duration: Option<Duration>,
    /// Fail requests on system error codes instead of retrying them.
    pub fail_on_code_errors: bool,
    pub csrf_cache: bool,
    pub user_id_cache: bool,
    /// Timeout applied by the default reqwest transport.
    pub request_timeout: Option<Duration>,
    /// Per-identity request rate, unlimited when `None`.
    pub max_requests_per_second: Option<f64>,
}

impl PoolConfig {
    /// Create a new configuration builder.
    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder::new()
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfigBuilder::new().build()
    }
}

/// Builder for `PoolConfig`.
pub struct PoolConfigBuilder {
    proxies: Vec<ProxyDescriptor>,
    credentials: Vec<String>,
    liveness_url: Option<String>,
    credential_probe_url: Option<String>,
    challenge_metadata_url: Option<String>,
    challenge_metadata_interval: Option<Option<Duration>>,
    recovery_interval: Option<Duration>,
    rate_limit_backoff: Option<Duration>,
    validation_batch_size: Option<usize>,
    challenge_limit: Option<usize>,
    max_solve_duration: Option<Duration>,
    fail_on_code_errors: Option<bool>,
    csrf_cache: Option<bool>,
    user_id_cache: Option<bool>,
    request_timeout: Option<Duration>,
    max_requests_per_second: Option<f64>,
}

impl PoolConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self {
            proxies: Vec::new(),
            credentials: Vec::new(),
            liveness_url: None,
            credential_probe_url: None,
            challenge_metadata_url: None,
            challenge_metadata_interval: None,
            recovery_interval: None,
            rate_limit_backoff: None,
            validation_batch_size: None,
            challenge_limit: None,
            max_solve_duration: None,
            fail_on_code_errors: None,
            csrf_cache: None,
            user_id_cache: None,
            request_timeout: None,
            max_requests_per_second: None,
        }
    }

    pub fn proxies(mut self, proxies: Vec<ProxyDescriptor>) -> Self {
        self.proxies = proxies;
        self
    }

    pub fn credentials(mut self, credentials: Vec<impl Into<String>>) -> Self {
        self.credentials = credentials.into_iter().map(Into::into).collect();
        self
    }

    pub fn liveness_url(mut self, url: impl Into<String>) -> Self {
        self.liveness_url = Some(url.into());
        self
    }

    pub fn credential_probe_url(mut self, url: impl Into<String>) -> Self {
        self.credential_probe_url = Some(url.into());
        self
    }

    pub fn challenge_metadata_url(mut self, url: impl Into<String>) -> Self {
        self.challenge_metadata_url = Some(url.into());
        self
    }

    /// Set the metadata refresh period, or `None` to never poll.
    pub fn challenge_metadata_interval(mut self, interval: Option<Duration>) -> Self {
        self.challenge_metadata_interval = Some(interval);
        self
    }

    /// Set the recovery probe period. Zero keeps the 60 s default.
    pub fn recovery_interval(mut self, interval: Duration) -> Self {
        self.recovery_interval = Some(interval);
        self
    }

    pub fn rate_limit_backoff(mut self, backoff: Duration) -> Self {
        self.rate_limit_backoff = Some(backoff);
        self
    }

    pub fn validation_batch_size(mut self, size: usize) -> Self {
        self.validation_batch_size = Some(size);
        self
    }

    pub fn challenge_limit(mut self, limit: usize) -> Self {
        self.challenge_limit = Some(limit);
        self
    }

    pub fn max_solve_duration(mut self, duration: Duration) -> Self {
        self.max_solve_duration = Some(duration);
        self
    }

    pub fn fail_on_code_errors(mut self, fail: bool) -> Self {
        self.fail_on_code_errors = Some(fail);
        self
    }

    /// Disable one or both lookup maps.
    pub fn disable_map(mut self, kind: MapKind) -> Self {
        if matches!(kind, MapKind::Csrf | MapKind::All) {
            self.csrf_cache = Some(false);
        }
        if matches!(kind, MapKind::UserId | MapKind::All) {
            self.user_id_cache = Some(false);
        }
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Set the maximum requests per second per identity.
    pub fn max_requests_per_second(mut self, rps: f64) -> Self {
        self.max_requests_per_second = Some(rps);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> PoolConfig {
        PoolConfig {
            proxies: self.proxies,
            credentials: self.credentials,
            liveness_url: self
                .liveness_url
                .unwrap_or_else(|| "https://www.roblox.com/robots.txt".to_string()),
            credential_probe_url: self
                .credential_probe_url
                .unwrap_or_else(|| "https://users.roblox.com/v1/users/authenticated".to_string()),
            challenge_metadata_url: self
                .challenge_metadata_url
                .unwrap_or_else(|| "https://captcha.roblox.com/v1/captcha/metadata".to_string()),
            challenge_metadata_interval: self
                .challenge_metadata_interval
                .unwrap_or(Some(DEFAULT_INTERVAL))
                .map(nonzero_or_default),
            recovery_interval: self
                .recovery_interval
                .map_or(DEFAULT_INTERVAL, nonzero_or_default),
            rate_limit_backoff: self.rate_limit_backoff.unwrap_or(Duration::from_millis(2500)),
            validation_batch_size: self.validation_batch_size.unwrap_or(DEFAULT_VALIDATION_BATCH),
            challenge_limit: self.challenge_limit.unwrap_or(DEFAULT_CHALLENGE_LIMIT),
            max_solve_duration: self.max_solve_duration,
            fail_on_code_errors: self.fail_on_code_errors.unwrap_or(false),
            csrf_cache: self.csrf_cache.unwrap_or(true),
            user_id_cache: self.user_id_cache.unwrap_or(true),
            request_timeout: self.request_timeout,
            max_requests_per_second: self.max_requests_per_second,
        }
    }
}

const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// Timer periods must be non-zero; zero falls back to the default.
pub(crate) fn nonzero_or_default(period: Duration) -> Duration {
    if period.is_zero() {
        DEFAULT_INTERVAL
    } else {
        period
    }
}

impl Default for PoolConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.recovery_interval, Duration::from_secs(60));
        assert_eq!(config.rate_limit_backoff, Duration::from_millis(2500));
        assert_eq!(config.challenge_limit, 10);
        assert_eq!(config.validation_batch_size, 1000);
        assert_eq!(config.challenge_metadata_interval, Some(Duration::from_secs(60)));
        assert!(config.max_solve_duration.is_none());
        assert!(!config.fail_on_code_errors);
        assert!(config.csrf_cache && config.user_id_cache);
    }

    #[test]
    fn zero_periods_fall_back_to_defaults() {
        let config = PoolConfig::builder()
            .recovery_interval(Duration::ZERO)
            .challenge_metadata_interval(Some(Duration::ZERO))
            .build();
        assert_eq!(config.recovery_interval, Duration::from_secs(60));
        assert_eq!(config.challenge_metadata_interval, Some(Duration::from_secs(60)));

        let config = PoolConfig::builder()
            .recovery_interval(Duration::from_secs(5))
            .challenge_metadata_interval(None)
            .build();
        assert_eq!(config.recovery_interval, Duration::from_secs(5));
        assert_eq!(config.challenge_metadata_interval, None);
    }

    #[test]
    fn disable_map_variants() {
        let config = PoolConfig::builder().disable_map(MapKind::Csrf).build();
        assert!(!config.csrf_cache && config.user_id_cache);

        let config = PoolConfig::builder().disable_map(MapKind::All).build();
        assert!(!config.csrf_cache && !config.user_id_cache);
    }

    #[test]
    fn client_options_default_to_proxy() {
        let options = ClientOptions::default();
        assert!(options.use_proxy && !options.only_proxy && !options.use_cookie);
        assert!(!ClientOptions::direct().use_proxy);
    }
}
