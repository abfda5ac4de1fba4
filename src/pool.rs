//! Core client pool implementation.

use crate::challenge::{ChallengeGateway, ChallengeSolver};
use crate::config::{nonzero_or_default, ClientOptions, MapKind, PoolConfig};
use crate::credentials::{CredentialPool, SESSION_COOKIE_PREFIX};
use crate::csrf::CsrfCache;
use crate::error::{Error, Result};
use crate::pipeline::PooledClient;
use crate::proxy::{ClientIdentity, ProxyDescriptor};
use crate::transport::{Connector, HttpRequest, ReqwestConnector};
use crate::utils;

use futures::future;
use http::header::{HeaderValue, COOKIE};
use http::StatusCode;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::AbortHandle;
use tokio::time::{self, MissedTickBehavior};

/// Why an identity was taken out of rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuarantineReason {
    /// Recoverable; the identity is probed until it answers again.
    #[default]
    RequestTimeout,
    /// The identity is unusable and never returns to the pool.
    DoNotReAddToPool,
}

/// Snapshot of pool membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub active: usize,
    pub quarantined: usize,
    pub excluded: usize,
    pub credentials: usize,
}

/// Active identities and the round-robin cursor, mutated together.
#[derive(Default)]
struct ActiveSet {
    identities: Vec<Arc<ClientIdentity>>,
    cursor: usize,
}

struct QuarantineRecord {
    identity: Arc<ClientIdentity>,
    reason: QuarantineReason,
    recovery: Option<AbortHandle>,
    since: Instant,
}

#[derive(Default)]
struct QuarantineState {
    records: HashMap<String, QuarantineRecord>,
    excluded: HashSet<String>,
}

#[derive(Deserialize)]
struct AuthenticatedUser {
    id: u64,
}

/// A pool of client identities used for outgoing HTTP requests.
pub struct ClientPool {
    /// Configuration for the pool.
    pub config: PoolConfig,
    connector: Arc<dyn Connector>,
    direct: Arc<ClientIdentity>,
    active: Mutex<ActiveSet>,
    quarantine: Mutex<QuarantineState>,
    credentials: CredentialPool,
    csrf: CsrfCache,
    challenges: ChallengeGateway,
    fail_on_code_errors: AtomicBool,
    metadata_task: Mutex<Option<AbortHandle>>,
}

impl ClientPool {
    /// Create a new pool backed by reqwest.
    ///
    /// Registers the configured proxies and credentials, loads the challenge
    /// site keys once and starts the periodic metadata refresh.
    pub async fn new(config: PoolConfig) -> Result<Arc<Self>> {
        let connector = Arc::new(ReqwestConnector::new(config.request_timeout));
        Self::with_connector(config, connector).await
    }

    /// Create a new pool with a custom transport connector.
    pub async fn with_connector(config: PoolConfig, connector: Arc<dyn Connector>) -> Result<Arc<Self>> {
        let direct = Arc::new(ClientIdentity::new(
            None,
            connector.connect(None)?,
            config.max_requests_per_second,
        ));

        let credentials = CredentialPool::new();
        credentials.set_user_id_cache(config.user_id_cache);
        credentials.add(&config.credentials);

        let pool = Arc::new(Self {
            connector,
            direct,
            active: Mutex::new(ActiveSet::default()),
            quarantine: Mutex::new(QuarantineState::default()),
            credentials,
            csrf: CsrfCache::new(config.csrf_cache),
            challenges: ChallengeGateway::new(config.challenge_limit, config.max_solve_duration),
            fail_on_code_errors: AtomicBool::new(config.fail_on_code_errors),
            metadata_task: Mutex::new(None),
            config,
        });

        pool.register_proxies(pool.config.proxies.clone())?;

        if let Some(interval) = pool.config.challenge_metadata_interval {
            if let Err(e) = pool.refresh_challenge_metadata().await {
                warn!("Could not load challenge metadata: {}", e);
            }
            let handle = pool.spawn_metadata_refresh(interval);
            *pool.metadata_task.lock() = Some(handle);
        }

        let stats = pool.stats();
        info!(
            "Client pool initialized: {} proxies, {} credentials",
            stats.active, stats.credentials
        );

        Ok(pool)
    }

    /// Register a proxy, returning the identity created for it.
    pub fn register_proxy(&self, proxy: ProxyDescriptor) -> Result<Arc<ClientIdentity>> {
        let identity = self.build_identity(proxy)?;
        self.active.lock().identities.push(Arc::clone(&identity));
        debug!("Registered proxy client {}", identity.id());
        Ok(identity)
    }

    /// Register several proxies. Duplicates become distinct identities.
    pub fn register_proxies(&self, proxies: impl IntoIterator<Item = ProxyDescriptor>) -> Result<usize> {
        let identities = proxies
            .into_iter()
            .map(|proxy| self.build_identity(proxy))
            .collect::<Result<Vec<_>>>()?;
        let count = identities.len();
        self.active.lock().identities.extend(identities);
        if count > 0 {
            info!("Registered {} proxy clients", count);
        }
        Ok(count)
    }

    fn build_identity(&self, proxy: ProxyDescriptor) -> Result<Arc<ClientIdentity>> {
        let transport = self.connector.connect(Some(&proxy))?;
        Ok(Arc::new(ClientIdentity::new(
            Some(proxy),
            transport,
            self.config.max_requests_per_second,
        )))
    }

    /// Register proxies from a URL or file with one `address:port[:user:pass]` per line.
    pub async fn register_proxies_from_source(&self, source: &str) -> Result<usize> {
        let content = utils::fetch_source(source).await?;
        let proxies = utils::parse_proxy_list(&content);
        info!("Fetched {} proxies from {}", proxies.len(), source);
        self.register_proxies(proxies)
    }

    /// Add credentials from a URL or file with one token per line.
    pub async fn add_credentials_from_source(&self, source: &str) -> Result<usize> {
        let content = utils::fetch_source(source).await?;
        let tokens = utils::parse_credential_list(&content);
        let before = self.credentials.len();
        self.credentials.add(&tokens);
        Ok(self.credentials.len() - before)
    }

    /// Get a client according to the selection policy.
    ///
    /// `use_proxy == false` always yields the direct identity. Otherwise the
    /// active identities are visited round-robin, falling back to the direct
    /// identity when none are active (or failing when `only_proxy` is set).
    pub fn acquire(self: &Arc<Self>, options: ClientOptions) -> Result<PooledClient> {
        let identity = self.select(options)?;
        let credential = if options.use_cookie {
            let token = self.credentials.get()?;
            identity.bind_credential(token.clone());
            Some(token)
        } else {
            None
        };
        Ok(PooledClient::new(Arc::clone(self), identity, options, credential))
    }

    fn select(&self, options: ClientOptions) -> Result<Arc<ClientIdentity>> {
        if !options.use_proxy {
            return Ok(Arc::clone(&self.direct));
        }

        let mut active = self.active.lock();
        if active.identities.is_empty() {
            if options.only_proxy {
                return Err(Error::NoProxiesAvailable);
            }
            return Ok(Arc::clone(&self.direct));
        }

        if active.cursor >= active.identities.len() {
            active.cursor = 0;
        }
        let identity = Arc::clone(&active.identities[active.cursor]);
        active.cursor += 1;
        Ok(identity)
    }

    /// Take an identity out of rotation.
    ///
    /// Fails with `NotAProxy` for identities without a proxy. Calling it for
    /// an identity that is already quarantined or excluded does nothing.
    pub fn quarantine(self: &Arc<Self>, identity: &Arc<ClientIdentity>, reason: QuarantineReason) -> Result<()> {
        if !identity.is_proxied() {
            return Err(Error::NotAProxy);
        }

        let mut state = self.quarantine.lock();
        let id = identity.id();
        if state.records.contains_key(id) || state.excluded.contains(id) {
            debug!("Client {} is already out of the pool", id);
            return Ok(());
        }

        self.active.lock().identities.retain(|i| i.id() != id);

        match reason {
            QuarantineReason::DoNotReAddToPool => {
                warn!("Client {} permanently removed from the pool", id);
                state.excluded.insert(id.to_string());
            }
            QuarantineReason::RequestTimeout => {
                warn!(
                    "Client {} quarantined, probing every {:?}",
                    id, self.config.recovery_interval
                );
                let recovery = self.spawn_recovery(Arc::clone(identity));
                state.records.insert(
                    id.to_string(),
                    QuarantineRecord {
                        identity: Arc::clone(identity),
                        reason,
                        recovery: Some(recovery),
                        since: Instant::now(),
                    },
                );
            }
        }
        Ok(())
    }

    /// Probe a quarantined identity until it answers 200, then put it back.
    fn spawn_recovery(self: &Arc<Self>, identity: Arc<ClientIdentity>) -> AbortHandle {
        let pool: Weak<Self> = Arc::downgrade(self);
        let period = nonzero_or_default(self.config.recovery_interval);
        let url = self.config.liveness_url.clone();

        tokio::spawn(async move {
            let mut ticker = time::interval_at(time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else {
                    break;
                };

                match identity.probe(&url).await {
                    Ok(response) if response.status == StatusCode::OK => {
                        pool.restore(&identity);
                        break;
                    }
                    Ok(response) => {
                        warn!("Client {} is still bad: status {}", identity.id(), response.status);
                    }
                    Err(e) => {
                        warn!("Client {} is still bad: {}", identity.id(), e);
                    }
                }
            }
        })
        .abort_handle()
    }

    fn restore(&self, identity: &Arc<ClientIdentity>) {
        let mut state = self.quarantine.lock();
        let Some(record) = state.records.remove(identity.id()) else {
            return;
        };
        self.active.lock().identities.push(Arc::clone(identity));
        info!(
            "Client {} is ok again after {:?} ({:?}), returned to pool",
            identity.id(),
            record.since.elapsed(),
            record.reason
        );
    }

    /// Probe every active identity concurrently and quarantine the failures.
    pub async fn validate_all(self: &Arc<Self>) {
        let identities = self.active_identities();
        info!("Starting health check for {} clients", identities.len());

        let url = self.config.liveness_url.as_str();
        let checks = identities
            .iter()
            .map(|identity| async move { (identity, identity.probe(url).await) });
        let results = future::join_all(checks).await;

        let mut unhealthy = 0;
        for (identity, result) in results {
            let reason = match result {
                Ok(response) if response.is_success() => continue,
                Ok(response) => format!("status {}", response.status),
                Err(e) => e.to_string(),
            };
            warn!("Client {} failed health check: {}", identity.id(), reason);
            unhealthy += 1;
            if let Err(e) = self.quarantine(identity, QuarantineReason::default()) {
                warn!("Could not quarantine client {}: {}", identity.id(), e);
            }
        }

        info!(
            "Health check completed: {} healthy, {} unhealthy",
            identities.len() - unhealthy,
            unhealthy
        );
    }

    /// Validate every credential against the probe endpoint, dropping the dead ones.
    ///
    /// Each probe runs on a throwaway direct identity bound to the credential.
    /// Returns the number of credentials removed.
    pub async fn validate_credentials(&self) -> usize {
        let url = self.config.credential_probe_url.as_str();
        self.credentials
            .validate_all(self.config.validation_batch_size, |token| {
                let identity = self.direct.detached();
                async move {
                    let cookie = HeaderValue::from_str(&format!("{SESSION_COOKIE_PREFIX}{token}"))
                        .map_err(|e| Error::InvalidRequest(e.to_string()))?;
                    identity.bind_credential(token);
                    let response = identity
                        .execute(HttpRequest::get(url).header(COOKIE, cookie))
                        .await?;
                    if !response.is_success() {
                        return Err(Error::Status(Box::new(response)));
                    }
                    Ok(response.json::<AuthenticatedUser>().ok().map(|user| user.id))
                }
            })
            .await
    }

    /// Fetch the challenge site keys and replace the lookup table.
    pub async fn refresh_challenge_metadata(self: &Arc<Self>) -> Result<usize> {
        let client = self.acquire(ClientOptions::default())?;
        let response = client
            .send_once(HttpRequest::get(&self.config.challenge_metadata_url))
            .await?;
        Ok(self.challenges.load_metadata(&response.body)?)
    }

    fn spawn_metadata_refresh(self: &Arc<Self>, period: Duration) -> AbortHandle {
        let period = nonzero_or_default(period);
        let pool: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = time::interval_at(time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                if let Err(e) = pool.refresh_challenge_metadata().await {
                    warn!("Could not refresh challenge metadata: {}", e);
                }
            }
        })
        .abort_handle()
    }

    /// Site key for a challenge type, loading the table once if it is empty.
    pub(crate) async fn site_key(self: &Arc<Self>, key_name: &str) -> Option<String> {
        if !self.challenges.has_site_keys() {
            if let Err(e) = self.refresh_challenge_metadata().await {
                warn!("Could not load challenge metadata: {}", e);
            }
        }
        self.challenges.site_key(key_name)
    }

    /// Install the challenge solver along with its admission limit and deadline.
    pub fn configure_challenges(
        &self,
        solver: Arc<dyn ChallengeSolver>,
        limit: usize,
        max_solve_duration: Option<Duration>,
    ) {
        self.challenges.configure(solver, limit, max_solve_duration);
    }

    /// Replace the challenge solver, keeping the limit and deadline.
    pub fn set_challenge_solver(&self, solver: Arc<dyn ChallengeSolver>) {
        self.challenges.set_solver(solver);
    }

    /// Retry (false) or fail (true) on transport errors carrying a system code.
    pub fn set_fail_on_code_errors(&self, fail: bool) {
        self.fail_on_code_errors.store(fail, Ordering::Relaxed);
    }

    /// Whether transport errors with a system code fail the request.
    pub fn fail_on_code_errors(&self) -> bool {
        self.fail_on_code_errors.load(Ordering::Relaxed)
    }

    /// Disable a lookup map to bound memory with very many credentials.
    pub fn disable_map(&self, kind: MapKind) {
        if matches!(kind, MapKind::Csrf | MapKind::All) {
            self.csrf.set_enabled(false);
        }
        if matches!(kind, MapKind::UserId | MapKind::All) {
            self.credentials.set_user_id_cache(false);
        }
    }

    /// The credential pool bound on `use_cookie` acquisitions.
    pub fn credentials(&self) -> &CredentialPool {
        &self.credentials
    }

    /// The anti-forgery token cache.
    pub fn csrf(&self) -> &CsrfCache {
        &self.csrf
    }

    /// The challenge solver gateway and site-key table.
    pub fn challenges(&self) -> &ChallengeGateway {
        &self.challenges
    }

    /// The non-proxied identity.
    pub fn direct(&self) -> &Arc<ClientIdentity> {
        &self.direct
    }

    /// Snapshot of the identities currently in rotation.
    pub fn active_identities(&self) -> Vec<Arc<ClientIdentity>> {
        self.active.lock().identities.clone()
    }

    /// Identities currently waiting for recovery.
    pub fn quarantined_identities(&self) -> Vec<Arc<ClientIdentity>> {
        self.quarantine
            .lock()
            .records
            .values()
            .map(|record| Arc::clone(&record.identity))
            .collect()
    }

    /// Whether the identity is in rotation.
    pub fn is_active(&self, id: &str) -> bool {
        self.active.lock().identities.iter().any(|i| i.id() == id)
    }

    /// Whether the identity is waiting for a recovery probe to succeed.
    pub fn is_quarantined(&self, id: &str) -> bool {
        self.quarantine.lock().records.contains_key(id)
    }

    /// Whether the identity was removed for good.
    pub fn is_excluded(&self, id: &str) -> bool {
        self.quarantine.lock().excluded.contains(id)
    }

    /// Get statistics about the pool.
    pub fn stats(&self) -> PoolStats {
        let (quarantined, excluded) = {
            let state = self.quarantine.lock();
            (state.records.len(), state.excluded.len())
        };
        PoolStats {
            active: self.active.lock().identities.len(),
            quarantined,
            excluded,
            credentials: self.credentials.len(),
        }
    }
}

impl Drop for ClientPool {
    fn drop(&mut self) {
        for record in self.quarantine.get_mut().records.values() {
            if let Some(recovery) = &record.recovery {
                recovery.abort();
            }
        }
        if let Some(task) = self.metadata_task.get_mut().take() {
            task.abort();
        }
    }
}
