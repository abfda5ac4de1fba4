//! Challenge detection and the bounded-concurrency solver gateway.
//!
//! A 403 response is a challenge demand when one of its `errors[]` entries
//! matches a known `{url pattern, code, message}` rule. The gateway admits at
//! most `limit` concurrent solves and rejects the rest outright.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use parking_lot::RwLock;
use regex::Regex;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::proxy::ProxyDescriptor;

/// Provider tag sent alongside a solved token.
pub const CHALLENGE_PROVIDER: &str = "PROVIDER_ARKOSE_LABS";

/// Default number of solves allowed in flight at once.
pub const DEFAULT_CHALLENGE_LIMIT: usize = 10;

/// External capability that turns a site key into a solved challenge token.
#[async_trait]
pub trait ChallengeSolver: Send + Sync {
    async fn solve(&self, site_key: &str, proxy: Option<&ProxyDescriptor>) -> anyhow::Result<String>;
}

struct ChallengeRule {
    url: Regex,
    code: i64,
    message: &'static str,
    key_name: &'static str,
}

impl ChallengeRule {
    fn new(url: &str, code: i64, message: &'static str, key_name: &'static str) -> Self {
        Self {
            url: Regex::new(url).expect("challenge url pattern must compile"),
            code,
            message,
            key_name,
        }
    }
}

static RULES: LazyLock<Vec<ChallengeRule>> = LazyLock::new(|| {
    vec![
        ChallengeRule::new(
            r"^https://auth\.roblox\.com/v(1|2)/login$",
            2,
            "You must pass the robot test before logging in.",
            "WebLogin",
        ),
        ChallengeRule::new(
            r"^https://auth\.roblox\.com/v(1|2|3)/signup$",
            2,
            "Captcha Failed.",
            "WebSignup",
        ),
        ChallengeRule::new(
            r"^https://groups\.roblox\.com/v1/groups/(\d+?)/users$",
            5,
            "You must pass the captcha test before joining this group.",
            "UserAction",
        ),
        ChallengeRule::new(
            r"^https://friends\.roblox\.com/v1/users/(\d+?)/request-friendship$",
            14,
            "The user has not passed the captcha.",
            "UserAction",
        ),
        ChallengeRule::new(
            r"^https://friends\.roblox\.com/v1/users/(\d+?)/follow$",
            14,
            "The user has not passed the captcha.",
            "UserAction",
        ),
    ]
});

#[derive(Deserialize)]
struct ApiErrors {
    #[serde(default)]
    errors: Vec<ApiError>,
}

#[derive(Deserialize)]
struct ApiError {
    code: i64,
    #[serde(default)]
    message: String,
}

/// A challenge demand recognized in a 403 response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeMatch {
    /// Challenge type name, used to look up the site key.
    pub key_name: &'static str,
    pub code: i64,
    pub message: String,
}

/// Match a 403 error body against the known challenge rules.
pub fn match_challenge(url: &str, body: &[u8]) -> Option<ChallengeMatch> {
    let parsed: ApiErrors = serde_json::from_slice(body).ok()?;
    let url = url.strip_suffix('/').unwrap_or(url);

    parsed.errors.iter().find_map(|error| {
        RULES
            .iter()
            .filter(|rule| rule.url.is_match(url))
            .find(|rule| rule.code == error.code && rule.message.eq_ignore_ascii_case(&error.message))
            .map(|rule| ChallengeMatch {
                key_name: rule.key_name,
                code: error.code,
                message: error.message.clone(),
            })
    })
}

#[derive(Deserialize)]
struct ChallengeMetadata {
    #[serde(rename = "funCaptchaPublicKeys", default)]
    public_keys: Vec<PublicKey>,
}

#[derive(Deserialize)]
struct PublicKey {
    #[serde(rename = "type")]
    kind: String,
    value: String,
}

/// Admission-controlled access to the configured [`ChallengeSolver`].
pub struct ChallengeGateway {
    solver: RwLock<Option<Arc<dyn ChallengeSolver>>>,
    limit: AtomicUsize,
    max_solve_duration: RwLock<Option<Duration>>,
    pending: AtomicUsize,
    site_keys: RwLock<HashMap<String, String>>,
}

impl ChallengeGateway {
    pub fn new(limit: usize, max_solve_duration: Option<Duration>) -> Self {
        Self {
            solver: RwLock::new(None),
            limit: AtomicUsize::new(limit),
            max_solve_duration: RwLock::new(max_solve_duration),
            pending: AtomicUsize::new(0),
            site_keys: RwLock::new(HashMap::new()),
        }
    }

    pub fn configure(
        &self,
        solver: Arc<dyn ChallengeSolver>,
        limit: usize,
        max_solve_duration: Option<Duration>,
    ) {
        self.set_solver(solver);
        self.set_limit(limit);
        self.set_max_solve_duration(max_solve_duration);
    }

    pub fn set_solver(&self, solver: Arc<dyn ChallengeSolver>) {
        *self.solver.write() = Some(solver);
    }

    pub fn set_limit(&self, limit: usize) {
        self.limit.store(limit, Ordering::SeqCst);
    }

    pub fn set_max_solve_duration(&self, max_solve_duration: Option<Duration>) {
        *self.max_solve_duration.write() = max_solve_duration;
    }

    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::SeqCst)
    }

    /// Number of solves currently in flight.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Solve a challenge, failing fast when the gate is full.
    pub async fn solve(&self, site_key: &str, proxy: Option<&ProxyDescriptor>) -> Result<String> {
        let solver = self.solver.read().clone().ok_or(Error::SolverNotConfigured)?;
        let _slot = self.admit()?;
        let deadline = *self.max_solve_duration.read();

        debug!("Solving challenge for site key {} ({} pending)", site_key, self.pending());
        let solve = solver.solve(site_key, proxy);
        let token = match deadline {
            Some(deadline) => tokio::time::timeout(deadline, solve)
                .await
                .map_err(|_| Error::SolveTimeout(deadline))?,
            None => solve.await,
        };
        token.map_err(Error::Solver)
    }

    fn admit(&self) -> Result<PendingSlot<'_>> {
        let limit = self.limit();
        self.pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < limit).then_some(n + 1)
            })
            .map_err(|_| Error::TooManyPending { limit })?;
        Ok(PendingSlot {
            pending: &self.pending,
        })
    }

    /// Site key for a challenge type name.
    pub fn site_key(&self, key_name: &str) -> Option<String> {
        self.site_keys.read().get(key_name).cloned()
    }

    pub fn set_site_key(&self, key_name: impl Into<String>, site_key: impl Into<String>) {
        self.site_keys.write().insert(key_name.into(), site_key.into());
    }

    pub fn has_site_keys(&self) -> bool {
        !self.site_keys.read().is_empty()
    }

    /// Replace the site-key table from a metadata response body.
    pub fn load_metadata(&self, body: &[u8]) -> serde_json::Result<usize> {
        let metadata: ChallengeMetadata = serde_json::from_slice(body)?;
        let keys: HashMap<String, String> = metadata
            .public_keys
            .into_iter()
            .map(|key| (key.kind, key.value))
            .collect();
        let count = keys.len();
        *self.site_keys.write() = keys;
        info!("Loaded {} challenge site keys", count);
        Ok(count)
    }
}

impl Default for ChallengeGateway {
    fn default() -> Self {
        Self::new(DEFAULT_CHALLENGE_LIMIT, None)
    }
}

/// Holds one admission slot; released on drop, including cancellation.
struct PendingSlot<'a> {
    pending: &'a AtomicUsize,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::Semaphore;

    fn errors(code: i64, message: &str) -> Vec<u8> {
        json!({ "errors": [{ "code": code, "message": message }] })
            .to_string()
            .into_bytes()
    }

    #[test]
    fn matches_login_challenge() {
        let body = errors(2, "You must pass the robot test before logging in.");
        let found = match_challenge("https://auth.roblox.com/v2/login", &body).unwrap();
        assert_eq!(found.key_name, "WebLogin");
        assert_eq!(found.code, 2);
    }

    #[test]
    fn ignores_trailing_slash_and_message_case() {
        let body = errors(5, "YOU MUST PASS THE CAPTCHA TEST BEFORE JOINING THIS GROUP.");
        let found = match_challenge("https://groups.roblox.com/v1/groups/1234/users/", &body);
        assert_eq!(found.map(|m| m.key_name), Some("UserAction"));
    }

    #[test]
    fn rejects_wrong_code_or_url() {
        let body = errors(3, "You must pass the robot test before logging in.");
        assert!(match_challenge("https://auth.roblox.com/v2/login", &body).is_none());

        let body = errors(2, "You must pass the robot test before logging in.");
        assert!(match_challenge("https://auth.roblox.com/v2/logout", &body).is_none());
        assert!(match_challenge("https://auth.roblox.com/v2/login", b"not json").is_none());
    }

    #[test]
    fn loads_site_keys_from_metadata() {
        let gateway = ChallengeGateway::default();
        let body = json!({
            "funCaptchaPublicKeys": [
                { "type": "WebLogin", "value": "LOGIN-KEY" },
                { "type": "UserAction", "value": "ACTION-KEY" }
            ]
        })
        .to_string();

        assert_eq!(gateway.load_metadata(body.as_bytes()).unwrap(), 2);
        assert_eq!(gateway.site_key("WebLogin").as_deref(), Some("LOGIN-KEY"));
        assert_eq!(gateway.site_key("WebSignup"), None);
    }

    struct GatedSolver {
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl ChallengeSolver for GatedSolver {
        async fn solve(&self, site_key: &str, _proxy: Option<&ProxyDescriptor>) -> anyhow::Result<String> {
            let _permit = self.gate.acquire().await?;
            Ok(format!("token-{site_key}"))
        }
    }

    #[tokio::test]
    async fn admission_limit_rejects_and_releases() {
        let gateway = Arc::new(ChallengeGateway::new(2, None));
        let gate = Arc::new(Semaphore::new(0));
        gateway.set_solver(Arc::new(GatedSolver { gate: gate.clone() }));

        let mut handles = Vec::new();
        for _ in 0..2 {
            let gateway = gateway.clone();
            handles.push(tokio::spawn(async move { gateway.solve("key", None).await }));
        }
        while gateway.pending() < 2 {
            tokio::task::yield_now().await;
        }

        let rejected = gateway.solve("key", None).await;
        assert!(matches!(rejected, Err(Error::TooManyPending { limit: 2 })));
        assert_eq!(gateway.pending(), 2);

        gate.add_permits(1);
        while gateway.pending() == 2 {
            tokio::task::yield_now().await;
        }
        assert_eq!(gateway.pending(), 1);

        gate.add_permits(1);
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "token-key");
        }
        assert_eq!(gateway.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_releases_slot() {
        let gateway = ChallengeGateway::new(1, Some(Duration::from_secs(30)));
        gateway.set_solver(Arc::new(GatedSolver {
            gate: Arc::new(Semaphore::new(0)),
        }));

        let result = gateway.solve("key", None).await;
        assert!(matches!(result, Err(Error::SolveTimeout(d)) if d == Duration::from_secs(30)));
        assert_eq!(gateway.pending(), 0);
    }

    #[tokio::test]
    async fn missing_solver_is_an_error() {
        let gateway = ChallengeGateway::default();
        assert!(matches!(
            gateway.solve("key", None).await,
            Err(Error::SolverNotConfigured)
        ));
        assert_eq!(gateway.pending(), 0);
    }
}
