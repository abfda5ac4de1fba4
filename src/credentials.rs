//! Session credential pool with round-robin retrieval.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::error::{Error, Result};

/// Prefix of a raw session cookie as copied out of a browser.
pub const SESSION_COOKIE_PREFIX: &str = ".ROBLOSECURITY=";

/// Number of credentials probed concurrently during validation.
pub const DEFAULT_VALIDATION_BATCH: usize = 1000;

#[derive(Default)]
struct CredentialSet {
    order: Vec<String>,
    members: HashSet<String>,
    cursor: usize,
}

/// A set of reusable session tokens.
///
/// Tokens keep their insertion order so rotation is stable; duplicates
/// collapse on insert.
pub struct CredentialPool {
    set: Mutex<CredentialSet>,
    user_ids: RwLock<HashMap<String, u64>>,
    user_ids_enabled: AtomicBool,
}

impl CredentialPool {
    pub fn new() -> Self {
        Self {
            set: Mutex::new(CredentialSet::default()),
            user_ids: RwLock::new(HashMap::new()),
            user_ids_enabled: AtomicBool::new(true),
        }
    }

    /// Add a single token.
    pub fn add_one(&self, token: &str) {
        self.add([token]);
    }

    /// Add tokens, stripping a leading session-cookie prefix once.
    pub fn add<I, S>(&self, tokens: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = self.set.lock();
        for token in tokens {
            let token = normalize(token.as_ref());
            if token.is_empty() {
                continue;
            }
            if set.members.insert(token.to_string()) {
                set.order.push(token.to_string());
            }
        }
    }

    /// Next token in rotation.
    pub fn get(&self) -> Result<String> {
        let mut set = self.set.lock();
        if set.cursor >= set.order.len() {
            if set.cursor > 0 {
                debug!("credential cursor {} past end, restarting at 0", set.cursor);
            }
            set.cursor = 0;
        }
        let token = set.order.get(set.cursor).cloned().ok_or(Error::EmptyPool)?;
        set.cursor += 1;
        Ok(token)
    }

    pub fn remove(&self, token: &str) -> bool {
        let mut set = self.set.lock();
        if !set.members.remove(token) {
            return false;
        }
        set.order.retain(|t| t != token);
        drop(set);
        self.user_ids.write().remove(token);
        true
    }

    pub fn contains(&self, token: &str) -> bool {
        self.set.lock().members.contains(token)
    }

    pub fn len(&self) -> usize {
        self.set.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all tokens in rotation order.
    pub fn tokens(&self) -> Vec<String> {
        self.set.lock().order.clone()
    }

    /// Account id resolved for a token during validation.
    pub fn user_id(&self, token: &str) -> Option<u64> {
        self.user_ids.read().get(token).copied()
    }

    /// Enable or disable the token-to-user-id cache. Disabling clears it.
    pub fn set_user_id_cache(&self, enabled: bool) {
        self.user_ids_enabled.store(enabled, Ordering::Relaxed);
        if !enabled {
            self.user_ids.write().clear();
        }
    }

    fn record_user_id(&self, token: &str, user_id: u64) {
        if self.user_ids_enabled.load(Ordering::Relaxed) {
            self.user_ids.write().insert(token.to_string(), user_id);
        }
    }

    /// Probe every token, removing the ones whose probe fails.
    ///
    /// Batches run one after another; probes inside a batch run concurrently.
    /// A successful probe may resolve the token's user id. Returns the number
    /// of tokens removed.
    pub async fn validate_all<F, Fut>(&self, batch_size: usize, probe: F) -> usize
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<Option<u64>>>,
    {
        let tokens = self.tokens();
        info!("Validating {} credentials", tokens.len());

        let mut removed = 0;
        for batch in tokens.chunks(batch_size.max(1)) {
            let checks = batch.iter().map(|token| {
                let check = probe(token.clone());
                async move { (token, check.await) }
            });

            for (token, result) in future::join_all(checks).await {
                match result {
                    Ok(Some(user_id)) => self.record_user_id(token, user_id),
                    Ok(None) => {}
                    Err(e) => {
                        warn!("Invalid credential removed from pool: {}", e);
                        self.remove(token);
                        removed += 1;
                    }
                }
            }
        }

        info!(
            "Credential validation completed: {} valid, {} removed",
            self.len(),
            removed
        );
        removed
    }
}

impl Default for CredentialPool {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize(token: &str) -> &str {
    let token = token.trim();
    token.strip_prefix(SESSION_COOKIE_PREFIX).unwrap_or(token)
}
