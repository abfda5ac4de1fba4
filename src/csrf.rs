//! Anti-forgery token cache keyed by session value.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use crate::credentials::SESSION_COOKIE_PREFIX;

/// Header carrying the anti-forgery token in both directions.
pub const CSRF_HEADER: &str = "x-csrf-token";

/// Maps a session value to the last anti-forgery token the server issued for
/// it, plus a process-wide last-known-good token used when no entry exists.
pub struct CsrfCache {
    by_session: RwLock<HashMap<String, String>>,
    last_good: RwLock<Option<String>>,
    enabled: AtomicBool,
}

impl CsrfCache {
    pub fn new(enabled: bool) -> Self {
        Self {
            by_session: RwLock::new(HashMap::new()),
            last_good: RwLock::new(None),
            enabled: AtomicBool::new(enabled),
        }
    }

    /// Token cached for a session, if the map is enabled.
    pub fn lookup(&self, session: &str) -> Option<String> {
        if !self.is_enabled() {
            return None;
        }
        self.by_session.read().get(session).cloned()
    }

    /// Process-wide last-known-good token.
    pub fn fallback(&self) -> Option<String> {
        self.last_good.read().clone()
    }

    /// Record a token the server just issued.
    pub fn record(&self, session: Option<&str>, token: &str) {
        *self.last_good.write() = Some(token.to_string());
        if let Some(session) = session {
            if self.is_enabled() {
                self.by_session
                    .write()
                    .insert(session.to_string(), token.to_string());
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Enable or disable the per-session map. Disabling drops its entries.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
        if !enabled {
            self.by_session.write().clear();
        }
    }

    pub fn len(&self) -> usize {
        self.by_session.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CsrfCache {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Extract the session value from a `cookie` header.
pub fn session_from_cookie(cookie: &str) -> Option<&str> {
    cookie
        .split(';')
        .map(str::trim)
        .find_map(|pair| pair.strip_prefix(SESSION_COOKIE_PREFIX))
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_extracted_from_any_position() {
        assert_eq!(session_from_cookie(".ROBLOSECURITY=abc; other=1"), Some("abc"));
        assert_eq!(session_from_cookie("a=1; .ROBLOSECURITY=xyz"), Some("xyz"));
        assert_eq!(session_from_cookie("a=1; b=2"), None);
        assert_eq!(session_from_cookie(".ROBLOSECURITY="), None);
    }

    #[test]
    fn record_updates_entry_and_fallback() {
        let cache = CsrfCache::new(true);
        cache.record(Some("session"), "token-1");

        assert_eq!(cache.lookup("session").as_deref(), Some("token-1"));
        assert_eq!(cache.fallback().as_deref(), Some("token-1"));

        cache.record(None, "token-2");
        assert_eq!(cache.lookup("session").as_deref(), Some("token-1"));
        assert_eq!(cache.fallback().as_deref(), Some("token-2"));
    }

    #[test]
    fn disabled_map_keeps_fallback_only() {
        let cache = CsrfCache::new(true);
        cache.record(Some("session"), "token-1");
        cache.set_enabled(false);

        assert!(cache.is_empty());
        assert_eq!(cache.lookup("session"), None);

        cache.record(Some("session"), "token-2");
        assert!(cache.is_empty());
        assert_eq!(cache.fallback().as_deref(), Some("token-2"));
    }
}
