//! Cooldown tracking
//!
//! After a successful remediation, the same action on the same resource is
//! suppressed for the namespace's cooldown period. Entries are recorded only
//! on success, keyed `"<namespace>:<resource>:<action>"`, and garbage
//! collected once they are older than an hour. State is process-local and
//! intentionally lost on restart.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::detection::ActionKind;

/// How long an entry may linger before the periodic sweep removes it.
pub const ENTRY_TTL: Duration = Duration::from_secs(60 * 60);

/// Build the compound cooldown key for a resource/action pair.
#[must_use]
pub fn cooldown_key(namespace: &str, resource: &str, action: ActionKind) -> String {
    format!("{namespace}:{resource}:{action}")
}

#[derive(Debug, Clone, Copy)]
struct CooldownEntry {
    last_action: Instant,
}

/// Table of active cooldowns.
#[derive(Default)]
pub struct CooldownTracker {
    entries: Mutex<HashMap<String, CooldownEntry>>,
}

impl CooldownTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` is still inside its cooldown window. A zero cooldown
    /// means the feature is disabled and nothing is ever suppressed.
    pub fn in_cooldown(&self, key: &str, cooldown: Duration) -> bool {
        if cooldown.is_zero() {
            return false;
        }

        let entries = self.entries.lock();
        entries
            .get(key)
            .is_some_and(|entry| entry.last_action.elapsed() < cooldown)
    }

    /// Record a successful action. Recording twice is the same as recording
    /// once at the later timestamp.
    pub fn record(&self, key: &str) {
        let mut entries = self.entries.lock();
        entries.insert(
            key.to_string(),
            CooldownEntry {
                last_action: Instant::now(),
            },
        );
    }

    /// Remove entries whose last action is older than `ttl`. Returns the
    /// number of entries dropped.
    pub fn cleanup_older_than(&self, ttl: Duration) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.last_action.elapsed() <= ttl);
        before - entries.len()
    }

    /// Number of live entries per namespace, for the cooldown gauge. The
    /// namespace is the first segment of the compound key.
    pub fn active_by_namespace(&self) -> HashMap<String, usize> {
        let entries = self.entries.lock();
        let mut counts: HashMap<String, usize> = HashMap::new();
        for key in entries.keys() {
            let namespace = key.split(':').next().unwrap_or_default();
            *counts.entry(namespace.to_string()).or_default() += 1;
        }
        counts
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
