use std::collections::HashMap;
use std::time::{Duration, Instant};

use shared::domain::UserId;

/// A typing indicator is considered stale after this long without a refresh.
pub const TYPING_TTL: Duration = Duration::from_secs(3);

struct PresenceEntry {
    display_name: String,
    started_at: Instant,
    expires_at: Instant,
}

/// Ephemeral, best-effort "who is typing" state. No persistence; rebuilt
/// from scratch after a reconnect.
pub struct PresenceTracker {
    ttl: Duration,
    entries: HashMap<UserId, PresenceEntry>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::with_ttl(TYPING_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    pub fn on_typing(&mut self, user_id: UserId, display_name: String) {
        self.on_typing_at(user_id, display_name, Instant::now());
    }

    fn on_typing_at(&mut self, user_id: UserId, display_name: String, now: Instant) {
        let expires_at = now + self.ttl;
        self.entries
            .entry(user_id)
            .and_modify(|entry| {
                entry.display_name.clone_from(&display_name);
                entry.expires_at = expires_at;
            })
            .or_insert(PresenceEntry {
                display_name,
                started_at: now,
                expires_at,
            });
    }

    pub fn on_stopped_typing(&mut self, user_id: &UserId) {
        self.entries.remove(user_id);
    }

    /// Display names of everyone currently typing, ordered by when they
    /// started. Expired entries are swept on read.
    pub fn active_typers(&mut self) -> Vec<String> {
        self.active_typers_at(Instant::now())
    }

    fn active_typers_at(&mut self, now: Instant) -> Vec<String> {
        self.entries.retain(|_, entry| entry.expires_at > now);
        let mut active: Vec<(&Instant, &String)> = self
            .entries
            .values()
            .map(|entry| (&entry.started_at, &entry.display_name))
            .collect();
        active.sort_by(|a, b| a.0.cmp(b.0).then_with(|| a.1.cmp(b.1)));
        active.into_iter().map(|(_, name)| name.clone()).collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
