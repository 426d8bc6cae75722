//! Presence registry: who is around, and who is still active.
//!
//! Entries are upserted from inbound presence messages and never removed on
//! their own. Liveness is computed on read: a collaborator is active while
//! `now - last_active < window`. Stale entries stay in the map until a fresh
//! message overwrites them, unless the caller opts into
//! [`PresenceRegistry::evict_older_than`].
//!
//! All timestamps are wall-clock milliseconds since the Unix epoch.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::protocol::{Permission, PresenceUpdate};

/// Default staleness window: five minutes.
pub const DEFAULT_ACTIVE_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A known remote collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collaborator {
    pub user_id: String,
    pub user_name: String,
    pub permission: Permission,
    pub last_active: u64,
}

impl Collaborator {
    /// Whether this collaborator counts as active at `now`.
    pub fn is_active(&self, now: u64, window: Duration) -> bool {
        // A timestamp from the future (clock skew) counts as just seen.
        u128::from(now.saturating_sub(self.last_active)) < window.as_millis()
    }
}

/// Every collaborator seen this session, keyed by user id.
#[derive(Debug, Default, Clone)]
pub struct PresenceRegistry {
    collaborators: BTreeMap<String, Collaborator>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a collaborator.
    ///
    /// `last_active` is the message timestamp, or `received_at` if the
    /// message carries none.
    pub fn upsert(&mut self, update: PresenceUpdate, received_at: u64) -> &Collaborator {
        let last_active = update.timestamp.unwrap_or(received_at);
        let collaborator = Collaborator {
            user_id: update.user_id.clone(),
            user_name: update.user_name,
            permission: update.permission,
            last_active,
        };
        log::trace!("Presence from {} at {last_active}", collaborator.user_id);

        match self.collaborators.entry(update.user_id) {
            Entry::Occupied(mut slot) => {
                slot.insert(collaborator);
                slot.into_mut()
            }
            Entry::Vacant(slot) => slot.insert(collaborator),
        }
    }

    /// Refresh `last_active` for a known collaborator. Unknown ids are ignored.
    ///
    /// Never moves `last_active` backwards.
    pub fn touch(&mut self, user_id: &str, at: u64) -> bool {
        match self.collaborators.get_mut(user_id) {
            Some(collaborator) => {
                collaborator.last_active = collaborator.last_active.max(at);
                true
            }
            None => false,
        }
    }

    /// Collaborators active at `now`, ordered by user id.
    pub fn active_collaborators(&self, now: u64, window: Duration) -> Vec<&Collaborator> {
        self.collaborators
            .values()
            .filter(|c| c.is_active(now, window))
            .collect()
    }

    pub fn is_active(&self, user_id: &str, now: u64, window: Duration) -> bool {
        self.collaborators
            .get(user_id)
            .is_some_and(|c| c.is_active(now, window))
    }

    pub fn get(&self, user_id: &str) -> Option<&Collaborator> {
        self.collaborators.get(user_id)
    }

    /// Every collaborator ever seen, active or not.
    pub fn all(&self) -> impl Iterator<Item = &Collaborator> {
        self.collaborators.values()
    }

    pub fn len(&self) -> usize {
        self.collaborators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collaborators.is_empty()
    }

    /// Drop entries whose `last_active` is `horizon` or more in the past.
    ///
    /// Returns the evicted user ids.
    pub fn evict_older_than(&mut self, now: u64, horizon: Duration) -> Vec<String> {
        let evicted: Vec<String> = self
            .collaborators
            .values()
            .filter(|c| !c.is_active(now, horizon))
            .map(|c| c.user_id.clone())
            .collect();

        for id in &evicted {
            self.collaborators.remove(id);
        }
        if !evicted.is_empty() {
            log::debug!("Evicted {} stale collaborators", evicted.len());
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: u64 = 60_000;

    fn update(user: &str, timestamp: Option<u64>) -> PresenceUpdate {
        PresenceUpdate {
            user_id: user.into(),
            user_name: format!("{user}-name"),
            permission: Permission::Editor,
            timestamp,
        }
    }

    fn ids(list: Vec<&Collaborator>) -> Vec<&str> {
        list.into_iter().map(|c| c.user_id.as_str()).collect()
    }

    #[test]
    fn test_upsert_uses_message_timestamp() {
        let mut registry = PresenceRegistry::new();
        let c = registry.upsert(update("alice", Some(1_000)), 9_999);
        assert_eq!(c.last_active, 1_000);
    }

    #[test]
    fn test_upsert_falls_back_to_receipt_time() {
        let mut registry = PresenceRegistry::new();
        let c = registry.upsert(update("alice", None), 9_999);
        assert_eq!(c.last_active, 9_999);
    }

    #[test]
    fn test_upsert_overwrites() {
        let mut registry = PresenceRegistry::new();
        registry.upsert(update("alice", Some(1_000)), 0);

        let mut renamed = update("alice", Some(2_000));
        renamed.user_name = "Alice Liddell".into();
        renamed.permission = Permission::Viewer;
        registry.upsert(renamed, 0);

        assert_eq!(registry.len(), 1);
        let alice = registry.get("alice").unwrap();
        assert_eq!(alice.user_name, "Alice Liddell");
        assert_eq!(alice.permission, Permission::Viewer);
        assert_eq!(alice.last_active, 2_000);
    }

    #[test]
    fn test_last_write_wins_even_if_older() {
        let mut registry = PresenceRegistry::new();
        registry.upsert(update("alice", Some(5_000)), 0);
        registry.upsert(update("alice", Some(1_000)), 0);
        assert_eq!(registry.get("alice").unwrap().last_active, 1_000);
    }

    #[test]
    fn test_active_window_boundary() {
        let now = 100 * MINUTE;
        let mut registry = PresenceRegistry::new();
        registry.upsert(update("fresh", Some(now - MINUTE)), 0);
        registry.upsert(update("edge", Some(now - 5 * MINUTE)), 0);
        registry.upsert(update("almost", Some(now - 5 * MINUTE + 1)), 0);
        registry.upsert(update("stale", Some(now - 6 * MINUTE)), 0);

        let active = registry.active_collaborators(now, DEFAULT_ACTIVE_WINDOW);
        assert_eq!(ids(active), vec!["almost", "fresh"]);
        // Stale entries are still retained.
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn test_active_independent_of_upsert_order() {
        let now = 50 * MINUTE;
        let updates = vec![
            update("c", Some(now - 10 * MINUTE)),
            update("a", Some(now - MINUTE)),
            update("b", Some(now)),
            update("d", Some(now - 4 * MINUTE)),
        ];

        let mut forward = PresenceRegistry::new();
        for u in updates.iter().cloned() {
            forward.upsert(u, 0);
        }
        let mut reverse = PresenceRegistry::new();
        for u in updates.into_iter().rev() {
            reverse.upsert(u, 0);
        }

        let expected = vec!["a", "b", "d"];
        assert_eq!(ids(forward.active_collaborators(now, DEFAULT_ACTIVE_WINDOW)), expected);
        assert_eq!(ids(reverse.active_collaborators(now, DEFAULT_ACTIVE_WINDOW)), expected);
    }

    #[test]
    fn test_future_timestamp_counts_as_active() {
        let mut registry = PresenceRegistry::new();
        registry.upsert(update("skewed", Some(10_000)), 0);
        assert!(registry.is_active("skewed", 5_000, DEFAULT_ACTIVE_WINDOW));
    }

    #[test]
    fn test_stale_entry_revived_by_fresh_message() {
        let now = 100 * MINUTE;
        let mut registry = PresenceRegistry::new();
        registry.upsert(update("bob", Some(now - 30 * MINUTE)), 0);
        assert!(!registry.is_active("bob", now, DEFAULT_ACTIVE_WINDOW));

        registry.upsert(update("bob", None), now);
        assert!(registry.is_active("bob", now, DEFAULT_ACTIVE_WINDOW));
    }

    #[test]
    fn test_touch() {
        let mut registry = PresenceRegistry::new();
        registry.upsert(update("alice", Some(1_000)), 0);

        assert!(registry.touch("alice", 3_000));
        assert_eq!(registry.get("alice").unwrap().last_active, 3_000);
        assert!(registry.touch("alice", 2_000));
        assert_eq!(registry.get("alice").unwrap().last_active, 3_000);

        assert!(!registry.touch("nobody", 3_000));
        assert!(registry.get("nobody").is_none());
    }

    #[test]
    fn test_evict_older_than() {
        let now = 100 * MINUTE;
        let mut registry = PresenceRegistry::new();
        registry.upsert(update("old", Some(now - 60 * MINUTE)), 0);
        registry.upsert(update("idle", Some(now - 10 * MINUTE)), 0);
        registry.upsert(update("live", Some(now)), 0);

        let evicted = registry.evict_older_than(now, Duration::from_secs(30 * 60));
        assert_eq!(evicted, vec!["old".to_string()]);
        assert_eq!(registry.len(), 2);
        assert!(registry.get("idle").is_some());
    }

    #[test]
    fn test_now_millis_is_recent() {
        // 2020-01-01T00:00:00Z
        assert!(now_millis() > 1_577_836_800_000);
    }
}
