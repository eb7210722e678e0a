//! Online-peer tracking. The server owns the truth; this is a plain mirror
//! of its snapshot plus deltas, reset on every reconnect.

use std::collections::HashSet;

use shared::domain::UserId;

#[derive(Debug, Default)]
pub struct PresenceTracker {
    online: HashSet<UserId>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole set from a server snapshot. Deltas that raced ahead
    /// of the snapshot are discarded with it.
    pub fn reset(&mut self, online: impl IntoIterator<Item = UserId>) {
        self.online = online.into_iter().collect();
    }

    /// Apply a single delta. Returns whether the set actually changed, so
    /// callers can skip redundant repaints.
    pub fn apply(&mut self, id: UserId, online: bool) -> bool {
        if online {
            self.online.insert(id)
        } else {
            self.online.remove(&id)
        }
    }

    pub fn is_online(&self, id: &UserId) -> bool {
        self.online.contains(id)
    }

    /// Everyone drops offline when the connection does.
    pub fn clear(&mut self) {
        self.online.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deltas_are_idempotent() {
        let mut tracker = PresenceTracker::new();
        assert!(tracker.apply(UserId::from("alice"), true));
        assert!(!tracker.apply(UserId::from("alice"), true));
        assert!(tracker.is_online(&UserId::from("alice")));
        assert!(tracker.apply(UserId::from("alice"), false));
        assert!(!tracker.apply(UserId::from("alice"), false));
        assert!(!tracker.is_online(&UserId::from("alice")));
    }

    #[test]
    fn reset_replaces_prior_state() {
        let mut tracker = PresenceTracker::new();
        tracker.apply(UserId::from("alice"), true);
        tracker.reset([UserId::from("bob")]);
        assert!(!tracker.is_online(&UserId::from("alice")));
        assert!(tracker.is_online(&UserId::from("bob")));
        tracker.clear();
        assert!(!tracker.is_online(&UserId::from("bob")));
    }
}
