//! Allow/deny/mute classification lists.
//!
//! The classification store is the fast path of the authorization pipeline:
//! a subject identity found on the allow or deny list gets its verdict
//! without a round trip to the remote policy engine, and a muted identity is
//! filtered out of the notify stream entirely. Each axis is an independent
//! [`IdentityCache`] replaced wholesale by the control surface.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::IdentityCache;

/// Tag stored for identities on the allow list.
const TAG_ALLOWED: u8 = 1;
/// Tag stored for identities on the deny list.
const TAG_DENIED: u8 = 2;
/// Tag stored for muted identities.
const TAG_MUTED: u8 = 1;

/// Fast-path verdict for a subject identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Not on any list; the pipeline must consult the remote policy engine.
    Plain,
    /// On the allow list; authorize immediately.
    Allowed,
    /// On the deny list; reject immediately.
    Denied,
}

/// Which classification list a bulk update targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListKind {
    /// Identities authorized without a policy round trip.
    Allow,
    /// Identities rejected without a policy round trip.
    Deny,
    /// Identities whose notify events are suppressed.
    Mute,
}

/// Three independent classification lists keyed by subject identity.
pub struct ClassificationStore {
    allow: IdentityCache<u64, u8>,
    deny: IdentityCache<u64, u8>,
    mute: IdentityCache<u64, u8>,
    max_list_len: usize,
}

impl ClassificationStore {
    /// Creates a store whose three lists each hold up to `capacity`
    /// identities, accepting at most `max_list_len` identities per bulk
    /// replace.
    pub fn new(capacity: usize, max_list_len: usize) -> Self {
        Self {
            allow: IdentityCache::new(capacity, 0),
            deny: IdentityCache::new(capacity, 0),
            mute: IdentityCache::new(capacity, 0),
            max_list_len,
        }
    }

    /// Classifies `identity` against the allow list first, then the deny
    /// list. Absence from both (and the null identity) is `Plain`.
    pub fn classify(&self, identity: u64) -> Classification {
        if identity == 0 {
            return Classification::Plain;
        }
        if self.allow.get(identity) != 0 {
            return Classification::Allowed;
        }
        if self.deny.get(identity) != 0 {
            return Classification::Denied;
        }
        Classification::Plain
    }

    /// Whether notify events for `identity` are suppressed.
    pub fn is_muted(&self, identity: u64) -> bool {
        self.mute.get(identity) != 0
    }

    /// Replaces the contents of one list.
    ///
    /// The target list is cleared, then each supplied identity is inserted
    /// with the list's tag. Input stops at the first null identity (callers
    /// may hand over zero-padded buffers) and is capped at the configured
    /// maximum list length.
    ///
    /// This is not atomic: a concurrent [`classify`](Self::classify) or
    /// [`is_muted`](Self::is_muted) during the replace window may observe a
    /// partially filled or empty list. Callers that need an atomic switch
    /// must double-buffer externally.
    pub fn replace(&self, kind: ListKind, identities: &[u64]) {
        let (list, tag) = match kind {
            ListKind::Allow => (&self.allow, TAG_ALLOWED),
            ListKind::Deny => (&self.deny, TAG_DENIED),
            ListKind::Mute => (&self.mute, TAG_MUTED),
        };

        list.clear();
        let mut inserted = 0_usize;
        for &identity in identities.iter().take(self.max_list_len) {
            if identity == 0 {
                break;
            }
            if list.set(identity, tag) {
                inserted += 1;
            } else {
                warn!(kind = ?kind, identity, "failed to insert list entry");
            }
        }
        debug!(kind = ?kind, inserted, "classification list replaced");
    }

    /// Number of identities currently on the given list.
    pub fn list_len(&self, kind: ListKind) -> usize {
        match kind {
            ListKind::Allow => self.allow.len(),
            ListKind::Deny => self.deny.len(),
            ListKind::Mute => self.mute.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_identities_classify_plain() {
        let store = ClassificationStore::new(16, 16);
        assert_eq!(store.classify(7), Classification::Plain);
        assert_eq!(store.classify(0), Classification::Plain);
        assert!(!store.is_muted(7));
    }

    #[test]
    fn test_allow_list_wins_over_deny_list() {
        let store = ClassificationStore::new(16, 16);
        store.replace(ListKind::Allow, &[42]);
        store.replace(ListKind::Deny, &[42, 43]);

        // The allow list is consulted first.
        assert_eq!(store.classify(42), Classification::Allowed);
        assert_eq!(store.classify(43), Classification::Denied);
    }

    #[test]
    fn test_replace_discards_previous_contents() {
        let store = ClassificationStore::new(16, 16);
        store.replace(ListKind::Deny, &[1, 2, 3]);
        assert_eq!(store.list_len(ListKind::Deny), 3);

        store.replace(ListKind::Deny, &[9]);
        assert_eq!(store.classify(1), Classification::Plain);
        assert_eq!(store.classify(9), Classification::Denied);
        assert_eq!(store.list_len(ListKind::Deny), 1);
    }

    #[test]
    fn test_replace_stops_at_null_terminator() {
        let store = ClassificationStore::new(16, 16);
        store.replace(ListKind::Mute, &[5, 6, 0, 7]);
        assert!(store.is_muted(5));
        assert!(store.is_muted(6));
        assert!(!store.is_muted(7));
    }

    #[test]
    fn test_replace_is_capped_at_max_list_len() {
        let store = ClassificationStore::new(64, 4);
        let identities: Vec<u64> = (1..=10).collect();
        store.replace(ListKind::Allow, &identities);
        assert_eq!(store.list_len(ListKind::Allow), 4);
        assert_eq!(store.classify(4), Classification::Allowed);
        assert_eq!(store.classify(5), Classification::Plain);
    }

    #[test]
    fn test_mute_list_is_independent_of_auth_lists() {
        let store = ClassificationStore::new(16, 16);
        store.replace(ListKind::Mute, &[11]);
        assert!(store.is_muted(11));
        assert_eq!(store.classify(11), Classification::Plain);
    }
}
