//! Presence: who is attached to a document channel right now.
//!
//! ## Architecture
//!
//! ```text
//! Session A ── track(entry) ──┐
//!                             ▼
//!                   PresenceRegistry (per topic, authoritative)
//!                             │ full state after every change
//!                             ▼
//!             PresenceSync ──► every subscriber, including A
//!                             │
//!                             ▼
//!                  others(state, me) → online users
//! ```
//!
//! Sync always carries the whole set, so a client that missed a sync heals on
//! the next one. The registry is keyed by subscriber, which lets one account
//! hold several connections; [`PresenceRegistry::state`] collapses those to a
//! single entry per `user_id`.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use crate::identity::Identity;
use crate::protocol::unix_millis;

/// One identity's membership record on a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub identity: Identity,
    /// Milliseconds since the Unix epoch when this entry was tracked.
    pub attached_at: u64,
}

impl PresenceEntry {
    /// Entry stamped with the current time.
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            attached_at: unix_millis(),
        }
    }

    pub fn user_id(&self) -> Uuid {
        self.identity.user_id
    }
}

/// Complete presence set of a channel, keyed by `user_id`.
pub type PresenceState = BTreeMap<Uuid, PresenceEntry>;

/// Authoritative presence for one topic.
///
/// Owned by whichever side hosts the topic (the in-process hub or the relay
/// server). Clients only ever see its [`state`](Self::state).
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    /// Subscriber id → tracked entry.
    entries: HashMap<Uuid, PresenceEntry>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track (or re-track) a subscriber. A second track from the same
    /// subscriber replaces the first.
    pub fn track(&mut self, subscriber: Uuid, entry: PresenceEntry) {
        self.entries.insert(subscriber, entry);
    }

    /// Remove a subscriber's entry. Returns the removed entry, if any.
    pub fn untrack(&mut self, subscriber: &Uuid) -> Option<PresenceEntry> {
        self.entries.remove(subscriber)
    }

    pub fn is_tracked(&self, subscriber: &Uuid) -> bool {
        self.entries.contains_key(subscriber)
    }

    /// Number of tracked subscribers (not users).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current set with one entry per `user_id`: the most recently tracked.
    pub fn state(&self) -> PresenceState {
        let mut state = PresenceState::new();
        for entry in self.entries.values() {
            match state.get(&entry.user_id()) {
                Some(existing) if existing.attached_at >= entry.attached_at => {}
                _ => {
                    state.insert(entry.user_id(), entry.clone());
                }
            }
        }
        state
    }
}

/// Everyone in `state` except `local_user_id`, ordered by attach time.
pub fn others(state: &PresenceState, local_user_id: Uuid) -> Vec<Identity> {
    let mut entries: Vec<&PresenceEntry> = state
        .values()
        .filter(|entry| entry.user_id() != local_user_id)
        .collect();
    entries.sort_by_key(|entry| (entry.attached_at, entry.user_id()));
    entries.into_iter().map(|entry| entry.identity.clone()).collect()
}
