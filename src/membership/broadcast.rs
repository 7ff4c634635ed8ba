// Broadcast Queue
//
// Holds at most one pending gossip update per member, ranked for
// dissemination. Keying the map by MemberId makes the no-duplicates
// invariant structural; ordering is computed at peek time since the queue
// is bounded by the member count.
//
// Priority, descending:
// 1. higher status severity (deaths travel first)
// 2. lower transmission counter (newer rumors first)
// 3. higher incarnation

use std::cmp::Ordering;
use std::collections::HashMap;

use super::{MemberId, MembershipUpdate};

#[derive(Debug, Default)]
pub struct BroadcastQueue {
    entries: HashMap<MemberId, MembershipUpdate>,
}

impl BroadcastQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an update, or replace the existing entry for the same member
    /// when the incoming one dominates: strictly higher incarnation, or
    /// higher severity at equal incarnation.
    pub fn push(&mut self, update: MembershipUpdate) {
        match self.entries.get(&update.member.id) {
            None => {
                self.entries.insert(update.member.id.clone(), update);
            }
            Some(current) => {
                let dominates = update.member.incarnation > current.member.incarnation
                    || (update.member.incarnation == current.member.incarnation
                        && update.member.status > current.member.status);
                if dominates {
                    self.entries.insert(update.member.id.clone(), update);
                }
            }
        }
    }

    /// Up to `k` updates in priority order, without mutation.
    pub fn peek(&self, k: usize) -> Vec<MembershipUpdate> {
        let mut ranked: Vec<&MembershipUpdate> = self.entries.values().collect();
        ranked.sort_by(|a, b| Self::priority(a, b));
        ranked.into_iter().take(k).cloned().collect()
    }

    /// Bump the transmission counter on each named entry.
    pub fn increment_counters(&mut self, ids: &[MemberId]) {
        for id in ids {
            if let Some(entry) = self.entries.get_mut(id) {
                entry.transmissions = entry.transmissions.saturating_add(1);
            }
        }
    }

    /// Drop every entry whose counter has reached the dissemination limit.
    pub fn remove_expired(&mut self, limit: u32) {
        self.entries.retain(|_, entry| entry.transmissions < limit);
    }

    pub fn remove(&mut self, id: &MemberId) {
        self.entries.remove(id);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn get(&self, id: &MemberId) -> Option<&MembershipUpdate> {
        self.entries.get(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn priority(a: &MembershipUpdate, b: &MembershipUpdate) -> Ordering {
        b.member
            .status
            .cmp(&a.member.status)
            .then(a.transmissions.cmp(&b.transmissions))
            .then(b.member.incarnation.cmp(&a.member.incarnation))
            // deterministic tiebreak for stable payloads
            .then(a.member.id.cmp(&b.member.id))
    }
}
