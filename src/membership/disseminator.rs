// Gossip Disseminator
//
// Thin coordination over the broadcast queue: selects the updates to
// piggyback on each outgoing message and feeds received payloads through
// the membership table, re-queueing whatever was accepted so the infection
// keeps spreading.

use super::broadcast::BroadcastQueue;
use super::table::{Change, MembershipTable};
use super::{Member, MemberId, MembershipUpdate};

#[derive(Debug)]
pub struct Disseminator {
    queue: BroadcastQueue,

    /// Upper bound on updates per outgoing message
    max_payload: usize,

    /// Base for the log-scaled per-update send budget
    base_limit: u32,
}

impl Disseminator {
    pub fn new(max_payload: usize, base_limit: u32) -> Self {
        Self {
            queue: BroadcastQueue::new(),
            max_payload,
            base_limit,
        }
    }

    /// Queue a member record for dissemination.
    pub fn enqueue(&mut self, member: Member) {
        self.queue.push(MembershipUpdate::new(member));
    }

    /// Build the gossip payload for one outgoing message: peek the top
    /// updates, charge each one transmission, and expire entries that have
    /// used up their budget for the current cluster size.
    pub fn payload_for_message(&mut self, member_count: usize) -> Vec<Member> {
        let selected = self.queue.peek(self.max_payload);
        if selected.is_empty() {
            return Vec::new();
        }
        let ids: Vec<MemberId> = selected.iter().map(|u| u.member.id.clone()).collect();
        self.queue.increment_counters(&ids);
        let limit = self.dissemination_limit(member_count);
        self.queue.remove_expired(limit);
        selected.into_iter().map(|u| u.member).collect()
    }

    /// Apply a received payload through the table. Every accepted update is
    /// pushed back into the queue (including pure incarnation bumps, which
    /// produce no `Change` but still carry news). Returns the observable
    /// changes in payload order.
    pub fn ingest(&mut self, updates: &[Member], table: &mut MembershipTable) -> Vec<Change> {
        let mut changes = Vec::new();
        for update in updates {
            let before = table.get(&update.id).cloned();
            let change = table.upsert(update.clone());
            let accepted = before.as_ref() != table.get(&update.id);
            if accepted {
                self.queue.push(MembershipUpdate::new(update.clone()));
            }
            if let Some(change) = change {
                changes.push(change);
            }
        }
        changes
    }

    /// Per-update send budget: ceil(base * ln N), never below one so small
    /// clusters still gossip.
    pub fn dissemination_limit(&self, member_count: usize) -> u32 {
        let n = member_count.max(1) as f64;
        ((self.base_limit as f64) * n.ln()).ceil().max(1.0) as u32
    }

    pub fn queue(&self) -> &BroadcastQueue {
        &self.queue
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::MemberStatus;

    fn member(n: usize, status: MemberStatus, incarnation: u64) -> Member {
        let id = MemberId::new(format!("node{}", n), format!("127.0.0.1:{}", 7000 + n));
        Member::new(id, status, incarnation)
    }

    #[test]
    fn test_payload_respects_budget() {
        let mut gossip = Disseminator::new(2, 3);
        for n in 0..5 {
            gossip.enqueue(member(n, MemberStatus::Alive, 0));
        }

        let payload = gossip.payload_for_message(5);
        assert_eq!(payload.len(), 2);
        assert!(gossip.queue().len() >= 3);
    }

    #[test]
    fn test_empty_queue_yields_empty_payload() {
        let mut gossip = Disseminator::new(10, 3);
        assert!(gossip.payload_for_message(4).is_empty());
    }

    #[test]
    fn test_updates_expire_after_limit_transmissions() {
        let mut gossip = Disseminator::new(10, 3);
        gossip.enqueue(member(1, MemberStatus::Suspect, 2));

        // two members: limit = ceil(3 * ln 2) = 3 sends
        let limit = gossip.dissemination_limit(2);
        assert_eq!(limit, 3);
        for _ in 0..limit {
            assert_eq!(gossip.payload_for_message(2).len(), 1);
        }
        assert!(gossip.payload_for_message(2).is_empty());
    }

    #[test]
    fn test_limit_floor_for_tiny_clusters() {
        let gossip = Disseminator::new(10, 3);
        assert_eq!(gossip.dissemination_limit(1), 1);
        assert!(gossip.dissemination_limit(10) > gossip.dissemination_limit(2));
    }

    #[test]
    fn test_ingest_requeues_accepted_updates() {
        let mut gossip = Disseminator::new(10, 3);
        let mut table = MembershipTable::new();

        let fresh = member(1, MemberStatus::Alive, 0);
        let changes = gossip.ingest(&[fresh.clone()], &mut table);
        assert_eq!(changes, vec![Change::Joined(fresh.clone())]);
        assert_eq!(gossip.queue().len(), 1);

        // a duplicate is rejected by the table and must not re-enter the queue
        gossip.clear();
        let changes = gossip.ingest(&[fresh.clone()], &mut table);
        assert!(changes.is_empty());
        assert!(gossip.queue().is_empty());
    }

    #[test]
    fn test_ingest_requeues_pure_incarnation_bumps() {
        let mut gossip = Disseminator::new(10, 3);
        let mut table = MembershipTable::new();
        table.upsert(member(1, MemberStatus::Alive, 1));

        // accepted by rule 1 but observably unchanged: no Change, yet the
        // newer incarnation still propagates
        let bumped = member(1, MemberStatus::Alive, 2);
        let changes = gossip.ingest(&[bumped.clone()], &mut table);
        assert!(changes.is_empty());
        assert_eq!(gossip.queue().get(&bumped.id).unwrap().member.incarnation, 2);
    }

    #[test]
    fn test_ingest_reports_status_changes_in_order() {
        let mut gossip = Disseminator::new(10, 3);
        let mut table = MembershipTable::new();

        let a = member(1, MemberStatus::Alive, 0);
        let b = member(2, MemberStatus::Alive, 0);
        gossip.ingest(&[a.clone(), b.clone()], &mut table);

        let suspect_a = member(1, MemberStatus::Suspect, 0);
        let dead_b = member(2, MemberStatus::Dead, 0);
        let changes = gossip.ingest(&[suspect_a.clone(), dead_b.clone()], &mut table);
        assert_eq!(
            changes,
            vec![
                Change::StatusChanged(suspect_a, MemberStatus::Alive),
                Change::StatusChanged(dead_b, MemberStatus::Alive),
            ]
        );
    }
}
