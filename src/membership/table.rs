// Membership Table
//
// The authoritative local map from member identity to (status, incarnation),
// with the SWIM conflict-resolution rules:
//
// 1. A higher incarnation always wins.
// 2. A lower incarnation is always rejected.
// 3. At equal incarnation the higher-severity status wins.
//
// Three auxiliary index sets (alive, suspect, dead) exactly partition the
// keyspace at all times so random selection never scans the full map. The
// owner serializes access; every method runs under the engine's single
// critical section.

use rand::seq::{IndexedRandom, SliceRandom};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use super::{Incarnation, Member, MemberId, MemberStatus};

/// An observable change committed by the table.
///
/// Pure incarnation bumps with no status change produce no `Change`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// A fresh MemberId entered the table
    Joined(Member),

    /// An existing member's status changed; carries the prior status
    StatusChanged(Member, MemberStatus),
}

#[derive(Debug, Clone)]
struct MemberRecord {
    member: Member,

    /// When the member transitioned to Dead, for retention-based GC
    dead_at: Option<Instant>,
}

#[derive(Debug, Default)]
pub struct MembershipTable {
    records: HashMap<MemberId, MemberRecord>,
    alive: HashSet<MemberId>,
    suspect: HashSet<MemberId>,
    dead: HashSet<MemberId>,

    // Shuffled probe order; rebuilt from alive + suspect when exhausted
    probe_order: Vec<MemberId>,
    probe_cursor: usize,
}

impl MembershipTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an incoming record under the conflict-resolution rules.
    pub fn upsert(&mut self, incoming: Member) -> Option<Change> {
        let Some(existing) = self.records.get(&incoming.id) else {
            let id = incoming.id.clone();
            self.records.insert(
                id.clone(),
                MemberRecord {
                    dead_at: (incoming.status == MemberStatus::Dead).then(Instant::now),
                    member: incoming.clone(),
                },
            );
            self.index_for(incoming.status).insert(id.clone());
            self.insert_probe_slot(id);
            return Some(Change::Joined(incoming));
        };

        let current = &existing.member;
        let accept = incoming.incarnation > current.incarnation
            || (incoming.incarnation == current.incarnation
                && incoming.status > current.status);
        if !accept {
            return None;
        }
        let prior = current.status;
        self.commit(incoming, prior)
    }

    pub fn get(&self, id: &MemberId) -> Option<&Member> {
        self.records.get(id).map(|record| &record.member)
    }

    pub fn contains(&self, id: &MemberId) -> bool {
        self.records.contains_key(id)
    }

    /// Begin suspecting a member. Succeeds only when the record is Alive at
    /// exactly the observed incarnation.
    pub fn mark_suspect(
        &mut self,
        id: &MemberId,
        incarnation_observed: Incarnation,
    ) -> Option<Change> {
        let record = self.records.get(id)?;
        if record.member.status != MemberStatus::Alive
            || record.member.incarnation != incarnation_observed
        {
            return None;
        }
        self.commit(
            Member::new(id.clone(), MemberStatus::Suspect, incarnation_observed),
            MemberStatus::Alive,
        )
    }

    /// Declare a member dead. Succeeds when the stored incarnation does not
    /// exceed the observed one and the member is not already dead; the
    /// stored incarnation takes the observed value.
    pub fn mark_dead(
        &mut self,
        id: &MemberId,
        incarnation_observed: Incarnation,
    ) -> Option<Change> {
        let record = self.records.get(id)?;
        if record.member.status == MemberStatus::Dead
            || record.member.incarnation > incarnation_observed
        {
            return None;
        }
        let prior = record.member.status;
        self.commit(
            Member::new(id.clone(), MemberStatus::Dead, incarnation_observed),
            prior,
        )
    }

    /// Apply a refutation: bring a member back alive under a strictly higher
    /// incarnation. The incarnation always advances on success; a `Change`
    /// is returned only when the status actually flipped.
    pub fn mark_alive(
        &mut self,
        id: &MemberId,
        incarnation_new: Incarnation,
    ) -> Option<Change> {
        let record = self.records.get(id)?;
        if incarnation_new <= record.member.incarnation {
            return None;
        }
        let prior = record.member.status;
        self.commit(
            Member::new(id.clone(), MemberStatus::Alive, incarnation_new),
            prior,
        )
    }

    pub fn remove(&mut self, id: &MemberId) {
        if let Some(record) = self.records.remove(id) {
            self.index_for(record.member.status).remove(id);
            // stale probe_order slots are skipped lazily
        }
    }

    /// Up to `k` distinct random alive members, minus the exclusions.
    pub fn random_alive(&self, k: usize, excluding: &[MemberId]) -> Vec<Member> {
        let candidates: Vec<&MemberId> = self
            .alive
            .iter()
            .filter(|id| !excluding.contains(*id))
            .collect();
        let mut rng = rand::rng();
        candidates
            .choose_multiple(&mut rng, k)
            .filter_map(|id| self.records.get(*id))
            .map(|record| record.member.clone())
            .collect()
    }

    /// One random probable (alive or suspect) member, minus the exclusions.
    pub fn random_probable(&self, excluding: &[MemberId]) -> Option<Member> {
        let candidates: Vec<&MemberId> = self
            .alive
            .iter()
            .chain(self.suspect.iter())
            .filter(|id| !excluding.contains(*id))
            .collect();
        let mut rng = rand::rng();
        candidates
            .choose(&mut rng)
            .and_then(|id| self.records.get(*id))
            .map(|record| record.member.clone())
    }

    /// Next probe target in shuffled round-robin order over the probable
    /// members. Each member is visited once per round; the order reshuffles
    /// when the round is exhausted.
    pub fn next_round_robin(&mut self, excluding: &MemberId) -> Option<Member> {
        if self.alive.len() + self.suspect.len() == 0 {
            return None;
        }
        let mut attempts = 0;
        let max_attempts = self.records.len() + self.probe_order.len() + 2;
        while attempts < max_attempts {
            if self.probe_cursor >= self.probe_order.len() {
                self.rebuild_probe_order();
                if self.probe_order.is_empty() {
                    return None;
                }
            }
            let id = self.probe_order[self.probe_cursor].clone();
            self.probe_cursor += 1;
            attempts += 1;
            if &id == excluding {
                continue;
            }
            if let Some(record) = self.records.get(&id) {
                if record.member.is_probable() {
                    return Some(record.member.clone());
                }
            }
        }
        None
    }

    /// Drop Dead members whose retention has elapsed. Returns the removed ids.
    pub fn gc_dead(&mut self, retention: Duration) -> Vec<MemberId> {
        let expired: Vec<MemberId> = self
            .dead
            .iter()
            .filter(|id| {
                self.records
                    .get(*id)
                    .and_then(|record| record.dead_at)
                    .map(|at| at.elapsed() >= retention)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        for id in &expired {
            self.remove(id);
        }
        expired
    }

    pub fn members(&self) -> Vec<Member> {
        self.records
            .values()
            .map(|record| record.member.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn alive_count(&self) -> usize {
        self.alive.len()
    }

    pub fn suspect_count(&self) -> usize {
        self.suspect.len()
    }

    pub fn dead_count(&self) -> usize {
        self.dead.len()
    }

    /// Store `next` over the existing record, maintaining the index
    /// partition. `prior` is the status before the write.
    fn commit(&mut self, next: Member, prior: MemberStatus) -> Option<Change> {
        let record = self
            .records
            .get_mut(&next.id)
            .expect("commit requires an existing record");
        record.member.incarnation = next.incarnation;
        record.member.status = next.status;
        record.dead_at = (next.status == MemberStatus::Dead).then(Instant::now);

        if next.status == prior {
            return None;
        }
        let id = next.id.clone();
        self.index_for(prior).remove(&id);
        self.index_for(next.status).insert(id);
        Some(Change::StatusChanged(next, prior))
    }

    fn index_for(&mut self, status: MemberStatus) -> &mut HashSet<MemberId> {
        match status {
            MemberStatus::Alive => &mut self.alive,
            MemberStatus::Suspect => &mut self.suspect,
            MemberStatus::Dead => &mut self.dead,
        }
    }

    fn rebuild_probe_order(&mut self) {
        self.probe_order = self.alive.union(&self.suspect).cloned().collect();
        self.probe_order.shuffle(&mut rand::rng());
        self.probe_cursor = 0;
    }

    // New members enter the current round at a random remaining position so
    // a joiner is probed within one round of arriving.
    fn insert_probe_slot(&mut self, id: MemberId) {
        let lo = self.probe_cursor.min(self.probe_order.len());
        let at = rand::rng().random_range(lo..=self.probe_order.len());
        self.probe_order.insert(at, id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member_id(n: usize) -> MemberId {
        MemberId::new(format!("node{}", n), format!("127.0.0.1:{}", 7000 + n))
    }

    fn assert_partition(table: &MembershipTable) {
        assert_eq!(
            table.alive.len() + table.suspect.len() + table.dead.len(),
            table.records.len()
        );
        for (id, record) in &table.records {
            let index = match record.member.status {
                MemberStatus::Alive => &table.alive,
                MemberStatus::Suspect => &table.suspect,
                MemberStatus::Dead => &table.dead,
            };
            assert!(index.contains(id), "index missing {}", id);
        }
    }

    #[test]
    fn test_upsert_fresh_member_joins() {
        let mut table = MembershipTable::new();
        let member = Member::alive(member_id(1));

        let change = table.upsert(member.clone());
        assert_eq!(change, Some(Change::Joined(member.clone())));
        assert_eq!(table.get(&member.id), Some(&member));
        assert_partition(&table);
    }

    #[test]
    fn test_higher_incarnation_always_wins() {
        let mut table = MembershipTable::new();
        let id = member_id(1);
        table.upsert(Member::new(id.clone(), MemberStatus::Dead, 3));

        let change = table.upsert(Member::new(id.clone(), MemberStatus::Alive, 4));
        assert_eq!(
            change,
            Some(Change::StatusChanged(
                Member::new(id.clone(), MemberStatus::Alive, 4),
                MemberStatus::Dead,
            ))
        );
        assert_partition(&table);
    }

    #[test]
    fn test_lower_incarnation_always_rejected() {
        let mut table = MembershipTable::new();
        let id = member_id(1);
        table.upsert(Member::new(id.clone(), MemberStatus::Alive, 5));

        assert_eq!(table.upsert(Member::new(id.clone(), MemberStatus::Dead, 4)), None);
        assert_eq!(table.get(&id).unwrap().incarnation, 5);
        assert_eq!(table.get(&id).unwrap().status, MemberStatus::Alive);
    }

    #[test]
    fn test_equal_incarnation_severity_wins() {
        // Spec scenario: Dead dominates Alive at the same incarnation and the
        // reverse is rejected.
        let mut table = MembershipTable::new();
        let id = member_id(1);
        table.upsert(Member::new(id.clone(), MemberStatus::Alive, 7));

        let change = table.upsert(Member::new(id.clone(), MemberStatus::Dead, 7));
        assert!(change.is_some());

        let change = table.upsert(Member::new(id.clone(), MemberStatus::Alive, 7));
        assert_eq!(change, None);
        assert_eq!(table.get(&id).unwrap().status, MemberStatus::Dead);
        assert_partition(&table);
    }

    #[test]
    fn test_upsert_order_independence() {
        let id = member_id(1);
        let updates = [
            Member::new(id.clone(), MemberStatus::Suspect, 2),
            Member::new(id.clone(), MemberStatus::Alive, 3),
            Member::new(id.clone(), MemberStatus::Dead, 2),
            Member::new(id.clone(), MemberStatus::Alive, 1),
        ];

        // The winner is (Alive, 3) no matter the delivery order; check a few
        // representative permutations.
        let orders: [[usize; 4]; 4] = [[0, 1, 2, 3], [3, 2, 1, 0], [1, 0, 3, 2], [2, 3, 0, 1]];
        for order in orders {
            let mut table = MembershipTable::new();
            for i in order {
                table.upsert(updates[i].clone());
            }
            let stored = table.get(&id).unwrap();
            assert_eq!(stored.status, MemberStatus::Alive);
            assert_eq!(stored.incarnation, 3);
            assert_partition(&table);
        }
    }

    #[test]
    fn test_pure_incarnation_bump_returns_no_change() {
        let mut table = MembershipTable::new();
        let id = member_id(1);
        table.upsert(Member::new(id.clone(), MemberStatus::Alive, 1));

        let change = table.upsert(Member::new(id.clone(), MemberStatus::Alive, 2));
        assert_eq!(change, None);
        assert_eq!(table.get(&id).unwrap().incarnation, 2);
    }

    #[test]
    fn test_mark_suspect_requires_alive_at_observed_incarnation() {
        let mut table = MembershipTable::new();
        let id = member_id(1);
        table.upsert(Member::new(id.clone(), MemberStatus::Alive, 5));

        assert_eq!(table.mark_suspect(&id, 4), None);
        assert!(table.mark_suspect(&id, 5).is_some());
        // already suspect
        assert_eq!(table.mark_suspect(&id, 5), None);
        assert_partition(&table);
    }

    #[test]
    fn test_mark_dead_adopts_observed_incarnation() {
        let mut table = MembershipTable::new();
        let id = member_id(1);
        table.upsert(Member::new(id.clone(), MemberStatus::Suspect, 5));

        let change = table.mark_dead(&id, 6);
        assert_eq!(
            change,
            Some(Change::StatusChanged(
                Member::new(id.clone(), MemberStatus::Dead, 6),
                MemberStatus::Suspect,
            ))
        );
        // dead stays dead
        assert_eq!(table.mark_dead(&id, 7), None);
        // and a stale observation cannot kill a newer record
        table.upsert(Member::new(id.clone(), MemberStatus::Alive, 9));
        assert_eq!(table.mark_dead(&id, 8), None);
    }

    #[test]
    fn test_mark_alive_needs_strictly_higher_incarnation() {
        let mut table = MembershipTable::new();
        let id = member_id(1);
        table.upsert(Member::new(id.clone(), MemberStatus::Suspect, 5));

        assert_eq!(table.mark_alive(&id, 5), None);
        let change = table.mark_alive(&id, 6);
        assert!(matches!(
            change,
            Some(Change::StatusChanged(_, MemberStatus::Suspect))
        ));
        // a further bump without a status flip is silent but still applied
        assert_eq!(table.mark_alive(&id, 7), None);
        assert_eq!(table.get(&id).unwrap().incarnation, 7);
    }

    #[test]
    fn test_remove_maintains_partition() {
        let mut table = MembershipTable::new();
        for n in 0..5 {
            table.upsert(Member::alive(member_id(n)));
        }
        table.mark_suspect(&member_id(2), 0);
        table.remove(&member_id(2));
        table.remove(&member_id(4));

        assert_eq!(table.len(), 3);
        assert!(!table.contains(&member_id(2)));
        assert_partition(&table);
    }

    #[test]
    fn test_random_alive_respects_exclusions() {
        let mut table = MembershipTable::new();
        for n in 0..6 {
            table.upsert(Member::alive(member_id(n)));
        }
        table.mark_suspect(&member_id(5), 0);

        let excluded = [member_id(0), member_id(1)];
        for _ in 0..20 {
            let picked = table.random_alive(3, &excluded);
            assert_eq!(picked.len(), 3);
            for member in &picked {
                assert!(!excluded.contains(&member.id));
                assert_eq!(member.status, MemberStatus::Alive);
            }
        }
    }

    #[test]
    fn test_random_probable_includes_suspects() {
        let mut table = MembershipTable::new();
        table.upsert(Member::alive(member_id(0)));
        table.upsert(Member::alive(member_id(1)));
        table.mark_suspect(&member_id(1), 0);
        table.upsert(Member::new(member_id(2), MemberStatus::Dead, 0));

        let mut saw_suspect = false;
        for _ in 0..50 {
            let picked = table.random_probable(&[member_id(0)]).unwrap();
            assert_ne!(picked.status, MemberStatus::Dead);
            saw_suspect |= picked.id == member_id(1);
        }
        assert!(saw_suspect);
    }

    #[test]
    fn test_round_robin_visits_every_probable_member() {
        let mut table = MembershipTable::new();
        let local = member_id(0);
        for n in 0..5 {
            table.upsert(Member::alive(member_id(n)));
        }
        table.upsert(Member::new(member_id(9), MemberStatus::Dead, 0));

        let mut seen = HashSet::new();
        for _ in 0..4 {
            let target = table.next_round_robin(&local).unwrap();
            assert!(target.is_probable());
            seen.insert(target.id);
        }
        // one full round covers all four probable non-local members
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn test_round_robin_with_only_self_yields_none() {
        let mut table = MembershipTable::new();
        let local = member_id(0);
        table.upsert(Member::alive(local.clone()));

        assert_eq!(table.next_round_robin(&local), None);
    }

    #[test]
    fn test_gc_dead_after_retention() {
        let mut table = MembershipTable::new();
        table.upsert(Member::alive(member_id(0)));
        table.upsert(Member::new(member_id(1), MemberStatus::Dead, 2));

        assert!(table.gc_dead(Duration::from_secs(60)).is_empty());
        let removed = table.gc_dead(Duration::ZERO);
        assert_eq!(removed, vec![member_id(1)]);
        assert_eq!(table.len(), 1);
        assert_partition(&table);
    }

    #[test]
    fn test_incarnation_wraparound_does_not_crash() {
        let mut table = MembershipTable::new();
        let id = member_id(1);
        table.upsert(Member::new(id.clone(), MemberStatus::Alive, u64::MAX));

        // comparison stays plainly monotonic; the wrapped value loses
        let change = table.upsert(Member::new(id.clone(), MemberStatus::Suspect, 0));
        assert_eq!(change, None);
        assert_eq!(table.get(&id).unwrap().incarnation, u64::MAX);
    }
}
