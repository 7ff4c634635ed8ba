// Suspicion Timers
//
// A set of named cancellable deadlines that escalate a suspected member to
// dead. Each armed timer is a spawned sleep task reporting its expiry on a
// channel; the engine's dispatcher drains that channel and calls mark_dead
// under the serialisation point after `confirm` validates the expiry.
//
// A per-timer generation defeats the cancel/fire race: an expiry that was
// already in flight when its timer was cancelled or re-armed fails the
// generation check and is dropped.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{Incarnation, MemberId};

/// A fired suspicion deadline, delivered to the engine's dispatcher.
#[derive(Debug)]
pub struct SuspicionExpiry {
    pub member_id: MemberId,

    /// Incarnation the member was suspected at; mark_dead observes this
    pub incarnation: Incarnation,

    generation: u64,
}

struct TimerEntry {
    generation: u64,
    handle: JoinHandle<()>,
}

pub struct SuspicionTimers {
    timers: HashMap<MemberId, TimerEntry>,
    expired_tx: mpsc::UnboundedSender<SuspicionExpiry>,
    next_generation: u64,
}

impl SuspicionTimers {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SuspicionExpiry>) {
        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        (
            Self {
                timers: HashMap::new(),
                expired_tx,
                next_generation: 0,
            },
            expired_rx,
        )
    }

    /// Arm the deadline for a member, replacing any prior timer.
    pub fn start(&mut self, member_id: MemberId, incarnation: Incarnation, duration: Duration) {
        self.cancel(&member_id);
        self.next_generation = self.next_generation.wrapping_add(1);
        let generation = self.next_generation;

        let tx = self.expired_tx.clone();
        let expired_id = member_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = tx.send(SuspicionExpiry {
                member_id: expired_id,
                incarnation,
                generation,
            });
        });
        self.timers.insert(member_id, TimerEntry { generation, handle });
    }

    /// Disarm the timer for a member. Any expiry already in flight will fail
    /// `confirm` and never escalate.
    pub fn cancel(&mut self, member_id: &MemberId) {
        if let Some(entry) = self.timers.remove(member_id) {
            entry.handle.abort();
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, entry) in self.timers.drain() {
            entry.handle.abort();
        }
    }

    /// Validate a delivered expiry against the live timer set. Returns true
    /// (and disarms the entry) only when the timer is still the one that
    /// fired; stale generations mean the timer was cancelled or re-armed.
    pub fn confirm(&mut self, expiry: &SuspicionExpiry) -> bool {
        match self.timers.get(&expiry.member_id) {
            Some(entry) if entry.generation == expiry.generation => {
                self.timers.remove(&expiry.member_id);
                true
            }
            _ => false,
        }
    }

    pub fn is_armed(&self, member_id: &MemberId) -> bool {
        self.timers.contains_key(member_id)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}
