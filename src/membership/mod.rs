// Cluster Membership for the SWIM Protocol
//
// This module implements the SWIM (Scalable Weakly-consistent Infection-style
// Process Group Membership) protocol for cluster membership and failure
// detection.
//
// Architecture:
// - MembershipTable: authoritative member map with incarnation-based
//   conflict resolution
// - BroadcastQueue: pending gossip updates ranked for dissemination
// - Disseminator: piggybacks updates on outgoing messages and ingests
//   received payloads (infection)
// - SuspicionTimers: cancellable suspect-to-dead deadlines
// - SwimMembership: the protocol engine driving probes, gossip, and events
//
// Reference: "SWIM: Scalable Weakly-consistent Infection-style Process Group
// Membership Protocol" (Das et al., 2002)

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::ErrorKind;

pub mod broadcast;
pub mod disseminator;
pub mod suspicion;
pub mod swim;
pub mod table;

// Re-exports for convenience
pub use broadcast::BroadcastQueue;
pub use disseminator::Disseminator;
pub use suspicion::{SuspicionExpiry, SuspicionTimers};
pub use swim::SwimMembership;
pub use table::{Change, MembershipTable};

/// Incarnation number for conflict resolution and suspicion refutation
pub type Incarnation = u64;

/// Stable identity of a cluster member.
///
/// Equality and hashing use both fields: the same logical id at a new
/// address is a different member. The address is the routing string the
/// transport understands (typically `host:port`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MemberId {
    /// Unique member identifier
    pub id: String,

    /// Network address for cluster communication
    pub address: String,
}

impl MemberId {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
        }
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.address)
    }
}

/// Member state in the cluster.
///
/// The derived ordering is the severity ordering used by conflict
/// resolution: Alive < Suspect < Dead.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum MemberStatus {
    /// Member is alive and responding
    Alive,

    /// Member is suspected of failure
    Suspect,

    /// Member has failed
    Dead,
}

impl MemberStatus {
    /// Wire code for this status.
    pub fn code(self) -> u8 {
        match self {
            MemberStatus::Alive => 0,
            MemberStatus::Suspect => 1,
            MemberStatus::Dead => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(MemberStatus::Alive),
            1 => Some(MemberStatus::Suspect),
            2 => Some(MemberStatus::Dead),
            _ => None,
        }
    }
}

impl fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberStatus::Alive => write!(f, "alive"),
            MemberStatus::Suspect => write!(f, "suspect"),
            MemberStatus::Dead => write!(f, "dead"),
        }
    }
}

/// A member as currently known: identity plus (status, incarnation).
///
/// For a given MemberId the table holds exactly one live triple. This is
/// also the unit carried in gossip payloads on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: MemberId,
    pub status: MemberStatus,
    pub incarnation: Incarnation,
}

impl Member {
    pub fn new(id: MemberId, status: MemberStatus, incarnation: Incarnation) -> Self {
        Self {
            id,
            status,
            incarnation,
        }
    }

    /// A freshly observed member: alive at incarnation zero.
    pub fn alive(id: MemberId) -> Self {
        Self::new(id, MemberStatus::Alive, 0)
    }

    /// Check if the member is a probe candidate (alive or suspect)
    pub fn is_probable(&self) -> bool {
        matches!(self.status, MemberStatus::Alive | MemberStatus::Suspect)
    }
}

/// A pending gossip update in the broadcast queue.
///
/// The transmission counter is receiver-local bookkeeping and never goes on
/// the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipUpdate {
    pub member: Member,

    /// How many times this update has been piggybacked so far
    pub transmissions: u32,
}

impl MembershipUpdate {
    pub fn new(member: Member) -> Self {
        Self {
            member,
            transmissions: 0,
        }
    }
}

/// SWIM protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwimConfig {
    /// Interval between probe rounds
    pub protocol_period: Duration,

    /// Per-probe ack timeout; reused for the indirect wait
    pub ping_timeout: Duration,

    /// Number of intermediaries asked for indirect probing
    pub indirect_probe_count: usize,

    /// Suspicion timeout = max(1, ln N) * multiplier * protocol_period
    pub suspicion_multiplier: f64,

    /// Upper bound on updates piggybacked per message
    pub max_payload_size: usize,

    /// Per-update send budget = ceil(base * ln N), at least 1
    pub base_dissemination_limit: u32,

    /// How long Dead members are retained before garbage collection;
    /// `None` disables the sweep
    pub dead_retention: Option<Duration>,

    /// Bounded event-stream capacity (lagging subscribers lose oldest)
    pub event_buffer: usize,
}

impl Default for SwimConfig {
    fn default() -> Self {
        Self {
            protocol_period: Duration::from_millis(200),
            ping_timeout: Duration::from_millis(100),
            indirect_probe_count: 3,
            suspicion_multiplier: 5.0,
            max_payload_size: 10,
            base_dissemination_limit: 3,
            dead_retention: Some(Duration::from_secs(30)),
            event_buffer: 256,
        }
    }
}

impl SwimConfig {
    /// Suspicion deadline for the current cluster size.
    pub fn suspicion_timeout(&self, member_count: usize) -> Duration {
        let scale = (member_count.max(1) as f64).ln().max(1.0);
        self.protocol_period
            .mul_f64(scale * self.suspicion_multiplier)
    }
}

/// Cluster membership events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipEvent {
    /// A member was observed for the first time
    Joined(Member),

    /// A member became suspected
    Suspected(Member),

    /// A member was declared dead
    Failed(Member),

    /// A suspected or dead member came back alive
    Recovered(Member),

    /// The local member left the cluster gracefully
    LocalLeft(MemberId),

    /// The local incarnation advanced to refute a rumor
    IncarnationIncremented(Incarnation),

    /// A coarse runtime error
    Error(ErrorKind),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_id_identity_uses_both_fields() {
        let a = MemberId::new("node1", "127.0.0.1:7000");
        let b = MemberId::new("node1", "127.0.0.1:7001");
        assert_ne!(a, b);
        assert_eq!(a, MemberId::new("node1", "127.0.0.1:7000"));
        assert_eq!(a.to_string(), "node1@127.0.0.1:7000");
    }

    #[test]
    fn test_status_severity_ordering() {
        assert!(MemberStatus::Alive < MemberStatus::Suspect);
        assert!(MemberStatus::Suspect < MemberStatus::Dead);
    }

    #[test]
    fn test_status_wire_codes() {
        for status in [MemberStatus::Alive, MemberStatus::Suspect, MemberStatus::Dead] {
            assert_eq!(MemberStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(MemberStatus::from_code(3), None);
    }

    #[test]
    fn test_fresh_member_is_probable() {
        let member = Member::alive(MemberId::new("node1", "127.0.0.1:7000"));
        assert_eq!(member.incarnation, 0);
        assert!(member.is_probable());

        let dead = Member::new(member.id.clone(), MemberStatus::Dead, 1);
        assert!(!dead.is_probable());
    }

    #[test]
    fn test_suspicion_timeout_scales_with_cluster_size() {
        let config = SwimConfig {
            protocol_period: Duration::from_millis(30),
            suspicion_multiplier: 1.0,
            ..SwimConfig::default()
        };

        // ln(2) < 1, so the floor keeps two-node clusters at one period
        assert_eq!(config.suspicion_timeout(2), Duration::from_millis(30));
        // ln(100) ~ 4.6
        assert!(config.suspicion_timeout(100) > Duration::from_millis(130));
    }

    #[test]
    fn test_config_serde_round_trip() {
        let config = SwimConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: SwimConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(back.protocol_period, config.protocol_period);
        assert_eq!(back.indirect_probe_count, config.indirect_probe_count);
        assert_eq!(back.dead_retention, config.dead_retention);
    }
}
