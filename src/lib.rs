// RustySwim - SWIM-based cluster membership and failure detection
//
// A library for maintaining an eventually-consistent view of which peers in
// a process group are alive, suspected, or dead. The protocol engine runs
// periodic probes with indirect fallback, disseminates membership updates
// by piggybacking them on probe traffic, and publishes a stream of
// membership-change events to the host application.

pub mod error;
pub mod membership;
pub mod protocol;
pub mod transport;

pub use error::{CodecError, ErrorKind, Result, SwimError, TransportError};
pub use membership::{
    Incarnation, Member, MemberId, MemberStatus, MembershipEvent, SwimConfig, SwimMembership,
};
pub use protocol::Message;
pub use transport::Transport;
