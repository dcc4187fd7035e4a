//! SWIM-style cluster membership: ping/ack failure detection with suspicion
//! timers, membership changes disseminated by piggybacking ttl-bounded
//! updates on probe traffic, and introducer-based bootstrap.

use std::net::SocketAddr;
use std::time::Duration;

pub mod dedup_cache;
pub mod error;
pub mod gossip_cache;
pub mod id;
pub mod membership_list;
pub mod network;
pub mod swim;
pub mod timer;
pub mod wire;

pub use error::{Result, SwimError};
pub use id::MemberId;
pub use membership_list::MembershipList;
pub use swim::MembershipService;
pub use wire::{Member, MemberState, Update, UpdateKind};

pub const DEFAULT_PORT: u16 = 6666;

#[derive(Debug, Clone)]
pub struct SwimConfig {
    /// Port every peer listens on.
    pub port: u16,
    /// Well-known bootstrap node. `None` makes this process the introducer.
    pub introducer: Option<SocketAddr>,
    /// Interval between two prober rounds. Shorter periods spread updates faster.
    pub probe_period: Duration,
    pub ping_timeout: Duration,
    /// How long a suspected member has to refute before it is removed.
    pub suspicion_timeout: Duration,
    /// Must exceed the time an update needs to reach the whole cluster.
    pub dedup_window: Duration,
    pub init_timeout: Duration,
    /// Times a new update is piggybacked by each node that holds it.
    pub gossip_ttl: u8,
    pub max_datagram_size: usize,
}

impl Default for SwimConfig {
    fn default() -> Self {
        SwimConfig {
            port: DEFAULT_PORT,
            introducer: None,
            probe_period: Duration::from_millis(500),
            ping_timeout: Duration::from_secs(1),
            suspicion_timeout: Duration::from_secs(1),
            dedup_window: Duration::from_secs(16),
            init_timeout: Duration::from_secs(2),
            gossip_ttl: 4,
            max_datagram_size: 65_507,
        }
    }
}

impl SwimConfig {
    pub fn is_introducer(&self) -> bool {
        self.introducer.is_none()
    }
}
