use std::fmt;
use std::net::Ipv4Addr;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

/// Identity of one cluster process: join timestamp plus IPv4 address.
///
/// A restarted process gets a new timestamp and therefore a new identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct MemberId {
    pub timestamp: u64,
    pub ip: u32,
}

impl MemberId {
    pub fn new(timestamp: u64, ip: u32) -> MemberId {
        return MemberId { timestamp, ip };
    }

    /// Identity for a process starting now on `ip`.
    pub fn starting_now(ip: Ipv4Addr) -> MemberId {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos() as u64)
            .unwrap_or_default();
        return MemberId::new(timestamp, u32::from(ip));
    }

    pub fn ip_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.ip)
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.timestamp, self.ip_addr())
    }
}

pub fn random_update_id() -> u64 {
    rand::thread_rng().gen()
}

pub fn random_sequence() -> u16 {
    rand::thread_rng().gen()
}

#[test]
fn display_uses_dotted_ip() {
    let id = MemberId::new(42, u32::from(Ipv4Addr::new(10, 0, 0, 7)));
    assert_eq!("42@10.0.0.7", id.to_string());
}

#[test]
fn starting_now_keeps_ip() {
    let ip = Ipv4Addr::new(192, 168, 1, 20);
    let id = MemberId::starting_now(ip);
    assert_eq!(ip, id.ip_addr());
    assert!(id.timestamp > 0);
}
