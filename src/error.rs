use std::net::SocketAddr;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SwimError>;

#[derive(Debug, Error)]
pub enum SwimError {
    #[error("member not found: ts={timestamp} ip={ip}")]
    NotFound { timestamp: u64, ip: u32 },

    #[error("gossip cache is empty")]
    Empty,

    #[error("index {index} out of range (size {size})")]
    OutOfRange { index: usize, size: usize },

    #[error("malformed datagram: {0}")]
    Malformed(String),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("{addr} unreachable: {reason}")]
    Unreachable { addr: SocketAddr, reason: String },
}

impl SwimError {
    pub(crate) fn too_short(what: &str, needed: usize, remaining: usize) -> SwimError {
        SwimError::Malformed(format!("{} needs {} bytes, {} left", what, needed, remaining))
    }
}
