use std::io;
use std::net::IpAddr;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("topology error: {0}")]
    Topology(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("interface {name} not found")]
    InterfaceNotFound { name: String },

    #[error("cannot impersonate {addr}: {reason}")]
    ImpersonationImpossible { addr: IpAddr, reason: String },

    #[error(transparent)]
    Timeout(#[from] HostTimeout),
}

/// No watched address answered within the allotted time.
///
/// This is an expected outcome of probing a sleeping host, not a fault.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no answer from {addresses:?} within {waited:?}")]
pub struct HostTimeout {
    pub addresses: Vec<IpAddr>,
    pub waited: Duration,
}

pub type Result<T> = std::result::Result<T, Error>;
