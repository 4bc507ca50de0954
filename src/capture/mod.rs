//! Frame capture and transmission
//!
//! The engine only talks to a [`NetworkDevice`]; the AF_PACKET backend
//! provides the real one and [`mock::RecordingDevice`] a capturing stand-in.

mod af_packet;
pub mod mock;

pub use af_packet::AfPacketDevice;

use crate::protocol::MacAddr;
use crate::Result;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Link the proxy listens and speaks on
///
/// Sends are non-blocking and never suspend the caller, so they may be
/// issued while the network lock is held.
pub trait NetworkDevice: Send + Sync {
    fn name(&self) -> &str;

    /// Hardware address used for every frame the proxy originates.
    fn mac(&self) -> MacAddr;

    fn ipv4(&self) -> Option<Ipv4Addr>;

    /// Source for neighbor solicitations and unsolicited advertisements.
    fn ipv6_link_local(&self) -> Option<Ipv6Addr>;

    /// Whether `addr` is directly reachable on this link.
    fn is_on_link(&self, addr: IpAddr) -> bool;

    /// Transmit a complete Ethernet frame.
    fn send_frame(&self, frame: &[u8]) -> Result<()>;

    /// Transmit a UDP payload through the host stack.
    fn send_datagram(&self, dst: SocketAddr, payload: &[u8]) -> Result<()>;
}
