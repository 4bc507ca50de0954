//! Link, network and transport codecs used by the sleep proxy
//!
//! Parsers borrow the captured buffer; builders return owned frames.

pub mod arp;
pub mod ethernet;
pub mod icmp;
pub mod icmpv6;
pub mod ipv4;
pub mod ipv6;
pub mod packet;
pub mod tcp;
pub mod types;
pub mod udp;
pub mod wol;

pub use packet::Packet;
pub use types::*;
