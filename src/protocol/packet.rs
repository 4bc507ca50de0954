//! Owned summary of a captured frame
//!
//! Every frame is decoded once, up to the transport layer, and then shared
//! by liveness tracking, probes, impersonation and trigger classification.

use super::arp::ArpPacket;
use super::ethernet::EthernetHeader;
use super::icmp::IcmpEcho;
use super::icmpv6::{self, NeighborAdvertisement, NeighborSolicitation};
use super::ipv4::{protocol, Ipv4Header};
use super::ipv6::Ipv6Header;
use super::tcp::{TcpFlags, TcpHeader};
use super::udp::UdpHeader;
use super::{EtherType, MacAddr};
use crate::Result;
use std::net::{IpAddr, Ipv4Addr};
use std::ops::Range;

/// Network-layer addressing of an IP packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpInfo {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub protocol: u8,
}

/// Neighbor Discovery content of an ICMPv6 message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ndp {
    Solicitation(NeighborSolicitation),
    Advertisement(NeighborAdvertisement),
    RouterAdvertisement,
}

/// Transport-layer summary
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    None,
    Tcp {
        src_port: u16,
        dst_port: u16,
        flags: TcpFlags,
    },
    Udp {
        src_port: u16,
        dst_port: u16,
    },
    Icmp {
        icmp_type: u8,
    },
    Icmpv6 {
        icmp_type: u8,
        ndp: Option<Ndp>,
    },
}

#[derive(Debug, Clone)]
pub struct Packet {
    bytes: Vec<u8>,
    pub ethernet: EthernetHeader,
    pub arp: Option<ArpPacket>,
    pub ip: Option<IpInfo>,
    pub transport: Transport,
    payload: Range<usize>,
}

impl Packet {
    /// Decode a raw Ethernet frame.
    ///
    /// Only a malformed Ethernet header is an error. Unknown or truncated
    /// upper layers leave the corresponding fields empty.
    pub fn parse(bytes: Vec<u8>) -> Result<Self> {
        let (ethernet, offset) = EthernetHeader::parse(&bytes)?;
        let mut packet = Packet {
            payload: offset..bytes.len(),
            bytes: Vec::new(),
            ethernet,
            arp: None,
            ip: None,
            transport: Transport::None,
        };

        match EtherType::from_u16(ethernet.ethertype) {
            Some(EtherType::Arp) => packet.arp = ArpPacket::parse(&bytes[offset..]).ok(),
            Some(EtherType::Ipv4) => {
                if let Ok(ip) = Ipv4Header::parse(&bytes[offset..]) {
                    packet.ip = Some(IpInfo {
                        src: ip.src_addr().into(),
                        dst: ip.dst_addr().into(),
                        protocol: ip.protocol(),
                    });
                    let start = offset + ip.header_len();
                    let l4 = start..start + ip.payload().len();
                    if !ip.is_later_fragment() {
                        packet.decode_transport(&bytes, ip.protocol(), l4);
                    }
                }
            }
            Some(EtherType::Ipv6) => {
                if let Ok(ip) = Ipv6Header::parse(&bytes[offset..]) {
                    packet.ip = Some(IpInfo {
                        src: ip.src_addr().into(),
                        dst: ip.dst_addr().into(),
                        protocol: ip.next_header(),
                    });
                    let start = offset + super::ipv6::HEADER_SIZE;
                    let l4 = start..start + ip.payload().len();
                    packet.decode_transport(&bytes, ip.next_header(), l4);
                }
            }
            _ => {}
        }

        packet.bytes = bytes;
        Ok(packet)
    }

    fn decode_transport(&mut self, bytes: &[u8], proto: u8, l4: Range<usize>) {
        let segment = &bytes[l4.clone()];
        match proto {
            protocol::TCP => {
                if let Ok(tcp) = TcpHeader::parse(segment) {
                    self.transport = Transport::Tcp {
                        src_port: tcp.src_port(),
                        dst_port: tcp.dst_port(),
                        flags: tcp.flags(),
                    };
                    self.payload = l4.start + tcp.header_len()..l4.end;
                }
            }
            protocol::UDP => {
                if let Ok(udp) = UdpHeader::parse(segment) {
                    self.transport = Transport::Udp {
                        src_port: udp.src_port(),
                        dst_port: udp.dst_port(),
                    };
                    let start = l4.start + super::udp::HEADER_SIZE;
                    self.payload = start..start + udp.payload().len();
                }
            }
            protocol::ICMP => {
                if let Ok(echo) = IcmpEcho::parse(segment) {
                    self.transport = Transport::Icmp {
                        icmp_type: echo.icmp_type,
                    };
                }
            }
            protocol::ICMPV6 if !segment.is_empty() => {
                let icmp_type = segment[0];
                let ndp = match icmp_type {
                    icmpv6::NEIGHBOR_SOLICITATION => NeighborSolicitation::parse(segment)
                        .ok()
                        .map(Ndp::Solicitation),
                    icmpv6::NEIGHBOR_ADVERTISEMENT => NeighborAdvertisement::parse(segment)
                        .ok()
                        .map(Ndp::Advertisement),
                    icmpv6::ROUTER_ADVERTISEMENT => Some(Ndp::RouterAdvertisement),
                    _ => None,
                };
                self.transport = Transport::Icmpv6 { icmp_type, ndp };
            }
            _ => {}
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn src_mac(&self) -> MacAddr {
        self.ethernet.src
    }

    pub fn dst_mac(&self) -> MacAddr {
        self.ethernet.dst
    }

    pub fn src_ip(&self) -> Option<IpAddr> {
        self.ip.map(|ip| ip.src)
    }

    pub fn dst_ip(&self) -> Option<IpAddr> {
        self.ip.map(|ip| ip.dst)
    }

    /// Source protocol address, taking ARP sender addresses into account.
    pub fn source_address(&self) -> Option<IpAddr> {
        match &self.arp {
            Some(arp) if !arp.sender_ip.is_unspecified() => Some(arp.sender_ip.into()),
            Some(_) => None,
            None => self.src_ip().filter(|ip| !ip.is_unspecified()),
        }
    }

    /// Application payload of a TCP/UDP packet, the Ethernet payload otherwise.
    pub fn payload(&self) -> &[u8] {
        &self.bytes[self.payload.clone()]
    }

    pub fn ndp(&self) -> Option<&Ndp> {
        match &self.transport {
            Transport::Icmpv6 { ndp, .. } => ndp.as_ref(),
            _ => None,
        }
    }

    pub fn is_echo_request(&self) -> bool {
        matches!(
            self.transport,
            Transport::Icmp { icmp_type: 8 }
                | Transport::Icmpv6 {
                    icmp_type: icmpv6::ECHO_REQUEST,
                    ..
                }
        )
    }

    pub fn is_echo_reply(&self) -> bool {
        matches!(
            self.transport,
            Transport::Icmp { icmp_type: 0 }
                | Transport::Icmpv6 {
                    icmp_type: icmpv6::ECHO_REPLY,
                    ..
                }
        )
    }

    pub fn is_tcp_connection_request(&self) -> bool {
        matches!(self.transport, Transport::Tcp { flags, .. } if flags.is_connection_request())
    }

    pub fn dst_port(&self) -> Option<u16> {
        match self.transport {
            Transport::Tcp { dst_port, .. } | Transport::Udp { dst_port, .. } => Some(dst_port),
            _ => None,
        }
    }

    /// Unicast IP addressed to one host at both layers.
    pub fn is_ip_unicast(&self) -> bool {
        let Some(ip) = self.ip else {
            return false;
        };
        if !self.dst_mac().is_unicast() {
            return false;
        }
        match ip.dst {
            IpAddr::V4(dst) => {
                !dst.is_multicast() && !dst.is_broadcast() && dst != Ipv4Addr::UNSPECIFIED
            }
            IpAddr::V6(dst) => !dst.is_multicast() && !dst.is_unspecified(),
        }
    }
}
