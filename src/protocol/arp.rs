//! ARP (Address Resolution Protocol) - RFC 826, RFC 5227

use super::ethernet::mac_at;
use super::MacAddr;
use crate::{Error, Result};
use std::net::Ipv4Addr;

/// ARP packet size (for Ethernet/IPv4)
pub const ARP_PACKET_SIZE: usize = 28;

/// ARP operation codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ArpOp {
    Request = 1,
    Reply = 2,
}

/// ARP packet (Ethernet/IPv4)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpPacket {
    pub operation: ArpOp,
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr,
    pub target_ip: Ipv4Addr,
}

impl ArpPacket {
    pub fn parse(buffer: &[u8]) -> Result<Self> {
        if buffer.len() < ARP_PACKET_SIZE {
            return Err(Error::Parse("ARP packet too short".into()));
        }

        // htype=1 (Ethernet), ptype=0x0800, hlen=6, plen=4
        if buffer[0..6] != [0x00, 0x01, 0x08, 0x00, 6, 4] {
            return Err(Error::Parse("ARP packet is not Ethernet/IPv4".into()));
        }

        let operation = match u16::from_be_bytes([buffer[6], buffer[7]]) {
            1 => ArpOp::Request,
            2 => ArpOp::Reply,
            other => return Err(Error::Parse(format!("invalid ARP operation {}", other))),
        };

        Ok(Self {
            operation,
            sender_mac: mac_at(buffer, 8),
            sender_ip: Ipv4Addr::new(buffer[14], buffer[15], buffer[16], buffer[17]),
            target_mac: mac_at(buffer, 18),
            target_ip: Ipv4Addr::new(buffer[24], buffer[25], buffer[26], buffer[27]),
        })
    }

    pub fn to_bytes(&self) -> [u8; ARP_PACKET_SIZE] {
        let mut buf = [0u8; ARP_PACKET_SIZE];
        buf[0..6].copy_from_slice(&[0x00, 0x01, 0x08, 0x00, 6, 4]);
        buf[6..8].copy_from_slice(&(self.operation as u16).to_be_bytes());
        buf[8..14].copy_from_slice(&self.sender_mac.0);
        buf[14..18].copy_from_slice(&self.sender_ip.octets());
        buf[18..24].copy_from_slice(&self.target_mac.0);
        buf[24..28].copy_from_slice(&self.target_ip.octets());
        buf
    }

    /// Who-has request
    pub fn request(sender_mac: MacAddr, sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Self {
        Self {
            operation: ArpOp::Request,
            sender_mac,
            sender_ip,
            target_mac: MacAddr::ZERO,
            target_ip,
        }
    }

    pub fn reply(
        sender_mac: MacAddr,
        sender_ip: Ipv4Addr,
        target_mac: MacAddr,
        target_ip: Ipv4Addr,
    ) -> Self {
        Self {
            operation: ArpOp::Reply,
            sender_mac,
            sender_ip,
            target_mac,
            target_ip,
        }
    }

    /// RFC 5227 announcement: a request claiming `ip` for `mac`.
    pub fn announcement(mac: MacAddr, ip: Ipv4Addr) -> Self {
        Self {
            operation: ArpOp::Request,
            sender_mac: mac,
            sender_ip: ip,
            target_mac: MacAddr::ZERO,
            target_ip: ip,
        }
    }

    /// Reply whose sender and target protocol addresses are equal.
    pub fn is_gratuitous(&self) -> bool {
        self.operation == ArpOp::Reply && self.sender_ip == self.target_ip
    }

    /// Request sent during address conflict detection (sender 0.0.0.0).
    pub fn is_probe(&self) -> bool {
        self.operation == ArpOp::Request && self.sender_ip.is_unspecified()
    }

    /// Request whose sender and target protocol addresses are equal.
    pub fn is_announcement(&self) -> bool {
        self.operation == ArpOp::Request && self.sender_ip == self.target_ip
    }

    /// A request that actually asks for a binding.
    pub fn is_resolution_request(&self) -> bool {
        self.operation == ArpOp::Request && !self.is_probe() && !self.is_announcement()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC_A: MacAddr = MacAddr([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
    const MAC_B: MacAddr = MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_request_bytes() {
        let mut buf = [0u8; ARP_PACKET_SIZE];
        buf[0..8].copy_from_slice(&[0x00, 0x01, 0x08, 0x00, 6, 4, 0x00, 0x01]);
        buf[8..14].copy_from_slice(&MAC_A.0);
        buf[14..18].copy_from_slice(&[192, 168, 1, 1]);
        buf[24..28].copy_from_slice(&[192, 168, 1, 2]);

        let arp = ArpPacket::parse(&buf).unwrap();
        assert_eq!(arp.operation, ArpOp::Request);
        assert_eq!(arp.sender_mac, MAC_A);
        assert_eq!(arp.sender_ip, ip("192.168.1.1"));
        assert_eq!(arp.target_mac, MacAddr::ZERO);
        assert_eq!(arp.target_ip, ip("192.168.1.2"));
    }

    #[test]
    fn test_reply_layout() {
        let reply = ArpPacket::reply(MAC_B, ip("192.168.1.2"), MAC_A, ip("192.168.1.1"));
        let bytes = reply.to_bytes();
        assert_eq!(&bytes[6..8], &[0x00, 0x02]);
        assert_eq!(&bytes[8..14], &MAC_B.0);
        assert_eq!(&bytes[24..28], &[192, 168, 1, 1]);
        assert_eq!(ArpPacket::parse(&bytes).unwrap(), reply);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(ArpPacket::parse(&[0u8; 20]).is_err());

        let mut wrong_hw = ArpPacket::request(MAC_A, ip("10.0.0.1"), ip("10.0.0.2")).to_bytes();
        wrong_hw[1] = 6;
        assert!(ArpPacket::parse(&wrong_hw).is_err());

        let mut bad_op = ArpPacket::request(MAC_A, ip("10.0.0.1"), ip("10.0.0.2")).to_bytes();
        bad_op[7] = 9;
        assert!(ArpPacket::parse(&bad_op).is_err());
    }

    #[test]
    fn test_reply_with_sender_equal_target_is_gratuitous() {
        let arp = ArpPacket::reply(MAC_A, ip("192.0.2.5"), MacAddr::BROADCAST, ip("192.0.2.5"));
        assert!(arp.is_gratuitous());
        assert!(!arp.is_announcement());
        assert!(!arp.is_probe());
    }

    #[test]
    fn test_request_with_sender_equal_target_is_announcement() {
        let arp = ArpPacket::announcement(MAC_A, ip("192.0.2.5"));
        assert!(arp.is_announcement());
        assert!(!arp.is_gratuitous());
        assert!(!arp.is_resolution_request());
    }

    #[test]
    fn test_request_from_unspecified_is_probe() {
        let arp = ArpPacket::request(MAC_A, Ipv4Addr::UNSPECIFIED, ip("192.0.2.5"));
        assert!(arp.is_probe());
        assert!(!arp.is_announcement());
        assert!(!arp.is_gratuitous());
        assert!(!arp.is_resolution_request());
    }

    #[test]
    fn test_plain_request_is_resolution() {
        let arp = ArpPacket::request(MAC_A, ip("192.0.2.1"), ip("192.0.2.5"));
        assert!(arp.is_resolution_request());
        assert!(!arp.is_gratuitous() && !arp.is_probe() && !arp.is_announcement());
    }
}
