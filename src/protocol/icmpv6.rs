//! ICMPv6 (RFC 4443) and Neighbor Discovery (RFC 4861)

use super::ipv4::{fold, protocol, sum_words};
use super::ipv6;
use super::MacAddr;
use crate::{Error, Result};
use std::net::Ipv6Addr;

pub const ECHO_REQUEST: u8 = 128;
pub const ECHO_REPLY: u8 = 129;
pub const ROUTER_ADVERTISEMENT: u8 = 134;
pub const NEIGHBOR_SOLICITATION: u8 = 135;
pub const NEIGHBOR_ADVERTISEMENT: u8 = 136;

/// NS/NA size without options: header(4) + flags/reserved(4) + target(16)
pub const NDP_MSG_SIZE: usize = 24;

const OPT_SOURCE_LINK_ADDR: u8 = 1;
const OPT_TARGET_LINK_ADDR: u8 = 2;

const FLAG_ROUTER: u8 = 0x80;
const FLAG_SOLICITED: u8 = 0x40;
const FLAG_OVERRIDE: u8 = 0x20;

/// Neighbor Solicitation message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborSolicitation {
    pub target_addr: Ipv6Addr,
    pub source_link_addr: Option<MacAddr>,
}

impl NeighborSolicitation {
    /// Parse a complete ICMPv6 message.
    pub fn parse(msg: &[u8]) -> Result<Self> {
        expect_ndp(msg, NEIGHBOR_SOLICITATION)?;
        Ok(Self {
            target_addr: target_at(msg),
            source_link_addr: link_layer_option(&msg[NDP_MSG_SIZE..], OPT_SOURCE_LINK_ADDR),
        })
    }

    /// Encode with a zero checksum; see [`set_checksum`].
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut msg = vec![0u8; NDP_MSG_SIZE];
        msg[0] = NEIGHBOR_SOLICITATION;
        msg[8..24].copy_from_slice(&self.target_addr.octets());
        if let Some(mac) = self.source_link_addr {
            push_link_layer_option(&mut msg, OPT_SOURCE_LINK_ADDR, mac);
        }
        msg
    }
}

/// Neighbor Advertisement message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborAdvertisement {
    pub router_flag: bool,
    pub solicited_flag: bool,
    pub override_flag: bool,
    pub target_addr: Ipv6Addr,
    pub target_link_addr: Option<MacAddr>,
}

impl NeighborAdvertisement {
    /// Answer to a solicitation: Solicited and Override set.
    pub fn solicited(target_addr: Ipv6Addr, link_addr: MacAddr) -> Self {
        Self {
            router_flag: false,
            solicited_flag: true,
            override_flag: true,
            target_addr,
            target_link_addr: Some(link_addr),
        }
    }

    /// Unsolicited update forcing neighbors to replace their cache entry.
    pub fn unsolicited(target_addr: Ipv6Addr, link_addr: MacAddr) -> Self {
        Self {
            solicited_flag: false,
            ..Self::solicited(target_addr, link_addr)
        }
    }

    pub fn parse(msg: &[u8]) -> Result<Self> {
        expect_ndp(msg, NEIGHBOR_ADVERTISEMENT)?;
        let flags = msg[4];
        Ok(Self {
            router_flag: flags & FLAG_ROUTER != 0,
            solicited_flag: flags & FLAG_SOLICITED != 0,
            override_flag: flags & FLAG_OVERRIDE != 0,
            target_addr: target_at(msg),
            target_link_addr: link_layer_option(&msg[NDP_MSG_SIZE..], OPT_TARGET_LINK_ADDR),
        })
    }

    /// Encode with a zero checksum; see [`set_checksum`].
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut msg = vec![0u8; NDP_MSG_SIZE];
        msg[0] = NEIGHBOR_ADVERTISEMENT;
        let mut flags = 0;
        if self.router_flag {
            flags |= FLAG_ROUTER;
        }
        if self.solicited_flag {
            flags |= FLAG_SOLICITED;
        }
        if self.override_flag {
            flags |= FLAG_OVERRIDE;
        }
        msg[4] = flags;
        msg[8..24].copy_from_slice(&self.target_addr.octets());
        if let Some(mac) = self.target_link_addr {
            push_link_layer_option(&mut msg, OPT_TARGET_LINK_ADDR, mac);
        }
        msg
    }
}

fn expect_ndp(msg: &[u8], msg_type: u8) -> Result<()> {
    if msg.len() < NDP_MSG_SIZE {
        return Err(Error::Parse("NDP message too short".into()));
    }
    if msg[0] != msg_type || msg[1] != 0 {
        return Err(Error::Parse(format!("not an NDP message of type {}", msg_type)));
    }
    Ok(())
}

fn target_at(msg: &[u8]) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&msg[8..24]);
    Ipv6Addr::from(octets)
}

fn push_link_layer_option(msg: &mut Vec<u8>, kind: u8, mac: MacAddr) {
    // Length is counted in units of 8 octets
    msg.extend_from_slice(&[kind, 1]);
    msg.extend_from_slice(&mac.0);
}

fn link_layer_option(mut options: &[u8], kind: u8) -> Option<MacAddr> {
    while options.len() >= 2 {
        let len = options[1] as usize * 8;
        if len == 0 || len > options.len() {
            return None;
        }
        if options[0] == kind && len >= 8 {
            return Some(super::ethernet::mac_at(options, 2));
        }
        options = &options[len..];
    }
    None
}

/// Sum of the IPv6 pseudo-header for an ICMPv6 message of `len` bytes.
fn pseudo_header_sum(src: &Ipv6Addr, dst: &Ipv6Addr, len: usize) -> u32 {
    let mut sum = sum_words(&src.octets(), 0);
    sum = sum_words(&dst.octets(), sum);
    let len = len as u32;
    sum = sum.wrapping_add(len >> 16).wrapping_add(len & 0xFFFF);
    sum.wrapping_add(protocol::ICMPV6 as u32)
}

/// ICMPv6 checksum, treating the message's checksum field as zero.
pub fn checksum(src: &Ipv6Addr, dst: &Ipv6Addr, msg: &[u8]) -> u16 {
    let mut sum = pseudo_header_sum(src, dst, msg.len());
    if msg.len() >= 4 {
        sum = sum_words(&msg[..2], sum);
        sum = sum_words(&msg[4..], sum);
    } else {
        sum = sum_words(msg, sum);
    }
    fold(sum)
}

pub fn set_checksum(msg: &mut [u8], src: &Ipv6Addr, dst: &Ipv6Addr) {
    let sum = checksum(src, dst, msg);
    msg[2..4].copy_from_slice(&sum.to_be_bytes());
}

pub fn validate_checksum(src: &Ipv6Addr, dst: &Ipv6Addr, msg: &[u8]) -> bool {
    fold(sum_words(msg, pseudo_header_sum(src, dst, msg.len()))) == 0
}

/// Echo request with a zero checksum; see [`set_checksum`].
pub fn echo_request(identifier: u16, sequence: u16, payload: &[u8]) -> Vec<u8> {
    let mut msg = vec![ECHO_REQUEST, 0, 0, 0];
    msg.extend_from_slice(&identifier.to_be_bytes());
    msg.extend_from_slice(&sequence.to_be_bytes());
    msg.extend_from_slice(payload);
    msg
}

/// Wrap an ICMPv6 message in an IPv6 header, filling in its checksum.
///
/// NDP requires a hop limit of 255, which is used for every message.
pub fn into_ipv6(mut msg: Vec<u8>, src: Ipv6Addr, dst: Ipv6Addr) -> Vec<u8> {
    set_checksum(&mut msg, &src, &dst);
    ipv6::build(src, dst, protocol::ICMPV6, 255, &msg)
}
