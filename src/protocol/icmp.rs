//! ICMP (RFC 792) echo messages

use super::ipv4::checksum;
use crate::{Error, Result};

/// ICMP header size for echo messages
pub const ECHO_HEADER_SIZE: usize = 8;

pub const ECHO_REPLY: u8 = 0;
pub const ECHO_REQUEST: u8 = 8;

/// Echo request/reply header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpEcho {
    pub icmp_type: u8,
    pub code: u8,
    pub identifier: u16,
    pub sequence: u16,
}

impl IcmpEcho {
    /// Parse the first eight bytes of any ICMP message.
    pub fn parse(buffer: &[u8]) -> Result<Self> {
        if buffer.len() < ECHO_HEADER_SIZE {
            return Err(Error::Parse("ICMP message too short".into()));
        }
        Ok(Self {
            icmp_type: buffer[0],
            code: buffer[1],
            identifier: u16::from_be_bytes([buffer[4], buffer[5]]),
            sequence: u16::from_be_bytes([buffer[6], buffer[7]]),
        })
    }

    pub fn is_request(&self) -> bool {
        self.icmp_type == ECHO_REQUEST
    }

    pub fn is_reply(&self) -> bool {
        self.icmp_type == ECHO_REPLY
    }
}

/// Build an ICMPv4 echo request with checksum.
pub fn echo_request(identifier: u16, sequence: u16, payload: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(ECHO_HEADER_SIZE + payload.len());
    msg.extend_from_slice(&[ECHO_REQUEST, 0, 0, 0]);
    msg.extend_from_slice(&identifier.to_be_bytes());
    msg.extend_from_slice(&sequence.to_be_bytes());
    msg.extend_from_slice(payload);

    let sum = checksum(&msg);
    msg[2..4].copy_from_slice(&sum.to_be_bytes());
    msg
}
