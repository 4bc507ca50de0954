//! Ethernet II framing

use super::{EtherType, MacAddr};
use crate::{Error, Result};

/// Header size without a VLAN tag
pub const HEADER_SIZE: usize = 14;
/// Header size with one 802.1Q tag
pub const VLAN_HEADER_SIZE: usize = 18;

/// Decoded Ethernet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthernetHeader {
    pub dst: MacAddr,
    pub src: MacAddr,
    /// Inner EtherType (after any VLAN tag)
    pub ethertype: u16,
    /// 802.1Q VLAN id, if the frame was tagged
    pub vlan_id: Option<u16>,
}

impl EthernetHeader {
    pub fn new(dst: MacAddr, src: MacAddr, ethertype: EtherType) -> Self {
        Self {
            dst,
            src,
            ethertype: ethertype as u16,
            vlan_id: None,
        }
    }

    /// Parse the header and return it with the payload offset.
    pub fn parse(buffer: &[u8]) -> Result<(Self, usize)> {
        if buffer.len() < HEADER_SIZE {
            return Err(Error::Parse("frame too short".into()));
        }

        let dst = mac_at(buffer, 0);
        let src = mac_at(buffer, 6);
        let outer = u16::from_be_bytes([buffer[12], buffer[13]]);

        if outer != EtherType::Vlan as u16 {
            let header = Self {
                dst,
                src,
                ethertype: outer,
                vlan_id: None,
            };
            return Ok((header, HEADER_SIZE));
        }

        if buffer.len() < VLAN_HEADER_SIZE {
            return Err(Error::Parse("VLAN frame too short".into()));
        }
        let tci = u16::from_be_bytes([buffer[14], buffer[15]]);
        let header = Self {
            dst,
            src,
            ethertype: u16::from_be_bytes([buffer[16], buffer[17]]),
            vlan_id: Some(tci & 0x0FFF),
        };
        Ok((header, VLAN_HEADER_SIZE))
    }

    /// Prepend this header to `payload`.
    pub fn encapsulate(&self, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(VLAN_HEADER_SIZE + payload.len());
        frame.extend_from_slice(&self.dst.0);
        frame.extend_from_slice(&self.src.0);
        if let Some(vid) = self.vlan_id {
            frame.extend_from_slice(&(EtherType::Vlan as u16).to_be_bytes());
            frame.extend_from_slice(&(vid & 0x0FFF).to_be_bytes());
        }
        frame.extend_from_slice(&self.ethertype.to_be_bytes());
        frame.extend_from_slice(payload);
        frame
    }
}

/// Overwrite the link-layer addresses of an existing frame in place.
pub fn rewrite_addresses(frame: &mut [u8], dst: MacAddr, src: MacAddr) -> Result<()> {
    if frame.len() < HEADER_SIZE {
        return Err(Error::Parse("frame too short".into()));
    }
    frame[0..6].copy_from_slice(&dst.0);
    frame[6..12].copy_from_slice(&src.0);
    Ok(())
}

pub(crate) fn mac_at(buffer: &[u8], offset: usize) -> MacAddr {
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&buffer[offset..offset + 6]);
    MacAddr(mac)
}
