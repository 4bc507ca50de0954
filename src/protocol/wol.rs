//! Wake-on-LAN magic packets
//!
//! Six 0xFF bytes, the target MAC sixteen times, then an optional
//! SecureOn password of four or six bytes.

use super::MacAddr;
use crate::{Error, Result};

/// Length without password
pub const MAGIC_SIZE: usize = 6 + 16 * 6;

/// Conventional UDP ports for magic packets
pub const DEFAULT_PORTS: [u16; 2] = [7, 9];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagicPacket {
    pub target: MacAddr,
    pub password: Option<Vec<u8>>,
}

impl MagicPacket {
    pub fn new(target: MacAddr) -> Self {
        Self {
            target,
            password: None,
        }
    }

    pub fn with_password(target: MacAddr, password: Vec<u8>) -> Result<Self> {
        if password.len() != 4 && password.len() != 6 {
            return Err(Error::Config(format!(
                "magic packet password must be 4 or 6 bytes, got {}",
                password.len()
            )));
        }
        Ok(Self {
            target,
            password: Some(password),
        })
    }

    pub fn parse(buffer: &[u8]) -> Result<Self> {
        if buffer.len() < MAGIC_SIZE {
            return Err(Error::Parse("magic packet too short".into()));
        }
        if buffer[..6] != [0xff; 6] {
            return Err(Error::Parse("missing magic packet sync stream".into()));
        }

        let target = super::ethernet::mac_at(buffer, 6);
        if buffer[6..MAGIC_SIZE]
            .chunks_exact(6)
            .any(|chunk| chunk != &target.0[..])
        {
            return Err(Error::Parse("magic packet repetitions differ".into()));
        }

        let trailer = &buffer[MAGIC_SIZE..];
        let password = match trailer.len() {
            4 | 6 => Some(trailer.to_vec()),
            _ => None,
        };
        Ok(Self { target, password })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MAGIC_SIZE + 6);
        buf.extend_from_slice(&[0xff; 6]);
        for _ in 0..16 {
            buf.extend_from_slice(&self.target.0);
        }
        if let Some(password) = &self.password {
            buf.extend_from_slice(password);
        }
        buf
    }
}

/// Parse a SecureOn password written as a MAC ("aa:bb:..") or IPv4 dotted quad.
pub fn parse_password(s: &str) -> Result<Vec<u8>> {
    if let Ok(mac) = s.parse::<MacAddr>() {
        return Ok(mac.0.to_vec());
    }
    if let Ok(ip) = s.parse::<std::net::Ipv4Addr>() {
        return Ok(ip.octets().to_vec());
    }
    Err(Error::Config(format!("invalid magic packet password '{}'", s)))
}
