//! In-memory device recording everything the engine transmits

use super::NetworkDevice;
use crate::protocol::{IpCidr, MacAddr};
use crate::{Error, Result};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

pub struct RecordingDevice {
    name: String,
    mac: MacAddr,
    address: Option<IpCidr>,
    link_local: Option<Ipv6Addr>,
    frames: Mutex<Vec<Vec<u8>>>,
    datagrams: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
    refuse_datagrams: AtomicBool,
}

impl RecordingDevice {
    pub fn new(mac: MacAddr, address: Option<IpCidr>, link_local: Option<Ipv6Addr>) -> Self {
        Self {
            name: "mock0".to_string(),
            mac,
            address,
            link_local,
            frames: Mutex::new(Vec::new()),
            datagrams: Mutex::new(Vec::new()),
            refuse_datagrams: AtomicBool::new(false),
        }
    }

    /// Make every `send_datagram` fail, as on a link without an IP stack.
    pub fn refuse_datagrams(&self, refuse: bool) {
        self.refuse_datagrams.store(refuse, Ordering::Relaxed);
    }

    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn datagrams(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        self.datagrams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drain recorded frames.
    pub fn take_frames(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.frames.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn clear(&self) {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.datagrams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl NetworkDevice for RecordingDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn mac(&self) -> MacAddr {
        self.mac
    }

    fn ipv4(&self) -> Option<Ipv4Addr> {
        match self.address.map(|cidr| cidr.addr()) {
            Some(IpAddr::V4(addr)) => Some(addr),
            _ => None,
        }
    }

    fn ipv6_link_local(&self) -> Option<Ipv6Addr> {
        self.link_local
    }

    fn is_on_link(&self, addr: IpAddr) -> bool {
        match addr {
            IpAddr::V6(v6) if crate::protocol::ipv6::is_link_local(&v6) => true,
            _ => self.address.is_some_and(|cidr| cidr.contains(addr)),
        }
    }

    fn send_frame(&self, frame: &[u8]) -> Result<()> {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(frame.to_vec());
        Ok(())
    }

    fn send_datagram(&self, dst: SocketAddr, payload: &[u8]) -> Result<()> {
        if self.refuse_datagrams.load(Ordering::Relaxed) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "datagrams refused",
            )));
        }
        self.datagrams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((dst, payload.to_vec()));
        Ok(())
    }
}
