//! AF_PACKET device

use super::NetworkDevice;
use crate::protocol::{IpCidr, MacAddr};
use crate::{Error, Result};
use std::ffi::CString;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};
use tokio::io::unix::AsyncFd;
use tracing::debug;

/// Raw socket bound to one interface in promiscuous mode
pub struct AfPacketDevice {
    async_fd: AsyncFd<RawFd>,
    ifindex: i32,
    name: String,
    mac: MacAddr,
    address: Option<IpCidr>,
    link_local: Option<Ipv6Addr>,
    udp4: Option<UdpSocket>,
    udp6: Option<UdpSocket>,
}

impl AfPacketDevice {
    /// Open `ifname`. Without an explicit link-local address the first
    /// link-scope address of the interface is used.
    pub fn open(ifname: &str, address: Option<IpCidr>, link_local: Option<Ipv6Addr>) -> Result<Self> {
        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW,
                (libc::ETH_P_ALL as u16).to_be() as i32,
            )
        };

        if fd < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }

        let ifindex = match Self::get_ifindex(fd, ifname) {
            Ok(ifindex) => ifindex,
            Err(e) => {
                unsafe { libc::close(fd) };
                return Err(e);
            }
        };

        let sockaddr = libc::sockaddr_ll {
            sll_family: libc::AF_PACKET as u16,
            sll_protocol: (libc::ETH_P_ALL as u16).to_be(),
            sll_ifindex: ifindex,
            sll_hatype: 0,
            sll_pkttype: 0,
            sll_halen: 0,
            sll_addr: [0; 8],
        };

        let ret = unsafe {
            libc::bind(
                fd,
                &sockaddr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as u32,
            )
        };

        if ret < 0 {
            unsafe { libc::close(fd) };
            return Err(Error::Io(std::io::Error::last_os_error()));
        }

        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };

        // Frames for sleeping hosts are not addressed to us
        if let Err(e) = Self::set_promisc(fd, ifindex, true) {
            unsafe { libc::close(fd) };
            return Err(e);
        }

        let async_fd = match AsyncFd::new(fd) {
            Ok(async_fd) => async_fd,
            Err(e) => {
                unsafe { libc::close(fd) };
                return Err(Error::Io(e));
            }
        };

        let mac = read_mac(ifname)?;
        let link_local = link_local.or_else(|| read_link_local(ifname));
        let udp4 = bind_udp(ifname, "0.0.0.0:0".parse().ok())
            .inspect_err(|e| debug!(interface = ifname, error = %e, "No IPv4 datagram socket"))
            .ok();
        let udp6 = bind_udp(ifname, "[::]:0".parse().ok())
            .inspect_err(|e| debug!(interface = ifname, error = %e, "No IPv6 datagram socket"))
            .ok();

        Ok(Self {
            async_fd,
            ifindex,
            name: ifname.to_string(),
            mac,
            address,
            link_local,
            udp4,
            udp6,
        })
    }

    fn get_ifindex(fd: RawFd, ifname: &str) -> Result<i32> {
        let ifname_c = CString::new(ifname).map_err(|_| Error::InterfaceNotFound {
            name: ifname.to_string(),
        })?;

        let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
        let name_bytes = ifname_c.as_bytes_with_nul();
        if name_bytes.len() > ifr.ifr_name.len() {
            return Err(Error::InterfaceNotFound {
                name: ifname.to_string(),
            });
        }
        for (dst, src) in ifr.ifr_name.iter_mut().zip(name_bytes) {
            *dst = *src as libc::c_char;
        }

        let ret = unsafe { libc::ioctl(fd, libc::SIOCGIFINDEX, &mut ifr) };
        if ret < 0 {
            return Err(Error::InterfaceNotFound {
                name: ifname.to_string(),
            });
        }

        Ok(unsafe { ifr.ifr_ifru.ifru_ifindex })
    }

    fn set_promisc(fd: RawFd, ifindex: i32, enable: bool) -> Result<()> {
        let mreq = libc::packet_mreq {
            mr_ifindex: ifindex,
            mr_type: libc::PACKET_MR_PROMISC as u16,
            mr_alen: 0,
            mr_address: [0; 8],
        };

        let optname = if enable {
            libc::PACKET_ADD_MEMBERSHIP
        } else {
            libc::PACKET_DROP_MEMBERSHIP
        };

        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_PACKET,
                optname,
                &mreq as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::packet_mreq>() as u32,
            )
        };

        if ret < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }

        Ok(())
    }

    /// Receive one frame, returning its length.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            let mut guard = self.async_fd.readable().await.map_err(Error::Io)?;

            match guard.try_io(|inner| {
                let fd = *inner.get_ref();
                let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut _, buf.len(), 0) };
                if n < 0 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(Ok(len)) => return Ok(len),
                Ok(Err(e)) => return Err(Error::Io(e)),
                Err(_would_block) => continue,
            }
        }
    }

    pub fn ifindex(&self) -> i32 {
        self.ifindex
    }
}

impl NetworkDevice for AfPacketDevice {
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
        let fd = *self.async_fd.get_ref();
        let n = unsafe { libc::send(fd, frame.as_ptr() as *const _, frame.len(), 0) };
        if n < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    fn send_datagram(&self, dst: SocketAddr, payload: &[u8]) -> Result<()> {
        let (socket, dst) = match dst {
            SocketAddr::V4(_) => (self.udp4.as_ref(), dst),
            SocketAddr::V6(mut v6) => {
                if crate::protocol::ipv6::is_link_local(v6.ip()) || v6.ip().is_multicast() {
                    v6.set_scope_id(self.ifindex as u32);
                }
                (self.udp6.as_ref(), SocketAddr::V6(v6))
            }
        };
        let socket = socket.ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                format!("no datagram socket for {}", dst),
            ))
        })?;
        socket.send_to(payload, dst)?;
        Ok(())
    }
}

impl AsRawFd for AfPacketDevice {
    fn as_raw_fd(&self) -> RawFd {
        *self.async_fd.get_ref()
    }
}

impl Drop for AfPacketDevice {
    fn drop(&mut self) {
        let _ = Self::set_promisc(*self.async_fd.get_ref(), self.ifindex, false);
        unsafe { libc::close(*self.async_fd.get_ref()) };
    }
}

fn read_mac(ifname: &str) -> Result<MacAddr> {
    let path = format!("/sys/class/net/{}/address", ifname);
    let text = std::fs::read_to_string(&path).map_err(|_| Error::InterfaceNotFound {
        name: ifname.to_string(),
    })?;
    text.trim()
        .parse()
        .map_err(|e| Error::Parse(format!("{}: {}", path, e)))
}

/// First link-scope address listed for `ifname` in /proc/net/if_inet6.
fn read_link_local(ifname: &str) -> Option<Ipv6Addr> {
    let text = std::fs::read_to_string("/proc/net/if_inet6").ok()?;
    parse_if_inet6(&text, ifname)
}

fn parse_if_inet6(text: &str, ifname: &str) -> Option<Ipv6Addr> {
    text.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 6 || fields[5] != ifname || fields[3] != "20" {
            return None;
        }
        u128::from_str_radix(fields[0], 16).ok().map(Ipv6Addr::from)
    })
}

fn bind_udp(ifname: &str, local: Option<SocketAddr>) -> Result<UdpSocket> {
    let local = local.ok_or_else(|| Error::Parse("bad wildcard address".into()))?;
    let socket = UdpSocket::bind(local)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;

    let name = CString::new(ifname).map_err(|_| Error::InterfaceNotFound {
        name: ifname.to_string(),
    })?;
    let bytes = name.as_bytes_with_nul();
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_BINDTODEVICE,
            bytes.as_ptr() as *const libc::c_void,
            bytes.len() as u32,
        )
    };
    if ret < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(socket)
}
