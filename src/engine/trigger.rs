//! Trigger classification
//!
//! Stateless examiners that decide whether a frame asks for a sleeping
//! watch host. They run in a fixed order and the first hit wins.

use super::host::{NetworkHost, RedirectPolicy};
use super::network::Network;
use crate::protocol::arp::ArpOp;
use crate::protocol::packet::{Ndp, Transport};
use crate::protocol::wol::MagicPacket;
use crate::protocol::{EtherType, Packet};
use std::net::IpAddr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMethod {
    MagicPacket,
    Arp,
    Ndp,
    Ip,
}

#[derive(Debug, Clone)]
pub struct Trigger {
    pub host: Arc<NetworkHost>,
    pub method: TriggerMethod,
    pub skip_filters: bool,
    /// Address the frame was aimed at, if it named one.
    pub destination: Option<IpAddr>,
}

/// Magic packet carried by `packet`, either as EtherType 0x0842 or as UDP
/// to one of `ports`.
pub fn magic_payload(packet: &Packet, ports: &[u16]) -> Option<MagicPacket> {
    let carried = match packet.transport {
        Transport::Udp { dst_port, .. } => ports.contains(&dst_port),
        _ => EtherType::from_u16(packet.ethernet.ethertype) == Some(EtherType::WakeOnLan),
    };
    if !carried {
        return None;
    }
    MagicPacket::parse(packet.payload()).ok()
}

/// Watch host announcing its own sleep: a magic packet naming the sender.
pub fn detect_unmagic(network: &Network, packet: &Packet) -> Option<Arc<NetworkHost>> {
    let magic = magic_payload(packet, &network.settings().wol_ports)?;
    if magic.target != packet.src_mac() {
        return None;
    }
    network.watch_host_by_mac(magic.target)
}

pub fn classify(network: &Network, packet: &Packet) -> Option<Trigger> {
    // Our own probes, answers and magic packets come back through capture
    if packet.src_mac() == network.device().mac() {
        return None;
    }
    examine_magic(network, packet)
        .or_else(|| examine_arp(network, packet))
        .or_else(|| examine_ndp(network, packet))
        .or_else(|| examine_ip(network, packet))
}

fn redirect_skips(host: &NetworkHost, magic: bool) -> bool {
    match host.virtual_profile().map(|v| v.redirect) {
        Some(RedirectPolicy::Always) => true,
        Some(RedirectPolicy::OnMagicPacket) => magic,
        _ => false,
    }
}

fn examine_magic(network: &Network, packet: &Packet) -> Option<Trigger> {
    let magic = magic_payload(packet, &network.settings().wol_ports)?;
    if magic.target == packet.src_mac() {
        return None;
    }
    let host = network.watch_host_by_mac(magic.target)?;
    Some(Trigger {
        skip_filters: redirect_skips(&host, true),
        host,
        method: TriggerMethod::MagicPacket,
        destination: packet.dst_ip(),
    })
}

fn examine_arp(network: &Network, packet: &Packet) -> Option<Trigger> {
    let arp = packet.arp.as_ref()?;
    if arp.operation != ArpOp::Request
        || arp.is_gratuitous()
        || arp.is_probe()
        || arp.is_announcement()
    {
        return None;
    }
    let target = IpAddr::V4(arp.target_ip);
    if network.impersonation().is_impersonated(target) {
        return None;
    }
    let host = network.watch_host_by_ip(target)?;
    if host.mac() == Some(arp.sender_mac) {
        return None;
    }
    Some(Trigger {
        skip_filters: redirect_skips(&host, false),
        host,
        method: TriggerMethod::Arp,
        destination: Some(target),
    })
}

fn examine_ndp(network: &Network, packet: &Packet) -> Option<Trigger> {
    let Some(Ndp::Solicitation(ns)) = packet.ndp() else {
        return None;
    };
    if packet.src_ip().is_none_or(|src| src.is_unspecified()) {
        return None;
    }
    let target = IpAddr::V6(ns.target_addr);
    if network.impersonation().is_impersonated(target) {
        return None;
    }
    let host = network.watch_host_by_ip(target)?;
    if host.mac() == Some(packet.src_mac()) {
        return None;
    }
    Some(Trigger {
        skip_filters: redirect_skips(&host, false),
        host,
        method: TriggerMethod::Ndp,
        destination: Some(target),
    })
}

fn examine_ip(network: &Network, packet: &Packet) -> Option<Trigger> {
    let wanted = match packet.transport {
        Transport::Tcp { .. } | Transport::Udp { .. } => true,
        _ => packet.is_echo_request(),
    };
    if !wanted {
        return None;
    }
    let destination = packet.dst_ip()?;
    let host = network.watch_host_by_ip(destination)?;
    if host.mac() == Some(packet.src_mac()) {
        return None;
    }
    Some(Trigger {
        skip_filters: redirect_skips(&host, false),
        host,
        method: TriggerMethod::Ip,
        destination: Some(destination),
    })
}
