//! Reachability probes
//!
//! A test registers its addresses before anything is transmitted, then waits
//! on a single-slot channel. Captured frames are pushed through
//! [`ReachabilityProbe::observe`]; the first frame sourced from a watched
//! address fills the slot.

use super::host::{HostEvent, NetworkHost, PingMethod};
use super::lock;
use crate::capture::NetworkDevice;
use crate::error::HostTimeout;
use crate::protocol::arp::ArpPacket;
use crate::protocol::ethernet::EthernetHeader;
use crate::protocol::icmpv6::{self, NeighborSolicitation};
use crate::protocol::packet::Ndp;
use crate::protocol::{icmp, ipv4, ipv6, EtherType, MacAddr, Packet};
use crate::telemetry::EngineStats;
use crate::Result;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, trace, warn};

/// Floor on a single polling attempt.
pub const MIN_ATTEMPT: Duration = Duration::from_millis(100);

struct Waiter {
    addresses: HashSet<IpAddr>,
    signal: mpsc::Sender<()>,
}

struct Registry {
    device: Arc<dyn NetworkDevice>,
    stats: Arc<EngineStats>,
    waiters: Mutex<HashMap<u64, Waiter>>,
    next_id: AtomicU64,
    sequence: AtomicU64,
}

/// Removes the test from the registry on every exit path.
struct PendingTest {
    registry: Arc<Registry>,
    id: u64,
}

impl Drop for PendingTest {
    fn drop(&mut self) {
        lock(&self.registry.waiters).remove(&self.id);
    }
}

#[derive(Clone)]
pub struct ReachabilityProbe {
    registry: Arc<Registry>,
}

impl ReachabilityProbe {
    pub fn new(device: Arc<dyn NetworkDevice>, stats: Arc<EngineStats>) -> Self {
        Self {
            registry: Arc::new(Registry {
                device,
                stats,
                waiters: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                sequence: AtomicU64::new(0),
            }),
        }
    }

    /// Probe `addresses` and wait for the first answer.
    pub async fn send(
        &self,
        addresses: &[IpAddr],
        timeout: Duration,
        use_icmp: bool,
    ) -> std::result::Result<Duration, HostTimeout> {
        if addresses.is_empty() {
            return Err(HostTimeout {
                addresses: Vec::new(),
                waited: Duration::ZERO,
            });
        }
        let start = Instant::now();
        let (pending, mut rx) = self.register(addresses);
        for ip in addresses {
            self.transmit(*ip, None, use_icmp);
        }
        self.wait(pending, &mut rx, start, timeout, addresses).await
    }

    /// Probe every address of `host`, following address changes while
    /// the test is pending.
    pub async fn send_for_host(
        &self,
        host: &NetworkHost,
        timeout: Duration,
        use_icmp: bool,
    ) -> std::result::Result<Duration, HostTimeout> {
        let start = Instant::now();
        let addresses = host.addresses();
        let (pending, mut rx) = self.register(&addresses);

        let registry = Arc::downgrade(&self.registry);
        let id = pending.id;
        let _follow = host.subscribe(move |event| {
            let Some(registry) = registry.upgrade() else {
                return;
            };
            let mut waiters = lock(&registry.waiters);
            let Some(waiter) = waiters.get_mut(&id) else {
                return;
            };
            match event {
                HostEvent::AddressAdded(ip) => {
                    waiter.addresses.insert(*ip);
                }
                HostEvent::AddressRemoved(ip) => {
                    waiter.addresses.remove(ip);
                }
                _ => {}
            }
        });

        let mac = host.mac();
        for ip in &addresses {
            self.transmit(*ip, mac, use_icmp);
        }
        self.wait(pending, &mut rx, start, timeout, &addresses)
            .await
            .inspect_err(|_| debug!(host = host.name(), ?timeout, "Host did not answer"))
    }

    /// Whether `host` is awake, trusting recent traffic before probing.
    pub async fn test(&self, host: &NetworkHost) -> bool {
        let ping = host.watch().map(|w| w.ping.clone()).unwrap_or_default();
        if host.seen_within(ping.timeout) {
            trace!(host = host.name(), "Seen recently, probe skipped");
            return true;
        }
        self.send_for_host(host, ping.timeout, ping.use_icmp)
            .await
            .is_ok()
    }

    /// Re-probe `host` once per ping timeout until it answers or `total`
    /// has passed. Latency is measured from the first probe. Attempts never
    /// run shorter than [`MIN_ATTEMPT`] except for the last one.
    pub async fn poll(
        &self,
        host: &NetworkHost,
        total: Duration,
    ) -> std::result::Result<Duration, HostTimeout> {
        let PingMethod { timeout, use_icmp } = host.watch().map(|w| w.ping.clone()).unwrap_or_default();
        let start = Instant::now();
        let deadline = start + total;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(HostTimeout {
                    addresses: host.addresses(),
                    waited: total,
                });
            }
            let attempt = timeout.max(MIN_ATTEMPT).min(deadline - now);
            if self.send_for_host(host, attempt, use_icmp).await.is_ok() {
                return Ok(start.elapsed());
            }
        }
    }

    /// Feed a captured frame to pending tests.
    pub fn observe(&self, packet: &Packet) {
        if packet.src_mac() == self.registry.device.mac() {
            return;
        }
        if let Some(ip) = packet.source_address() {
            self.answered(ip);
        }
        if let Some(Ndp::Advertisement(na)) = packet.ndp() {
            self.answered(IpAddr::V6(na.target_addr));
        }
    }

    fn answered(&self, ip: IpAddr) {
        let waiters = lock(&self.registry.waiters);
        for waiter in waiters.values() {
            if waiter.addresses.contains(&ip) {
                // A full slot already carries the answer
                let _ = waiter.signal.try_send(());
            }
        }
    }

    pub fn pending(&self) -> usize {
        lock(&self.registry.waiters).len()
    }

    fn register(&self, addresses: &[IpAddr]) -> (PendingTest, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.registry.waiters).insert(
            id,
            Waiter {
                addresses: addresses.iter().copied().collect(),
                signal: tx,
            },
        );
        (
            PendingTest {
                registry: Arc::clone(&self.registry),
                id,
            },
            rx,
        )
    }

    async fn wait(
        &self,
        pending: PendingTest,
        rx: &mut mpsc::Receiver<()>,
        start: Instant,
        timeout: Duration,
        addresses: &[IpAddr],
    ) -> std::result::Result<Duration, HostTimeout> {
        let outcome = time::timeout(timeout, rx.recv()).await;
        drop(pending);
        match outcome {
            Ok(Some(())) => Ok(start.elapsed()),
            _ => Err(HostTimeout {
                addresses: addresses.to_vec(),
                waited: timeout,
            }),
        }
    }

    fn transmit(&self, ip: IpAddr, mac: Option<MacAddr>, use_icmp: bool) {
        let frame = match (ip, use_icmp) {
            (IpAddr::V4(ip), false) => Some(self.arp_request(ip)),
            (IpAddr::V6(ip), false) => Some(self.neighbor_solicitation(ip)),
            (IpAddr::V4(ip), true) => Some(self.echo_v4(ip, mac)),
            (IpAddr::V6(ip), true) => self.echo_v6(ip, mac),
        };
        let Some(frame) = frame else {
            debug!(%ip, "No source address to probe from");
            return;
        };
        match self.send_frame(&frame) {
            Ok(()) => {
                self.registry.stats.probes.inc();
                trace!(%ip, use_icmp, "Probe sent");
            }
            Err(e) => warn!(%ip, error = %e, "Failed to send probe"),
        }
    }

    fn send_frame(&self, frame: &[u8]) -> Result<()> {
        self.registry.device.send_frame(frame)
    }

    fn arp_request(&self, target: Ipv4Addr) -> Vec<u8> {
        let device = &self.registry.device;
        let sender_ip = device.ipv4().unwrap_or(Ipv4Addr::UNSPECIFIED);
        let arp = ArpPacket::request(device.mac(), sender_ip, target);
        EthernetHeader::new(MacAddr::BROADCAST, device.mac(), EtherType::Arp)
            .encapsulate(&arp.to_bytes())
    }

    fn neighbor_solicitation(&self, target: Ipv6Addr) -> Vec<u8> {
        let device = &self.registry.device;
        let group = ipv6::solicited_node(target);
        // Without a link-local address the solicitation goes out as DAD
        let (src, slla) = match device.ipv6_link_local() {
            Some(ll) => (ll, Some(device.mac())),
            None => (Ipv6Addr::UNSPECIFIED, None),
        };
        let ns = NeighborSolicitation {
            target_addr: target,
            source_link_addr: slla,
        };
        let packet = icmpv6::into_ipv6(ns.to_bytes(), src, group);
        EthernetHeader::new(MacAddr::ipv6_multicast(group), device.mac(), EtherType::Ipv6)
            .encapsulate(&packet)
    }

    fn echo_v4(&self, target: Ipv4Addr, mac: Option<MacAddr>) -> Vec<u8> {
        let device = &self.registry.device;
        let seq = self.registry.sequence.fetch_add(1, Ordering::Relaxed) as u16;
        let src = device.ipv4().unwrap_or(Ipv4Addr::UNSPECIFIED);
        let packet = ipv4::build(
            src,
            target,
            ipv4::protocol::ICMP,
            64,
            &icmp::echo_request(std::process::id() as u16, seq, b"sleepproxy"),
        );
        EthernetHeader::new(mac.unwrap_or(MacAddr::BROADCAST), device.mac(), EtherType::Ipv4)
            .encapsulate(&packet)
    }

    fn echo_v6(&self, target: Ipv6Addr, mac: Option<MacAddr>) -> Option<Vec<u8>> {
        let device = &self.registry.device;
        let src = device.ipv6_link_local()?;
        let seq = self.registry.sequence.fetch_add(1, Ordering::Relaxed) as u16;
        let msg = icmpv6::echo_request(std::process::id() as u16, seq, b"sleepproxy");
        let packet = icmpv6::into_ipv6(msg, src, target);
        let dst = mac.unwrap_or_else(|| MacAddr::ipv6_multicast(ipv6::solicited_node(target)));
        Some(EthernetHeader::new(dst, device.mac(), EtherType::Ipv6).encapsulate(&packet))
    }
}
