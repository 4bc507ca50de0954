//! Address impersonation
//!
//! Each claimed address has at most one active [`Impersonation`], alive
//! while at least one registered [`ImpersonationRequest`] claims it. While
//! active, ARP requests and neighbor solicitations for the address are
//! answered with the proxy's MAC. When the last claim goes away the kernel
//! neighbor override is removed and, unless the release was silent, the
//! hosts that were told the lie get the real owner's binding back.

use super::events::{Observers, Subscription};
use super::lock;
use super::network::WatchScope;
use crate::capture::NetworkDevice;
use crate::neighbor::NeighborCache;
use crate::protocol::arp::{ArpOp, ArpPacket};
use crate::protocol::ethernet::EthernetHeader;
use crate::protocol::icmpv6::{self, NeighborAdvertisement};
use crate::protocol::packet::Ndp;
use crate::protocol::{ipv6, EtherType, MacAddr, Packet};
use crate::telemetry::EngineStats;
use crate::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info, warn};

static NEXT_REQUEST: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimEvent {
    Added(IpAddr),
    Removed(IpAddr),
    Disposed { silent: bool },
}

/// Set of addresses claimed on behalf of one caller
pub struct ImpersonationRequest {
    id: u64,
    owner: Option<MacAddr>,
    addresses: Mutex<HashSet<IpAddr>>,
    observers: Observers<ClaimEvent>,
    disposed: AtomicBool,
}

impl ImpersonationRequest {
    /// `owner` is the real hardware address, used for corrections.
    pub fn new(owner: Option<MacAddr>, addresses: impl IntoIterator<Item = IpAddr>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_REQUEST.fetch_add(1, Ordering::Relaxed),
            owner,
            addresses: Mutex::new(addresses.into_iter().collect()),
            observers: Observers::new(),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn owner(&self) -> Option<MacAddr> {
        self.owner
    }

    pub fn addresses(&self) -> Vec<IpAddr> {
        let mut addresses: Vec<_> = lock(&self.addresses).iter().copied().collect();
        addresses.sort();
        addresses
    }

    pub fn claims(&self, ip: IpAddr) -> bool {
        !self.is_disposed() && lock(&self.addresses).contains(&ip)
    }

    pub fn add(&self, ip: IpAddr) {
        if lock(&self.addresses).insert(ip) {
            self.observers.emit(&ClaimEvent::Added(ip));
        }
    }

    pub fn remove(&self, ip: IpAddr) {
        if lock(&self.addresses).remove(&ip) {
            self.observers.emit(&ClaimEvent::Removed(ip));
        }
    }

    /// Release every claim. Only the first call has an effect.
    pub fn dispose(&self, silent: bool) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            self.observers.emit(&ClaimEvent::Disposed { silent });
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ClaimEvent) + Send + Sync + 'static,
    {
        self.observers.subscribe(handler)
    }
}

impl std::fmt::Debug for ImpersonationRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImpersonationRequest")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("addresses", &self.addresses())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Disposes its request when dropped; loud unless made silent.
pub struct ImpersonationScope {
    request: Arc<ImpersonationRequest>,
    silent: bool,
}

impl ImpersonationScope {
    pub fn new(request: Arc<ImpersonationRequest>) -> Self {
        Self {
            request,
            silent: false,
        }
    }

    pub fn request(&self) -> &Arc<ImpersonationRequest> {
        &self.request
    }

    pub fn set_silent(&mut self, silent: bool) {
        self.silent = silent;
    }
}

impl Drop for ImpersonationScope {
    fn drop(&mut self) {
        self.request.dispose(self.silent);
    }
}

/// State of one impersonated address
#[derive(Debug)]
struct Impersonation {
    owner: Option<MacAddr>,
    /// Announced to the whole link
    broadcast: bool,
    /// Hosts answered individually, by MAC
    targets: HashMap<MacAddr, IpAddr>,
}

struct Claim {
    request: Arc<ImpersonationRequest>,
    /// Addresses added later are announced too
    announce: bool,
    _subscription: Subscription,
}

struct Inner {
    device: Arc<dyn NetworkDevice>,
    neighbors: Arc<dyn NeighborCache>,
    scope: WatchScope,
    stats: Arc<EngineStats>,
    active: Mutex<HashMap<IpAddr, Impersonation>>,
    claims: Mutex<HashMap<u64, Claim>>,
}

#[derive(Clone)]
pub struct ImpersonationEngine {
    inner: Arc<Inner>,
}

impl ImpersonationEngine {
    pub fn new(
        device: Arc<dyn NetworkDevice>,
        neighbors: Arc<dyn NeighborCache>,
        scope: WatchScope,
        stats: Arc<EngineStats>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                device,
                neighbors,
                scope,
                stats,
                active: Mutex::new(HashMap::new()),
                claims: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Start impersonating every address `request` claims.
    ///
    /// Addresses that cannot be impersonated are skipped; in network scope
    /// the first such failure is returned after the others were started.
    /// With `advertise` every impersonation of the request is announced,
    /// including ones already active for a quieter claim and addresses
    /// added to the request later. A `trigger` solicitation is answered
    /// directly.
    pub fn impersonate(
        &self,
        request: &Arc<ImpersonationRequest>,
        advertise: bool,
        trigger: Option<&Packet>,
    ) -> Result<()> {
        if request.is_disposed() {
            return Ok(());
        }
        let announce = advertise && self.inner.scope == WatchScope::Network;
        self.register(request, announce);

        let mut failure = None;
        for ip in request.addresses() {
            match self.inner.check(ip) {
                Ok(()) => self.inner.start(ip, request.owner(), announce),
                Err(e) if self.inner.scope == WatchScope::Host => {
                    debug!(error = %e, "Impersonation skipped");
                }
                Err(e) => {
                    if failure.is_none() {
                        failure = Some(e);
                    }
                }
            }
        }

        if let Some(trigger) = trigger {
            self.handle(trigger);
        }
        failure.map_or(Ok(()), Err)
    }

    fn register(&self, request: &Arc<ImpersonationRequest>, announce: bool) {
        let mut claims = lock(&self.inner.claims);
        if let Some(claim) = claims.get_mut(&request.id) {
            claim.announce |= announce;
            return;
        }
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let id = request.id;
        let subscription = request.subscribe(move |event| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match event {
                ClaimEvent::Added(ip) => {
                    if inner.check(*ip).is_ok() {
                        let (owner, announce) = lock(&inner.claims)
                            .get(&id)
                            .map(|c| (c.request.owner(), c.announce))
                            .unwrap_or_default();
                        inner.start(*ip, owner, announce);
                    }
                }
                ClaimEvent::Removed(_) => inner.sift(false),
                ClaimEvent::Disposed { silent } => {
                    let claim = lock(&inner.claims).remove(&id);
                    drop(claim);
                    inner.sift(*silent);
                }
            }
        });
        claims.insert(
            id,
            Claim {
                request: Arc::clone(request),
                announce,
                _subscription: subscription,
            },
        );
    }

    /// Stop every impersonation no live request claims any more.
    pub fn sift(&self, silent: bool) {
        self.inner.sift(silent);
    }

    /// Answer a solicitation for an impersonated address.
    ///
    /// Returns true if a reply was sent.
    pub fn handle(&self, packet: &Packet) -> bool {
        if let Some(arp) = &packet.arp {
            return self.inner.answer_arp(arp);
        }
        if let Some(Ndp::Solicitation(ns)) = packet.ndp() {
            let Some(IpAddr::V6(src)) = packet.src_ip() else {
                return false;
            };
            // Duplicate address detection comes from the owner itself
            if src.is_unspecified() {
                return false;
            }
            let reply_mac = ns.source_link_addr.unwrap_or(packet.src_mac());
            return self.inner.answer_ns(ns.target_addr, src, reply_mac);
        }
        false
    }

    pub fn is_impersonated(&self, ip: IpAddr) -> bool {
        lock(&self.inner.active).contains_key(&ip)
    }

    pub fn active_count(&self) -> usize {
        lock(&self.inner.active).len()
    }

    pub fn claim_count(&self) -> usize {
        lock(&self.inner.claims).len()
    }
}

impl Inner {
    fn check(&self, ip: IpAddr) -> Result<()> {
        let reason = match ip {
            _ if ip.is_unspecified() || ip.is_multicast() => Some("not a unicast address"),
            IpAddr::V4(v4) if v4.is_broadcast() => Some("not a unicast address"),
            IpAddr::V6(_) if self.device.ipv6_link_local().is_none() => {
                Some("device has no IPv6 link-local address")
            }
            _ => None,
        };
        match reason {
            Some(reason) => Err(Error::ImpersonationImpossible {
                addr: ip,
                reason: reason.to_string(),
            }),
            None => Ok(()),
        }
    }

    fn start(&self, ip: IpAddr, owner: Option<MacAddr>, announce: bool) {
        let mut active = lock(&self.active);
        if let Some(existing) = active.get_mut(&ip) {
            if existing.owner.is_none() {
                existing.owner = owner;
            }
            if announce && !existing.broadcast {
                existing.broadcast = true;
                drop(active);
                self.announce(ip);
                debug!(%ip, "Impersonation announced");
            }
            return;
        }
        active.insert(
            ip,
            Impersonation {
                owner,
                broadcast: announce,
                targets: HashMap::new(),
            },
        );
        drop(active);

        // Keep our own stack talking to the real owner
        if let Some(owner) = owner {
            self.neighbors.update(ip, owner);
        }
        if announce {
            self.announce(ip);
        }
        self.stats.impersonations.inc();
        info!(%ip, announce, "Impersonation started");
    }

    fn sift(&self, silent: bool) {
        let claimed: HashSet<IpAddr> = lock(&self.claims)
            .values()
            .filter(|claim| !claim.request.is_disposed())
            .flat_map(|claim| claim.request.addresses())
            .collect();

        let released: Vec<(IpAddr, Impersonation)> = {
            let mut active = lock(&self.active);
            let stale: Vec<IpAddr> = active
                .keys()
                .filter(|ip| !claimed.contains(ip))
                .copied()
                .collect();
            stale
                .into_iter()
                .filter_map(|ip| active.remove(&ip).map(|imp| (ip, imp)))
                .collect()
        };

        for (ip, imp) in released {
            self.stop(ip, imp, silent);
        }
    }

    fn stop(&self, ip: IpAddr, imp: Impersonation, silent: bool) {
        self.neighbors.delete(ip);
        if !silent {
            match imp.owner {
                Some(owner) => self.correct(ip, owner, &imp),
                None => debug!(%ip, "Owner unknown, no correction sent"),
            }
        }
        info!(%ip, silent, "Impersonation stopped");
    }

    fn announce(&self, ip: IpAddr) {
        let mac = self.device.mac();
        let frame = match ip {
            IpAddr::V4(v4) => Some(arp_frame(mac, MacAddr::BROADCAST, &ArpPacket::announcement(mac, v4))),
            IpAddr::V6(v6) => self.unsolicited_na(v6, mac, ipv6::ALL_NODES, None),
        };
        if let Some(frame) = frame {
            self.send(&frame, ip);
        }
    }

    /// Restore the owner's binding wherever it was replaced.
    fn correct(&self, ip: IpAddr, owner: MacAddr, imp: &Impersonation) {
        let mac = self.device.mac();
        let mut frames = Vec::new();
        match ip {
            IpAddr::V4(v4) => {
                if imp.broadcast {
                    frames.push(arp_frame(mac, MacAddr::BROADCAST, &ArpPacket::announcement(owner, v4)));
                } else {
                    for (target_mac, target_ip) in &imp.targets {
                        if let IpAddr::V4(target_ip) = target_ip {
                            let reply = ArpPacket::reply(owner, v4, *target_mac, *target_ip);
                            frames.push(arp_frame(mac, *target_mac, &reply));
                        }
                    }
                }
            }
            IpAddr::V6(v6) => {
                if imp.broadcast {
                    frames.extend(self.unsolicited_na(v6, owner, ipv6::ALL_NODES, None));
                } else {
                    for (target_mac, target_ip) in &imp.targets {
                        if let IpAddr::V6(target_ip) = target_ip {
                            frames.extend(self.unsolicited_na(v6, owner, *target_ip, Some(*target_mac)));
                        }
                    }
                }
            }
        }
        for frame in frames {
            self.send(&frame, ip);
        }
    }

    fn unsolicited_na(
        &self,
        target: Ipv6Addr,
        link_addr: MacAddr,
        dst: Ipv6Addr,
        dst_mac: Option<MacAddr>,
    ) -> Option<Vec<u8>> {
        let src = self.device.ipv6_link_local()?;
        let na = NeighborAdvertisement::unsolicited(target, link_addr);
        let packet = icmpv6::into_ipv6(na.to_bytes(), src, dst);
        let dst_mac = dst_mac.unwrap_or_else(|| MacAddr::ipv6_multicast(dst));
        Some(EthernetHeader::new(dst_mac, self.device.mac(), EtherType::Ipv6).encapsulate(&packet))
    }

    fn answer_arp(&self, arp: &ArpPacket) -> bool {
        if arp.operation != ArpOp::Request || arp.is_probe() || arp.is_announcement() {
            return false;
        }
        let mac = self.device.mac();
        if arp.sender_mac == mac {
            return false;
        }
        let target = IpAddr::V4(arp.target_ip);
        {
            let mut active = lock(&self.active);
            let Some(imp) = active.get_mut(&target) else {
                return false;
            };
            if imp.owner == Some(arp.sender_mac) {
                return false;
            }
            if !imp.broadcast {
                imp.targets.insert(arp.sender_mac, IpAddr::V4(arp.sender_ip));
            }
        }

        let reply = ArpPacket::reply(mac, arp.target_ip, arp.sender_mac, arp.sender_ip);
        self.send(&arp_frame(mac, arp.sender_mac, &reply), target);
        self.stats.impersonation_replies.inc();
        debug!(ip = %target, requester = %arp.sender_ip, "Answered ARP request");
        true
    }

    fn answer_ns(&self, target: Ipv6Addr, requester: Ipv6Addr, requester_mac: MacAddr) -> bool {
        let mac = self.device.mac();
        if requester_mac == mac {
            return false;
        }
        let key = IpAddr::V6(target);
        {
            let mut active = lock(&self.active);
            let Some(imp) = active.get_mut(&key) else {
                return false;
            };
            if imp.owner == Some(requester_mac) {
                return false;
            }
            if !imp.broadcast {
                imp.targets.insert(requester_mac, IpAddr::V6(requester));
            }
        }

        let na = NeighborAdvertisement::solicited(target, mac);
        let packet = icmpv6::into_ipv6(na.to_bytes(), target, requester);
        let frame = EthernetHeader::new(requester_mac, mac, EtherType::Ipv6).encapsulate(&packet);
        self.send(&frame, key);
        self.stats.impersonation_replies.inc();
        debug!(ip = %target, %requester, "Answered neighbor solicitation");
        true
    }

    fn send(&self, frame: &[u8], ip: IpAddr) {
        if let Err(e) = self.device.send_frame(frame) {
            warn!(%ip, error = %e, "Failed to send impersonation frame");
        }
    }
}

fn arp_frame(src: MacAddr, dst: MacAddr, arp: &ArpPacket) -> Vec<u8> {
    EthernetHeader::new(dst, src, EtherType::Arp).encapsulate(&arp.to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::mock::RecordingDevice;
    use crate::protocol::icmpv6::NeighborSolicitation;
    use crate::protocol::packet::build;
    use std::net::Ipv4Addr;

    const PROXY: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0xfe]);
    const PC1: MacAddr = MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]);
    const CLIENT: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x05]);

    #[derive(Default)]
    struct RecordingNeighbors {
        ops: Mutex<Vec<String>>,
    }

    impl NeighborCache for RecordingNeighbors {
        fn update(&self, ip: IpAddr, mac: MacAddr) {
            self.ops.lock().unwrap().push(format!("update {} {}", ip, mac));
        }
        fn delete(&self, ip: IpAddr) {
            self.ops.lock().unwrap().push(format!("delete {}", ip));
        }
    }

    struct Fixture {
        device: Arc<RecordingDevice>,
        neighbors: Arc<RecordingNeighbors>,
        engine: ImpersonationEngine,
    }

    fn fixture(scope: WatchScope, link_local: Option<&str>) -> Fixture {
        let device = Arc::new(RecordingDevice::new(
            PROXY,
            Some("192.168.1.2/24".parse().unwrap()),
            link_local.map(|ll| ll.parse().unwrap()),
        ));
        let neighbors = Arc::new(RecordingNeighbors::default());
        let engine = ImpersonationEngine::new(
            device.clone(),
            neighbors.clone(),
            scope,
            Arc::new(EngineStats::new()),
        );
        Fixture {
            device,
            neighbors,
            engine,
        }
    }

    fn pc1_ip() -> IpAddr {
        "192.168.1.10".parse().unwrap()
    }

    fn who_has(sender_mac: MacAddr, sender_ip: &str, target: &str) -> Packet {
        let arp = ArpPacket::request(sender_mac, sender_ip.parse().unwrap(), target.parse().unwrap());
        Packet::parse(build::arp(sender_mac, MacAddr::BROADCAST, &arp)).unwrap()
    }

    fn arp_of(frame: &[u8]) -> ArpPacket {
        Packet::parse(frame.to_vec()).unwrap().arp.unwrap()
    }

    #[test]
    fn test_overlapping_claims_share_one_instance() {
        let f = fixture(WatchScope::Network, None);
        let first = ImpersonationScope::new(ImpersonationRequest::new(Some(PC1), [pc1_ip()]));
        let second = ImpersonationScope::new(ImpersonationRequest::new(Some(PC1), [pc1_ip()]));

        f.engine.impersonate(first.request(), true, None).unwrap();
        f.engine.impersonate(second.request(), true, None).unwrap();
        assert_eq!(f.engine.active_count(), 1);
        assert_eq!(f.device.take_frames().len(), 1);

        drop(first);
        assert!(f.engine.is_impersonated(pc1_ip()));
        assert!(f.device.frames().is_empty());

        drop(second);
        assert!(!f.engine.is_impersonated(pc1_ip()));
        assert_eq!(f.engine.claim_count(), 0);

        let frames = f.device.frames();
        assert_eq!(frames.len(), 1);
        let correction = arp_of(&frames[0]);
        assert!(correction.is_announcement());
        assert_eq!(correction.sender_mac, PC1);

        let ops = f.neighbors.ops.lock().unwrap();
        assert_eq!(
            *ops,
            vec!["update 192.168.1.10 aa:bb:cc:dd:ee:01", "delete 192.168.1.10"]
        );
    }

    #[test]
    fn test_answers_requests_and_corrects_targets() {
        let f = fixture(WatchScope::Network, None);
        let scope = ImpersonationScope::new(ImpersonationRequest::new(Some(PC1), [pc1_ip()]));
        f.engine.impersonate(scope.request(), false, None).unwrap();
        assert!(f.device.frames().is_empty());

        assert!(f.engine.handle(&who_has(CLIENT, "192.168.1.5", "192.168.1.10")));
        let reply = arp_of(&f.device.take_frames()[0]);
        assert_eq!(reply.operation, ArpOp::Reply);
        assert_eq!(reply.sender_mac, PROXY);
        assert_eq!(reply.sender_ip, Ipv4Addr::new(192, 168, 1, 10));
        assert_eq!(reply.target_mac, CLIENT);

        drop(scope);
        let frames = f.device.frames();
        assert_eq!(frames.len(), 1);
        let correction = Packet::parse(frames[0].clone()).unwrap();
        assert_eq!(correction.dst_mac(), CLIENT);
        let arp = correction.arp.unwrap();
        assert_eq!(arp.sender_mac, PC1);
        assert_eq!(arp.target_ip, Ipv4Addr::new(192, 168, 1, 5));
    }

    #[test]
    fn test_ignores_probes_owner_and_unclaimed() {
        let f = fixture(WatchScope::Network, None);
        let scope = ImpersonationScope::new(ImpersonationRequest::new(Some(PC1), [pc1_ip()]));
        f.engine.impersonate(scope.request(), false, None).unwrap();

        assert!(!f.engine.handle(&who_has(CLIENT, "0.0.0.0", "192.168.1.10")));
        assert!(!f.engine.handle(&who_has(PC1, "192.168.1.10", "192.168.1.10")));
        assert!(!f.engine.handle(&who_has(PC1, "192.168.1.99", "192.168.1.10")));
        assert!(!f.engine.handle(&who_has(CLIENT, "192.168.1.5", "192.168.1.11")));
        assert!(f.device.frames().is_empty());
    }

    #[test]
    fn test_silent_release_sends_nothing() {
        let f = fixture(WatchScope::Network, None);
        let mut scope = ImpersonationScope::new(ImpersonationRequest::new(Some(PC1), [pc1_ip()]));
        f.engine.impersonate(scope.request(), true, None).unwrap();
        f.device.clear();

        scope.set_silent(true);
        drop(scope);
        assert_eq!(f.engine.active_count(), 0);
        assert!(f.device.frames().is_empty());
        assert_eq!(f.neighbors.ops.lock().unwrap().last().unwrap(), "delete 192.168.1.10");
    }

    #[test]
    fn test_host_scope_never_announces() {
        let f = fixture(WatchScope::Host, None);
        let scope = ImpersonationScope::new(ImpersonationRequest::new(Some(PC1), [pc1_ip()]));
        f.engine.impersonate(scope.request(), true, None).unwrap();
        assert!(f.engine.is_impersonated(pc1_ip()));
        assert!(f.device.frames().is_empty());
    }

    #[test]
    fn test_trigger_is_answered_directly() {
        let f = fixture(WatchScope::Network, None);
        let scope = ImpersonationScope::new(ImpersonationRequest::new(Some(PC1), [pc1_ip()]));
        let trigger = who_has(CLIENT, "192.168.1.5", "192.168.1.10");
        f.engine.impersonate(scope.request(), false, Some(&trigger)).unwrap();

        let frames = f.device.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(arp_of(&frames[0]).target_mac, CLIENT);
    }

    #[test]
    fn test_advertising_claim_announces_active_address() {
        let f = fixture(WatchScope::Network, None);
        let quiet = ImpersonationScope::new(ImpersonationRequest::new(Some(PC1), [pc1_ip()]));
        let loud = ImpersonationScope::new(ImpersonationRequest::new(Some(PC1), [pc1_ip()]));

        f.engine.impersonate(quiet.request(), false, None).unwrap();
        assert!(f.device.frames().is_empty());
        f.engine.impersonate(loud.request(), true, None).unwrap();
        let frames = f.device.take_frames();
        assert_eq!(frames.len(), 1);
        let announcement = arp_of(&frames[0]);
        assert!(announcement.is_announcement());
        assert_eq!(announcement.sender_mac, PROXY);

        // Announced once: later requesters are not tracked individually
        assert!(f.engine.handle(&who_has(CLIENT, "192.168.1.5", "192.168.1.10")));
        f.device.clear();
        drop(loud);
        drop(quiet);
        let frames = f.device.frames();
        assert_eq!(frames.len(), 1);
        let correction = Packet::parse(frames[0].clone()).unwrap();
        assert!(correction.dst_mac().is_broadcast());
        assert_eq!(correction.arp.unwrap().sender_mac, PC1);
    }

    #[test]
    fn test_addresses_added_to_advertising_claim_are_announced() {
        let f = fixture(WatchScope::Network, None);
        let scope = ImpersonationScope::new(ImpersonationRequest::new(Some(PC1), [pc1_ip()]));
        f.engine.impersonate(scope.request(), true, None).unwrap();
        f.device.clear();

        scope.request().add("192.168.1.11".parse().unwrap());
        let frames = f.device.frames();
        assert_eq!(frames.len(), 1);
        let announcement = arp_of(&frames[0]);
        assert!(announcement.is_announcement());
        assert_eq!(announcement.sender_ip, Ipv4Addr::new(192, 168, 1, 11));
    }

    #[test]
    fn test_claim_changes_are_followed() {
        let f = fixture(WatchScope::Network, None);
        let scope = ImpersonationScope::new(ImpersonationRequest::new(Some(PC1), [pc1_ip()]));
        f.engine.impersonate(scope.request(), false, None).unwrap();

        let extra: IpAddr = "192.168.1.11".parse().unwrap();
        scope.request().add(extra);
        assert!(f.engine.is_impersonated(extra));

        scope.request().remove(pc1_ip());
        assert!(!f.engine.is_impersonated(pc1_ip()));
        assert_eq!(f.engine.active_count(), 1);
    }

    #[test]
    fn test_neighbor_solicitation_answered_except_dad() {
        let f = fixture(WatchScope::Network, Some("fe80::fe"));
        let target: Ipv6Addr = "2001:db8::10".parse().unwrap();
        let scope = ImpersonationScope::new(ImpersonationRequest::new(Some(PC1), [IpAddr::V6(target)]));
        f.engine.impersonate(scope.request(), false, None).unwrap();

        let group = ipv6::solicited_node(target);
        let ns = NeighborSolicitation {
            target_addr: target,
            source_link_addr: Some(CLIENT),
        };
        let dad = build::ndp(CLIENT, MacAddr::ipv6_multicast(group), Ipv6Addr::UNSPECIFIED, group, ns.to_bytes());
        assert!(!f.engine.handle(&Packet::parse(dad).unwrap()));

        let query = build::ndp(CLIENT, MacAddr::ipv6_multicast(group), "fe80::5".parse().unwrap(), group, ns.to_bytes());
        assert!(f.engine.handle(&Packet::parse(query).unwrap()));

        let reply = Packet::parse(f.device.frames()[0].clone()).unwrap();
        assert_eq!(reply.dst_mac(), CLIENT);
        assert_eq!(reply.src_ip(), Some(IpAddr::V6(target)));
        match reply.ndp() {
            Some(Ndp::Advertisement(na)) => {
                assert!(na.solicited_flag && na.override_flag);
                assert_eq!(na.target_link_addr, Some(PROXY));
            }
            other => panic!("expected advertisement, got {:?}", other),
        }
    }

    #[test]
    fn test_ipv6_without_link_local_is_impossible() {
        let v6: IpAddr = "2001:db8::10".parse().unwrap();

        let f = fixture(WatchScope::Network, None);
        let scope = ImpersonationScope::new(ImpersonationRequest::new(Some(PC1), [pc1_ip(), v6]));
        let err = f.engine.impersonate(scope.request(), false, None).unwrap_err();
        assert!(matches!(err, Error::ImpersonationImpossible { addr, .. } if addr == v6));
        assert!(f.engine.is_impersonated(pc1_ip()));

        let f = fixture(WatchScope::Host, None);
        let scope = ImpersonationScope::new(ImpersonationRequest::new(Some(PC1), [v6]));
        assert!(f.engine.impersonate(scope.request(), false, None).is_ok());
        assert_eq!(f.engine.active_count(), 0);
    }
}
