//! Host records
//!
//! One flattened record per host; what a host can do is decided by its
//! [`HostKind`]. Method structs are resolved once from configuration and
//! never change afterwards.

use super::address_table::{AddressTable, TableEvent};
use super::events::{Observers, Subscription};
use super::lock;
use crate::protocol::{IpCidr, MacAddr};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Seen,
    Unseen,
    AddressAdded(IpAddr),
    AddressRemoved(IpAddr),
    MacChanged(MacAddr),
    Woken,
    VpnClientsReachable(bool),
}

/// How reachability is tested
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingMethod {
    pub timeout: Duration,
    pub use_icmp: bool,
}

impl Default for PingMethod {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(500),
            use_icmp: false,
        }
    }
}

/// Impersonation timing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoseMethod {
    /// How long corroborating traffic is collected, and the bound on
    /// preemptive probes.
    pub timeout: Duration,
    /// Quiet interval before the host is impersonated preemptively.
    pub latency: Option<Duration>,
}

impl Default for PoseMethod {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            latency: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WakeFlags {
    /// UDP broadcast to the subnet
    pub network: bool,
    /// Ethernet frame with EtherType 0x0842
    pub link: bool,
    /// UDP to each of the host's addresses
    pub unicast: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WakeMode {
    #[default]
    Auto,
    Explicit(WakeFlags),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakeMethod {
    pub mode: WakeMode,
    pub port: u16,
    /// Upper bound on waiting for the host after the magic packet.
    pub timeout: Duration,
    /// Traffic within this window after the host was seen or woken is ignored.
    pub latency: Duration,
    /// Do not wait for the host to answer after waking it.
    pub silent: bool,
    /// Forward queued traffic to the woken host.
    pub forward: bool,
    pub password: Option<Vec<u8>>,
}

impl Default for WakeMethod {
    fn default() -> Self {
        Self {
            mode: WakeMode::Auto,
            port: 9,
            timeout: Duration::from_secs(30),
            latency: Duration::from_secs(5),
            silent: false,
            forward: true,
            password: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WatchProfile {
    pub ping: PingMethod,
    pub pose: PoseMethod,
    pub wake: WakeMethod,
}

/// When a virtual host may bypass its filters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RedirectPolicy {
    #[default]
    Never,
    OnMagicPacket,
    Always,
}

#[derive(Debug)]
pub struct VirtualProfile {
    pub watch: WatchProfile,
    pub physical: Arc<NetworkHost>,
    pub redirect: RedirectPolicy,
}

/// What traffic arriving through a router may wake a host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WakePolicy {
    /// Anything routed, including the router's own traffic
    AllowWake,
    /// Only VPN clients, and only while they are reachable
    AllowWakeByProxy,
    /// Only magic packets relayed by the router
    #[default]
    AllowWakeOnLan,
}

#[derive(Debug)]
pub struct RouterProfile {
    pub policy: WakePolicy,
    pub vpn_subnets: Vec<IpCidr>,
    pub vpn_timeout: Duration,
    vpn_last_seen: Mutex<Option<Instant>>,
}

impl RouterProfile {
    pub fn new(policy: WakePolicy, vpn_subnets: Vec<IpCidr>, vpn_timeout: Duration) -> Self {
        Self {
            policy,
            vpn_subnets,
            vpn_timeout,
            vpn_last_seen: Mutex::new(None),
        }
    }

    pub fn is_vpn_client(&self, ip: IpAddr) -> bool {
        self.vpn_subnets.iter().any(|net| net.contains(ip))
    }

    pub fn vpn_reachable(&self) -> bool {
        lock(&self.vpn_last_seen).is_some_and(|t| t.elapsed() < self.vpn_timeout)
    }

    /// Returns true when the VPN clients were not reachable before.
    fn mark_vpn_seen(&self) -> bool {
        let mut last = lock(&self.vpn_last_seen);
        let was = last.is_some_and(|t| t.elapsed() < self.vpn_timeout);
        *last = Some(Instant::now());
        !was
    }
}

#[derive(Debug)]
pub enum HostKind {
    Plain,
    Router(RouterProfile),
    Watch(WatchProfile),
    Virtual(VirtualProfile),
}

#[derive(Debug, Default)]
struct Timestamps {
    last_seen: Option<Instant>,
    last_unseen: Option<Instant>,
    last_wake: Option<Instant>,
}

pub struct NetworkHost {
    name: String,
    hostname: Option<String>,
    mac: Mutex<Option<MacAddr>>,
    addresses: Mutex<AddressTable<IpAddr>>,
    kind: HostKind,
    times: Mutex<Timestamps>,
    observers: Observers<HostEvent>,
    _forward: Subscription,
}

impl NetworkHost {
    pub fn new(name: impl Into<String>, kind: HostKind) -> Self {
        let observers = Observers::new();
        let addresses = AddressTable::new();
        let sink = observers.clone();
        let forward = addresses.subscribe(move |event: &TableEvent<IpAddr>| match event {
            TableEvent::Added(ip) => sink.emit(&HostEvent::AddressAdded(*ip)),
            TableEvent::Removed(ip) | TableEvent::Expired(ip) => {
                sink.emit(&HostEvent::AddressRemoved(*ip))
            }
        });

        Self {
            name: name.into(),
            hostname: None,
            mac: Mutex::new(None),
            addresses: Mutex::new(addresses),
            kind,
            times: Mutex::new(Timestamps::default()),
            observers,
            _forward: forward,
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn with_mac(self, mac: MacAddr) -> Self {
        *lock(&self.mac) = Some(mac);
        self
    }

    pub fn with_addresses(self, addresses: impl IntoIterator<Item = IpAddr>) -> Self {
        {
            let mut table = lock(&self.addresses);
            for ip in addresses {
                table.add_static(ip);
            }
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    pub fn kind(&self) -> &HostKind {
        &self.kind
    }

    /// Wake configuration, for hosts that can be woken.
    pub fn watch(&self) -> Option<&WatchProfile> {
        match &self.kind {
            HostKind::Watch(watch) => Some(watch),
            HostKind::Virtual(v) => Some(&v.watch),
            _ => None,
        }
    }

    pub fn router(&self) -> Option<&RouterProfile> {
        match &self.kind {
            HostKind::Router(router) => Some(router),
            _ => None,
        }
    }

    pub fn virtual_profile(&self) -> Option<&VirtualProfile> {
        match &self.kind {
            HostKind::Virtual(v) => Some(v),
            _ => None,
        }
    }

    /// Host whose hardware receives the magic packet.
    pub fn wake_target(self: &Arc<Self>) -> Arc<NetworkHost> {
        match &self.kind {
            HostKind::Virtual(v) => Arc::clone(&v.physical),
            _ => Arc::clone(self),
        }
    }

    /// Address events are delivered with the address table locked, so
    /// handlers must not read the host's addresses.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&HostEvent) + Send + Sync + 'static,
    {
        self.observers.subscribe(handler)
    }

    pub fn mac(&self) -> Option<MacAddr> {
        *lock(&self.mac)
    }

    /// Returns true if the address changed.
    pub fn set_mac(&self, mac: MacAddr) -> bool {
        {
            let mut current = lock(&self.mac);
            if *current == Some(mac) {
                return false;
            }
            *current = Some(mac);
        }
        self.observers.emit(&HostEvent::MacChanged(mac));
        true
    }

    /// Record an address seen in traffic; returns true if it is new.
    pub fn learn_address(&self, ip: IpAddr, ttl: Duration) -> bool {
        lock(&self.addresses).set_dynamic(ip, ttl)
    }

    pub fn remove_address(&self, ip: IpAddr) -> bool {
        lock(&self.addresses).remove(&ip)
    }

    pub fn has_address(&self, ip: IpAddr) -> bool {
        lock(&self.addresses).contains(&ip)
    }

    /// Live addresses in a stable order, evicting expired ones.
    pub fn addresses(&self) -> Vec<IpAddr> {
        let mut addresses = lock(&self.addresses).sweep();
        addresses.sort();
        addresses
    }

    pub fn mark_seen(&self) {
        lock(&self.times).last_seen = Some(Instant::now());
        self.observers.emit(&HostEvent::Seen);
    }

    /// The host announced it is going to sleep.
    pub fn mark_unseen(&self) {
        lock(&self.times).last_unseen = Some(Instant::now());
        self.observers.emit(&HostEvent::Unseen);
    }

    pub fn mark_woken(&self) {
        lock(&self.times).last_wake = Some(Instant::now());
        self.observers.emit(&HostEvent::Woken);
    }

    pub fn mark_vpn_seen(&self) {
        if let Some(router) = self.router() {
            if router.mark_vpn_seen() {
                self.observers.emit(&HostEvent::VpnClientsReachable(true));
            }
        }
    }

    pub fn last_seen(&self) -> Option<Instant> {
        lock(&self.times).last_seen
    }

    pub fn last_unseen(&self) -> Option<Instant> {
        lock(&self.times).last_unseen
    }

    pub fn last_wake(&self) -> Option<Instant> {
        lock(&self.times).last_wake
    }

    /// Seen within `window` and not announced asleep since.
    pub fn seen_within(&self, window: Duration) -> bool {
        let times = lock(&self.times);
        match times.last_seen {
            Some(seen) => {
                seen.elapsed() < window && times.last_unseen.is_none_or(|unseen| seen > unseen)
            }
            None => false,
        }
    }

    pub fn woken_within(&self, window: Duration) -> bool {
        lock(&self.times)
            .last_wake
            .is_some_and(|wake| wake.elapsed() < window)
    }
}

impl std::fmt::Debug for NetworkHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkHost")
            .field("name", &self.name)
            .field("mac", &self.mac())
            .field("kind", &self.kind)
            .finish()
    }
}
