//! Per-network arena
//!
//! A [`Network`] owns its device, host directory, filter chains and the
//! reachability and impersonation services. Wake requests hold `Arc`s into
//! it and never outlive the process.

use super::address_table::{AddressTable, TableEvent};
use super::events::Subscription;
use super::filter::FilterChain;
use super::host::{HostKind, NetworkHost};
use super::impersonation::ImpersonationEngine;
use super::lock;
use super::reachability::ReachabilityProbe;
use crate::capture::NetworkDevice;
use crate::neighbor::NeighborCache;
use crate::protocol::{wol, MacAddr, Packet};
use crate::telemetry::EngineStats;
use crate::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

/// Whose addresses the proxy may speak for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WatchScope {
    /// Announce on behalf of hosts to the whole link
    #[default]
    Network,
    /// Only answer queries; never announce
    Host,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSettings {
    pub scope: WatchScope,
    /// Minimum interval between two wakes of the same hardware.
    pub throttle: Duration,
    /// Lifetime of learned addresses and discovered hosts.
    pub discovery_ttl: Duration,
    /// UDP ports carrying magic packets.
    pub wol_ports: Vec<u16>,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            scope: WatchScope::Network,
            throttle: Duration::from_secs(10),
            discovery_ttl: Duration::from_secs(3600),
            wol_ports: wol::DEFAULT_PORTS.to_vec(),
        }
    }
}

struct Directory {
    /// Configured hosts are static, discovered ones dynamic.
    names: AddressTable<String>,
    hosts: BTreeMap<String, Arc<NetworkHost>>,
}

impl Directory {
    /// Live hosts, configured before discovered, each group by name.
    fn live(&mut self) -> Vec<Arc<NetworkHost>> {
        let names = self.names.sweep();
        self.hosts.retain(|name, _| names.contains(name));
        let (mut configured, discovered): (Vec<_>, Vec<_>) = self
            .hosts
            .iter()
            .partition(|(name, _)| self.names.is_static(name));
        configured.extend(discovered);
        configured.into_iter().map(|(_, host)| Arc::clone(host)).collect()
    }
}

pub struct Network {
    name: String,
    device: Arc<dyn NetworkDevice>,
    settings: NetworkSettings,
    directory: Mutex<Directory>,
    chains: Mutex<HashMap<String, Arc<FilterChain>>>,
    reachability: ReachabilityProbe,
    impersonation: ImpersonationEngine,
    stats: Arc<EngineStats>,
    capture: tokio::sync::Mutex<()>,
    _expiry: Subscription,
}

impl Network {
    pub fn new(
        name: impl Into<String>,
        device: Arc<dyn NetworkDevice>,
        neighbors: Arc<dyn NeighborCache>,
        settings: NetworkSettings,
    ) -> Self {
        let name = name.into();
        let stats = Arc::new(EngineStats::new());
        let names = AddressTable::new();
        let network = name.clone();
        let expiry = names.subscribe(move |event: &TableEvent<String>| {
            if let TableEvent::Expired(host) = event {
                debug!(network = %network, host = %host, "Discovered host expired");
            }
        });

        Self {
            reachability: ReachabilityProbe::new(Arc::clone(&device), Arc::clone(&stats)),
            impersonation: ImpersonationEngine::new(
                Arc::clone(&device),
                neighbors,
                settings.scope,
                Arc::clone(&stats),
            ),
            name,
            device,
            settings,
            directory: Mutex::new(Directory {
                names,
                hosts: BTreeMap::new(),
            }),
            chains: Mutex::new(HashMap::new()),
            stats,
            capture: tokio::sync::Mutex::new(()),
            _expiry: expiry,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> &Arc<dyn NetworkDevice> {
        &self.device
    }

    pub fn settings(&self) -> &NetworkSettings {
        &self.settings
    }

    pub fn reachability(&self) -> &ReachabilityProbe {
        &self.reachability
    }

    pub fn impersonation(&self) -> &ImpersonationEngine {
        &self.impersonation
    }

    pub fn stats(&self) -> &Arc<EngineStats> {
        &self.stats
    }

    /// Serializes frame handling for this network.
    pub async fn lock_capture(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.capture.lock().await
    }

    /// Register a configured host.
    pub fn add_host(&self, host: Arc<NetworkHost>) -> Result<()> {
        let mut directory = lock(&self.directory);
        let name = host.name().to_string();
        if directory.names.is_static(&name) {
            return Err(Error::Topology(format!(
                "duplicate host '{}' on network '{}'",
                name, self.name
            )));
        }
        directory.names.add_static(name.clone());
        directory.hosts.insert(name, host);
        Ok(())
    }

    pub fn set_filters(&self, host: &str, chain: FilterChain) {
        lock(&self.chains).insert(host.to_string(), Arc::new(chain));
    }

    /// Filter chain for `host`; empty when none was configured.
    pub fn filters(&self, host: &NetworkHost) -> Arc<FilterChain> {
        lock(&self.chains)
            .get(host.name())
            .cloned()
            .unwrap_or_default()
    }

    pub fn hosts(&self) -> Vec<Arc<NetworkHost>> {
        lock(&self.directory).live()
    }

    pub fn watch_hosts(&self) -> Vec<Arc<NetworkHost>> {
        self.hosts()
            .into_iter()
            .filter(|host| host.watch().is_some())
            .collect()
    }

    pub fn host_by_name(&self, name: &str) -> Option<Arc<NetworkHost>> {
        self.hosts().into_iter().find(|host| host.name() == name)
    }

    pub fn host_by_ip(&self, ip: IpAddr) -> Option<Arc<NetworkHost>> {
        self.hosts().into_iter().find(|host| host.has_address(ip))
    }

    pub fn host_by_mac(&self, mac: MacAddr) -> Option<Arc<NetworkHost>> {
        self.hosts().into_iter().find(|host| host.mac() == Some(mac))
    }

    /// Watch host owning `ip`.
    pub fn watch_host_by_ip(&self, ip: IpAddr) -> Option<Arc<NetworkHost>> {
        self.hosts()
            .into_iter()
            .find(|host| host.watch().is_some() && host.has_address(ip))
    }

    /// Watch host with hardware address `mac`.
    pub fn watch_host_by_mac(&self, mac: MacAddr) -> Option<Arc<NetworkHost>> {
        self.hosts()
            .into_iter()
            .find(|host| host.watch().is_some() && host.mac() == Some(mac))
    }

    /// Liveness bookkeeping for one captured frame.
    ///
    /// The sender is marked seen, its on-link source address learned and
    /// its MAC recorded. Routers only teach addresses through ARP since
    /// they relay foreign sources. Unknown senders become discovered hosts.
    pub fn observe(&self, packet: &Packet) {
        let src_mac = packet.src_mac();
        if src_mac == self.device.mac() || !src_mac.is_unicast() {
            return;
        }
        let source = packet.source_address();
        let on_link = source.filter(|ip| self.device.is_on_link(*ip));

        let host = match self.host_by_mac(src_mac) {
            Some(host) => host,
            None => {
                let by_ip = on_link
                    .and_then(|ip| self.host_by_ip(ip))
                    .filter(|host| host.router().is_none());
                match by_ip {
                    // A known hardware address is never replaced by a sender
                    // that merely uses the same IP.
                    Some(host) if host.mac().is_none() => {
                        host.set_mac(src_mac);
                        info!(host = host.name(), mac = %src_mac, "Learned hardware address");
                        host
                    }
                    other => {
                        if let Some(known) = other {
                            debug!(
                                host = known.name(),
                                mac = %src_mac,
                                "Address in use by a different hardware address"
                            );
                        }
                        if let Some(ip) = on_link {
                            self.discover(src_mac, ip);
                        }
                        return;
                    }
                }
            }
        };

        host.mark_seen();
        self.refresh(&host);

        match (host.router(), source) {
            (Some(router), Some(ip)) => {
                if router.is_vpn_client(ip) {
                    host.mark_vpn_seen();
                }
                if packet.arp.is_some() && on_link.is_some() {
                    host.learn_address(ip, self.settings.discovery_ttl);
                }
            }
            (None, _) => {
                if let Some(ip) = on_link {
                    if host.learn_address(ip, self.settings.discovery_ttl) {
                        debug!(host = host.name(), %ip, "Learned address");
                    }
                }
            }
            _ => {}
        }
    }

    fn refresh(&self, host: &NetworkHost) {
        let mut directory = lock(&self.directory);
        let name = host.name().to_string();
        if !directory.names.is_static(&name) {
            directory.names.set_dynamic(name, self.settings.discovery_ttl);
        }
    }

    fn discover(&self, mac: MacAddr, ip: IpAddr) {
        let name = format!("discovered-{}", mac);
        let host = Arc::new(NetworkHost::new(name, HostKind::Plain).with_mac(mac));
        host.learn_address(ip, self.settings.discovery_ttl);
        host.mark_seen();

        let mut directory = lock(&self.directory);
        if directory
            .names
            .set_dynamic(host.name().to_string(), self.settings.discovery_ttl)
        {
            debug!(network = %self.name, %mac, %ip, "Discovered host");
            directory.hosts.insert(host.name().to_string(), host);
        }
    }
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network")
            .field("name", &self.name)
            .field("device", &self.device.name())
            .field("settings", &self.settings)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::mock::RecordingDevice;
    use crate::engine::host::{RouterProfile, WakePolicy, WatchProfile};
    use crate::neighbor::NoopNeighborCache;
    use crate::protocol::arp::ArpPacket;
    use crate::protocol::packet::build;

    const PROXY: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0xfe]);
    const PC1: MacAddr = MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]);
    const GW: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x01]);

    fn network() -> Network {
        let device = Arc::new(RecordingDevice::new(
            PROXY,
            Some("192.168.1.2/24".parse().unwrap()),
            None,
        ));
        let network = Network::new(
            "lan",
            device,
            Arc::new(NoopNeighborCache),
            NetworkSettings {
                discovery_ttl: Duration::from_secs(60),
                ..Default::default()
            },
        );
        network
            .add_host(Arc::new(
                NetworkHost::new("pc1", HostKind::Watch(WatchProfile::default()))
                    .with_addresses(["192.168.1.10".parse().unwrap()]),
            ))
            .unwrap();
        network
            .add_host(Arc::new(
                NetworkHost::new(
                    "gw",
                    HostKind::Router(RouterProfile::new(
                        WakePolicy::AllowWakeByProxy,
                        vec!["10.8.0.0/24".parse().unwrap()],
                        Duration::from_secs(30),
                    )),
                )
                .with_mac(GW)
                .with_addresses(["192.168.1.1".parse().unwrap()]),
            ))
            .unwrap();
        network
    }

    fn arp_from(mac: MacAddr, ip: &str) -> Packet {
        let arp = ArpPacket::request(mac, ip.parse().unwrap(), "192.168.1.2".parse().unwrap());
        Packet::parse(build::arp(mac, MacAddr::BROADCAST, &arp)).unwrap()
    }

    #[test]
    fn test_duplicate_host_is_rejected() {
        let network = network();
        let err = network
            .add_host(Arc::new(NetworkHost::new("pc1", HostKind::Plain)))
            .unwrap_err();
        assert!(matches!(err, Error::Topology(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_observe_marks_seen_and_learns_mac() {
        let network = network();
        network.observe(&arp_from(PC1, "192.168.1.10"));

        let pc1 = network.host_by_name("pc1").unwrap();
        assert_eq!(pc1.mac(), Some(PC1));
        assert!(pc1.seen_within(Duration::from_secs(1)));
        assert!(Arc::ptr_eq(&network.watch_host_by_mac(PC1).unwrap(), &pc1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_routed_source_is_not_learned() {
        let network = network();
        let frame = build::tcp_syn(
            GW,
            PC1,
            "10.8.0.7".parse().unwrap(),
            "192.168.1.10".parse().unwrap(),
            22,
        );
        network.observe(&Packet::parse(frame).unwrap());

        let gw = network.host_by_name("gw").unwrap();
        assert!(gw.router().unwrap().vpn_reachable());
        assert!(!gw.has_address("10.8.0.7".parse().unwrap()));
        assert!(network.host_by_ip("10.8.0.7".parse().unwrap()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovered_hosts_expire() {
        let network = network();
        let stranger = MacAddr([0x02, 0, 0, 0, 0, 0x77]);
        network.observe(&arp_from(stranger, "192.168.1.77"));

        let host = network.host_by_mac(stranger).unwrap();
        assert_eq!(host.name(), "discovered-02:00:00:00:00:77");
        assert!(host.watch().is_none());
        assert_eq!(network.hosts().len(), 3);
        assert_eq!(network.hosts()[2].name(), host.name());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(network.host_by_mac(stranger).is_none());
        assert_eq!(network.hosts().len(), 2);
    }

    #[test]
    fn test_own_frames_are_ignored() {
        let network = network();
        network.observe(&arp_from(PROXY, "192.168.1.10"));
        assert_eq!(network.hosts().len(), 2);
        assert!(network.host_by_name("pc1").unwrap().last_seen().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_known_mac_survives_foreign_sender() {
        let network = network();
        let pc2_mac = MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x02]);
        let intruder = MacAddr([0x02, 0, 0, 0, 0, 0x66]);
        network
            .add_host(Arc::new(
                NetworkHost::new("pc2", HostKind::Watch(WatchProfile::default()))
                    .with_mac(pc2_mac)
                    .with_addresses(["192.168.1.20".parse().unwrap()]),
            ))
            .unwrap();

        network.observe(&arp_from(intruder, "192.168.1.20"));

        let pc2 = network.host_by_name("pc2").unwrap();
        assert_eq!(pc2.mac(), Some(pc2_mac));
        assert!(pc2.last_seen().is_none());
        assert!(Arc::ptr_eq(&network.watch_host_by_mac(pc2_mac).unwrap(), &pc2));
        let other = network.host_by_mac(intruder).unwrap();
        assert_eq!(other.name(), "discovered-02:00:00:00:00:66");
        assert!(Arc::ptr_eq(
            &network.host_by_ip("192.168.1.20".parse().unwrap()).unwrap(),
            &pc2
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_never_shadows_configured_name() {
        let network = network();
        let stranger = MacAddr([0x02, 0, 0, 0, 0, 0x77]);
        network
            .add_host(Arc::new(NetworkHost::new(
                "discovered-02:00:00:00:00:77",
                HostKind::Plain,
            )))
            .unwrap();

        network.observe(&arp_from(stranger, "192.168.1.77"));

        assert_eq!(network.hosts().len(), 3);
        let configured = network.host_by_name("discovered-02:00:00:00:00:77").unwrap();
        assert!(configured.mac().is_none());
        assert!(network.host_by_mac(stranger).is_none());
    }

    #[test]
    fn test_hosts_listed_configured_first_by_name() {
        let network = network();
        network
            .add_host(Arc::new(NetworkHost::new("alpha", HostKind::Plain)))
            .unwrap();
        let names: Vec<String> = network
            .hosts()
            .iter()
            .map(|host| host.name().to_string())
            .collect();
        assert_eq!(names, ["alpha", "gw", "pc1"]);
    }
}
