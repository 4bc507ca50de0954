//! Filter chain
//!
//! Every wake request is checked against the target host's chain. A veto
//! from any filter rejects at once. Otherwise a chain containing whitelist
//! rules accepts only if one of them matched. Filters that can only judge
//! unicast IP make the chain defer on anything else.

use super::host::{NetworkHost, WakePolicy};
use super::network::Network;
use super::trigger::magic_payload;
use crate::protocol::packet::Transport;
use crate::protocol::{IpCidr, PortRange, Packet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Result of running the chain over one packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject { filter: String },
    /// Only unicast IP traffic can settle this request.
    NeedMoreEvidence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FilterOutcome {
    pub veto: bool,
    pub matched: bool,
}

impl FilterOutcome {
    pub const PASS: Self = Self {
        veto: false,
        matched: false,
    };
    pub const VETO: Self = Self {
        veto: true,
        matched: false,
    };
    pub const MATCH: Self = Self {
        veto: false,
        matched: true,
    };
}

/// What a filter may consult while judging a packet
pub struct FilterContext<'a> {
    pub network: &'a Network,
    pub host: &'a Arc<NetworkHost>,
    /// Service named by the rule that matched, if any.
    pub service: &'a mut Option<String>,
}

pub trait PacketFilter: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Whether this filter can only judge unicast IP traffic.
    fn needs_ip_unicast(&self) -> bool {
        false
    }

    /// Whether a match is required for the chain to accept.
    fn is_whitelist(&self) -> bool {
        false
    }

    fn should_filter(&self, ctx: &mut FilterContext<'_>, packet: &Packet) -> FilterOutcome;
}

#[derive(Debug, Default)]
pub struct FilterChain {
    filters: Vec<Box<dyn PacketFilter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, filter: impl PacketFilter + 'static) {
        self.filters.push(Box::new(filter));
    }

    pub fn with(mut self, filter: impl PacketFilter + 'static) -> Self {
        self.push(filter);
        self
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.filters.iter().map(|f| f.name())
    }

    pub fn verify(&self, ctx: &mut FilterContext<'_>, packet: &Packet) -> Verdict {
        let mut whitelist = false;
        let mut matched = false;
        let mut needs_unicast = false;

        for filter in &self.filters {
            let outcome = filter.should_filter(ctx, packet);
            if outcome.veto {
                return Verdict::Reject {
                    filter: filter.name().to_string(),
                };
            }
            whitelist |= filter.is_whitelist();
            matched |= outcome.matched;
            needs_unicast |= filter.needs_ip_unicast();
        }

        // A magic packet is an explicit request and needs no corroboration
        let explicit = magic_payload(packet, &ctx.network.settings().wol_ports).is_some();
        if needs_unicast && !packet.is_ip_unicast() && !explicit {
            return Verdict::NeedMoreEvidence;
        }
        if whitelist && !matched {
            return Verdict::Reject {
                filter: "whitelist".to_string(),
            };
        }
        Verdict::Accept
    }
}

/// Whether a matching rule allows or forbids
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Must,
    MustNot,
}

impl RuleAction {
    fn outcome(self, hit: bool) -> FilterOutcome {
        match (self, hit) {
            (RuleAction::Must, true) => FilterOutcome::MATCH,
            (RuleAction::MustNot, true) => FilterOutcome::VETO,
            (_, false) => FilterOutcome::PASS,
        }
    }
}

/// Sources given as address ranges or host names
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceMatcher {
    pub networks: Vec<IpCidr>,
    /// Resolved against the directory on every packet.
    pub hosts: Vec<String>,
}

impl SourceMatcher {
    pub fn matches(&self, network: &Network, packet: &Packet) -> bool {
        let source = packet.source_address();
        if let Some(ip) = source {
            if self.networks.iter().any(|net| net.contains(ip)) {
                return true;
            }
        }
        self.hosts.iter().any(|name| {
            network.host_by_name(name).is_some_and(|host| {
                host.mac() == Some(packet.src_mac())
                    || source.is_some_and(|ip| host.has_address(ip))
            })
        })
    }
}

#[derive(Debug)]
pub struct HostFilter {
    pub name: String,
    pub action: RuleAction,
    pub sources: SourceMatcher,
}

impl PacketFilter for HostFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_whitelist(&self) -> bool {
        self.action == RuleAction::Must
    }

    fn should_filter(&self, ctx: &mut FilterContext<'_>, packet: &Packet) -> FilterOutcome {
        self.action
            .outcome(self.sources.matches(ctx.network, packet))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceProtocol {
    Tcp,
    Udp,
}

#[derive(Debug)]
pub struct ServiceFilter {
    pub name: String,
    pub action: RuleAction,
    pub protocol: ServiceProtocol,
    pub ports: PortRange,
    /// Byte string the transport payload must contain.
    pub payload: Option<Vec<u8>>,
}

impl ServiceFilter {
    fn hit(&self, packet: &Packet) -> bool {
        let port_hit = match (self.protocol, &packet.transport) {
            (ServiceProtocol::Tcp, Transport::Tcp { dst_port, flags, .. }) => {
                flags.is_connection_request() && self.ports.contains(*dst_port)
            }
            (ServiceProtocol::Udp, Transport::Udp { dst_port, .. }) => self.ports.contains(*dst_port),
            _ => false,
        };
        port_hit
            && self.payload.as_ref().is_none_or(|needle| {
                needle.is_empty()
                    || packet
                        .payload()
                        .windows(needle.len())
                        .any(|window| window == needle.as_slice())
            })
    }
}

impl PacketFilter for ServiceFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn needs_ip_unicast(&self) -> bool {
        true
    }

    fn is_whitelist(&self) -> bool {
        self.action == RuleAction::Must
    }

    fn should_filter(&self, ctx: &mut FilterContext<'_>, packet: &Packet) -> FilterOutcome {
        let hit = self.hit(packet);
        if hit && self.action == RuleAction::Must {
            *ctx.service = Some(self.name.clone());
        }
        self.action.outcome(hit)
    }
}

#[derive(Debug)]
pub struct PingFilter {
    pub name: String,
    pub action: RuleAction,
    pub sources: Option<SourceMatcher>,
}

impl PacketFilter for PingFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn needs_ip_unicast(&self) -> bool {
        true
    }

    fn is_whitelist(&self) -> bool {
        self.action == RuleAction::Must
    }

    fn should_filter(&self, ctx: &mut FilterContext<'_>, packet: &Packet) -> FilterOutcome {
        let hit = packet.is_echo_request()
            && self
                .sources
                .as_ref()
                .is_none_or(|sources| sources.matches(ctx.network, packet));
        self.action.outcome(hit)
    }
}

/// Judges traffic relayed by a router against the router's policy
///
/// A frame that is neither unicast IP nor a magic packet is left to the
/// frames that follow and defers the chain. Each frame gathered for the
/// same request is judged on its own, so the first unicast frame settles
/// whether the trigger came through the router or from the link.
#[derive(Debug, Default)]
pub struct RouterFilter;

impl PacketFilter for RouterFilter {
    fn name(&self) -> &str {
        "router"
    }

    fn needs_ip_unicast(&self) -> bool {
        true
    }

    fn should_filter(&self, ctx: &mut FilterContext<'_>, packet: &Packet) -> FilterOutcome {
        let Some(router_host) = ctx.network.host_by_mac(packet.src_mac()) else {
            return FilterOutcome::PASS;
        };
        let Some(router) = router_host.router() else {
            return FilterOutcome::PASS;
        };
        let magic = magic_payload(packet, &ctx.network.settings().wol_ports).is_some();
        if !magic && !packet.is_ip_unicast() {
            return FilterOutcome::PASS;
        }
        let source = packet.src_ip();
        let vpn_client = source.is_some_and(|ip| router.is_vpn_client(ip));

        let allowed = if magic {
            match router.policy {
                WakePolicy::AllowWake | WakePolicy::AllowWakeOnLan => true,
                WakePolicy::AllowWakeByProxy => vpn_client && router.vpn_reachable(),
            }
        } else if source.is_some_and(|ip| router_host.has_address(ip)) {
            router.policy == WakePolicy::AllowWake
        } else if vpn_client {
            match router.policy {
                WakePolicy::AllowWake => true,
                WakePolicy::AllowWakeByProxy => router.vpn_reachable(),
                WakePolicy::AllowWakeOnLan => false,
            }
        } else {
            router.policy == WakePolicy::AllowWake
        };

        if allowed {
            FilterOutcome::PASS
        } else {
            FilterOutcome::VETO
        }
    }
}

/// Keeps a virtual host's own traffic from waking its physical host
#[derive(Debug, Default)]
pub struct VirtualHostFilter;

impl PacketFilter for VirtualHostFilter {
    fn name(&self) -> &str {
        "virtual-host"
    }

    fn should_filter(&self, ctx: &mut FilterContext<'_>, packet: &Packet) -> FilterOutcome {
        let source = packet.source_address();
        let from_guest = ctx.network.hosts().iter().any(|host| {
            host.virtual_profile()
                .is_some_and(|v| Arc::ptr_eq(&v.physical, ctx.host))
                && (host.mac() == Some(packet.src_mac())
                    || source.is_some_and(|ip| host.has_address(ip)))
        });
        if from_guest {
            FilterOutcome::VETO
        } else {
            FilterOutcome::PASS
        }
    }
}

/// Rejects while the wake target was woken within the window
#[derive(Debug)]
pub struct ThrottleFilter {
    pub window: Duration,
}

impl PacketFilter for ThrottleFilter {
    fn name(&self) -> &str {
        "throttle"
    }

    fn should_filter(&self, ctx: &mut FilterContext<'_>, _packet: &Packet) -> FilterOutcome {
        if ctx.host.wake_target().woken_within(self.window) {
            FilterOutcome::VETO
        } else {
            FilterOutcome::PASS
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Accept => write!(f, "accept"),
            Verdict::Reject { filter } => write!(f, "reject by {}", filter),
            Verdict::NeedMoreEvidence => write!(f, "need more evidence"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::mock::RecordingDevice;
    use crate::engine::host::{HostKind, RedirectPolicy, RouterProfile, VirtualProfile, WatchProfile};
    use crate::engine::network::NetworkSettings;
    use crate::neighbor::NoopNeighborCache;
    use crate::protocol::arp::ArpPacket;
    use crate::protocol::packet::build;
    use crate::protocol::tcp::TcpFlags;
    use crate::protocol::wol::MagicPacket;
    use crate::protocol::MacAddr;

    const PROXY: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0xfe]);
    const PC1: MacAddr = MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]);
    const CLIENT: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x05]);
    const GW: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x01]);

    fn lan(policy: WakePolicy) -> (Network, Arc<NetworkHost>) {
        let device = Arc::new(RecordingDevice::new(
            PROXY,
            Some("192.168.1.2/24".parse().unwrap()),
            None,
        ));
        let network = Network::new(
            "lan",
            device,
            Arc::new(NoopNeighborCache),
            NetworkSettings::default(),
        );
        let pc1 = Arc::new(
            NetworkHost::new("pc1", HostKind::Watch(WatchProfile::default()))
                .with_mac(PC1)
                .with_addresses(["192.168.1.10".parse().unwrap()]),
        );
        network.add_host(Arc::clone(&pc1)).unwrap();
        network
            .add_host(Arc::new(
                NetworkHost::new(
                    "gw",
                    HostKind::Router(RouterProfile::new(
                        policy,
                        vec!["10.8.0.0/24".parse().unwrap()],
                        Duration::from_secs(30),
                    )),
                )
                .with_mac(GW)
                .with_addresses(["192.168.1.1".parse().unwrap()]),
            ))
            .unwrap();
        (network, pc1)
    }

    fn syn(src_mac: MacAddr, src: &str, port: u16) -> Packet {
        Packet::parse(build::tcp_syn(
            src_mac,
            PC1,
            src.parse().unwrap(),
            "192.168.1.10".parse().unwrap(),
            port,
        ))
        .unwrap()
    }

    fn verify(chain: &FilterChain, network: &Network, host: &Arc<NetworkHost>, packet: &Packet) -> (Verdict, Option<String>) {
        let mut service = None;
        let mut ctx = FilterContext {
            network,
            host,
            service: &mut service,
        };
        let verdict = chain.verify(&mut ctx, packet);
        (verdict, service)
    }

    fn rdp(action: RuleAction) -> ServiceFilter {
        ServiceFilter {
            name: "rdp".into(),
            action,
            protocol: ServiceProtocol::Tcp,
            ports: PortRange::single(3389),
            payload: None,
        }
    }

    fn deny_client() -> HostFilter {
        HostFilter {
            name: "deny-client".into(),
            action: RuleAction::MustNot,
            sources: SourceMatcher {
                networks: vec!["192.168.1.5/32".parse().unwrap()],
                hosts: vec![],
            },
        }
    }

    #[test]
    fn test_whitelist_without_match_rejects() {
        let (network, pc1) = lan(WakePolicy::AllowWake);
        let chain = FilterChain::new().with(rdp(RuleAction::Must));

        let (verdict, service) = verify(&chain, &network, &pc1, &syn(CLIENT, "192.168.1.5", 22));
        assert_eq!(verdict, Verdict::Reject { filter: "whitelist".into() });
        assert_eq!(service, None);

        let (verdict, service) = verify(&chain, &network, &pc1, &syn(CLIENT, "192.168.1.5", 3389));
        assert_eq!(verdict, Verdict::Accept);
        assert_eq!(service.as_deref(), Some("rdp"));
    }

    #[test]
    fn test_veto_short_circuits() {
        let (network, pc1) = lan(WakePolicy::AllowWake);
        let chain = FilterChain::new()
            .with(rdp(RuleAction::Must))
            .with(deny_client());

        let (verdict, _) = verify(&chain, &network, &pc1, &syn(CLIENT, "192.168.1.5", 3389));
        assert_eq!(verdict, Verdict::Reject { filter: "deny-client".into() });

        let (verdict, _) = verify(&chain, &network, &pc1, &syn(CLIENT, "192.168.1.6", 3389));
        assert_eq!(verdict, Verdict::Accept);
    }

    #[test]
    fn test_non_unicast_needs_more_evidence() {
        let (network, pc1) = lan(WakePolicy::AllowWake);
        let chain = FilterChain::new().with(rdp(RuleAction::Must));

        let arp = ArpPacket::request(CLIENT, "192.168.1.5".parse().unwrap(), "192.168.1.10".parse().unwrap());
        let packet = Packet::parse(build::arp(CLIENT, MacAddr::BROADCAST, &arp)).unwrap();
        let (verdict, _) = verify(&chain, &network, &pc1, &packet);
        assert_eq!(verdict, Verdict::NeedMoreEvidence);

        // A deny rule still applies to the query itself
        let chain = chain.with(deny_client());
        let (verdict, _) = verify(&chain, &network, &pc1, &packet);
        assert!(matches!(verdict, Verdict::Reject { .. }));
    }

    #[test]
    fn test_empty_chain_accepts() {
        let (network, pc1) = lan(WakePolicy::AllowWake);
        let (verdict, _) = verify(&FilterChain::new(), &network, &pc1, &syn(CLIENT, "192.168.1.5", 1));
        assert_eq!(verdict, Verdict::Accept);
    }

    #[test]
    fn test_tcp_service_requires_connection_request() {
        let (network, pc1) = lan(WakePolicy::AllowWake);
        let chain = FilterChain::new().with(rdp(RuleAction::Must));
        let ack = TcpFlags {
            ack: true,
            ..Default::default()
        };
        let packet = Packet::parse(build::tcp_with_flags(
            CLIENT,
            PC1,
            "192.168.1.5".parse().unwrap(),
            "192.168.1.10".parse().unwrap(),
            3389,
            ack,
            &[],
        ))
        .unwrap();
        let (verdict, _) = verify(&chain, &network, &pc1, &packet);
        assert!(matches!(verdict, Verdict::Reject { .. }));
    }

    #[test]
    fn test_service_payload_match() {
        let (network, pc1) = lan(WakePolicy::AllowWake);
        let chain = FilterChain::new().with(ServiceFilter {
            name: "media".into(),
            action: RuleAction::Must,
            protocol: ServiceProtocol::Udp,
            ports: "5000-5010".parse().unwrap(),
            payload: Some(b"PLAY".to_vec()),
        });
        let packet = |payload: &[u8]| {
            Packet::parse(build::udp(
                CLIENT,
                PC1,
                "192.168.1.5".parse().unwrap(),
                "192.168.1.10".parse().unwrap(),
                5004,
                payload,
            ))
            .unwrap()
        };
        assert_eq!(verify(&chain, &network, &pc1, &packet(b"xxPLAYxx")).0, Verdict::Accept);
        assert!(matches!(
            verify(&chain, &network, &pc1, &packet(b"PAUSE")).0,
            Verdict::Reject { .. }
        ));
    }

    #[test]
    fn test_ping_filter_scoped_to_source() {
        let (network, pc1) = lan(WakePolicy::AllowWake);
        let chain = FilterChain::new().with(PingFilter {
            name: "ping-from-gw".into(),
            action: RuleAction::Must,
            sources: Some(SourceMatcher {
                networks: vec![],
                hosts: vec!["gw".into()],
            }),
        });
        let ping = |mac: MacAddr, src: &str| {
            Packet::parse(build::ping(mac, PC1, src.parse().unwrap(), "192.168.1.10".parse().unwrap())).unwrap()
        };
        assert_eq!(verify(&chain, &network, &pc1, &ping(GW, "192.168.1.1")).0, Verdict::Accept);
        assert!(matches!(
            verify(&chain, &network, &pc1, &ping(CLIENT, "192.168.1.5")).0,
            Verdict::Reject { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_router_policies() {
        let chain = FilterChain::new().with(RouterFilter);

        let (network, pc1) = lan(WakePolicy::AllowWakeOnLan);
        let routed = syn(GW, "203.0.113.9", 3389);
        assert!(matches!(verify(&chain, &network, &pc1, &routed).0, Verdict::Reject { .. }));
        let magic = Packet::parse(build::udp(
            GW,
            MacAddr::BROADCAST,
            "192.168.1.1".parse().unwrap(),
            "192.168.1.255".parse().unwrap(),
            9,
            &MagicPacket::new(PC1).to_bytes(),
        ))
        .unwrap();
        assert_eq!(verify(&chain, &network, &pc1, &magic).0, Verdict::Accept);

        let (network, pc1) = lan(WakePolicy::AllowWakeByProxy);
        let vpn = syn(GW, "10.8.0.7", 3389);
        assert!(matches!(verify(&chain, &network, &pc1, &vpn).0, Verdict::Reject { .. }));
        network.observe(&vpn);
        assert_eq!(verify(&chain, &network, &pc1, &vpn).0, Verdict::Accept);
        assert!(matches!(verify(&chain, &network, &pc1, &routed).0, Verdict::Reject { .. }));

        let (network, pc1) = lan(WakePolicy::AllowWake);
        assert_eq!(verify(&chain, &network, &pc1, &routed).0, Verdict::Accept);
        // Not relayed by a router
        assert_eq!(verify(&chain, &network, &pc1, &syn(CLIENT, "192.168.1.5", 22)).0, Verdict::Accept);
    }

    #[tokio::test(start_paused = true)]
    async fn test_router_query_settled_by_first_unicast_frame() {
        let chain = FilterChain::new().with(RouterFilter);
        let (network, pc1) = lan(WakePolicy::AllowWakeOnLan);
        let who_has = ArpPacket::request(GW, "192.168.1.1".parse().unwrap(), "192.168.1.10".parse().unwrap());
        let query = Packet::parse(build::arp(GW, MacAddr::BROADCAST, &who_has)).unwrap();

        assert_eq!(verify(&chain, &network, &pc1, &query).0, Verdict::NeedMoreEvidence);
        // Traffic really relayed by the router is refused by its policy
        assert_eq!(
            verify(&chain, &network, &pc1, &syn(GW, "203.0.113.9", 3389)).0,
            Verdict::Reject { filter: "router".into() }
        );
        // An on-link client is not subject to it
        assert_eq!(
            verify(&chain, &network, &pc1, &syn(CLIENT, "192.168.1.5", 3389)).0,
            Verdict::Accept
        );

        let (network, pc1) = lan(WakePolicy::AllowWake);
        assert_eq!(verify(&chain, &network, &pc1, &query).0, Verdict::NeedMoreEvidence);
        assert_eq!(
            verify(&chain, &network, &pc1, &syn(GW, "203.0.113.9", 3389)).0,
            Verdict::Accept
        );
    }

    #[test]
    fn test_virtual_host_cannot_wake_its_physical_host() {
        let (network, pc1) = lan(WakePolicy::AllowWake);
        let vm_mac = MacAddr([0x02, 0, 0, 0, 0, 0x42]);
        network
            .add_host(Arc::new(
                NetworkHost::new(
                    "vm",
                    HostKind::Virtual(VirtualProfile {
                        watch: WatchProfile::default(),
                        physical: Arc::clone(&pc1),
                        redirect: RedirectPolicy::Never,
                    }),
                )
                .with_mac(vm_mac)
                .with_addresses(["192.168.1.42".parse().unwrap()]),
            ))
            .unwrap();

        let chain = FilterChain::new().with(VirtualHostFilter);
        let (verdict, _) = verify(&chain, &network, &pc1, &syn(vm_mac, "192.168.1.42", 445));
        assert_eq!(verdict, Verdict::Reject { filter: "virtual-host".into() });
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_uses_wake_target() {
        let (network, pc1) = lan(WakePolicy::AllowWake);
        let vm = Arc::new(NetworkHost::new(
            "vm",
            HostKind::Virtual(VirtualProfile {
                watch: WatchProfile::default(),
                physical: Arc::clone(&pc1),
                redirect: RedirectPolicy::Never,
            }),
        ));
        let chain = FilterChain::new().with(ThrottleFilter {
            window: Duration::from_secs(10),
        });
        let packet = syn(CLIENT, "192.168.1.5", 22);

        assert_eq!(verify(&chain, &network, &vm, &packet).0, Verdict::Accept);
        pc1.mark_woken();
        assert!(matches!(verify(&chain, &network, &vm, &packet).0, Verdict::Reject { .. }));
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(verify(&chain, &network, &vm, &packet).0, Verdict::Accept);
    }
}
