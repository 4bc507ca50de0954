//! Configuration resolution
//!
//! Turns a validated [`NetworkConfig`] into a [`NetworkPlan`]: parsed
//! addresses, effective methods with defaults filled in, and one filter
//! chain per watch host.

use super::{
    ActionConfig, Config, HostConfig, HostKindConfig, MethodConfig, NetworkConfig, PolicyConfig,
    ProtocolConfig, RedirectConfig, RuleConfig, RuleKind, ScopeConfig, WakeModeConfig,
};
use crate::capture::NetworkDevice;
use crate::engine::{
    FilterChain, HostFilter, HostKind, Network, NetworkHost, NetworkSettings, PingFilter,
    PingMethod, PoseMethod, RedirectPolicy, RouterFilter, RouterProfile, RuleAction, ServiceFilter,
    ServiceProtocol, SourceMatcher, ThrottleFilter, VirtualHostFilter, VirtualProfile, WakeFlags,
    WakeMethod, WakeMode, WakePolicy, WatchProfile, WatchScope,
};
use crate::neighbor::NeighborCache;
use crate::protocol::{wol, IpCidr, MacAddr, PortRange};
use crate::{Error, Result};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const DEFAULT_VPN_TIMEOUT: Duration = Duration::from_secs(60);

/// Everything needed to bring one network up
pub struct NetworkPlan {
    pub name: String,
    pub interface: String,
    pub address: Option<IpCidr>,
    pub link_local: Option<Ipv6Addr>,
    pub neighbor_cache: bool,
    pub settings: NetworkSettings,
    /// Physical hosts come before the virtual hosts that reference them.
    pub hosts: Vec<Arc<NetworkHost>>,
    pub chains: Vec<(String, FilterChain)>,
}

impl NetworkPlan {
    /// Create the network on `device` and register the planned hosts and chains.
    pub fn build(
        self,
        device: Arc<dyn NetworkDevice>,
        neighbors: Arc<dyn NeighborCache>,
    ) -> Result<Arc<Network>> {
        let network = Network::new(self.name, device, neighbors, self.settings);
        for host in self.hosts {
            network.add_host(host)?;
        }
        for (host, chain) in self.chains {
            network.set_filters(&host, chain);
        }
        Ok(Arc::new(network))
    }
}

impl std::fmt::Debug for NetworkPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkPlan")
            .field("name", &self.name)
            .field("interface", &self.interface)
            .field("address", &self.address)
            .field("hosts", &self.hosts.len())
            .field("chains", &self.chains.len())
            .finish()
    }
}

/// Resolve every network, stopping at the first error.
pub fn resolve(config: &Config) -> Result<Vec<NetworkPlan>> {
    let mut plans: Vec<NetworkPlan> = Vec::with_capacity(config.network.len());
    for network in &config.network {
        if plans.iter().any(|plan| plan.name == network.name) {
            return Err(Error::Topology(format!(
                "network '{}' defined more than once",
                network.name
            )));
        }
        plans.push(resolve_network(network)?);
    }
    Ok(plans)
}

fn resolve_network(config: &NetworkConfig) -> Result<NetworkPlan> {
    let base = NetworkSettings::default();
    let settings = NetworkSettings {
        scope: match config.scope {
            ScopeConfig::Network => WatchScope::Network,
            ScopeConfig::Host => WatchScope::Host,
        },
        throttle: config.throttle_ms.map(Duration::from_millis).unwrap_or(base.throttle),
        discovery_ttl: config
            .discovery_ttl_ms
            .map(Duration::from_millis)
            .unwrap_or(base.discovery_ttl),
        wol_ports: config.wol_ports.clone().unwrap_or(base.wol_ports),
    };
    let address = config
        .address
        .as_deref()
        .map(parse_cidr)
        .transpose()
        .map_err(|e| network_error(config, e))?;
    let link_local = config
        .link_local
        .as_deref()
        .map(parse_link_local)
        .transpose()
        .map_err(|e| network_error(config, e))?;

    let mut by_name: HashMap<&str, Arc<NetworkHost>> = HashMap::new();
    let mut hosts = Vec::with_capacity(config.host.len());
    let (virtuals, physicals): (Vec<&HostConfig>, Vec<&HostConfig>) = config
        .host
        .iter()
        .partition(|host| host.kind == HostKindConfig::Virtual);
    for host_config in physicals.into_iter().chain(virtuals) {
        if by_name.contains_key(host_config.name.as_str()) {
            return Err(Error::Topology(format!(
                "network '{}': host '{}' defined more than once",
                config.name, host_config.name
            )));
        }
        let host = Arc::new(resolve_host(config, host_config, &by_name)?);
        by_name.insert(host_config.name.as_str(), Arc::clone(&host));
        hosts.push(host);
    }

    let chains = resolve_chains(config, &settings, &hosts)?;
    debug!(
        network = %config.name,
        hosts = hosts.len(),
        chains = chains.len(),
        "Network resolved"
    );

    Ok(NetworkPlan {
        name: config.name.clone(),
        interface: config.interface.clone(),
        address,
        link_local,
        neighbor_cache: config.neighbor_cache,
        settings,
        hosts,
        chains,
    })
}

fn resolve_host(
    network: &NetworkConfig,
    config: &HostConfig,
    known: &HashMap<&str, Arc<NetworkHost>>,
) -> Result<NetworkHost> {
    let fail = |e: String| Error::Config(format!("network '{}', host '{}': {}", network.name, config.name, e));

    let watch = || -> Result<WatchProfile> {
        let password = config
            .password
            .as_deref()
            .map(wol::parse_password)
            .transpose()?;
        watch_profile(&network.defaults.overlay(&config.method), password).map_err(fail)
    };

    let kind = match config.kind {
        HostKindConfig::Plain => HostKind::Plain,
        HostKindConfig::Watch => HostKind::Watch(watch()?),
        HostKindConfig::Router => {
            let policy = match config.policy.unwrap_or(PolicyConfig::AllowWakeOnLan) {
                PolicyConfig::AllowWake => WakePolicy::AllowWake,
                PolicyConfig::AllowWakeByProxy => WakePolicy::AllowWakeByProxy,
                PolicyConfig::AllowWakeOnLan => WakePolicy::AllowWakeOnLan,
            };
            let subnets = config
                .vpn_subnets
                .iter()
                .map(|s| parse_cidr(s))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(fail)?;
            let timeout = config
                .vpn_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_VPN_TIMEOUT);
            HostKind::Router(RouterProfile::new(policy, subnets, timeout))
        }
        HostKindConfig::Virtual => {
            let name = config
                .physical
                .as_deref()
                .ok_or_else(|| fail("virtual host requires physical".into()))?;
            let physical = known
                .get(name)
                .filter(|host| matches!(host.kind(), HostKind::Watch(_)))
                .ok_or_else(|| {
                    Error::Topology(format!(
                        "network '{}', host '{}': physical host '{}' is not a watch host",
                        network.name, config.name, name
                    ))
                })?;
            HostKind::Virtual(VirtualProfile {
                watch: watch()?,
                physical: Arc::clone(physical),
                redirect: match config.redirect.unwrap_or(RedirectConfig::Never) {
                    RedirectConfig::Never => RedirectPolicy::Never,
                    RedirectConfig::OnMagicPacket => RedirectPolicy::OnMagicPacket,
                    RedirectConfig::Always => RedirectPolicy::Always,
                },
            })
        }
    };

    let addresses = config
        .addresses
        .iter()
        .map(|s| parse_ip(s))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(fail)?;
    let mut host = NetworkHost::new(config.name.clone(), kind).with_addresses(addresses);
    if let Some(hostname) = &config.hostname {
        host = host.with_hostname(hostname.clone());
    }
    if let Some(mac) = &config.mac {
        host = host.with_mac(parse_mac(mac).map_err(fail)?);
    }
    Ok(host)
}

/// Fill unset method fields with built-in defaults.
fn watch_profile(
    method: &MethodConfig,
    password: Option<Vec<u8>>,
) -> std::result::Result<WatchProfile, String> {
    let ping = PingMethod::default();
    let pose = PoseMethod::default();
    let wake = WakeMethod::default();
    let ms = |value: Option<u64>, default: Duration| value.map(Duration::from_millis).unwrap_or(default);

    Ok(WatchProfile {
        ping: PingMethod {
            timeout: ms(method.ping_timeout_ms, ping.timeout),
            use_icmp: method.use_icmp.unwrap_or(ping.use_icmp),
        },
        pose: PoseMethod {
            timeout: ms(method.pose_timeout_ms, pose.timeout),
            latency: match method.pose_latency_ms {
                Some(0) => None,
                Some(latency) => Some(Duration::from_millis(latency)),
                None => pose.latency,
            },
        },
        wake: WakeMethod {
            mode: match &method.wake_mode {
                Some(modes) => wake_mode(modes)?,
                None => wake.mode,
            },
            port: method.wake_port.unwrap_or(wake.port),
            timeout: ms(method.wake_timeout_ms, wake.timeout),
            latency: ms(method.wake_latency_ms, wake.latency),
            silent: method.silent.unwrap_or(wake.silent),
            forward: method.forward.unwrap_or(wake.forward),
            password,
        },
    })
}

pub(super) fn wake_mode(modes: &[WakeModeConfig]) -> std::result::Result<WakeMode, String> {
    if modes.is_empty() {
        return Err("wake_mode is empty".into());
    }
    if modes.contains(&WakeModeConfig::Auto) {
        if modes.len() > 1 {
            return Err("wake_mode 'auto' cannot be combined with other modes".into());
        }
        return Ok(WakeMode::Auto);
    }
    let mut flags = WakeFlags::default();
    for mode in modes {
        match mode {
            WakeModeConfig::Network => flags.network = true,
            WakeModeConfig::Link => flags.link = true,
            WakeModeConfig::Unicast => flags.unicast = true,
            WakeModeConfig::Auto => {}
        }
    }
    Ok(WakeMode::Explicit(flags))
}

fn resolve_chains(
    config: &NetworkConfig,
    settings: &NetworkSettings,
    hosts: &[Arc<NetworkHost>],
) -> Result<Vec<(String, FilterChain)>> {
    for (index, rule) in config.rule.iter().enumerate() {
        for target in &rule.hosts {
            if !hosts
                .iter()
                .any(|host| host.name() == target && host.watch().is_some())
            {
                return Err(Error::Topology(format!(
                    "network '{}', rule[{}]: '{}' is not a watch host",
                    config.name, index, target
                )));
            }
        }
    }

    let has_router = hosts.iter().any(|host| host.router().is_some());
    let mut chains = Vec::new();
    for host in hosts.iter().filter(|host| host.watch().is_some()) {
        let has_guests = hosts.iter().any(|guest| {
            guest
                .virtual_profile()
                .is_some_and(|v| Arc::ptr_eq(&v.physical, host))
        });

        let mut chain = FilterChain::new().with(ThrottleFilter {
            window: settings.throttle,
        });
        if has_guests {
            chain.push(VirtualHostFilter);
        }
        if has_router {
            chain.push(RouterFilter);
        }
        for (index, rule) in config.rule.iter().enumerate() {
            if rule.hosts.is_empty() || rule.hosts.iter().any(|name| name == host.name()) {
                push_rule(&mut chain, index, rule)
                    .map_err(|e| Error::Config(format!("network '{}', rule[{}]: {}", config.name, index, e)))?;
            }
        }
        chains.push((host.name().to_string(), chain));
    }
    Ok(chains)
}

fn push_rule(chain: &mut FilterChain, index: usize, rule: &RuleConfig) -> std::result::Result<(), String> {
    let name = rule.name.clone().unwrap_or_else(|| format!("rule{}", index));
    let action = match rule.action {
        ActionConfig::Must => RuleAction::Must,
        ActionConfig::MustNot => RuleAction::MustNot,
    };
    let sources = SourceMatcher {
        networks: rule
            .sources
            .iter()
            .map(|s| parse_cidr(s))
            .collect::<std::result::Result<_, _>>()?,
        hosts: rule.source_hosts.clone(),
    };

    match rule.kind {
        RuleKind::Host => {
            if sources == SourceMatcher::default() {
                return Err("host rule needs sources or source_hosts".into());
            }
            chain.push(HostFilter {
                name,
                action,
                sources,
            });
        }
        RuleKind::Service => {
            let protocol = match rule.protocol {
                Some(ProtocolConfig::Tcp) => ServiceProtocol::Tcp,
                Some(ProtocolConfig::Udp) => ServiceProtocol::Udp,
                None => return Err("service rule needs a protocol".into()),
            };
            let ports = rule
                .ports
                .as_deref()
                .ok_or_else(|| "service rule needs ports".to_string())
                .and_then(parse_ports)?;
            chain.push(ServiceFilter {
                name,
                action,
                protocol,
                ports,
                payload: rule.payload.as_ref().map(|p| p.as_bytes().to_vec()),
            });
        }
        RuleKind::Ping => {
            let sources = (sources != SourceMatcher::default()).then_some(sources);
            chain.push(PingFilter {
                name,
                action,
                sources,
            });
        }
    }
    Ok(())
}

fn network_error(config: &NetworkConfig, e: String) -> Error {
    Error::Config(format!("network '{}': {}", config.name, e))
}

pub(super) fn parse_mac(s: &str) -> std::result::Result<MacAddr, String> {
    s.parse::<MacAddr>().map_err(|e| e.to_string())
}

pub(super) fn parse_ip(s: &str) -> std::result::Result<IpAddr, String> {
    s.parse::<IpAddr>()
        .map_err(|_| format!("invalid IP address '{}'", s))
}

pub(super) fn parse_link_local(s: &str) -> std::result::Result<Ipv6Addr, String> {
    match parse_ip(s)? {
        IpAddr::V6(addr) => Ok(addr),
        IpAddr::V4(_) => Err(format!("link_local '{}' is not an IPv6 address", s)),
    }
}

pub(super) fn parse_cidr(s: &str) -> std::result::Result<IpCidr, String> {
    s.parse::<IpCidr>()
}

pub(super) fn parse_ports(s: &str) -> std::result::Result<PortRange, String> {
    s.parse::<PortRange>()
}
