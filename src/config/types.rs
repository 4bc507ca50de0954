//! Configuration types
//!
//! Durations are integer milliseconds. Addresses, MACs, prefixes and port
//! ranges stay strings here and are parsed during resolution so errors can
//! name the offending entry.

use crate::telemetry::LogConfig;
use serde::Deserialize;

/// User-defined configuration (sleepproxy.toml)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LogConfig,
    #[serde(default)]
    pub network: Vec<NetworkConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    pub name: String,
    pub interface: String,
    /// The proxy's own address and prefix on this link, e.g. "192.168.1.2/24"
    pub address: Option<String>,
    /// IPv6 link-local source; read from the interface when absent
    pub link_local: Option<String>,
    #[serde(default)]
    pub scope: ScopeConfig,
    pub throttle_ms: Option<u64>,
    pub discovery_ttl_ms: Option<u64>,
    pub wol_ports: Option<Vec<u16>>,
    /// Pin impersonated addresses in the kernel neighbor cache
    #[serde(default = "default_true")]
    pub neighbor_cache: bool,
    #[serde(default)]
    pub defaults: MethodConfig,
    #[serde(default)]
    pub host: Vec<HostConfig>,
    #[serde(default)]
    pub rule: Vec<RuleConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeConfig {
    #[default]
    Network,
    Host,
}

/// Ping, pose and wake settings; every field may be left to the level above
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct MethodConfig {
    pub ping_timeout_ms: Option<u64>,
    pub use_icmp: Option<bool>,
    pub pose_timeout_ms: Option<u64>,
    /// Quiet interval before preemptive impersonation; 0 disables it
    pub pose_latency_ms: Option<u64>,
    pub wake_mode: Option<Vec<WakeModeConfig>>,
    pub wake_port: Option<u16>,
    pub wake_timeout_ms: Option<u64>,
    pub wake_latency_ms: Option<u64>,
    pub silent: Option<bool>,
    pub forward: Option<bool>,
}

impl MethodConfig {
    /// Fields set in `over` win, the rest come from `self`.
    pub fn overlay(&self, over: &MethodConfig) -> MethodConfig {
        MethodConfig {
            ping_timeout_ms: over.ping_timeout_ms.or(self.ping_timeout_ms),
            use_icmp: over.use_icmp.or(self.use_icmp),
            pose_timeout_ms: over.pose_timeout_ms.or(self.pose_timeout_ms),
            pose_latency_ms: over.pose_latency_ms.or(self.pose_latency_ms),
            wake_mode: over.wake_mode.clone().or_else(|| self.wake_mode.clone()),
            wake_port: over.wake_port.or(self.wake_port),
            wake_timeout_ms: over.wake_timeout_ms.or(self.wake_timeout_ms),
            wake_latency_ms: over.wake_latency_ms.or(self.wake_latency_ms),
            silent: over.silent.or(self.silent),
            forward: over.forward.or(self.forward),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WakeModeConfig {
    Auto,
    Network,
    Link,
    Unicast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostKindConfig {
    #[default]
    Plain,
    Watch,
    Router,
    Virtual,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HostConfig {
    pub name: String,
    pub hostname: Option<String>,
    #[serde(default)]
    pub kind: HostKindConfig,
    pub mac: Option<String>,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub method: MethodConfig,
    /// SecureOn password, as a MAC or dotted quad
    pub password: Option<String>,

    // virtual hosts
    pub physical: Option<String>,
    pub redirect: Option<RedirectConfig>,

    // routers
    pub policy: Option<PolicyConfig>,
    #[serde(default)]
    pub vpn_subnets: Vec<String>,
    pub vpn_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RedirectConfig {
    Never,
    OnMagicPacket,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyConfig {
    AllowWake,
    AllowWakeByProxy,
    AllowWakeOnLan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    Host,
    Service,
    Ping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionConfig {
    #[default]
    Must,
    MustNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolConfig {
    Tcp,
    Udp,
}

/// Filter rule attached to watch hosts
#[derive(Debug, Clone, Deserialize)]
pub struct RuleConfig {
    pub kind: RuleKind,
    pub name: Option<String>,
    #[serde(default)]
    pub action: ActionConfig,
    /// Watch hosts the rule applies to; all of them when empty
    #[serde(default)]
    pub hosts: Vec<String>,
    /// Source prefixes
    #[serde(default)]
    pub sources: Vec<String>,
    /// Source hosts by name
    #[serde(default)]
    pub source_hosts: Vec<String>,
    pub protocol: Option<ProtocolConfig>,
    /// "22" or "8000-8080"
    pub ports: Option<String>,
    pub payload: Option<String>,
}

fn default_true() -> bool {
    true
}
