//! Configuration validation
//!
//! Collects every problem at once so `sleepproxy validate` can report them
//! together. Resolution stops at the first error instead.

use super::resolve::{parse_cidr, parse_ip, parse_link_local, parse_mac, parse_ports, wake_mode};
use super::{Config, HostConfig, HostKindConfig, NetworkConfig, RuleKind};
use crate::protocol::wol;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    pub fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn print_diagnostics(&self) {
        for warning in &self.warnings {
            println!("[WARN] {}", warning);
        }
        for error in &self.errors {
            println!("[ERROR] {}", error);
        }
    }
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate configuration and return warnings/errors
pub fn validate(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    if config.network.is_empty() {
        result.error("no [[network]] defined");
    }
    let mut names = HashSet::new();
    for network in &config.network {
        if !names.insert(network.name.as_str()) {
            result.error(format!("network '{}': defined more than once", network.name));
        }
        validate_network(network, &mut result);
    }

    result
}

fn validate_network(network: &NetworkConfig, result: &mut ValidationResult) {
    let prefix = format!("network '{}'", network.name);

    if network.interface.is_empty() {
        result.error(format!("{}: interface not specified", prefix));
    }
    match &network.address {
        None => result.warn(format!(
            "{}: address not specified, probes go out from 0.0.0.0 and nothing is on-link",
            prefix
        )),
        Some(address) => {
            if let Err(e) = parse_cidr(address) {
                result.error(format!("{}: {}", prefix, e));
            }
        }
    }
    if let Some(link_local) = &network.link_local {
        if let Err(e) = parse_link_local(link_local) {
            result.error(format!("{}: link_local: {}", prefix, e));
        }
    }
    if network.wol_ports.as_ref().is_some_and(|ports| ports.is_empty()) {
        result.warn(format!("{}: wol_ports is empty, only EtherType 0x0842 magic packets are seen", prefix));
    }

    let mut hosts: HashMap<&str, &HostConfig> = HashMap::new();
    for host in &network.host {
        if hosts.insert(host.name.as_str(), host).is_some() {
            result.error(format!("{}: host '{}' defined more than once", prefix, host.name));
        }
    }
    for host in &network.host {
        validate_host(&prefix, network, host, &hosts, result);
    }
    validate_rules(&prefix, network, &hosts, result);
}

fn validate_host(
    prefix: &str,
    network: &NetworkConfig,
    host: &HostConfig,
    hosts: &HashMap<&str, &HostConfig>,
    result: &mut ValidationResult,
) {
    let prefix = format!("{}, host '{}'", prefix, host.name);
    let wakeable = matches!(host.kind, HostKindConfig::Watch | HostKindConfig::Virtual);

    match &host.mac {
        Some(mac) => {
            if let Err(e) = parse_mac(mac) {
                result.error(format!("{}: {}", prefix, e));
            }
        }
        None if wakeable => result.warn(format!(
            "{}: no mac, cannot be woken until it is seen on the link",
            prefix
        )),
        None => {}
    }
    for address in &host.addresses {
        if let Err(e) = parse_ip(address) {
            result.error(format!("{}: {}", prefix, e));
        }
    }
    if wakeable && host.addresses.is_empty() {
        result.warn(format!("{}: no addresses, only magic packets can wake it", prefix));
    }

    if let Some(password) = &host.password {
        if let Err(e) = wol::parse_password(password) {
            result.error(format!("{}: {}", prefix, e));
        }
    }

    let method = network.defaults.overlay(&host.method);
    for (field, value) in [
        ("ping_timeout_ms", method.ping_timeout_ms),
        ("pose_timeout_ms", method.pose_timeout_ms),
    ] {
        if value == Some(0) {
            result.error(format!("{}: {} must be greater than 0", prefix, field));
        }
    }
    if let Some(modes) = &method.wake_mode {
        if let Err(e) = wake_mode(modes) {
            result.error(format!("{}: {}", prefix, e));
        }
    }
    if let (Some(latency), Some(timeout)) = (method.pose_latency_ms, method.pose_timeout_ms) {
        if latency > 0 && latency < timeout {
            result.warn(format!(
                "{}: pose_latency_ms ({}) is shorter than pose_timeout_ms ({})",
                prefix, latency, timeout
            ));
        }
    }

    match host.kind {
        HostKindConfig::Virtual => match host.physical.as_deref() {
            None => result.error(format!("{}: virtual host requires physical", prefix)),
            Some(physical) => match hosts.get(physical) {
                None => result.error(format!("{}: physical host '{}' not defined", prefix, physical)),
                Some(target) if target.kind != HostKindConfig::Watch => result.error(format!(
                    "{}: physical host '{}' is not a watch host",
                    prefix, physical
                )),
                Some(_) => {}
            },
        },
        HostKindConfig::Router => {
            if host.policy.is_none() {
                result.warn(format!(
                    "{}: policy not specified, using allow-wake-on-lan",
                    prefix
                ));
            }
            for subnet in &host.vpn_subnets {
                if let Err(e) = parse_cidr(subnet) {
                    result.error(format!("{}: vpn_subnets: {}", prefix, e));
                }
            }
        }
        _ => {}
    }

    if host.kind != HostKindConfig::Virtual && (host.physical.is_some() || host.redirect.is_some()) {
        result.warn(format!("{}: physical/redirect only apply to virtual hosts", prefix));
    }
    if host.kind != HostKindConfig::Router && (host.policy.is_some() || !host.vpn_subnets.is_empty()) {
        result.warn(format!("{}: policy/vpn_subnets only apply to routers", prefix));
    }
}

fn validate_rules(
    prefix: &str,
    network: &NetworkConfig,
    hosts: &HashMap<&str, &HostConfig>,
    result: &mut ValidationResult,
) {
    for (i, rule) in network.rule.iter().enumerate() {
        let prefix = format!("{}, rule[{}]", prefix, i);

        for target in &rule.hosts {
            match hosts.get(target.as_str()) {
                None => result.error(format!("{}: host '{}' not defined", prefix, target)),
                Some(host)
                    if !matches!(host.kind, HostKindConfig::Watch | HostKindConfig::Virtual) =>
                {
                    result.error(format!("{}: host '{}' cannot be woken", prefix, target))
                }
                Some(_) => {}
            }
        }
        for source in &rule.sources {
            if let Err(e) = parse_cidr(source) {
                result.error(format!("{}: sources: {}", prefix, e));
            }
        }
        for source in &rule.source_hosts {
            if !hosts.contains_key(source.as_str()) {
                result.warn(format!(
                    "{}: source host '{}' is not configured, it must be discovered",
                    prefix, source
                ));
            }
        }

        match rule.kind {
            RuleKind::Host => {
                if rule.sources.is_empty() && rule.source_hosts.is_empty() {
                    result.error(format!("{}: host rule needs sources or source_hosts", prefix));
                }
            }
            RuleKind::Service => {
                if rule.protocol.is_none() {
                    result.error(format!("{}: service rule needs a protocol", prefix));
                }
                match &rule.ports {
                    None => result.error(format!("{}: service rule needs ports", prefix)),
                    Some(ports) => {
                        if let Err(e) = parse_ports(ports) {
                            result.error(format!("{}: {}", prefix, e));
                        }
                    }
                }
            }
            RuleKind::Ping => {
                if rule.ports.is_some() || rule.protocol.is_some() {
                    result.warn(format!("{}: ping rule ignores protocol and ports", prefix));
                }
            }
        }
    }
}
