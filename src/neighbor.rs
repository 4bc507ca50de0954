//! Operating-system neighbor cache
//!
//! While an address is impersonated the proxy's own stack must keep sending
//! to the real owner, so the kernel entry is pinned to the owner's MAC and
//! released again afterwards. Both calls are fire-and-forget.

use crate::protocol::MacAddr;
use std::net::IpAddr;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub trait NeighborCache: Send + Sync {
    fn update(&self, ip: IpAddr, mac: MacAddr);
    fn delete(&self, ip: IpAddr);
}

/// Cache that does nothing, for host-only scope and tests
#[derive(Debug, Default)]
pub struct NoopNeighborCache;

impl NeighborCache for NoopNeighborCache {
    fn update(&self, _ip: IpAddr, _mac: MacAddr) {}
    fn delete(&self, _ip: IpAddr) {}
}

#[derive(Debug)]
enum NeighborOp {
    Update(IpAddr, MacAddr),
    Delete(IpAddr),
}

/// Drives `ip neigh` from a single worker so operations apply in order
pub struct IpNeighCache {
    tx: mpsc::UnboundedSender<NeighborOp>,
}

impl IpNeighCache {
    /// Spawn the worker for `interface`. Must be called inside a runtime.
    pub fn spawn(interface: &str) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let interface = interface.to_string();
        tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                run(&interface, op).await;
            }
        });
        Self { tx }
    }

    fn submit(&self, op: NeighborOp) {
        if self.tx.send(op).is_err() {
            warn!("Neighbor cache worker is gone");
        }
    }
}

impl NeighborCache for IpNeighCache {
    fn update(&self, ip: IpAddr, mac: MacAddr) {
        self.submit(NeighborOp::Update(ip, mac));
    }

    fn delete(&self, ip: IpAddr) {
        self.submit(NeighborOp::Delete(ip));
    }
}

fn command_args(interface: &str, op: &NeighborOp) -> Vec<String> {
    match op {
        NeighborOp::Update(ip, mac) => vec![
            "neigh".into(),
            "replace".into(),
            ip.to_string(),
            "lladdr".into(),
            mac.to_string(),
            "dev".into(),
            interface.into(),
            "nud".into(),
            "permanent".into(),
        ],
        NeighborOp::Delete(ip) => vec![
            "neigh".into(),
            "del".into(),
            ip.to_string(),
            "dev".into(),
            interface.into(),
        ],
    }
}

async fn run(interface: &str, op: NeighborOp) {
    let args = command_args(interface, &op);
    match Command::new("ip").args(&args).output().await {
        Ok(output) if output.status.success() => {
            debug!(interface, ?op, "Neighbor cache updated");
        }
        Ok(output) => {
            warn!(
                interface,
                ?op,
                status = %output.status,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "ip neigh failed"
            );
        }
        Err(e) => warn!(interface, ?op, error = %e, "Failed to run ip neigh"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_args() {
        let mac: MacAddr = "aa:bb:cc:dd:ee:01".parse().unwrap();
        let args = command_args(
            "eth0",
            &NeighborOp::Update("192.168.1.10".parse().unwrap(), mac),
        );
        assert_eq!(
            args.join(" "),
            "neigh replace 192.168.1.10 lladdr aa:bb:cc:dd:ee:01 dev eth0 nud permanent"
        );
    }

    #[test]
    fn test_delete_args() {
        let args = command_args("eth0", &NeighborOp::Delete("fe80::1".parse().unwrap()));
        assert_eq!(args.join(" "), "neigh del fe80::1 dev eth0");
    }
}
