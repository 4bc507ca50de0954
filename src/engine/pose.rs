//! Preemptive impersonation
//!
//! A watch host with a pose latency is probed every latency interval, and
//! once more a latency after it announced its own sleep. When it stays
//! silent its addresses are impersonated until it shows up again.

use super::host::{HostEvent, NetworkHost};
use super::impersonation::{ImpersonationRequest, ImpersonationScope};
use super::network::Network;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Controller task for one host; aborted on drop.
pub struct PoseHandle {
    host: String,
    unmagic: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl PoseHandle {
    /// Start the controller, or `None` if the host has no pose latency.
    pub fn spawn(network: Arc<Network>, host: Arc<NetworkHost>) -> Option<Self> {
        let latency = host.watch()?.pose.latency?;
        let (unmagic, rx) = mpsc::channel(1);
        let name = host.name().to_string();
        let task = tokio::spawn(run(network, host, latency, rx));
        Some(Self {
            host: name,
            unmagic,
            task,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// The host announced its sleep; probe again after the grace period.
    pub fn signal_unmagic(&self) {
        let _ = self.unmagic.try_send(());
    }
}

impl Drop for PoseHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl std::fmt::Debug for PoseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoseHandle").field("host", &self.host).finish()
    }
}

async fn run(
    network: Arc<Network>,
    host: Arc<NetworkHost>,
    latency: Duration,
    mut unmagic: mpsc::Receiver<()>,
) {
    let (seen_tx, mut seen) = mpsc::channel(1);
    let _seen = host.subscribe(move |event| {
        if *event == HostEvent::Seen {
            let _ = seen_tx.try_send(());
        }
    });

    // The first tick completes at once and stands for monitoring start
    let mut ticker = time::interval(latency);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            Some(()) = unmagic.recv() => {
                debug!(host = host.name(), ?latency, "Host went to sleep, waiting before probing");
                time::sleep(latency).await;
            }
        }
        attempt(&network, &host, &mut seen).await;
    }
}

async fn attempt(network: &Network, host: &NetworkHost, seen: &mut mpsc::Receiver<()>) {
    let addresses = host.addresses();
    let engine = network.impersonation();
    if addresses.is_empty() || addresses.iter().all(|ip| engine.is_impersonated(*ip)) {
        return;
    }

    let Some(watch) = host.watch() else {
        return;
    };
    let probe = network
        .reachability()
        .send_for_host(host, watch.pose.timeout, watch.ping.use_icmp)
        .await;
    if probe.is_ok() {
        return;
    }

    // Sightings from before the probe failed say nothing about now
    while seen.try_recv().is_ok() {}

    let mut scope = ImpersonationScope::new(ImpersonationRequest::new(host.mac(), addresses));
    {
        let _capture = network.lock_capture().await;
        if let Err(e) = engine.impersonate(scope.request(), true, None) {
            warn!(host = host.name(), error = %e, "Preemptive impersonation incomplete");
        }
    }
    info!(host = host.name(), "Host is silent, impersonating");

    seen.recv().await;
    debug!(host = host.name(), "Host is back, releasing its addresses");
    scope.set_silent(true);
    let _capture = network.lock_capture().await;
    drop(scope);
}
