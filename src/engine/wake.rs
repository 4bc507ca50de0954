//! Wake orchestration
//!
//! Every captured frame passes through [`WakeOrchestrator::handle_frame`]
//! under the network's capture lock. A frame that triggers for a host
//! without an outstanding request opens a numbered request that runs in
//! its own task; later triggers for the same host queue up behind it.

use super::events::{Observers, Subscription};
use super::filter::{FilterContext, Verdict};
use super::host::{HostEvent, NetworkHost, WakeFlags, WakeMode};
use super::impersonation::{ImpersonationRequest, ImpersonationScope};
use super::lock;
use super::network::Network;
use super::pose::PoseHandle;
use super::trigger::{classify, detect_unmagic, Trigger, TriggerMethod};
use crate::protocol::ethernet::{self, EthernetHeader};
use crate::protocol::wol::MagicPacket;
use crate::protocol::{ipv6, EtherType, MacAddr, Packet};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, trace, warn};

/// How a wake request finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeOutcome {
    /// Magic packet sent; `latency` until the host answered, unless the
    /// wake method is silent.
    Woken { latency: Option<Duration> },
    /// The host answered before anything was sent.
    FalseAlarm,
    Filtered,
    /// The host came back while evidence was being collected.
    HostReturned,
    /// No accepted unicast traffic arrived within the pose timeout.
    NoEvidence,
    /// No magic packet could be sent.
    NotSent,
    /// The host did not answer within its wake timeout.
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WakeEvent {
    Began {
        host: String,
        sequence: u64,
        method: TriggerMethod,
    },
    Filtered {
        host: String,
        sequence: u64,
        filter: String,
    },
    TimedOut {
        host: String,
        sequence: u64,
    },
    Ended {
        host: String,
        sequence: u64,
        outcome: WakeOutcome,
        service: Option<String>,
    },
}

struct Outstanding {
    sequence: u64,
    queue: mpsc::UnboundedSender<Packet>,
}

type OutstandingMap = Arc<Mutex<HashMap<String, Outstanding>>>;

/// Frees the host's slot when its request task ends, however it ends.
struct OutstandingSlot {
    outstanding: OutstandingMap,
    host: String,
    sequence: u64,
}

impl Drop for OutstandingSlot {
    fn drop(&mut self) {
        let mut outstanding = lock(&self.outstanding);
        if outstanding
            .get(&self.host)
            .is_some_and(|slot| slot.sequence == self.sequence)
        {
            outstanding.remove(&self.host);
        }
    }
}

struct WakeRequest {
    trigger: Trigger,
    sequence: u64,
    /// Frame that opened the request
    packet: Packet,
    service: Option<String>,
    incoming: mpsc::UnboundedReceiver<Packet>,
    /// Frames already read from `incoming`, kept for forwarding
    outgoing: Vec<Packet>,
}

enum Evidence {
    Accepted,
    HostReturned,
    Exhausted,
}

pub struct WakeOrchestrator {
    network: Arc<Network>,
    outstanding: OutstandingMap,
    sequence: AtomicU64,
    poses: Mutex<HashMap<String, PoseHandle>>,
    observers: Observers<WakeEvent>,
}

impl WakeOrchestrator {
    pub fn new(network: Arc<Network>) -> Arc<Self> {
        Arc::new(Self {
            network,
            outstanding: Arc::new(Mutex::new(HashMap::new())),
            sequence: AtomicU64::new(0),
            poses: Mutex::new(HashMap::new()),
            observers: Observers::new(),
        })
    }

    pub fn network(&self) -> &Arc<Network> {
        &self.network
    }

    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&WakeEvent) + Send + Sync + 'static,
    {
        self.observers.subscribe(handler)
    }

    /// Start preemptive impersonation for every watch host that wants it.
    pub fn start_pose(&self) {
        let mut poses = lock(&self.poses);
        for host in self.network.watch_hosts() {
            if poses.contains_key(host.name()) {
                continue;
            }
            if let Some(handle) = PoseHandle::spawn(Arc::clone(&self.network), host) {
                debug!(network = self.network.name(), host = handle.host(), "Pose controller started");
                poses.insert(handle.host().to_string(), handle);
            }
        }
    }

    /// Hosts with a request in flight.
    pub fn outstanding(&self) -> usize {
        lock(&self.outstanding).len()
    }

    pub async fn handle_frame(self: &Arc<Self>, frame: Vec<u8>) {
        let stats = self.network.stats();
        stats.frames.inc();
        let packet = match Packet::parse(frame) {
            Ok(packet) => packet,
            Err(e) => {
                stats.parse_errors.inc();
                trace!(error = %e, "Dropped frame");
                return;
            }
        };

        let _capture = self.network.lock_capture().await;
        self.network.observe(&packet);
        if let Some(host) = detect_unmagic(&self.network, &packet) {
            info!(host = host.name(), "Host announced it is going to sleep");
            host.mark_unseen();
            if let Some(pose) = lock(&self.poses).get(host.name()) {
                pose.signal_unmagic();
            }
        }
        self.network.reachability().observe(&packet);
        self.network.impersonation().handle(&packet);

        let Some(trigger) = classify(&self.network, &packet) else {
            return;
        };
        stats.triggers.inc();
        let host = Arc::clone(&trigger.host);

        if let Some(slot) = lock(&self.outstanding).get(host.name()) {
            trace!(host = host.name(), sequence = slot.sequence, "Queued behind outstanding request");
            let _ = slot.queue.send(packet);
            return;
        }

        let latency = host.watch().map(|w| w.wake.latency).unwrap_or_default();
        if host.seen_within(latency) || host.wake_target().woken_within(latency) {
            trace!(host = host.name(), "Recently seen or woken, trigger ignored");
            return;
        }

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let (queue, incoming) = mpsc::unbounded_channel();
        lock(&self.outstanding).insert(host.name().to_string(), Outstanding { sequence, queue });
        stats.requests.inc();

        self.spawn(WakeRequest {
            trigger,
            sequence,
            packet,
            service: None,
            incoming,
            outgoing: Vec::new(),
        });
    }

    fn spawn(self: &Arc<Self>, request: WakeRequest) {
        let host = request.trigger.host.name().to_string();
        let method = request.trigger.method;
        let sequence = request.sequence;
        let slot = OutstandingSlot {
            outstanding: Arc::clone(&self.outstanding),
            host: host.clone(),
            sequence,
        };

        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            let _slot = slot;
            this.process(request).await;
        });
        tokio::spawn(async move {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!(host = %host, ?method, sequence, "Wake request panicked");
                }
            }
        });
    }

    async fn process(&self, mut request: WakeRequest) {
        let host = Arc::clone(&request.trigger.host);
        let sequence = request.sequence;
        let started = Instant::now();
        self.observers.emit(&WakeEvent::Began {
            host: host.name().to_string(),
            sequence,
            method: request.trigger.method,
        });
        info!(host = host.name(), sequence, method = ?request.trigger.method, "Wake request began");

        let mut claim = None;
        let outcome = self.decide(&mut request, &mut claim).await;
        self.release(claim, outcome == WakeOutcome::HostReturned).await;

        let stats = self.network.stats();
        match outcome {
            WakeOutcome::Woken { latency: Some(_) } => {
                if host.watch().is_some_and(|w| w.wake.forward) {
                    self.forward(&host, &mut request);
                }
            }
            WakeOutcome::FalseAlarm => stats.false_alarms.inc(),
            WakeOutcome::Filtered => stats.filtered.inc(),
            WakeOutcome::TimedOut => {
                stats.timeouts.inc();
                self.observers.emit(&WakeEvent::TimedOut {
                    host: host.name().to_string(),
                    sequence,
                });
            }
            _ => {}
        }

        info!(
            host = host.name(),
            sequence,
            ?outcome,
            service = request.service.as_deref(),
            elapsed = ?started.elapsed(),
            "Wake request ended"
        );
        self.observers.emit(&WakeEvent::Ended {
            host: host.name().to_string(),
            sequence,
            outcome,
            service: request.service.take(),
        });
    }

    async fn decide(
        &self,
        request: &mut WakeRequest,
        claim: &mut Option<ImpersonationScope>,
    ) -> WakeOutcome {
        let host = Arc::clone(&request.trigger.host);
        let engine = self.network.impersonation();

        let impersonated = request
            .trigger
            .destination
            .is_some_and(|ip| engine.is_impersonated(ip));
        if !impersonated && self.network.reachability().test(&host).await {
            debug!(host = host.name(), "Host is awake");
            return WakeOutcome::FalseAlarm;
        }

        if !request.trigger.skip_filters {
            let verdict = self.verify(&host, &mut request.service, &request.packet);
            debug!(host = host.name(), sequence = request.sequence, %verdict, "Filter verdict");
            match verdict {
                Verdict::Accept => {}
                Verdict::Reject { filter } => {
                    self.filtered(request, filter);
                    return WakeOutcome::Filtered;
                }
                Verdict::NeedMoreEvidence => {
                    self.network.stats().need_more_evidence.inc();
                    let scope = ImpersonationScope::new(ImpersonationRequest::new(
                        host.mac(),
                        host.addresses(),
                    ));
                    {
                        let _capture = self.network.lock_capture().await;
                        if let Err(e) = engine.impersonate(scope.request(), false, Some(&request.packet)) {
                            debug!(host = host.name(), error = %e, "Impersonation incomplete");
                        }
                    }
                    *claim = Some(scope);

                    let timeout = host.watch().map(|w| w.pose.timeout).unwrap_or_default();
                    match self.gather(request, &host, timeout).await {
                        Evidence::Accepted => {}
                        Evidence::HostReturned => return WakeOutcome::HostReturned,
                        Evidence::Exhausted => return WakeOutcome::NoEvidence,
                    }
                }
            }
        }

        self.wake_up(&host).await
    }

    fn verify(&self, host: &Arc<NetworkHost>, service: &mut Option<String>, packet: &Packet) -> Verdict {
        let chain = self.network.filters(host);
        let mut ctx = FilterContext {
            network: &self.network,
            host,
            service,
        };
        chain.verify(&mut ctx, packet)
    }

    fn filtered(&self, request: &WakeRequest, filter: String) {
        info!(host = request.trigger.host.name(), sequence = request.sequence, filter = %filter, "Wake request filtered");
        self.observers.emit(&WakeEvent::Filtered {
            host: request.trigger.host.name().to_string(),
            sequence: request.sequence,
            filter,
        });
    }

    /// Read queued frames until one unicast IP frame passes the chain.
    async fn gather(&self, request: &mut WakeRequest, host: &Arc<NetworkHost>, timeout: Duration) -> Evidence {
        let (seen_tx, mut seen) = mpsc::channel(1);
        let _seen = host.subscribe(move |event| {
            if *event == HostEvent::Seen {
                let _ = seen_tx.try_send(());
            }
        });

        enum Next {
            Frame(Packet),
            Seen,
            Closed,
        }

        let deadline = Instant::now() + timeout;
        loop {
            let next = time::timeout_at(deadline, async {
                tokio::select! {
                    packet = request.incoming.recv() => packet.map_or(Next::Closed, Next::Frame),
                    _ = seen.recv() => Next::Seen,
                }
            })
            .await;
            let packet = match next {
                Ok(Next::Frame(packet)) => packet,
                Ok(Next::Seen) => return Evidence::HostReturned,
                Ok(Next::Closed) | Err(_) => return Evidence::Exhausted,
            };

            if !packet.is_ip_unicast() {
                request.outgoing.push(packet);
                continue;
            }
            let verdict = self.verify(host, &mut request.service, &packet);
            request.outgoing.push(packet);
            match verdict {
                Verdict::Accept => return Evidence::Accepted,
                Verdict::Reject { filter } => {
                    debug!(host = host.name(), filter = %filter, "Corroborating frame rejected");
                }
                Verdict::NeedMoreEvidence => {}
            }
        }
    }

    async fn release(&self, claim: Option<ImpersonationScope>, silent: bool) {
        let Some(mut scope) = claim else {
            return;
        };
        scope.set_silent(silent);
        let _capture = self.network.lock_capture().await;
        drop(scope);
    }

    /// Wake `host`, and its physical host first if it is virtual.
    ///
    /// Waits for an answer up to the wake timeout unless the wake method
    /// is silent.
    pub async fn wake_up(&self, host: &Arc<NetworkHost>) -> WakeOutcome {
        let probe = self.network.reachability();
        if let Some(profile) = host.virtual_profile() {
            let physical = &profile.physical;
            if !probe.test(physical).await {
                info!(host = host.name(), physical = physical.name(), "Waking physical host first");
                if !self.send_magic(physical) {
                    return WakeOutcome::NotSent;
                }
                let timeout = physical.watch().map(|w| w.wake.timeout).unwrap_or_default();
                if let Err(e) = probe.poll(physical, timeout).await {
                    debug!(physical = physical.name(), error = %e, "Physical host did not wake");
                    return WakeOutcome::TimedOut;
                }
            }
        }

        if !self.send_magic(host) {
            return WakeOutcome::NotSent;
        }
        let wake = host.watch().map(|w| w.wake.clone()).unwrap_or_default();
        if wake.silent {
            return WakeOutcome::Woken { latency: None };
        }
        match probe.poll(host, wake.timeout).await {
            Ok(latency) => {
                info!(host = host.name(), ?latency, "Host is up");
                WakeOutcome::Woken {
                    latency: Some(latency),
                }
            }
            Err(e) => {
                debug!(host = host.name(), error = %e, "Host did not wake");
                WakeOutcome::TimedOut
            }
        }
    }

    /// Send the magic packet(s) for `host`; returns false if none went out.
    fn send_magic(&self, host: &Arc<NetworkHost>) -> bool {
        let Some(mac) = host.mac() else {
            warn!(host = host.name(), "Hardware address unknown, cannot wake");
            return false;
        };
        let wake = host.watch().map(|w| w.wake.clone()).unwrap_or_default();
        let payload = MagicPacket {
            target: mac,
            password: wake.password.clone(),
        }
        .to_bytes();
        let device = self.network.device();

        let auto = wake.mode == WakeMode::Auto;
        let flags = match wake.mode {
            WakeMode::Explicit(flags) => flags,
            WakeMode::Auto => WakeFlags::default(),
        };
        let mut destinations = Vec::new();
        for ip in host.addresses() {
            let on_link = device.is_on_link(ip);
            if flags.network || (auto && on_link) {
                destinations.push(SocketAddr::new(broadcast_for(ip), wake.port));
            }
            if flags.unicast || (auto && !on_link) {
                destinations.push(SocketAddr::new(ip, wake.port));
            }
        }
        destinations.sort();
        destinations.dedup();

        let mut sent = 0u64;
        for dst in destinations {
            match device.send_datagram(dst, &payload) {
                Ok(()) => {
                    sent += 1;
                    debug!(host = host.name(), %dst, "Magic packet sent");
                }
                Err(e) => debug!(host = host.name(), %dst, error = %e, "Magic packet not sent"),
            }
        }
        if flags.link || (auto && sent == 0) {
            let frame = EthernetHeader::new(MacAddr::BROADCAST, device.mac(), EtherType::WakeOnLan)
                .encapsulate(&payload);
            match device.send_frame(&frame) {
                Ok(()) => {
                    sent += 1;
                    debug!(host = host.name(), "Magic frame sent");
                }
                Err(e) => warn!(host = host.name(), error = %e, "Failed to send magic frame"),
            }
        }

        if sent == 0 {
            warn!(host = host.name(), "No magic packet could be sent");
            return false;
        }
        self.network.stats().wakes.add(sent);
        host.mark_woken();
        let target = host.wake_target();
        if !Arc::ptr_eq(&target, host) {
            target.mark_woken();
        }
        info!(host = host.name(), %mac, sent, "Woke host");
        true
    }

    /// Hand queued unicast traffic to the host that just woke.
    fn forward(&self, host: &NetworkHost, request: &mut WakeRequest) {
        let Some(mac) = host.mac() else {
            return;
        };
        let device = self.network.device();
        let mut frames = vec![request.packet.clone()];
        frames.append(&mut request.outgoing);
        while let Ok(packet) = request.incoming.try_recv() {
            frames.push(packet);
        }

        let mut forwarded = 0u64;
        for packet in frames {
            let for_host = packet.dst_ip().is_some_and(|ip| host.has_address(ip));
            if !packet.is_ip_unicast() || !for_host {
                continue;
            }
            let mut bytes = packet.into_bytes();
            if let Err(e) = ethernet::rewrite_addresses(&mut bytes, mac, device.mac()) {
                debug!(host = host.name(), error = %e, "Frame not forwarded");
                continue;
            }
            match device.send_frame(&bytes) {
                Ok(()) => forwarded += 1,
                Err(e) => warn!(host = host.name(), error = %e, "Failed to forward frame"),
            }
        }
        if forwarded > 0 {
            self.network.stats().forwarded.add(forwarded);
            info!(host = host.name(), forwarded, "Forwarded queued traffic");
        }
    }
}

impl std::fmt::Debug for WakeOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakeOrchestrator")
            .field("network", &self.network.name())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

fn broadcast_for(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::BROADCAST),
        IpAddr::V6(_) => IpAddr::V6(ipv6::ALL_NODES),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::mock::RecordingDevice;
    use crate::engine::filter::{FilterChain, HostFilter, RuleAction, ServiceFilter, ServiceProtocol, SourceMatcher};
    use crate::engine::host::{HostKind, PingMethod, RedirectPolicy, VirtualProfile, WakeMethod, WatchProfile};
    use crate::engine::network::NetworkSettings;
    use crate::neighbor::NoopNeighborCache;
    use crate::protocol::arp::{ArpOp, ArpPacket};
    use crate::protocol::packet::{build, Transport};
    use crate::protocol::PortRange;

    const PROXY: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0xfe]);
    const PC1: MacAddr = MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]);
    const VM: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x42]);
    const CLIENT: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x05]);

    struct Lan {
        device: Arc<RecordingDevice>,
        network: Arc<Network>,
        wake: Arc<WakeOrchestrator>,
        pc1: Arc<NetworkHost>,
        events: Arc<Mutex<Vec<WakeEvent>>>,
        _events: Subscription,
    }

    impl Lan {
        fn events(&self) -> Vec<WakeEvent> {
            lock(&self.events).clone()
        }

        fn outcome(&self) -> Option<WakeOutcome> {
            self.events().into_iter().find_map(|event| match event {
                WakeEvent::Ended { outcome, .. } => Some(outcome),
                _ => None,
            })
        }

        fn magic_targets(&self) -> Vec<MacAddr> {
            self.device
                .datagrams()
                .into_iter()
                .filter_map(|(_, payload)| MagicPacket::parse(&payload).ok())
                .map(|magic| magic.target)
                .collect()
        }
    }

    fn watch() -> WatchProfile {
        WatchProfile {
            ping: PingMethod {
                timeout: Duration::from_millis(500),
                use_icmp: false,
            },
            wake: WakeMethod {
                timeout: Duration::from_secs(10),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn lan() -> Lan {
        let device = Arc::new(RecordingDevice::new(
            PROXY,
            Some("192.168.1.2/24".parse().unwrap()),
            None,
        ));
        let network = Arc::new(Network::new(
            "lan",
            device.clone(),
            Arc::new(NoopNeighborCache),
            NetworkSettings::default(),
        ));
        let pc1 = Arc::new(
            NetworkHost::new("pc1", HostKind::Watch(watch()))
                .with_mac(PC1)
                .with_addresses(["192.168.1.10".parse().unwrap()]),
        );
        network.add_host(pc1.clone()).unwrap();

        let wake = WakeOrchestrator::new(network.clone());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let subscription = wake.subscribe(move |event| lock(&sink).push(event.clone()));
        Lan {
            device,
            network,
            wake,
            pc1,
            events,
            _events: subscription,
        }
    }

    fn rdp_only() -> FilterChain {
        FilterChain::new().with(ServiceFilter {
            name: "rdp".into(),
            action: RuleAction::Must,
            protocol: ServiceProtocol::Tcp,
            ports: PortRange::single(3389),
            payload: None,
        })
    }

    fn syn_to(dst_mac: MacAddr, dst: &str) -> Vec<u8> {
        build::tcp_syn(
            CLIENT,
            dst_mac,
            "192.168.1.5".parse().unwrap(),
            dst.parse().unwrap(),
            3389,
        )
    }

    fn who_has_pc1() -> Vec<u8> {
        let arp = ArpPacket::request(
            CLIENT,
            "192.168.1.5".parse().unwrap(),
            "192.168.1.10".parse().unwrap(),
        );
        build::arp(CLIENT, MacAddr::BROADCAST, &arp)
    }

    fn reply_from(mac: MacAddr, ip: &str) -> Vec<u8> {
        let arp = ArpPacket::reply(mac, ip.parse().unwrap(), PROXY, "192.168.1.2".parse().unwrap());
        build::arp(mac, PROXY, &arp)
    }

    fn sent(device: &RecordingDevice) -> Vec<Packet> {
        device
            .frames()
            .into_iter()
            .filter_map(|frame| Packet::parse(frame).ok())
            .collect()
    }

    fn is_forwarded_syn(packet: &Packet) -> bool {
        packet.src_mac() == PROXY
            && packet.dst_mac() == PC1
            && matches!(packet.transport, Transport::Tcp { dst_port: 3389, .. })
    }

    #[tokio::test(start_paused = true)]
    async fn test_wake_and_forward() {
        let lan = lan();
        lan.wake.handle_frame(syn_to(PC1, "192.168.1.10")).await;
        time::sleep(Duration::from_millis(600)).await;

        let datagrams = lan.device.datagrams();
        assert_eq!(datagrams.len(), 1);
        assert_eq!(datagrams[0].0, "255.255.255.255:9".parse::<SocketAddr>().unwrap());
        assert_eq!(lan.magic_targets(), vec![PC1]);
        assert!(lan.pc1.last_wake().is_some());

        lan.wake.handle_frame(reply_from(PC1, "192.168.1.10")).await;
        time::sleep(Duration::from_millis(10)).await;

        assert_eq!(
            lan.outcome(),
            Some(WakeOutcome::Woken {
                latency: Some(Duration::from_millis(100))
            })
        );
        assert!(sent(&lan.device).iter().any(is_forwarded_syn));
        assert_eq!(lan.network.stats().forwarded.get(), 1);
        assert_eq!(lan.wake.outstanding(), 0);
        assert!(matches!(
            lan.events()[0],
            WakeEvent::Began {
                method: TriggerMethod::Ip,
                sequence: 1,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_back_to_back_frames_open_one_request() {
        let lan = lan();
        lan.wake.handle_frame(syn_to(PC1, "192.168.1.10")).await;
        lan.wake.handle_frame(syn_to(PC1, "192.168.1.10")).await;
        lan.wake.handle_frame(who_has_pc1()).await;

        let stats = lan.network.stats();
        assert_eq!(stats.triggers.get(), 3);
        assert_eq!(stats.requests.get(), 1);
        assert_eq!(lan.wake.outstanding(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_answering_host_is_a_false_alarm() {
        let lan = lan();
        lan.wake.handle_frame(syn_to(PC1, "192.168.1.10")).await;
        time::sleep(Duration::from_millis(100)).await;
        lan.wake.handle_frame(reply_from(PC1, "192.168.1.10")).await;
        time::sleep(Duration::from_millis(10)).await;

        assert_eq!(lan.outcome(), Some(WakeOutcome::FalseAlarm));
        assert!(lan.device.datagrams().is_empty());
        assert_eq!(lan.network.stats().false_alarms.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recently_seen_host_is_not_woken() {
        let lan = lan();
        lan.pc1.mark_seen();
        lan.wake.handle_frame(syn_to(PC1, "192.168.1.10")).await;
        assert_eq!(lan.network.stats().requests.get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_request_reports_filter() {
        let lan = lan();
        lan.network.set_filters(
            "pc1",
            FilterChain::new().with(HostFilter {
                name: "no-lab".into(),
                action: RuleAction::MustNot,
                sources: SourceMatcher {
                    networks: vec!["192.168.1.0/24".parse().unwrap()],
                    hosts: Vec::new(),
                },
            }),
        );
        lan.wake.handle_frame(syn_to(PC1, "192.168.1.10")).await;
        time::sleep(Duration::from_millis(600)).await;

        assert!(lan.events().contains(&WakeEvent::Filtered {
            host: "pc1".into(),
            sequence: 1,
            filter: "no-lab".into(),
        }));
        assert_eq!(lan.outcome(), Some(WakeOutcome::Filtered));
        assert!(lan.device.datagrams().is_empty());
        assert_eq!(lan.network.stats().filtered.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_arp_trigger_waits_for_unicast_evidence() {
        let lan = lan();
        lan.network.set_filters("pc1", rdp_only());
        lan.wake.handle_frame(who_has_pc1()).await;
        time::sleep(Duration::from_millis(600)).await;

        // The request itself was answered so the client talks to us
        assert!(lan.network.impersonation().is_impersonated("192.168.1.10".parse().unwrap()));
        let answered = sent(&lan.device).into_iter().any(|p| {
            p.arp
                .is_some_and(|arp| arp.operation == ArpOp::Reply && arp.sender_mac == PROXY && arp.target_mac == CLIENT)
        });
        assert!(answered);
        assert!(lan.device.datagrams().is_empty());

        lan.wake.handle_frame(syn_to(PROXY, "192.168.1.10")).await;
        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(lan.magic_targets(), vec![PC1]);

        lan.device.clear();
        lan.wake.handle_frame(reply_from(PC1, "192.168.1.10")).await;
        time::sleep(Duration::from_millis(10)).await;

        let frames = sent(&lan.device);
        let corrected = frames.iter().any(|p| {
            p.arp
                .as_ref()
                .is_some_and(|arp| arp.operation == ArpOp::Reply && arp.sender_mac == PC1 && arp.target_mac == CLIENT)
        });
        assert!(corrected, "client must learn the real owner again");
        assert!(frames.iter().any(is_forwarded_syn));
        assert!(!lan.network.impersonation().is_impersonated("192.168.1.10".parse().unwrap()));
        assert!(lan.events().iter().any(|e| matches!(
            e,
            WakeEvent::Ended { service: Some(service), .. } if service == "rdp"
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_host_returning_aborts_silently() {
        let lan = lan();
        lan.network.set_filters("pc1", rdp_only());
        lan.wake.handle_frame(who_has_pc1()).await;
        time::sleep(Duration::from_millis(600)).await;
        assert!(lan.network.impersonation().is_impersonated("192.168.1.10".parse().unwrap()));

        lan.device.clear();
        let chatter = build::udp(
            PC1,
            CLIENT,
            "192.168.1.10".parse().unwrap(),
            "192.168.1.5".parse().unwrap(),
            53,
            b"",
        );
        lan.wake.handle_frame(chatter).await;
        time::sleep(Duration::from_millis(10)).await;

        assert_eq!(lan.outcome(), Some(WakeOutcome::HostReturned));
        assert!(!lan.network.impersonation().is_impersonated("192.168.1.10".parse().unwrap()));
        assert!(lan.device.frames().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_evidence_within_pose_timeout() {
        let lan = lan();
        lan.network.set_filters("pc1", rdp_only());
        lan.wake.handle_frame(who_has_pc1()).await;
        time::sleep(Duration::from_secs(6)).await;

        assert_eq!(lan.outcome(), Some(WakeOutcome::NoEvidence));
        assert_eq!(lan.network.impersonation().active_count(), 0);
        assert!(lan.device.datagrams().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_host_times_out() {
        let lan = lan();
        lan.wake.handle_frame(syn_to(PC1, "192.168.1.10")).await;
        time::sleep(Duration::from_secs(11)).await;

        assert_eq!(lan.outcome(), Some(WakeOutcome::TimedOut));
        assert!(lan.events().contains(&WakeEvent::TimedOut {
            host: "pc1".into(),
            sequence: 1,
        }));
        assert!(!sent(&lan.device).iter().any(is_forwarded_syn));
        assert_eq!(lan.network.stats().timeouts.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_mode_falls_back_to_link_layer() {
        let lan = lan();
        lan.device.refuse_datagrams(true);
        lan.wake.handle_frame(syn_to(PC1, "192.168.1.10")).await;
        time::sleep(Duration::from_millis(600)).await;

        let magic = sent(&lan.device).into_iter().find(|p| {
            EtherType::from_u16(p.ethernet.ethertype) == Some(EtherType::WakeOnLan)
        });
        let magic = magic.expect("link-layer magic frame");
        assert!(magic.dst_mac().is_broadcast());
        assert_eq!(MagicPacket::parse(magic.payload()).unwrap().target, PC1);
        assert_eq!(lan.network.stats().wakes.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmagic_marks_host_unseen() {
        let lan = lan();
        lan.pc1.mark_seen();
        let unmagic = build::udp(
            PC1,
            MacAddr::BROADCAST,
            "192.168.1.10".parse().unwrap(),
            "192.168.1.255".parse().unwrap(),
            9,
            &MagicPacket::new(PC1).to_bytes(),
        );
        lan.wake.handle_frame(unmagic).await;

        assert!(lan.pc1.last_unseen().is_some());
        assert!(!lan.pc1.seen_within(Duration::from_secs(3600)));
        assert_eq!(lan.network.stats().requests.get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_virtual_host_wakes_physical_first() {
        let lan = lan();
        let vm = Arc::new(
            NetworkHost::new(
                "vm",
                HostKind::Virtual(VirtualProfile {
                    watch: watch(),
                    physical: lan.pc1.clone(),
                    redirect: RedirectPolicy::Never,
                }),
            )
            .with_mac(VM)
            .with_addresses(["192.168.1.42".parse().unwrap()]),
        );
        lan.network.add_host(vm.clone()).unwrap();

        lan.wake.handle_frame(syn_to(VM, "192.168.1.42")).await;
        // vm probe, then pc1 probe, then pc1 magic packet
        time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(lan.magic_targets(), vec![PC1]);

        lan.wake.handle_frame(reply_from(PC1, "192.168.1.10")).await;
        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(lan.magic_targets(), vec![PC1, VM]);

        lan.wake.handle_frame(reply_from(VM, "192.168.1.42")).await;
        time::sleep(Duration::from_millis(10)).await;
        assert!(matches!(lan.outcome(), Some(WakeOutcome::Woken { .. })));
        assert!(vm.last_wake().is_some());
    }
}
