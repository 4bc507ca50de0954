//! Engine counters.
//!
//! One [`EngineStats`] is shared by everything attached to a network;
//! counters are exported as key/value pairs and logged on shutdown.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counter for thread-safe increment operations.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Creates a new counter initialized to zero.
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Increments the counter by 1.
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds a value to the counter.
    pub fn add(&self, val: u64) {
        self.0.fetch_add(val, Ordering::Relaxed);
    }

    /// Gets the current value of the counter.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-network engine statistics.
#[derive(Debug, Default)]
pub struct EngineStats {
    /// Frames handed to the orchestrator.
    pub frames: Counter,
    /// Frames dropped because the Ethernet header was malformed.
    pub parse_errors: Counter,
    /// Frames classified as wake triggers.
    pub triggers: Counter,
    /// Wake requests opened.
    pub requests: Counter,
    /// Requests finished because the host turned out to be awake.
    pub false_alarms: Counter,
    /// Requests rejected by a filter.
    pub filtered: Counter,
    /// Requests that had to gather more evidence.
    pub need_more_evidence: Counter,
    /// Magic packets transmitted.
    pub wakes: Counter,
    /// Hosts that did not answer after waking.
    pub timeouts: Counter,
    /// Frames forwarded to a woken host.
    pub forwarded: Counter,
    /// Addresses that entered impersonation.
    pub impersonations: Counter,
    /// ARP and NDP answers sent on behalf of sleeping hosts.
    pub impersonation_replies: Counter,
    /// Reachability probes sent.
    pub probes: Counter,
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exports all counters as key-value pairs.
    pub fn export(&self) -> Vec<(String, u64)> {
        vec![
            ("frames".into(), self.frames.get()),
            ("parse_errors".into(), self.parse_errors.get()),
            ("triggers".into(), self.triggers.get()),
            ("requests".into(), self.requests.get()),
            ("false_alarms".into(), self.false_alarms.get()),
            ("filtered".into(), self.filtered.get()),
            ("need_more_evidence".into(), self.need_more_evidence.get()),
            ("wakes".into(), self.wakes.get()),
            ("timeouts".into(), self.timeouts.get()),
            ("forwarded".into(), self.forwarded.get()),
            ("impersonations".into(), self.impersonations.get()),
            (
                "impersonation_replies".into(),
                self.impersonation_replies.get(),
            ),
            ("probes".into(), self.probes.get()),
        ]
    }
}
