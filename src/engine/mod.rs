//! Sleep proxy engine
//!
//! Tracks who is on the link, answers for hosts that went to sleep and
//! wakes them when traffic that passes their filters asks for them.

mod address_table;
mod events;
mod filter;
mod host;
mod impersonation;
mod network;
mod pose;
mod reachability;
mod trigger;
mod wake;

pub use address_table::{AddressTable, TableEvent};
pub use events::{Observers, Subscription};
pub use filter::{
    FilterChain, FilterContext, FilterOutcome, HostFilter, PacketFilter, PingFilter, RouterFilter,
    RuleAction, ServiceFilter, ServiceProtocol, SourceMatcher, ThrottleFilter, Verdict,
    VirtualHostFilter,
};
pub use host::{
    HostEvent, HostKind, NetworkHost, PingMethod, PoseMethod, RedirectPolicy, RouterProfile,
    VirtualProfile, WakeFlags, WakeMethod, WakeMode, WakePolicy, WatchProfile,
};
pub use impersonation::{ClaimEvent, ImpersonationEngine, ImpersonationRequest, ImpersonationScope};
pub use network::{Network, NetworkSettings, WatchScope};
pub use pose::PoseHandle;
pub use reachability::ReachabilityProbe;
pub use trigger::{classify, detect_unmagic, magic_payload, Trigger, TriggerMethod};
pub use wake::{WakeEvent, WakeOrchestrator, WakeOutcome};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, carrying on with the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
