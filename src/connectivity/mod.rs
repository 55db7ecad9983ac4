//! Network reachability tracking.
//!
//! One [`ConnectivityMonitor`] holds the authoritative online/offline state. It combines passive
//! signals from the host (the OS "online"/"offline" events) with active probing of several
//! independent endpoints, and notifies subscribers on each distinct transition.

mod monitor;
mod probe;

pub use monitor::{ConnectivityMonitor, ConnectivitySettings, ConnectivityState};
pub use probe::{HttpProbe, ManualOsSignal, OsSignal, ProbeOutcome, ReachabilityProbe, StaticProbe};
