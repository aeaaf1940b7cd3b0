//! Configuration for caches, coordination and background maintenance

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the fleet index
///
/// Timing values are fixed at startup; nothing here is derived at runtime.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Config {
    /// Lower bound for vehicle TTLs computed from feed freshness
    pub vehicle_ttl_min: Duration,
    /// Upper bound for vehicle TTLs computed from feed freshness
    pub vehicle_ttl_max: Duration,
    /// Lower bound for station TTLs computed from feed freshness
    pub station_ttl_min: Duration,
    /// TTL for slow-changing reference data (systems, vehicle types, pricing plans, ...)
    pub reference_ttl: Duration,
    /// Name of the leadership lock in the shared store
    pub lock_name: String,
    /// Interval between leadership heartbeats
    pub heartbeat_interval: Duration,
    /// Maximum time a heartbeat waits for the lock
    pub lock_wait: Duration,
    /// Lease granted on each successful acquisition; must exceed `heartbeat_interval`
    pub lock_lease: Duration,
    /// Interval between feed polls while leader
    pub feed_update_interval: Duration,
    /// Interval between orphan sweeps while leader
    pub orphan_sweep_interval: Duration,
    /// Whether the in-memory cache reports TTL expiry as change events
    pub emit_expiry_events: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vehicle_ttl_min: Duration::from_secs(30),
            vehicle_ttl_max: Duration::from_secs(300),
            station_ttl_min: Duration::from_secs(300),
            reference_ttl: Duration::from_secs(24 * 60 * 60),
            lock_name: "leader".to_string(),
            heartbeat_interval: Duration::from_secs(5),
            lock_wait: Duration::from_secs(1),
            lock_lease: Duration::from_secs(15),
            feed_update_interval: Duration::from_secs(30),
            orphan_sweep_interval: Duration::from_secs(60),
            emit_expiry_events: true,
        }
    }
}
