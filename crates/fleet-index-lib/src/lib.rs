//! Fleet Index Library - Core of a shared-mobility (GBFS) aggregator
//!
//! This library keeps a derived geospatial index eventually consistent with a TTL-evicting
//! entity cache, answers radius and bounding-box searches over the aggregated fleet, and
//! gates the feed-polling pipeline behind a cluster-wide leadership lock.
//!
//! # Architecture
//!
//! - **[`Identifier`]**: `CODESPACE:TYPE:VALUE` identifiers and cheap prefix matchers
//! - **[`SpatialIndexMember`]**: delimited member strings stored at index coordinates
//! - **[`EntityCache`]**: TTL key-value store abstraction emitting batched change events
//! - **[`SpatialIndex`]**: per-kind geospatial set of members
//! - **[`Projector`]**: turns cache change events into index upserts and removals
//! - **[`OrphanReconciler`]**: removes index members whose entity is gone from the cache or has changed
//! - **[`GeoSearchEngine`]**: filtered radius and bounding-box queries
//! - **[`Coordinator`]**: lock-based leader election driving a [`FeedUpdateScheduler`]
//! - **[`FleetUpdater`]**: writes provider snapshots into the caches
//!
//! # Consistency
//!
//! Cache writes and index updates are not transactional. The projector heals the index
//! from change events, and the reconciler sweeps whatever expiry notifications were lost.

mod cache;
mod config;
mod entities;
mod id;
mod index_key;
mod leader;
mod projector;
mod query;
mod reconciler;
mod search;
mod spatial;
pub mod ttl;
mod updater;
pub mod utils;

// Public API exports
pub use cache::{CacheEvent, CacheListener, EntityCache, InMemoryCache, SubscriptionId};
pub use config::Config;
pub use entities::{
    FeedProvider, GeofencingZones, PricingPlan, Region, Station, System, Vehicle, VehicleType,
    VehicleTypeAvailability,
};
pub use id::{IdPrefixMatcher, Identifier};
pub use index_key::{
    EntityKind, FormFactor, MemberAttributes, PropulsionType, SpatialIndexMember,
    StationAttributes, VehicleAttributes,
};
pub use leader::{
    Coordinator, DistributedLock, FeedUpdateScheduler, InMemoryLeaseLock, LeaderState, LeaseHandle,
    run_heartbeat,
};
pub use projector::{Indexable, Projector};
pub use query::{
    BoundingBox, SearchParameters, SearchShape, validate_codespaces, validate_count, validate_systems,
};
pub use reconciler::OrphanReconciler;
pub use search::{GeoSearchEngine, StationFilter, VehicleFilter};
pub use spatial::{GeoEntry, InMemorySpatialIndex, SpatialIndex};
pub use updater::{FleetCaches, FleetSnapshot, FleetUpdater, UpdateReport};

/// Error types for the fleet index
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FleetError {
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Malformed spatial index key: {0}")]
    MalformedIndexKey(String),

    #[error("Transient store error: {0}")]
    TransientStore(String),

    #[error("Interrupted while acquiring lock '{0}'")]
    LockAcquisitionInterrupted(String),

    #[error("Invalid query parameters: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, FleetError>;
