//! Feed snapshot updater - the single writer of the entity caches
//!
//! A [`FleetSnapshot`] is one poll of one provider. Applying it:
//!
//! - qualifies vehicle and station ids as `CODESPACE:TYPE:VALUE` identifiers, dropping
//!   entities whose id cannot be qualified (with a warning);
//! - drops duplicate vehicle and station ids (first one wins, with a warning);
//! - removes entities the provider stopped reporting since the previous snapshot, or, with
//!   no previous snapshot, cached entities of the same system missing from this one;
//! - writes the rest with a TTL derived from the feed's freshness.
//!
//! The spatial indexes are not touched here; projectors follow the cache events.

use crate::cache::{EntityCache, InMemoryCache};
use crate::config::Config;
use crate::entities::{
    FeedProvider, GeofencingZones, PricingPlan, Region, Station, System, Vehicle, VehicleType,
};
use crate::id::{IdPrefixMatcher, Identifier};
use crate::ttl::{compute_ttl, unix_now};
use crate::Result;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// One provider's feeds at one point in time
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct FleetSnapshot {
    pub provider: FeedProvider,
    /// Unix seconds at which the provider last updated its status feeds
    pub last_updated: u64,
    /// Seconds the status feeds stay valid after `last_updated`
    pub ttl: u64,
    pub vehicles: Vec<Vehicle>,
    pub stations: Vec<Station>,
    pub system: Option<System>,
    pub vehicle_types: Vec<VehicleType>,
    pub pricing_plans: Vec<PricingPlan>,
    pub regions: Vec<Region>,
    pub geofencing_zones: Option<GeofencingZones>,
}

/// What one snapshot changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpdateReport {
    pub vehicles_written: usize,
    pub vehicles_removed: usize,
    pub stations_written: usize,
    pub stations_removed: usize,
    pub duplicates_dropped: usize,
    /// Vehicles and stations whose id could not be qualified
    pub invalid_ids_dropped: usize,
}

/// All entity caches of a node
#[derive(Clone)]
pub struct FleetCaches {
    pub vehicles: Arc<dyn EntityCache<Vehicle>>,
    pub stations: Arc<dyn EntityCache<Station>>,
    pub systems: Arc<dyn EntityCache<System>>,
    pub vehicle_types: Arc<dyn EntityCache<VehicleType>>,
    pub pricing_plans: Arc<dyn EntityCache<PricingPlan>>,
    pub regions: Arc<dyn EntityCache<Region>>,
    pub geofencing_zones: Arc<dyn EntityCache<GeofencingZones>>,
}

impl FleetCaches {
    /// Process-local caches for every entity type
    pub fn in_memory(config: &Config) -> Self {
        fn cache<T: Clone + Send + Sync + 'static>(name: &str, config: &Config) -> Arc<InMemoryCache<T>> {
            Arc::new(InMemoryCache::new(name).with_expiry_events(config.emit_expiry_events))
        }
        Self {
            vehicles: cache::<Vehicle>("vehicles", config),
            stations: cache::<Station>("stations", config),
            systems: cache::<System>("systems", config),
            vehicle_types: cache::<VehicleType>("vehicle_types", config),
            pricing_plans: cache::<PricingPlan>("pricing_plans", config),
            regions: cache::<Region>("regions", config),
            geofencing_zones: cache::<GeofencingZones>("geofencing_zones", config),
        }
    }
}

/// Writes provider snapshots into the entity caches
pub struct FleetUpdater {
    caches: FleetCaches,
    config: Config,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl FleetUpdater {
    pub fn new(caches: FleetCaches, config: Config) -> Self {
        Self { caches, config }
    }

    #[inline]
    pub fn caches(&self) -> &FleetCaches {
        &self.caches
    }

    /// Apply one snapshot, given the one applied before it for the same provider
    pub fn apply_snapshot(
        &self,
        previous: Option<&FleetSnapshot>,
        snapshot: &FleetSnapshot,
    ) -> Result<UpdateReport> {
        self.apply_snapshot_at(unix_now(), previous, snapshot)
    }

    fn apply_snapshot_at(
        &self,
        now: u64,
        previous: Option<&FleetSnapshot>,
        snapshot: &FleetSnapshot,
    ) -> Result<UpdateReport> {
        let provider = &snapshot.provider;
        let mut report = UpdateReport::default();

        self.write_reference_data(snapshot)?;

        let vehicle_ids = IdMapper::new(&provider.codespace, "Vehicle")?;
        let (vehicles, invalid) = vehicle_ids.map_all(&snapshot.vehicles, |v| &mut v.id);
        report.invalid_ids_dropped += invalid;
        let mapped = vehicles.len();
        let vehicles = dedup_by_id(&vehicles, |v| &v.id);
        report.duplicates_dropped += mapped - vehicles.len();
        let stale = stale_ids(
            self.caches.vehicles.as_ref(),
            previous.map(|p| vehicle_ids.map_known(p.vehicles.iter().map(|v| v.id.as_str()))),
            &vehicles,
            |v| &v.id,
            |v| v.provider.system_id == provider.system_id,
        )?;
        if !stale.is_empty() {
            tracing::debug!("Removing {} vehicles of {} from cache", stale.len(), provider.system_id);
            self.caches.vehicles.remove_all(&stale)?;
        }
        report.vehicles_removed = stale.len();

        let ttl = compute_ttl(
            now,
            snapshot.last_updated,
            snapshot.ttl,
            self.config.vehicle_ttl_min,
            Some(self.config.vehicle_ttl_max),
        );
        report.vehicles_written = vehicles.len();
        if !vehicles.is_empty() {
            let entries = vehicles.into_iter().map(|v| (v.id.clone(), v)).collect();
            self.caches.vehicles.put_all(entries, ttl)?;
        }

        let station_ids = IdMapper::new(&provider.codespace, "Station")?;
        let (stations, invalid) = station_ids.map_all(&snapshot.stations, |s| &mut s.id);
        report.invalid_ids_dropped += invalid;
        let mapped = stations.len();
        let stations = dedup_by_id(&stations, |s| &s.id);
        report.duplicates_dropped += mapped - stations.len();
        let stale = stale_ids(
            self.caches.stations.as_ref(),
            previous.map(|p| station_ids.map_known(p.stations.iter().map(|s| s.id.as_str()))),
            &stations,
            |s| &s.id,
            |s| s.provider.system_id == provider.system_id,
        )?;
        if !stale.is_empty() {
            tracing::debug!("Removing {} stations of {} from cache", stale.len(), provider.system_id);
            self.caches.stations.remove_all(&stale)?;
        }
        report.stations_removed = stale.len();

        let ttl = compute_ttl(
            now,
            snapshot.last_updated,
            snapshot.ttl,
            self.config.station_ttl_min,
            None,
        );
        report.stations_written = stations.len();
        if !stations.is_empty() {
            let entries = stations.into_iter().map(|s| (s.id.clone(), s)).collect();
            self.caches.stations.put_all(entries, ttl)?;
        }

        if report.invalid_ids_dropped > 0 {
            tracing::warn!(
                "Dropped {} entities with invalid ids in feed from {}",
                report.invalid_ids_dropped,
                provider.system_id
            );
        }
        if report.duplicates_dropped > 0 {
            tracing::warn!(
                "Dropped {} duplicate entities in feed from {}",
                report.duplicates_dropped,
                provider.system_id
            );
        }
        Ok(report)
    }

    fn write_reference_data(&self, snapshot: &FleetSnapshot) -> Result<()> {
        let ttl = self.config.reference_ttl;
        if let Some(system) = &snapshot.system {
            self.caches.systems.put(system.id.clone(), system.clone(), ttl)?;
        }
        if let Some(zones) = &snapshot.geofencing_zones {
            self.caches
                .geofencing_zones
                .put(zones.system_id.clone(), zones.clone(), ttl)?;
        }
        put_keyed(self.caches.vehicle_types.as_ref(), &snapshot.vehicle_types, |t| &t.id, ttl)?;
        put_keyed(self.caches.pricing_plans.as_ref(), &snapshot.pricing_plans, |p| &p.id, ttl)?;
        put_keyed(self.caches.regions.as_ref(), &snapshot.regions, |r| &r.id, ttl)
    }

    /// Drop every vehicle, station, system and geofencing entry of a system.
    ///
    /// Used when a provider is no longer configured. Shared reference data (vehicle types,
    /// pricing plans, regions) is left to expire.
    pub fn clear_system(&self, system_id: &str) -> Result<UpdateReport> {
        let vehicles = keys_where(self.caches.vehicles.as_ref(), |v| &v.id, |v| {
            v.provider.system_id == system_id
        })?;
        let stations = keys_where(self.caches.stations.as_ref(), |s| &s.id, |s| {
            s.provider.system_id == system_id
        })?;

        self.caches.vehicles.remove_all(&vehicles)?;
        self.caches.stations.remove_all(&stations)?;
        self.caches.systems.remove(system_id)?;
        self.caches.geofencing_zones.remove(system_id)?;

        tracing::info!(
            "Cleared {} vehicles and {} stations of system {}",
            vehicles.len(),
            stations.len(),
            system_id
        );
        Ok(UpdateReport {
            vehicles_removed: vehicles.len(),
            stations_removed: stations.len(),
            ..Default::default()
        })
    }
}

/// Qualifies raw feed ids of one entity type for one codespace
struct IdMapper {
    codespace: String,
    entity_type: &'static str,
    qualified: IdPrefixMatcher,
}

impl IdMapper {
    fn new(codespace: &str, entity_type: &'static str) -> Result<Self> {
        Ok(Self {
            codespace: codespace.to_string(),
            entity_type,
            qualified: IdPrefixMatcher::new(Some(codespace), Some(entity_type))?,
        })
    }

    /// Keep ids already qualified for this codespace and type, prefix the others
    fn map(&self, raw: &str) -> Result<String> {
        if self.qualified.matches(raw) {
            Identifier::parse(raw)?;
            Ok(raw.to_string())
        } else {
            Identifier::build(&self.codespace, self.entity_type, raw)
        }
    }

    /// Entities with qualified ids, and how many were dropped
    fn map_all<T: Clone>(&self, entities: &[T], id: impl Fn(&mut T) -> &mut String) -> (Vec<T>, usize) {
        let mut dropped = 0;
        let mapped = entities
            .iter()
            .filter_map(|entity| {
                let mut entity = entity.clone();
                let slot = id(&mut entity);
                match self.map(slot) {
                    Ok(qualified) => {
                        *slot = qualified;
                        Some(entity)
                    }
                    Err(e) => {
                        tracing::warn!("Dropping {} with id '{}': {}", self.entity_type, slot, e);
                        dropped += 1;
                        None
                    }
                }
            })
            .collect();
        (mapped, dropped)
    }

    /// Qualified ids of a previous snapshot; ids that never made it into the cache are skipped
    fn map_known<'a>(&self, raw: impl Iterator<Item = &'a str>) -> HashSet<String> {
        raw.filter_map(|id| self.map(id).ok()).collect()
    }
}

fn dedup_by_id<T: Clone>(entities: &[T], id: impl Fn(&T) -> &str) -> Vec<T> {
    let mut seen = HashSet::with_capacity(entities.len());
    entities
        .iter()
        .filter(|e| seen.insert(id(*e)))
        .cloned()
        .collect()
}

/// Ids to remove before writing `current`.
///
/// With a previous snapshot: ids it listed that `current` no longer does. Without one: cached
/// entities of the same system that `current` does not list.
fn stale_ids<T>(
    cache: &dyn EntityCache<T>,
    previous: Option<HashSet<String>>,
    current: &[T],
    id: impl Fn(&T) -> &str,
    same_system: impl Fn(&T) -> bool,
) -> Result<Vec<String>> {
    let current: HashSet<&str> = current.iter().map(&id).collect();
    let mut stale: Vec<String> = match previous {
        Some(previous) => previous
            .into_iter()
            .filter(|old| !current.contains(old.as_str()))
            .collect(),
        None => keys_where(cache, &id, |e| same_system(e) && !current.contains(id(e)))?,
    };
    stale.sort_unstable();
    Ok(stale)
}

fn keys_where<T>(
    cache: &dyn EntityCache<T>,
    id: impl Fn(&T) -> &str,
    keep: impl Fn(&T) -> bool,
) -> Result<Vec<String>> {
    Ok(cache
        .values()?
        .iter()
        .filter(|e| keep(*e))
        .map(|e| id(e).to_string())
        .collect())
}

fn put_keyed<T: Clone>(
    cache: &dyn EntityCache<T>,
    entities: &[T],
    id: impl Fn(&T) -> &str,
    ttl: std::time::Duration,
) -> Result<()> {
    if entities.is_empty() {
        return Ok(());
    }
    let entries = entities.iter().map(|e| (id(e).to_string(), e.clone())).collect();
    cache.put_all(entries, ttl)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::fixtures::*;
    use std::time::Duration;

    fn create_test_snapshot(vehicle_ids: &[&str]) -> FleetSnapshot {
        FleetSnapshot {
            provider: create_test_provider("TST"),
            last_updated: 1_000,
            ttl: 60,
            vehicles: vehicle_ids
                .iter()
                .map(|id| create_test_vehicle(id, 10.0, 59.9))
                .collect(),
            system: Some(System {
                id: "TST:System:1".to_string(),
                name: "Test system".to_string(),
                operator_id: "TST:Operator:1".to_string(),
                language: Some("en".to_string()),
                timezone: None,
            }),
            ..Default::default()
        }
    }

    fn create_test_updater() -> FleetUpdater {
        let config = Config::default();
        FleetUpdater::new(FleetCaches::in_memory(&config), config)
    }

    fn cached_vehicle_ids(updater: &FleetUpdater) -> Vec<String> {
        let mut ids: Vec<String> = updater
            .caches()
            .vehicles
            .values()
            .unwrap()
            .into_iter()
            .map(|v| v.id)
            .collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_snapshot_replaces_previous() {
        let updater = create_test_updater();
        let first = create_test_snapshot(&["TST:Vehicle:1", "TST:Vehicle:2"]);
        updater.apply_snapshot_at(1_000, None, &first).unwrap();
        assert_eq!(cached_vehicle_ids(&updater), vec!["TST:Vehicle:1", "TST:Vehicle:2"]);
        assert!(updater.caches().systems.has_key("TST:System:1").unwrap());

        let second = create_test_snapshot(&["TST:Vehicle:2", "TST:Vehicle:3"]);
        let report = updater.apply_snapshot_at(1_010, Some(&first), &second).unwrap();
        assert_eq!(report.vehicles_removed, 1);
        assert_eq!(report.vehicles_written, 2);
        assert_eq!(cached_vehicle_ids(&updater), vec!["TST:Vehicle:2", "TST:Vehicle:3"]);
    }

    #[test]
    fn test_without_previous_removes_missing_of_same_system() {
        let updater = create_test_updater();
        updater
            .apply_snapshot_at(1_000, None, &create_test_snapshot(&["TST:Vehicle:1", "TST:Vehicle:2"]))
            .unwrap();

        let mut other = create_test_vehicle("YVO:Vehicle:9", 10.0, 59.9);
        other.provider = create_test_provider("YVO");
        updater.caches().vehicles.put(other.id.clone(), other, Duration::from_secs(60)).unwrap();

        let report = updater
            .apply_snapshot_at(1_000, None, &create_test_snapshot(&["TST:Vehicle:2"]))
            .unwrap();
        assert_eq!(report.vehicles_removed, 1);
        assert_eq!(cached_vehicle_ids(&updater), vec!["TST:Vehicle:2", "YVO:Vehicle:9"]);
    }

    #[test]
    fn test_duplicates_dropped() {
        let updater = create_test_updater();
        let snapshot = create_test_snapshot(&["TST:Vehicle:1", "TST:Vehicle:1", "TST:Vehicle:2"]);
        let report = updater.apply_snapshot_at(1_000, None, &snapshot).unwrap();
        assert_eq!(report.duplicates_dropped, 1);
        assert_eq!(report.vehicles_written, 2);
    }

    #[test]
    fn test_stale_feed_gets_minimum_ttl() {
        let updater = create_test_updater();
        let snapshot = create_test_snapshot(&["TST:Vehicle:1"]);
        // Feed went stale long ago; entries still live for the configured minimum
        updater.apply_snapshot_at(100_000, None, &snapshot).unwrap();
        assert!(updater.caches().vehicles.has_key("TST:Vehicle:1").unwrap());
    }

    #[test]
    fn test_stations_follow_snapshots() {
        let updater = create_test_updater();
        let mut first = create_test_snapshot(&[]);
        first.stations = vec![
            create_test_station("TST:Station:1", 10.0, 59.9),
            create_test_station("TST:Station:2", 10.1, 59.9),
        ];
        updater.apply_snapshot_at(1_000, None, &first).unwrap();

        let mut second = create_test_snapshot(&[]);
        second.stations = vec![create_test_station("TST:Station:2", 10.1, 59.9)];
        let report = updater.apply_snapshot_at(1_000, Some(&first), &second).unwrap();
        assert_eq!(report.stations_removed, 1);
        assert_eq!(updater.caches().stations.count().unwrap(), 1);
    }

    #[test]
    fn test_clear_system() {
        let updater = create_test_updater();
        let mut snapshot = create_test_snapshot(&["TST:Vehicle:1", "TST:Vehicle:2"]);
        snapshot.stations = vec![create_test_station("TST:Station:1", 10.0, 59.9)];
        updater.apply_snapshot_at(1_000, None, &snapshot).unwrap();

        let report = updater.clear_system("TST:System:1").unwrap();
        assert_eq!(report.vehicles_removed, 2);
        assert_eq!(report.stations_removed, 1);
        assert_eq!(updater.caches().vehicles.count().unwrap(), 0);
        assert!(!updater.caches().systems.has_key("TST:System:1").unwrap());
    }

    #[test]
    fn test_ids_are_qualified_or_dropped() {
        let updater = create_test_updater();
        let mut snapshot = create_test_snapshot(&["TST:Vehicle:1", "2", "not an id!", "YVO:Vehicle:3"]);
        snapshot.stations = vec![
            create_test_station("7", 10.0, 59.9),
            create_test_station("", 10.0, 59.9),
        ];

        let report = updater.apply_snapshot_at(1_000, None, &snapshot).unwrap();
        assert_eq!(report.invalid_ids_dropped, 3);
        assert_eq!(report.vehicles_written, 2);
        assert_eq!(report.stations_written, 1);
        assert_eq!(cached_vehicle_ids(&updater), vec!["TST:Vehicle:1", "TST:Vehicle:2"]);
        assert!(updater.caches().stations.has_key("TST:Station:7").unwrap());

        // Raw and qualified forms of one id are the same entity
        let next = create_test_snapshot(&["1", "TST:Vehicle:1"]);
        let report = updater.apply_snapshot_at(1_010, Some(&snapshot), &next).unwrap();
        assert_eq!(report.duplicates_dropped, 1);
        assert_eq!(report.vehicles_removed, 1);
        assert_eq!(cached_vehicle_ids(&updater), vec!["TST:Vehicle:1"]);
    }
}
