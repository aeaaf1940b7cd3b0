//! Orphan reconciler - removes index members that no longer describe a cached entity
//!
//! TTL expiry in a shared store can happen without a delivered notification, so the
//! projector alone cannot guarantee that expired entities leave the index. Concurrent
//! projections of the same key can also leave a member encoding an older version of an
//! entity. The reconciler sweeps a whole index, which costs O(index size); the index is
//! bounded by the live fleet.
//!
//! For every indexed id the cache decides:
//!
//! - no entry: every member of the id is an orphan;
//! - an entry: every member other than the entity's current one is stale, and the current
//!   member is re-added when the entity has a usable position.
//!
//! Removal policy: re-check before delete. Between the scan and the removal an entity may be
//! re-created or updated; every candidate is inspected against the cache again right before
//! its members are removed, and after the removal the current members of the touched ids
//! are written back.

use crate::cache::EntityCache;
use crate::index_key::{EntityKind, SpatialIndexMember};
use crate::projector::{Indexable, usable_position};
use crate::spatial::SpatialIndex;
use crate::Result;

use geo::Point;
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Indexed members of one id with their positions
type Entries = Vec<(SpatialIndexMember, Point<f64>)>;

/// What one id needs for the index to match the cache
#[derive(Debug, Default)]
struct Repair {
    /// The cache has no entry for the id
    missing: bool,
    remove: Vec<SpatialIndexMember>,
    upsert: Option<(SpatialIndexMember, Point<f64>)>,
}

impl Repair {
    fn is_clean(&self) -> bool {
        self.remove.is_empty() && self.upsert.is_none()
    }
}

/// Finds and removes orphaned and stale members of one spatial index
pub struct OrphanReconciler<T: Indexable> {
    cache: Arc<dyn EntityCache<T>>,
    index: Arc<dyn SpatialIndex>,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl<T: Indexable> OrphanReconciler<T> {
    pub fn new(cache: Arc<dyn EntityCache<T>>, index: Arc<dyn SpatialIndex>) -> Self {
        Self { cache, index }
    }

    #[inline]
    pub fn kind(&self) -> EntityKind {
        self.index.kind()
    }

    /// Ids of indexed entities that have no cache entry
    pub fn find_orphans(&self) -> Result<HashSet<String>> {
        Ok(self
            .scan()?
            .into_iter()
            .filter(|(_, (repair, _))| repair.missing)
            .map(|(id, _)| id)
            .collect())
    }

    /// Remove orphaned and stale members in one batch, then re-add the current members of
    /// the touched entities. Returns the ids that lost members.
    pub fn reconcile(&self) -> Result<HashSet<String>> {
        let candidates = self.scan()?;
        if candidates.is_empty() {
            return Ok(HashSet::new());
        }

        let mut removed_ids = HashSet::with_capacity(candidates.len());
        let mut members = Vec::new();
        let mut upserts = Vec::new();
        for (id, (_, entries)) in candidates {
            // Re-check: the entity may have been re-created or updated since the scan
            match self.inspect(&id, &entries) {
                Ok(repair) => {
                    if repair.is_clean() {
                        tracing::debug!("{} '{}' was repaired before reconciliation", self.kind(), id);
                        continue;
                    }
                    if !repair.remove.is_empty() {
                        removed_ids.insert(id);
                        members.extend(repair.remove);
                    }
                    upserts.extend(repair.upsert);
                }
                Err(e) => {
                    tracing::warn!("Skipping reconciliation of {} '{}': {}", self.kind(), id, e);
                }
            }
        }

        if !members.is_empty() {
            self.index.remove_all(&members)?;
        }
        for (member, location) in &upserts {
            self.index.add(member, *location)?;
        }
        self.restore(&removed_ids, &members);
        Ok(removed_ids)
    }

    /// Write back current members that a concurrent projection recreated and the batch
    /// removal took out again
    fn restore(&self, ids: &HashSet<String>, removed: &[SpatialIndexMember]) {
        for id in ids {
            let current = match self.cache.get(id) {
                Ok(Some(entity)) => entity,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!("Could not restore {} '{}': {}", self.kind(), id, e);
                    continue;
                }
            };
            let Some(location) = usable_position(&current) else {
                continue;
            };
            match current.index_member() {
                Ok(member) if removed.contains(&member) => {
                    if let Err(e) = self.index.add(&member, location) {
                        tracing::warn!("Could not restore {} '{}': {}", self.kind(), id, e);
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Cannot derive {} member for '{}': {}", self.kind(), id, e),
            }
        }
    }

    /// Compare the indexed entries of one id with the cache
    fn inspect(&self, id: &str, entries: &[(SpatialIndexMember, Point<f64>)]) -> Result<Repair> {
        let Some(entity) = self.cache.get(id)? else {
            return Ok(Repair {
                missing: true,
                remove: entries.iter().map(|(m, _)| m.clone()).collect(),
                upsert: None,
            });
        };

        let current = entity.index_member()?;
        let mut repair = Repair::default();
        match usable_position(&entity) {
            Some(location) => {
                for (member, _) in entries {
                    if *member != current {
                        repair.remove.push(member.clone());
                    }
                }
                let in_place = entries
                    .iter()
                    .any(|(m, at)| *m == current && same_location(*at, location));
                if !in_place {
                    repair.upsert = Some((current, location));
                }
            }
            None => {
                repair.remove = entries.iter().map(|(m, _)| m.clone()).collect();
            }
        }
        Ok(repair)
    }

    /// Ids whose indexed entries disagree with the cache, with those entries
    fn scan(&self) -> Result<HashMap<String, (Repair, Entries)>> {
        let mut by_id: HashMap<String, Entries> = HashMap::new();
        for entry in self.index.get_all()? {
            by_id
                .entry(entry.member.id.clone())
                .or_default()
                .push((entry.member, entry.location));
        }

        let kind = self.kind();
        Ok(by_id
            .into_par_iter()
            .filter_map(|(id, entries)| match self.inspect(&id, &entries) {
                Ok(repair) if repair.is_clean() => None,
                Ok(repair) => Some((id, (repair, entries))),
                Err(e) => {
                    tracing::warn!("Could not check {} '{}' against the cache: {}", kind, id, e);
                    None
                }
            })
            .collect())
    }
}

/// Geo sets store coordinates with limited precision
#[inline]
fn same_location(a: Point<f64>, b: Point<f64>) -> bool {
    const EPSILON: f64 = 1e-5;
    (a.x() - b.x()).abs() <= EPSILON && (a.y() - b.y()).abs() <= EPSILON
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheListener, InMemoryCache, SubscriptionId};
    use crate::entities::Vehicle;
    use crate::entities::fixtures::*;
    use crate::index_key::{FormFactor, PropulsionType};
    use crate::projector::Projector;
    use crate::spatial::InMemorySpatialIndex;
    use std::sync::Mutex;
    use std::time::Duration;

    const TTL: Duration = Duration::from_secs(60);

    fn put_vehicles(cache: &InMemoryCache<Vehicle>, ids: &[&str]) {
        let entries = ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.to_string(), create_test_vehicle(id, 10.0 + i as f64 * 0.001, 59.9)))
            .collect();
        cache.put_all(entries, TTL).unwrap();
    }

    #[test]
    fn test_reconcile_removes_exactly_the_orphans() {
        let cache: Arc<InMemoryCache<Vehicle>> = Arc::new(InMemoryCache::new("vehicles"));
        let index = Arc::new(InMemorySpatialIndex::new(EntityKind::Vehicle));
        let projector = Arc::new(Projector::<Vehicle>::new(cache.clone(), index.clone()).unwrap());
        let subscription = projector.attach();

        put_vehicles(&cache, &["TST:Vehicle:a", "TST:Vehicle:b", "TST:Vehicle:c"]);
        assert_eq!(index.len(), 3);

        // Remove behind the projector's back
        projector.detach(subscription);
        cache
            .remove_all(&["TST:Vehicle:a".to_string(), "TST:Vehicle:c".to_string()])
            .unwrap();
        assert_eq!(index.len(), 3);

        let reconciler = OrphanReconciler::<Vehicle>::new(cache.clone(), index.clone());
        let expected: HashSet<String> = ["TST:Vehicle:a", "TST:Vehicle:c"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(reconciler.find_orphans().unwrap(), expected);
        assert_eq!(reconciler.reconcile().unwrap(), expected);

        let remaining = index.get_all().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].member.id, "TST:Vehicle:b");

        // Converged
        assert!(reconciler.reconcile().unwrap().is_empty());
    }

    #[test]
    fn test_reconcile_heals_silent_expiry() {
        let cache: Arc<InMemoryCache<Vehicle>> =
            Arc::new(InMemoryCache::new("vehicles").with_expiry_events(false));
        let index = Arc::new(InMemorySpatialIndex::new(EntityKind::Vehicle));
        let projector = Arc::new(Projector::<Vehicle>::new(cache.clone(), index.clone()).unwrap());
        projector.attach();

        let vehicle = create_test_vehicle("TST:Vehicle:short", 10.0, 59.9);
        cache
            .put(vehicle.id.clone(), vehicle, Duration::from_millis(10))
            .unwrap();
        put_vehicles(&cache, &["TST:Vehicle:long"]);
        std::thread::sleep(Duration::from_millis(30));
        cache.purge_expired();
        assert_eq!(index.len(), 2);

        let reconciler = OrphanReconciler::<Vehicle>::new(cache.clone(), index.clone());
        let removed = reconciler.reconcile().unwrap();
        assert_eq!(removed.len(), 1);
        assert!(removed.contains("TST:Vehicle:short"));
        assert_eq!(index.len(), 1);
    }

    /// Cache answering the first lookup of every key with `first`, and the truth afterwards
    struct RecreatingCache {
        inner: InMemoryCache<Vehicle>,
        first: Option<Vehicle>,
        seen: Mutex<HashSet<String>>,
    }

    impl RecreatingCache {
        fn new(first: Option<Vehicle>) -> Self {
            Self {
                inner: InMemoryCache::new("vehicles"),
                first,
                seen: Mutex::new(HashSet::new()),
            }
        }
    }

    impl EntityCache<Vehicle> for RecreatingCache {
        fn get(&self, key: &str) -> Result<Option<Vehicle>> {
            if self.seen.lock().unwrap().insert(key.to_string()) {
                return Ok(self.first.clone());
            }
            self.inner.get(key)
        }
        fn get_all(&self, keys: &[String]) -> Result<HashMap<String, Vehicle>> {
            self.inner.get_all(keys)
        }
        fn values(&self) -> Result<Vec<Vehicle>> {
            self.inner.values()
        }
        fn put_all(&self, entries: Vec<(String, Vehicle)>, ttl: Duration) -> Result<()> {
            self.inner.put_all(entries, ttl)
        }
        fn remove_all(&self, keys: &[String]) -> Result<()> {
            self.inner.remove_all(keys)
        }
        fn has_key(&self, key: &str) -> Result<bool> {
            self.inner.has_key(key)
        }
        fn count(&self) -> Result<usize> {
            self.inner.count()
        }
        fn subscribe(&self, listener: Arc<dyn CacheListener<Vehicle>>) -> SubscriptionId {
            self.inner.subscribe(listener)
        }
        fn unsubscribe(&self, id: SubscriptionId) -> bool {
            self.inner.unsubscribe(id)
        }
    }

    #[test]
    fn test_reconcile_rechecks_before_delete() {
        let cache = Arc::new(RecreatingCache::new(None));
        let index = Arc::new(InMemorySpatialIndex::new(EntityKind::Vehicle));
        let vehicle = create_test_vehicle("TST:Vehicle:1", 10.0, 59.9);
        index
            .add(&vehicle.index_member().unwrap(), geo::Point::new(10.0, 59.9))
            .unwrap();
        put_vehicles(&cache.inner, &["TST:Vehicle:1"]);

        let reconciler = OrphanReconciler::<Vehicle>::new(cache, index.clone());
        // Scan sees it missing, the re-check sees it back
        assert!(reconciler.reconcile().unwrap().is_empty());
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_reconcile_replaces_stale_members() {
        let cache: Arc<InMemoryCache<Vehicle>> = Arc::new(InMemoryCache::new("vehicles"));
        let index = Arc::new(InMemorySpatialIndex::new(EntityKind::Vehicle));

        // The index lost a race and still holds the bicycle version
        let mut bike = create_test_vehicle("TST:Vehicle:1", 10.0, 59.9);
        bike.vehicle_type = create_test_vehicle_type(FormFactor::Bicycle, PropulsionType::Human);
        index.add(&bike.index_member().unwrap(), geo::Point::new(10.0, 59.9)).unwrap();
        let scooter = create_test_vehicle("TST:Vehicle:1", 10.001, 59.9);
        cache.put(scooter.id.clone(), scooter.clone(), TTL).unwrap();

        let reconciler = OrphanReconciler::<Vehicle>::new(cache.clone(), index.clone());
        assert!(reconciler.find_orphans().unwrap().is_empty());
        let removed = reconciler.reconcile().unwrap();
        assert_eq!(removed, HashSet::from(["TST:Vehicle:1".to_string()]));

        let entries = index.get_all().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].member, scooter.index_member().unwrap());
        assert!((entries[0].location.x() - 10.001).abs() < 1e-9);

        // Converged
        assert!(reconciler.reconcile().unwrap().is_empty());
    }

    #[test]
    fn test_reconcile_follows_update_after_scan() {
        // The scan reads the bicycle version, the entity is a scooter by the time of removal
        let mut bike = create_test_vehicle("TST:Vehicle:1", 10.0, 59.9);
        bike.vehicle_type = create_test_vehicle_type(FormFactor::Bicycle, PropulsionType::Human);
        let cache = Arc::new(RecreatingCache::new(Some(bike.clone())));
        let scooter = create_test_vehicle("TST:Vehicle:1", 10.0, 59.9);
        cache.inner.put(scooter.id.clone(), scooter.clone(), TTL).unwrap();

        let index = Arc::new(InMemorySpatialIndex::new(EntityKind::Vehicle));
        index.add(&bike.index_member().unwrap(), geo::Point::new(10.0, 59.9)).unwrap();
        index.add(&scooter.index_member().unwrap(), geo::Point::new(10.0, 59.9)).unwrap();

        let reconciler = OrphanReconciler::<Vehicle>::new(cache, index.clone());
        let removed = reconciler.reconcile().unwrap();
        assert_eq!(removed, HashSet::from(["TST:Vehicle:1".to_string()]));

        let members: Vec<_> = index.get_all().unwrap().into_iter().map(|e| e.member).collect();
        assert_eq!(members, vec![scooter.index_member().unwrap()]);
    }

    #[test]
    fn test_reconcile_drops_entities_without_position() {
        let cache: Arc<InMemoryCache<Vehicle>> = Arc::new(InMemoryCache::new("vehicles"));
        let index = Arc::new(InMemorySpatialIndex::new(EntityKind::Vehicle));
        let mut vehicle = create_test_vehicle("TST:Vehicle:1", 10.0, 59.9);
        index.add(&vehicle.index_member().unwrap(), geo::Point::new(10.0, 59.9)).unwrap();
        vehicle.lat = None;
        cache.put(vehicle.id.clone(), vehicle, TTL).unwrap();

        let reconciler = OrphanReconciler::<Vehicle>::new(cache, index.clone());
        assert_eq!(reconciler.reconcile().unwrap().len(), 1);
        assert!(index.is_empty());
    }
}
