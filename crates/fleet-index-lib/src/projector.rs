//! Cache-to-index projector
//!
//! Subscribes to an entity cache and keeps the spatial index of the same kind in step with
//! it. Events are treated as hints about which key changed; the cache holds the truth.
//! For every event the projector:
//!
//! 1. derives the members the event mentions (the value, and the previous value of an
//!    update), purely from the event payload;
//! 2. reads the key's current value from the cache;
//! 3. upserts the current entity's member if it has a usable position, and removes every
//!    other member it derived.
//!
//! Duplicate events repeat the same work, and out-of-order events still end with the index
//! reflecting whatever the cache holds for that key. Events for different keys touch
//! disjoint members, so batches can be handled concurrently.

use crate::cache::{CacheEvent, CacheListener, EntityCache, SubscriptionId};
use crate::entities::{Station, Vehicle};
use crate::index_key::{EntityKind, SpatialIndexMember};
use crate::spatial::SpatialIndex;
use crate::utils::is_valid_position;
use crate::{FleetError, Result};

use geo::Point;
use smallvec::SmallVec;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Entities that can be placed in a spatial index
pub trait Indexable: Clone + Send + Sync + 'static {
    const KIND: EntityKind;

    /// Position as lon/lat, if the entity has one
    fn position(&self) -> Option<Point<f64>>;

    /// Member string payload for this entity
    fn index_member(&self) -> Result<SpatialIndexMember>;
}

impl Indexable for Vehicle {
    const KIND: EntityKind = EntityKind::Vehicle;

    #[inline]
    fn position(&self) -> Option<Point<f64>> {
        Vehicle::position(self)
    }

    fn index_member(&self) -> Result<SpatialIndexMember> {
        Vehicle::index_member(self)
    }
}

impl Indexable for Station {
    const KIND: EntityKind = EntityKind::Station;

    #[inline]
    fn position(&self) -> Option<Point<f64>> {
        Station::position(self)
    }

    fn index_member(&self) -> Result<SpatialIndexMember> {
        Station::index_member(self)
    }
}

/// Projects cache changes of one entity kind onto its spatial index
pub struct Projector<T: Indexable> {
    cache: Arc<dyn EntityCache<T>>,
    index: Arc<dyn SpatialIndex>,
    failed_events: AtomicU64,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl<T: Indexable> Projector<T> {
    pub fn new(cache: Arc<dyn EntityCache<T>>, index: Arc<dyn SpatialIndex>) -> Result<Self> {
        if index.kind() != T::KIND {
            return Err(FleetError::MalformedIndexKey(format!(
                "Cannot project {} entities onto a {} index",
                T::KIND,
                index.kind()
            )));
        }
        Ok(Self {
            cache,
            index,
            failed_events: AtomicU64::new(0),
        })
    }

    /// Subscribe this projector to its cache
    pub fn attach(self: &Arc<Self>) -> SubscriptionId {
        let listener: Arc<dyn CacheListener<T>> = self.clone();
        self.cache.subscribe(listener)
    }

    /// Unsubscribe a previous [`Projector::attach`]
    pub fn detach(&self, id: SubscriptionId) -> bool {
        self.cache.unsubscribe(id)
    }

    /// Number of events that could not be applied since creation
    #[inline]
    pub fn failed_events(&self) -> u64 {
        self.failed_events.load(Ordering::Relaxed)
    }

    /// Project every entity currently in the cache. Returns how many were indexed.
    ///
    /// Used when a node starts maintaining an index that may have missed events.
    pub fn project_all(&self) -> Result<usize> {
        let mut indexed = 0;
        for entity in self.cache.values()? {
            match self.upsert(&entity) {
                Ok(true) => indexed += 1,
                Ok(false) => {}
                Err(e) => {
                    self.failed_events.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("Failed to index {} entity: {}", T::KIND, e);
                }
            }
        }
        tracing::debug!("Projected {} {} entities onto spatial index", indexed, T::KIND);
        Ok(indexed)
    }

    /// Bring the index in line with the cache for the key of one event
    pub fn apply(&self, event: &CacheEvent<T>) -> Result<()> {
        let key = event.key();

        let mut stale: SmallVec<[SpatialIndexMember; 2]> = SmallVec::new();
        self.collect_member(event.value(), key, &mut stale);
        if let CacheEvent::Updated { previous, .. } = event {
            self.collect_member(previous, key, &mut stale);
        }

        if let Some(current) = self.cache.get(key)? {
            let member = current.index_member()?;
            stale.retain(|m| *m != member);
            match usable_position(&current) {
                Some(position) => {
                    self.index.add(&member, position)?;
                }
                None => {
                    tracing::debug!("Not indexing {} '{}' without a valid position", T::KIND, key);
                    stale.push(member);
                }
            }
        }

        if !stale.is_empty() {
            stale.dedup();
            self.index.remove_all(&stale)?;
        }
        Ok(())
    }

    /// Upsert one entity. Returns false when it has no usable position.
    fn upsert(&self, entity: &T) -> Result<bool> {
        let Some(position) = usable_position(entity) else {
            return Ok(false);
        };
        let member = entity.index_member()?;
        self.index.add(&member, position)?;
        Ok(true)
    }

    fn collect_member(&self, entity: &T, key: &str, out: &mut SmallVec<[SpatialIndexMember; 2]>) {
        match entity.index_member() {
            Ok(member) => {
                if !out.contains(&member) {
                    out.push(member);
                }
            }
            Err(e) => tracing::warn!("Cannot derive {} member for '{}': {}", T::KIND, key, e),
        }
    }
}

impl<T: Indexable> CacheListener<T> for Projector<T> {
    fn on_events(&self, events: &[CacheEvent<T>]) {
        #[cfg(feature = "profiling")]
        profiling::scope!("projector::on_events");

        for event in events {
            // One bad entity must not block the rest of the batch
            if let Err(e) = self.apply(event) {
                self.failed_events.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "Failed to project {} event for '{}': {}",
                    T::KIND,
                    event.key(),
                    e
                );
            }
        }
    }
}

#[inline]
pub(crate) fn usable_position<T: Indexable>(entity: &T) -> Option<Point<f64>> {
    entity
        .position()
        .filter(|p| is_valid_position(p.x(), p.y()))
}
