//! Spatial index - geospatial set of member strings per entity kind
//!
//! The index stores encoded [`SpatialIndexMember`] strings at lon/lat positions, the same
//! way a geo set in a shared store does. Adding an existing member moves it (last write
//! wins), and removing an unknown member is a no-op, so both operations are idempotent.

use crate::index_key::{EntityKind, SpatialIndexMember};
use crate::utils::{haversine_distance, is_valid_position};
use crate::{FleetError, Result};

use dashmap::DashMap;
use geo::Point;
use rayon::prelude::*;

/// A decoded member and its position
#[derive(Debug, Clone, PartialEq)]
pub struct GeoEntry {
    pub member: SpatialIndexMember,
    /// x = longitude, y = latitude
    pub location: Point<f64>,
}

/// Geospatial set for one entity kind
pub trait SpatialIndex: Send + Sync {
    fn kind(&self) -> EntityKind;

    /// Insert or move a member. Returns true if the member was not present before.
    fn add(&self, member: &SpatialIndexMember, location: Point<f64>) -> Result<bool>;

    /// Remove members. Returns how many were present.
    fn remove_all(&self, members: &[SpatialIndexMember]) -> Result<usize>;

    /// Every member with its position. Undecodable members are skipped.
    fn get_all(&self) -> Result<Vec<GeoEntry>>;

    /// Members within `radius_m` meters of `center`, nearest first, with their distance
    fn within_radius(&self, center: Point<f64>, radius_m: f64) -> Result<Vec<(GeoEntry, f64)>> {
        let mut hits: Vec<(GeoEntry, f64)> = self
            .get_all()?
            .into_par_iter()
            .filter_map(|entry| {
                let distance = haversine_distance(center, entry.location);
                (distance <= radius_m).then_some((entry, distance))
            })
            .collect();
        hits.sort_by(|a, b| {
            a.1.total_cmp(&b.1)
                .then_with(|| a.0.member.id.cmp(&b.0.member.id))
        });
        Ok(hits)
    }
}

/// In-process [`SpatialIndex`] keyed by encoded member strings
pub struct InMemorySpatialIndex {
    kind: EntityKind,
    members: DashMap<String, Point<f64>>,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl InMemorySpatialIndex {
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            members: DashMap::new(),
        }
    }

    /// Number of stored member strings
    #[inline]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Raw member strings, as a shared store would return them
    pub fn raw_members(&self) -> Vec<String> {
        self.members.iter().map(|e| e.key().clone()).collect()
    }

    #[cfg(test)]
    pub(crate) fn insert_raw(&self, raw: &str, location: Point<f64>) {
        self.members.insert(raw.to_string(), location);
    }
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl SpatialIndex for InMemorySpatialIndex {
    #[inline]
    fn kind(&self) -> EntityKind {
        self.kind
    }

    fn add(&self, member: &SpatialIndexMember, location: Point<f64>) -> Result<bool> {
        if member.kind() != self.kind {
            return Err(FleetError::MalformedIndexKey(format!(
                "Cannot add {} member to {} index: {}",
                member.kind(),
                self.kind,
                member
            )));
        }
        if !is_valid_position(location.x(), location.y()) {
            return Err(FleetError::TransientStore(format!(
                "Invalid position ({}, {}) for member {}",
                location.x(),
                location.y(),
                member
            )));
        }
        Ok(self.members.insert(member.encode(), location).is_none())
    }

    fn remove_all(&self, members: &[SpatialIndexMember]) -> Result<usize> {
        Ok(members
            .iter()
            .filter(|m| self.members.remove(&m.encode()).is_some())
            .count())
    }

    fn get_all(&self) -> Result<Vec<GeoEntry>> {
        let raw: Vec<(String, Point<f64>)> = self
            .members
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();

        let kind = self.kind;
        Ok(raw
            .into_par_iter()
            .filter_map(|(raw, location)| match SpatialIndexMember::decode(kind, &raw) {
                Ok(member) => Some(GeoEntry { member, location }),
                Err(e) => {
                    tracing::warn!("Skipping undecodable {} index member '{}': {}", kind, raw, e);
                    None
                }
            })
            .collect())
    }
}
