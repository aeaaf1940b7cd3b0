//! Geo search engine - filtered radius and bounding-box queries
//!
//! Queries run against the spatial index first: members are decoded and filtered on the
//! attributes they carry, so only surviving entity ids are fetched from the entity caches.
//!
//! - Range queries return entities nearest first.
//! - Bounding-box queries scan every member of the kind (geo sets have no box primitive)
//!   and return entities ordered by id.
//! - A `count` cap truncates the final, filtered result.
//!
//! The index can briefly hold a member that no longer describes its entity. Every fetched
//! entity is therefore checked again against the filter and the query shape, using its
//! current attributes and position.
//!
//! Store errors are returned to the caller; a query never silently hides a failed read.

use crate::cache::EntityCache;
use crate::entities::{Station, Vehicle};
use crate::index_key::{EntityKind, FormFactor, PropulsionType, SpatialIndexMember};
use crate::projector::Indexable;
use crate::query::{BoundingBox, SearchParameters, SearchShape};
use crate::spatial::SpatialIndex;
use crate::utils::{haversine_distance, rect_contains_inclusive};
use crate::{FleetError, Result};

use geo::Point;
use rayon::prelude::*;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// Attribute filter for vehicle searches. Empty lists match everything.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct VehicleFilter {
    pub codespaces: Vec<String>,
    pub systems: Vec<String>,
    pub operators: Vec<String>,
    pub form_factors: Vec<FormFactor>,
    pub propulsion_types: Vec<PropulsionType>,
    /// Reserved vehicles are left out unless set
    pub include_reserved: bool,
    /// Disabled vehicles are left out unless set
    pub include_disabled: bool,
}

/// Attribute filter for station searches. Empty lists match everything.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct StationFilter {
    pub codespaces: Vec<String>,
    pub systems: Vec<String>,
    pub operators: Vec<String>,
    /// Match stations offering any of these form factors
    pub available_form_factors: Vec<FormFactor>,
    /// Match stations offering any of these propulsion types
    pub available_propulsion_types: Vec<PropulsionType>,
}

#[inline]
fn allowed<T: PartialEq>(allow: &[T], value: &T) -> bool {
    allow.is_empty() || allow.contains(value)
}

#[inline]
fn any_allowed<T: PartialEq>(allow: &[T], values: &[T]) -> bool {
    allow.is_empty() || values.iter().any(|v| allow.contains(v))
}

#[inline]
fn common_allowed(
    member: &SpatialIndexMember,
    codespaces: &[String],
    systems: &[String],
    operators: &[String],
) -> bool {
    allowed(codespaces, &member.codespace)
        && allowed(systems, &member.system_id)
        && allowed(operators, &member.operator_id)
}

/// Whether an entity, as it is now, still matches a member filter
fn entity_matches<T: Indexable>(entity: &T, keep: impl Fn(&SpatialIndexMember) -> bool) -> bool {
    entity.index_member().is_ok_and(|member| keep(&member))
}

fn entity_within<T: Indexable>(entity: &T, center: Point<f64>, radius_m: f64) -> bool {
    entity
        .position()
        .is_some_and(|p| haversine_distance(center, p) <= radius_m)
}

fn entity_inside<T: Indexable>(entity: &T, bbox: &BoundingBox) -> bool {
    let rect = bbox.to_rect();
    entity
        .position()
        .is_some_and(|p| rect_contains_inclusive(&rect, p))
}

impl VehicleFilter {
    /// Whether a decoded member passes this filter
    pub fn matches(&self, member: &SpatialIndexMember) -> bool {
        let Some(attrs) = member.vehicle() else {
            return false;
        };
        common_allowed(member, &self.codespaces, &self.systems, &self.operators)
            && allowed(&self.form_factors, &attrs.form_factor)
            && allowed(&self.propulsion_types, &attrs.propulsion_type)
            && (self.include_reserved || !attrs.reserved)
            && (self.include_disabled || !attrs.disabled)
    }
}

impl StationFilter {
    /// Whether a decoded member passes this filter
    pub fn matches(&self, member: &SpatialIndexMember) -> bool {
        let Some(attrs) = member.station() else {
            return false;
        };
        common_allowed(member, &self.codespaces, &self.systems, &self.operators)
            && any_allowed(&self.available_form_factors, &attrs.available_form_factors)
            && any_allowed(
                &self.available_propulsion_types,
                &attrs.available_propulsion_types,
            )
    }
}

/// Answers geo queries over the vehicle and station indexes
pub struct GeoSearchEngine {
    vehicle_cache: Arc<dyn EntityCache<Vehicle>>,
    vehicle_index: Arc<dyn SpatialIndex>,
    station_cache: Arc<dyn EntityCache<Station>>,
    station_index: Arc<dyn SpatialIndex>,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl GeoSearchEngine {
    pub fn new(
        vehicle_cache: Arc<dyn EntityCache<Vehicle>>,
        vehicle_index: Arc<dyn SpatialIndex>,
        station_cache: Arc<dyn EntityCache<Station>>,
        station_index: Arc<dyn SpatialIndex>,
    ) -> Result<Self> {
        for (index, kind) in [
            (&vehicle_index, EntityKind::Vehicle),
            (&station_index, EntityKind::Station),
        ] {
            if index.kind() != kind {
                return Err(FleetError::MalformedIndexKey(format!(
                    "Expected a {} index, got a {} index",
                    kind,
                    index.kind()
                )));
            }
        }
        Ok(Self {
            vehicle_cache,
            vehicle_index,
            station_cache,
            station_index,
        })
    }

    /// Vehicles within `radius_m` meters of `center`, nearest first
    pub fn vehicles_within_range(
        &self,
        center: Point<f64>,
        radius_m: f64,
        filter: &VehicleFilter,
        count: Option<usize>,
    ) -> Result<Vec<Vehicle>> {
        let ids = range_ids(self.vehicle_index.as_ref(), center, radius_m, |m| {
            filter.matches(m)
        })?;
        fetch_ordered(self.vehicle_cache.as_ref(), &ids, count, |v| {
            entity_matches(v, |m| filter.matches(m)) && entity_within(v, center, radius_m)
        })
    }

    /// Vehicles inside a bounding box, ordered by id
    pub fn vehicles_in_bounding_box(
        &self,
        bbox: &BoundingBox,
        filter: &VehicleFilter,
        count: Option<usize>,
    ) -> Result<Vec<Vehicle>> {
        let ids = bbox_ids(self.vehicle_index.as_ref(), bbox, |m| filter.matches(m))?;
        fetch_ordered(self.vehicle_cache.as_ref(), &ids, count, |v| {
            entity_matches(v, |m| filter.matches(m)) && entity_inside(v, bbox)
        })
    }

    /// Stations within `radius_m` meters of `center`, nearest first
    pub fn stations_within_range(
        &self,
        center: Point<f64>,
        radius_m: f64,
        filter: &StationFilter,
        count: Option<usize>,
    ) -> Result<Vec<Station>> {
        let ids = range_ids(self.station_index.as_ref(), center, radius_m, |m| {
            filter.matches(m)
        })?;
        fetch_ordered(self.station_cache.as_ref(), &ids, count, |s| {
            entity_matches(s, |m| filter.matches(m)) && entity_within(s, center, radius_m)
        })
    }

    /// Stations inside a bounding box, ordered by id
    pub fn stations_in_bounding_box(
        &self,
        bbox: &BoundingBox,
        filter: &StationFilter,
        count: Option<usize>,
    ) -> Result<Vec<Station>> {
        let ids = bbox_ids(self.station_index.as_ref(), bbox, |m| filter.matches(m))?;
        fetch_ordered(self.station_cache.as_ref(), &ids, count, |s| {
            entity_matches(s, |m| filter.matches(m)) && entity_inside(s, bbox)
        })
    }

    /// Validate raw parameters and run the matching vehicle query
    pub fn search_vehicles(
        &self,
        params: &SearchParameters,
        filter: &VehicleFilter,
    ) -> Result<Vec<Vehicle>> {
        match params.validate()? {
            (SearchShape::Range { center, radius_m }, count) => {
                self.vehicles_within_range(center, radius_m, filter, count)
            }
            (SearchShape::BoundingBox(bbox), count) => {
                self.vehicles_in_bounding_box(&bbox, filter, count)
            }
        }
    }

    /// Validate raw parameters and run the matching station query
    pub fn search_stations(
        &self,
        params: &SearchParameters,
        filter: &StationFilter,
    ) -> Result<Vec<Station>> {
        match params.validate()? {
            (SearchShape::Range { center, radius_m }, count) => {
                self.stations_within_range(center, radius_m, filter, count)
            }
            (SearchShape::BoundingBox(bbox), count) => {
                self.stations_in_bounding_box(&bbox, filter, count)
            }
        }
    }
}

/// Filtered entity ids within a radius, nearest first, each id once
fn range_ids<F>(index: &dyn SpatialIndex, center: Point<f64>, radius_m: f64, keep: F) -> Result<Vec<String>>
where
    F: Fn(&SpatialIndexMember) -> bool + Sync,
{
    let hits = index.within_radius(center, radius_m)?;
    // Indexed parallel collect keeps the distance order
    let ids: Vec<String> = hits
        .into_par_iter()
        .filter(|(entry, _)| keep(&entry.member))
        .map(|(entry, _)| entry.member.id)
        .collect();
    Ok(dedup_in_order(ids))
}

/// Filtered entity ids inside a box, ordered by id, each id once
fn bbox_ids<F>(index: &dyn SpatialIndex, bbox: &BoundingBox, keep: F) -> Result<Vec<String>>
where
    F: Fn(&SpatialIndexMember) -> bool + Sync,
{
    let rect = bbox.to_rect();
    let mut ids: Vec<String> = index
        .get_all()?
        .into_par_iter()
        .filter(|entry| rect_contains_inclusive(&rect, entry.location) && keep(&entry.member))
        .map(|entry| entry.member.id)
        .collect();
    ids.par_sort_unstable();
    ids.dedup();
    Ok(ids)
}

fn dedup_in_order(ids: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}

/// Fetch entities in the order of `ids`, stopping once `count` entities were kept.
///
/// Ids whose entity vanished since the index was read, or no longer passes `keep`, are
/// skipped, and the next ids fill their place.
fn fetch_ordered<T>(
    cache: &dyn EntityCache<T>,
    ids: &[String],
    count: Option<usize>,
    keep: impl Fn(&T) -> bool,
) -> Result<Vec<T>> {
    let limit = count.unwrap_or(ids.len());
    let mut out = Vec::with_capacity(limit.min(ids.len()));
    if limit == 0 || ids.is_empty() {
        return Ok(out);
    }

    for chunk in ids.chunks(limit) {
        let mut found = cache.get_all(chunk)?;
        for id in chunk {
            if let Some(entity) = found.remove(id).filter(|e| keep(e)) {
                out.push(entity);
                if out.len() == limit {
                    return Ok(out);
                }
            }
        }
    }
    Ok(out)
}
