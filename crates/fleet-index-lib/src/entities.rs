//! Normalized entity model shared by all operators
//!
//! Entities are produced by the feed pipeline and stored in entity caches keyed by their
//! identifier. Vehicles and stations embed everything needed to derive their spatial index
//! member, so the member of a removed entity can be rebuilt from the evicted value alone.

use crate::index_key::{
    FormFactor, MemberAttributes, PropulsionType, SpatialIndexMember, StationAttributes,
    VehicleAttributes,
};
use crate::Result;

use geo::Point;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Feed provider an entity was published by
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FeedProvider {
    pub codespace: String,
    pub system_id: String,
    pub operator_id: String,
    pub operator_name: String,
}

/// A vehicle type as published in the provider's vehicle types feed
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct VehicleType {
    pub id: String,
    pub form_factor: FormFactor,
    pub propulsion_type: PropulsionType,
    #[cfg_attr(feature = "serde", serde(default))]
    pub name: Option<String>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub max_range_meters: Option<f64>,
}

/// A free-floating or docked vehicle
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Vehicle {
    pub id: String,
    /// Absent for vehicles that are only reported through a station
    #[cfg_attr(feature = "serde", serde(default))]
    pub lat: Option<f64>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub lon: Option<f64>,
    pub provider: FeedProvider,
    pub vehicle_type: VehicleType,
    #[cfg_attr(feature = "serde", serde(default))]
    pub pricing_plan_id: Option<String>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub current_range_meters: Option<f64>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub reserved: bool,
    #[cfg_attr(feature = "serde", serde(default))]
    pub disabled: bool,
}

/// Number of vehicles of one type available at a station
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct VehicleTypeAvailability {
    pub vehicle_type: VehicleType,
    pub count: u32,
}

/// A docking station with its current status
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Station {
    pub id: String,
    pub name: String,
    #[cfg_attr(feature = "serde", serde(default))]
    pub lat: Option<f64>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub lon: Option<f64>,
    pub provider: FeedProvider,
    #[cfg_attr(feature = "serde", serde(default))]
    pub capacity: Option<u32>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub num_vehicles_available: u32,
    #[cfg_attr(feature = "serde", serde(default))]
    pub vehicle_types_available: Vec<VehicleTypeAvailability>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub is_renting: bool,
    #[cfg_attr(feature = "serde", serde(default))]
    pub is_returning: bool,
}

/// A shared mobility system
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct System {
    pub id: String,
    pub name: String,
    pub operator_id: String,
    #[cfg_attr(feature = "serde", serde(default))]
    pub language: Option<String>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub timezone: Option<String>,
}

/// A pricing plan referenced by vehicles
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PricingPlan {
    pub id: String,
    pub name: String,
    pub currency: String,
    pub price: f64,
    #[cfg_attr(feature = "serde", serde(default))]
    pub is_taxable: bool,
}

/// A system region
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Region {
    pub id: String,
    pub name: String,
}

/// Geofencing zones of a system, kept as the raw GeoJSON feature collection
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GeofencingZones {
    pub system_id: String,
    pub geojson: String,
}

impl Vehicle {
    /// Position as a lon/lat point, when both coordinates are present
    #[inline]
    pub fn position(&self) -> Option<Point<f64>> {
        Some(Point::new(self.lon?, self.lat?))
    }

    /// Spatial index member for this vehicle
    pub fn index_member(&self) -> Result<SpatialIndexMember> {
        SpatialIndexMember::new(
            self.id.as_str(),
            self.provider.codespace.as_str(),
            self.provider.system_id.as_str(),
            self.provider.operator_id.as_str(),
            MemberAttributes::Vehicle(VehicleAttributes {
                form_factor: self.vehicle_type.form_factor,
                propulsion_type: self.vehicle_type.propulsion_type,
                reserved: self.reserved,
                disabled: self.disabled,
            }),
        )
    }
}

impl Station {
    /// Position as a lon/lat point, when both coordinates are present
    #[inline]
    pub fn position(&self) -> Option<Point<f64>> {
        Some(Point::new(self.lon?, self.lat?))
    }

    /// Spatial index member for this station
    pub fn index_member(&self) -> Result<SpatialIndexMember> {
        let mut attributes = StationAttributes::default();
        for availability in &self.vehicle_types_available {
            let vt = &availability.vehicle_type;
            if !attributes.available_form_factors.contains(&vt.form_factor) {
                attributes.available_form_factors.push(vt.form_factor);
            }
            if !attributes
                .available_propulsion_types
                .contains(&vt.propulsion_type)
            {
                attributes.available_propulsion_types.push(vt.propulsion_type);
            }
        }

        SpatialIndexMember::new(
            self.id.as_str(),
            self.provider.codespace.as_str(),
            self.provider.system_id.as_str(),
            self.provider.operator_id.as_str(),
            MemberAttributes::Station(attributes),
        )
    }
}
