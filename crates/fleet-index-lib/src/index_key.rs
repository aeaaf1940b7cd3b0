//! Spatial index member codec
//!
//! A member is the string stored at a coordinate in a spatial index. It carries the entity
//! id (which is also the entity cache key) plus the attributes geo searches filter on, so a
//! search can discard candidates before fetching any entity.
//!
//! Fields are joined with [`MEMBER_SEPARATOR`]:
//!
//! ```text
//! vehicle: id|codespace|systemId|operatorId|FORM_FACTOR|PROPULSION_TYPE|reserved|disabled
//! station: id|codespace|systemId|operatorId|FORM_FACTOR,...|PROPULSION_TYPE,...
//! ```
//!
//! The station attribute lists may be empty, and the bare four-field station form is also
//! accepted when decoding.

use crate::{FleetError, Result};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use std::str::FromStr;

/// Separator between member fields
pub const MEMBER_SEPARATOR: char = '|';

/// Separator between the values of a list attribute
const LIST_SEPARATOR: char = ',';

const VEHICLE_FIELDS: usize = 8;
const STATION_FIELDS: usize = 6;
const STATION_LEGACY_FIELDS: usize = 4;

/// Kind of entity a spatial index holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum EntityKind {
    Vehicle,
    Station,
}

impl EntityKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Vehicle => "vehicle",
            EntityKind::Station => "station",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Vehicle form factor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum FormFactor {
    Bicycle,
    CargoBicycle,
    Car,
    Moped,
    Scooter,
    ScooterStanding,
    ScooterSeated,
    Other,
}

impl FormFactor {
    pub const ALL: [FormFactor; 8] = [
        FormFactor::Bicycle,
        FormFactor::CargoBicycle,
        FormFactor::Car,
        FormFactor::Moped,
        FormFactor::Scooter,
        FormFactor::ScooterStanding,
        FormFactor::ScooterSeated,
        FormFactor::Other,
    ];

    /// Canonical name, as used in member strings
    pub const fn as_str(&self) -> &'static str {
        match self {
            FormFactor::Bicycle => "BICYCLE",
            FormFactor::CargoBicycle => "CARGO_BICYCLE",
            FormFactor::Car => "CAR",
            FormFactor::Moped => "MOPED",
            FormFactor::Scooter => "SCOOTER",
            FormFactor::ScooterStanding => "SCOOTER_STANDING",
            FormFactor::ScooterSeated => "SCOOTER_SEATED",
            FormFactor::Other => "OTHER",
        }
    }
}

impl fmt::Display for FormFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FormFactor {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self> {
        FormFactor::ALL
            .into_iter()
            .find(|ff| ff.as_str() == s)
            .ok_or_else(|| FleetError::MalformedIndexKey(format!("Unknown form factor '{}'", s)))
    }
}

/// Vehicle propulsion type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum PropulsionType {
    Human,
    ElectricAssist,
    Electric,
    Combustion,
    CombustionDiesel,
    Hybrid,
    PlugInHybrid,
    HydrogenFuelCell,
}

impl PropulsionType {
    pub const ALL: [PropulsionType; 8] = [
        PropulsionType::Human,
        PropulsionType::ElectricAssist,
        PropulsionType::Electric,
        PropulsionType::Combustion,
        PropulsionType::CombustionDiesel,
        PropulsionType::Hybrid,
        PropulsionType::PlugInHybrid,
        PropulsionType::HydrogenFuelCell,
    ];

    /// Canonical name, as used in member strings
    pub const fn as_str(&self) -> &'static str {
        match self {
            PropulsionType::Human => "HUMAN",
            PropulsionType::ElectricAssist => "ELECTRIC_ASSIST",
            PropulsionType::Electric => "ELECTRIC",
            PropulsionType::Combustion => "COMBUSTION",
            PropulsionType::CombustionDiesel => "COMBUSTION_DIESEL",
            PropulsionType::Hybrid => "HYBRID",
            PropulsionType::PlugInHybrid => "PLUG_IN_HYBRID",
            PropulsionType::HydrogenFuelCell => "HYDROGEN_FUEL_CELL",
        }
    }
}

impl fmt::Display for PropulsionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PropulsionType {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self> {
        PropulsionType::ALL
            .into_iter()
            .find(|pt| pt.as_str() == s)
            .ok_or_else(|| {
                FleetError::MalformedIndexKey(format!("Unknown propulsion type '{}'", s))
            })
    }
}

/// Attributes carried by vehicle members
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VehicleAttributes {
    pub form_factor: FormFactor,
    pub propulsion_type: PropulsionType,
    pub reserved: bool,
    pub disabled: bool,
}

/// Attributes carried by station members
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct StationAttributes {
    pub available_form_factors: SmallVec<[FormFactor; 4]>,
    pub available_propulsion_types: SmallVec<[PropulsionType; 4]>,
}

/// Per-kind attribute payload of a member
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MemberAttributes {
    Vehicle(VehicleAttributes),
    Station(StationAttributes),
}

/// A decoded spatial index member
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SpatialIndexMember {
    /// Entity id, also the entity cache key
    pub id: String,
    pub codespace: String,
    pub system_id: String,
    pub operator_id: String,
    pub attributes: MemberAttributes,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl SpatialIndexMember {
    /// Create a member, rejecting fields that would not survive encoding.
    pub fn new(
        id: impl Into<String>,
        codespace: impl Into<String>,
        system_id: impl Into<String>,
        operator_id: impl Into<String>,
        attributes: MemberAttributes,
    ) -> Result<Self> {
        let member = Self {
            id: id.into(),
            codespace: codespace.into(),
            system_id: system_id.into(),
            operator_id: operator_id.into(),
            attributes,
        };
        check_field("id", &member.id)?;
        check_field("codespace", &member.codespace)?;
        check_field("systemId", &member.system_id)?;
        check_field("operatorId", &member.operator_id)?;
        Ok(member)
    }

    #[inline]
    pub fn kind(&self) -> EntityKind {
        match self.attributes {
            MemberAttributes::Vehicle(_) => EntityKind::Vehicle,
            MemberAttributes::Station(_) => EntityKind::Station,
        }
    }

    /// Vehicle attributes, if this is a vehicle member
    #[inline]
    pub fn vehicle(&self) -> Option<&VehicleAttributes> {
        match &self.attributes {
            MemberAttributes::Vehicle(attrs) => Some(attrs),
            MemberAttributes::Station(_) => None,
        }
    }

    /// Station attributes, if this is a station member
    #[inline]
    pub fn station(&self) -> Option<&StationAttributes> {
        match &self.attributes {
            MemberAttributes::Station(attrs) => Some(attrs),
            MemberAttributes::Vehicle(_) => None,
        }
    }

    /// Encode into the delimited member string
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(
            self.id.len() + self.codespace.len() + self.system_id.len() + self.operator_id.len() + 48,
        );
        for field in [&self.id, &self.codespace, &self.system_id, &self.operator_id] {
            if !out.is_empty() {
                out.push(MEMBER_SEPARATOR);
            }
            out.push_str(field);
        }

        match &self.attributes {
            MemberAttributes::Vehicle(attrs) => {
                for field in [
                    attrs.form_factor.as_str(),
                    attrs.propulsion_type.as_str(),
                    bool_str(attrs.reserved),
                    bool_str(attrs.disabled),
                ] {
                    out.push(MEMBER_SEPARATOR);
                    out.push_str(field);
                }
            }
            MemberAttributes::Station(attrs) => {
                out.push(MEMBER_SEPARATOR);
                push_list(&mut out, attrs.available_form_factors.iter().map(|f| f.as_str()));
                out.push(MEMBER_SEPARATOR);
                push_list(
                    &mut out,
                    attrs.available_propulsion_types.iter().map(|p| p.as_str()),
                );
            }
        }
        out
    }

    /// Decode a member string stored in the index of the given kind
    pub fn decode(kind: EntityKind, s: &str) -> Result<Self> {
        let fields: SmallVec<[&str; 8]> = s.split(MEMBER_SEPARATOR).collect();

        let attributes = match kind {
            EntityKind::Vehicle => {
                if fields.len() != VEHICLE_FIELDS {
                    return Err(field_count_error(kind, VEHICLE_FIELDS, fields.len(), s));
                }
                MemberAttributes::Vehicle(VehicleAttributes {
                    form_factor: fields[4].parse()?,
                    propulsion_type: fields[5].parse()?,
                    reserved: parse_bool(fields[6])?,
                    disabled: parse_bool(fields[7])?,
                })
            }
            EntityKind::Station => match fields.len() {
                STATION_LEGACY_FIELDS => MemberAttributes::Station(StationAttributes::default()),
                STATION_FIELDS => MemberAttributes::Station(StationAttributes {
                    available_form_factors: parse_list(fields[4])?,
                    available_propulsion_types: parse_list(fields[5])?,
                }),
                n => return Err(field_count_error(kind, STATION_FIELDS, n, s)),
            },
        };

        Self::new(fields[0], fields[1], fields[2], fields[3], attributes)
    }
}

impl fmt::Display for SpatialIndexMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

fn check_field(name: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(FleetError::MalformedIndexKey(format!("Empty {} field", name)));
    }
    if value.contains(MEMBER_SEPARATOR) {
        return Err(FleetError::MalformedIndexKey(format!(
            "Field {} contains separator '{}': {}",
            name, MEMBER_SEPARATOR, value
        )));
    }
    Ok(())
}

fn field_count_error(kind: EntityKind, expected: usize, found: usize, s: &str) -> FleetError {
    FleetError::MalformedIndexKey(format!(
        "Expected {} fields in {} member, found {}: {}",
        expected, kind, found, s
    ))
}

#[inline]
fn bool_str(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}

fn parse_bool(s: &str) -> Result<bool> {
    match s {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(FleetError::MalformedIndexKey(format!(
            "Expected 'true' or 'false', found '{}'",
            other
        ))),
    }
}

fn push_list<'a>(out: &mut String, values: impl Iterator<Item = &'a str>) {
    for (i, value) in values.enumerate() {
        if i > 0 {
            out.push(LIST_SEPARATOR);
        }
        out.push_str(value);
    }
}

fn parse_list<T: FromStr<Err = FleetError>>(s: &str) -> Result<SmallVec<[T; 4]>> {
    if s.is_empty() {
        return Ok(SmallVec::new());
    }
    s.split(LIST_SEPARATOR).map(str::parse).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn create_test_vehicle_member(id: &str, form_factor: FormFactor) -> SpatialIndexMember {
        SpatialIndexMember::new(
            id,
            "TST",
            "TST:System:1",
            "TST:Operator:1",
            MemberAttributes::Vehicle(VehicleAttributes {
                form_factor,
                propulsion_type: PropulsionType::Electric,
                reserved: false,
                disabled: true,
            }),
        )
        .unwrap()
    }

    #[test]
    fn test_decode_vehicle_member() {
        let member = SpatialIndexMember::decode(
            EntityKind::Vehicle,
            "TST:Vehicle:12|TST|TST:System:1|TST:Operator:1|SCOOTER|ELECTRIC|false|false",
        )
        .unwrap();

        assert_eq!(member.id, "TST:Vehicle:12");
        assert_eq!(member.codespace, "TST");
        assert_eq!(member.system_id, "TST:System:1");
        assert_eq!(member.operator_id, "TST:Operator:1");
        assert_eq!(member.kind(), EntityKind::Vehicle);

        let attrs = member.vehicle().unwrap();
        assert_eq!(attrs.form_factor, FormFactor::Scooter);
        assert_eq!(attrs.propulsion_type, PropulsionType::Electric);
        assert!(!attrs.reserved);
        assert!(!attrs.disabled);
    }

    #[test]
    fn test_encode_vehicle_member() {
        let member = create_test_vehicle_member("veh-1", FormFactor::CargoBicycle);
        assert_eq!(
            member.encode(),
            "veh-1|TST|TST:System:1|TST:Operator:1|CARGO_BICYCLE|ELECTRIC|false|true"
        );
        let decoded = SpatialIndexMember::decode(EntityKind::Vehicle, &member.encode()).unwrap();
        assert_eq!(decoded, member);
    }

    #[test]
    fn test_station_member_with_attributes() {
        let member = SpatialIndexMember::new(
            "TST:Station:1",
            "TST",
            "TST:System:1",
            "TST:Operator:1",
            MemberAttributes::Station(StationAttributes {
                available_form_factors: smallvec![FormFactor::Bicycle, FormFactor::Scooter],
                available_propulsion_types: smallvec![PropulsionType::Human],
            }),
        )
        .unwrap();

        let encoded = member.encode();
        assert_eq!(
            encoded,
            "TST:Station:1|TST|TST:System:1|TST:Operator:1|BICYCLE,SCOOTER|HUMAN"
        );
        assert_eq!(
            SpatialIndexMember::decode(EntityKind::Station, &encoded).unwrap(),
            member
        );
    }

    #[test]
    fn test_station_member_without_attributes() {
        let legacy = SpatialIndexMember::decode(
            EntityKind::Station,
            "TST:Station:1|TST|TST:System:1|TST:Operator:1",
        )
        .unwrap();
        let station = legacy.station().unwrap();
        assert!(station.available_form_factors.is_empty());
        assert!(station.available_propulsion_types.is_empty());

        // Empty lists encode as empty fields and decode back to empty lists
        assert_eq!(legacy.encode(), "TST:Station:1|TST|TST:System:1|TST:Operator:1||");
        assert_eq!(
            SpatialIndexMember::decode(EntityKind::Station, &legacy.encode()).unwrap(),
            legacy
        );
    }

    #[test]
    fn test_decode_rejects_malformed_members() {
        let kind = EntityKind::Vehicle;
        // wrong field count
        assert!(SpatialIndexMember::decode(kind, "veh-1|TST|sys|op|SCOOTER|ELECTRIC|false").is_err());
        // unknown enum names
        assert!(SpatialIndexMember::decode(kind, "veh-1|TST|sys|op|HOVERBOARD|ELECTRIC|false|false").is_err());
        assert!(SpatialIndexMember::decode(kind, "veh-1|TST|sys|op|SCOOTER|NUCLEAR|false|false").is_err());
        // booleans are literal
        assert!(SpatialIndexMember::decode(kind, "veh-1|TST|sys|op|SCOOTER|ELECTRIC|no|false").is_err());
        assert!(SpatialIndexMember::decode(kind, "veh-1|TST|sys|op|SCOOTER|ELECTRIC|False|false").is_err());
        // empty field
        assert!(SpatialIndexMember::decode(kind, "|TST|sys|op|SCOOTER|ELECTRIC|false|false").is_err());
        // station with five fields
        assert!(SpatialIndexMember::decode(EntityKind::Station, "st|TST|sys|op|BICYCLE").is_err());
    }

    #[test]
    fn test_new_rejects_separator_in_field() {
        let result = SpatialIndexMember::new(
            "veh|1",
            "TST",
            "TST:System:1",
            "TST:Operator:1",
            MemberAttributes::Station(StationAttributes::default()),
        );
        assert!(matches!(result, Err(FleetError::MalformedIndexKey(_))));
    }

    #[test]
    fn test_enum_names_are_canonical() {
        for ff in FormFactor::ALL {
            assert_eq!(ff.as_str().parse::<FormFactor>().unwrap(), ff);
        }
        for pt in PropulsionType::ALL {
            assert_eq!(pt.as_str().parse::<PropulsionType>().unwrap(), pt);
        }
        assert_eq!(PropulsionType::PlugInHybrid.to_string(), "PLUG_IN_HYBRID");
        assert!("scooter".parse::<FormFactor>().is_err());
    }
}
