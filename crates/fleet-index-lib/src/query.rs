//! Query parameter validation
//!
//! Raw query parameters arrive as a loose bag of optional values. A request must fully
//! describe exactly one search shape: a range search (`lat`, `lon`, `range`) or a bounding
//! box search (all four min/max coordinates). Anything else is rejected before it reaches
//! the search engine.

use crate::utils::is_valid_position;
use crate::{FleetError, Result};

use geo::{Coord, Point, Rect};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Inclusive latitude/longitude rectangle
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BoundingBox {
    pub min_lat: f64,
    pub min_lon: f64,
    pub max_lat: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    /// The box as a lon/lat rectangle (x = longitude, y = latitude)
    #[inline]
    pub fn to_rect(&self) -> Rect<f64> {
        Rect::new(
            Coord {
                x: self.min_lon,
                y: self.min_lat,
            },
            Coord {
                x: self.max_lon,
                y: self.max_lat,
            },
        )
    }

    fn validate(&self) -> Result<()> {
        if !is_valid_position(self.min_lon, self.min_lat)
            || !is_valid_position(self.max_lon, self.max_lat)
        {
            return Err(FleetError::Validation(
                "Bounding box coordinates out of range".to_string(),
            ));
        }
        if self.min_lat > self.max_lat || self.min_lon > self.max_lon {
            return Err(FleetError::Validation(
                "Bounding box minimum must not exceed maximum".to_string(),
            ));
        }
        Ok(())
    }
}

/// A validated search shape
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SearchShape {
    Range { center: Point<f64>, radius_m: f64 },
    BoundingBox(BoundingBox),
}

/// Raw, unvalidated search parameters
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SearchParameters {
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    /// Radius in meters
    pub range: Option<f64>,
    pub min_lat: Option<f64>,
    pub min_lon: Option<f64>,
    pub max_lat: Option<f64>,
    pub max_lon: Option<f64>,
    pub count: Option<i64>,
}

impl SearchParameters {
    /// Validate and resolve the search shape and result cap
    pub fn validate(&self) -> Result<(SearchShape, Option<usize>)> {
        let range_fields = [self.lat, self.lon, self.range];
        let bbox_fields = [self.min_lat, self.min_lon, self.max_lat, self.max_lon];
        let any_range = range_fields.iter().any(Option::is_some);
        let any_bbox = bbox_fields.iter().any(Option::is_some);

        let shape = match (any_range, any_bbox) {
            (true, true) => {
                return Err(FleetError::Validation(
                    "Give either range search or bounding box parameters, not both".to_string(),
                ));
            }
            (false, false) => {
                return Err(FleetError::Validation(
                    "Either lat, lon and range, or all of minimumLatitude, minimumLongitude, maximumLatitude and maximumLongitude must be specified".to_string(),
                ));
            }
            (true, false) => match range_fields {
                [Some(lat), Some(lon), Some(range)] => {
                    if !range.is_finite() || range < 0.0 {
                        return Err(FleetError::Validation(
                            "Range must be non-negative".to_string(),
                        ));
                    }
                    if !is_valid_position(lon, lat) {
                        return Err(FleetError::Validation(
                            "Center coordinates out of range".to_string(),
                        ));
                    }
                    SearchShape::Range {
                        center: Point::new(lon, lat),
                        radius_m: range,
                    }
                }
                _ => {
                    return Err(FleetError::Validation(
                        "Range search requires lat, lon and range".to_string(),
                    ));
                }
            },
            (false, true) => match bbox_fields {
                [Some(min_lat), Some(min_lon), Some(max_lat), Some(max_lon)] => {
                    let bbox = BoundingBox {
                        min_lat,
                        min_lon,
                        max_lat,
                        max_lon,
                    };
                    bbox.validate()?;
                    SearchShape::BoundingBox(bbox)
                }
                _ => {
                    return Err(FleetError::Validation(
                        "Bounding box search requires minimumLatitude, minimumLongitude, maximumLatitude and maximumLongitude".to_string(),
                    ));
                }
            },
        };

        Ok((shape, validate_count(self.count)?))
    }
}

/// A result cap, when given, must be positive
pub fn validate_count(count: Option<i64>) -> Result<Option<usize>> {
    match count {
        None => Ok(None),
        Some(c) if c > 0 => Ok(Some(c as usize)),
        Some(_) => Err(FleetError::Validation("Count must be positive".to_string())),
    }
}

/// Requested codespaces must all be known
pub fn validate_codespaces(requested: &[String], known: &HashSet<String>) -> Result<()> {
    validate_known(requested, known, "Unknown codespace(s)")
}

/// Requested systems must all be known
pub fn validate_systems(requested: &[String], known: &HashSet<String>) -> Result<()> {
    validate_known(requested, known, "Unknown system(s)")
}

fn validate_known(requested: &[String], known: &HashSet<String>, message: &str) -> Result<()> {
    let unknown: Vec<&str> = requested
        .iter()
        .filter(|r| !known.contains(*r))
        .map(String::as_str)
        .collect();
    if unknown.is_empty() {
        Ok(())
    } else {
        Err(FleetError::Validation(format!(
            "{}: {}",
            message,
            unknown.join(", ")
        )))
    }
}
