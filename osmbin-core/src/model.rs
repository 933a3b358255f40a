//! Map entities as seen by callers of the datasets.
//!
//! Coordinates are degrees in `f64`; the storage layer keeps them as
//! fixed-precision `i32` (see [`to_fixed`]).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Fixed-point scale for latitude/longitude (1e-7 degree resolution).
pub const FIXED_PRECISION: f64 = 10_000_000.0;

/// Mean earth radius used for distances
const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Length of one degree of latitude on that sphere
pub const METERS_PER_DEGREE: f64 = EARTH_RADIUS_METERS * std::f64::consts::PI / 180.0;

/// Key/value tags of an entity
pub type Tags = BTreeMap<String, String>;

/// Convert degrees to the on-disk fixed-point representation.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn to_fixed(degrees: f64) -> i32 {
    (degrees * FIXED_PRECISION).round() as i32
}

/// Convert an on-disk fixed-point value back to degrees.
#[must_use]
pub fn from_fixed(fixed: i32) -> f64 {
    f64::from(fixed) / FIXED_PRECISION
}

/// Kind of entity; the discriminant is the on-disk member type ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityType {
    /// A point
    Node = 0,
    /// An ordered list of nodes
    Way = 1,
    /// A group of typed members
    Relation = 2,
}

impl EntityType {
    /// Ordinal stored in relation member slots
    #[must_use]
    pub const fn ordinal(self) -> i32 {
        self as i32
    }

    /// Inverse of [`EntityType::ordinal`]
    #[must_use]
    pub const fn from_ordinal(ordinal: i32) -> Option<Self> {
        match ordinal {
            0 => Some(Self::Node),
            1 => Some(Self::Way),
            2 => Some(Self::Relation),
            _ => None,
        }
    }
}

/// A geographic position
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLon {
    /// Latitude in degrees
    pub lat: f64,
    /// Longitude in degrees
    pub lon: f64,
}

impl LatLon {
    /// Create a position
    #[must_use]
    pub const fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Great-circle (haversine) distance in meters
    #[must_use]
    pub fn distance_to(&self, other: &LatLon) -> f64 {
        let d_lat = (other.lat - self.lat).to_radians();
        let d_lon = (other.lon - self.lon).to_radians();
        let a = (d_lat / 2.0).sin().powi(2)
            + self.lat.to_radians().cos()
                * other.lat.to_radians().cos()
                * (d_lon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_METERS * a.sqrt().atan2((1.0 - a).sqrt())
    }
}

/// An axis-aligned lat/lon rectangle; all edges are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    /// Southern edge
    pub min_lat: f64,
    /// Northern edge
    pub max_lat: f64,
    /// Western edge
    pub min_lon: f64,
    /// Eastern edge
    pub max_lon: f64,
}

impl Bounds {
    /// The whole planet
    pub const WORLD: Bounds =
        Bounds { min_lat: -90.0, max_lat: 90.0, min_lon: -180.0, max_lon: 180.0 };

    /// Create bounds from two corners in any order
    #[must_use]
    pub fn new(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> Self {
        Self {
            min_lat: lat1.min(lat2),
            max_lat: lat1.max(lat2),
            min_lon: lon1.min(lon2),
            max_lon: lon1.max(lon2),
        }
    }

    /// A square window of `radius` degrees around `center`, clamped to the planet
    #[must_use]
    pub fn around(center: LatLon, radius: f64) -> Self {
        Self::around_with(center, radius, radius)
    }

    /// A window reaching `dlat` and `dlon` degrees from `center`, clamped to the planet
    #[must_use]
    pub fn around_with(center: LatLon, dlat: f64, dlon: f64) -> Self {
        Self {
            min_lat: (center.lat - dlat).max(-90.0),
            max_lat: (center.lat + dlat).min(90.0),
            min_lon: (center.lon - dlon).max(-180.0),
            max_lon: (center.lon + dlon).min(180.0),
        }
    }

    /// Bounds covering a single point
    #[must_use]
    pub const fn point(pos: LatLon) -> Self {
        Self { min_lat: pos.lat, max_lat: pos.lat, min_lon: pos.lon, max_lon: pos.lon }
    }

    /// True if these bounds cover the whole planet
    #[must_use]
    pub fn is_world(&self) -> bool {
        self.min_lat <= -90.0
            && self.max_lat >= 90.0
            && self.min_lon <= -180.0
            && self.max_lon >= 180.0
    }

    /// Inclusive point containment
    #[must_use]
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        lat >= self.min_lat && lat <= self.max_lat && lon >= self.min_lon && lon <= self.max_lon
    }

    /// True if the rectangles share at least one point
    #[must_use]
    pub fn intersects(&self, other: &Bounds) -> bool {
        self.min_lat <= other.max_lat
            && other.min_lat <= self.max_lat
            && self.min_lon <= other.max_lon
            && other.min_lon <= self.max_lon
    }

    /// Grow to include a point
    pub fn extend(&mut self, lat: f64, lon: f64) {
        self.min_lat = self.min_lat.min(lat);
        self.max_lat = self.max_lat.max(lat);
        self.min_lon = self.min_lon.min(lon);
        self.max_lon = self.max_lon.max(lon);
    }
}

/// A tagged point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Entity id
    pub id: i64,
    /// Version counter, higher wins
    pub version: i32,
    /// Latitude in degrees
    pub lat: f64,
    /// Longitude in degrees
    pub lon: f64,
    /// Tags
    pub tags: Tags,
}

impl Node {
    /// Create an untagged node
    #[must_use]
    pub fn new(id: i64, version: i32, lat: f64, lon: f64) -> Self {
        Self { id, version, lat, lon, tags: Tags::new() }
    }

    /// Builder-style tag setter
    #[must_use]
    pub fn with_tag(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key.to_owned(), value.to_owned());
        self
    }

    /// Position of the node
    #[must_use]
    pub const fn position(&self) -> LatLon {
        LatLon { lat: self.lat, lon: self.lon }
    }
}

/// An ordered sequence of nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Way {
    /// Entity id
    pub id: i64,
    /// Version counter, higher wins
    pub version: i32,
    /// Tags
    pub tags: Tags,
    /// Referenced node ids in order
    pub node_ids: Vec<i64>,
}

impl Way {
    /// Create an untagged way
    #[must_use]
    pub fn new(id: i64, version: i32, node_ids: Vec<i64>) -> Self {
        Self { id, version, tags: Tags::new(), node_ids }
    }

    /// Builder-style tag setter
    #[must_use]
    pub fn with_tag(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key.to_owned(), value.to_owned());
        self
    }
}

/// One typed member of a relation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Member kind
    pub kind: EntityType,
    /// Member id
    pub id: i64,
    /// Role string, possibly empty
    pub role: String,
}

impl Member {
    /// Create a member
    #[must_use]
    pub fn new(kind: EntityType, id: i64, role: &str) -> Self {
        Self { kind, id, role: role.to_owned() }
    }
}

/// A group of typed references
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    /// Entity id
    pub id: i64,
    /// Version counter, higher wins
    pub version: i32,
    /// Tags
    pub tags: Tags,
    /// Members in order
    pub members: Vec<Member>,
}

impl Relation {
    /// Create an untagged relation
    #[must_use]
    pub fn new(id: i64, version: i32, members: Vec<Member>) -> Self {
        Self { id, version, tags: Tags::new(), members }
    }

    /// Builder-style tag setter
    #[must_use]
    pub fn with_tag(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key.to_owned(), value.to_owned());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_point_round_trip() {
        for deg in [52.5, 13.4, -33.8688, 151.2093, 0.0, 89.999_999_9] {
            assert_eq!(from_fixed(to_fixed(deg)), deg);
        }
    }

    #[test]
    fn test_bounds_inclusive_edges() {
        let b = Bounds::new(1.0, 1.0, 2.0, 2.0);
        assert!(b.contains(1.0, 1.0));
        assert!(b.contains(2.0, 2.0));
        assert!(!b.contains(2.000_000_1, 1.5));
    }

    #[test]
    fn test_distance_one_degree_latitude() {
        let d = LatLon::new(0.0, 0.0).distance_to(&LatLon::new(1.0, 0.0));
        assert!((d - 111_195.0).abs() < 10.0, "got {d}");
    }

    #[test]
    fn test_entity_type_ordinals() {
        for kind in [EntityType::Node, EntityType::Way, EntityType::Relation] {
            assert_eq!(EntityType::from_ordinal(kind.ordinal()), Some(kind));
        }
        assert_eq!(EntityType::from_ordinal(7), None);
    }
}
