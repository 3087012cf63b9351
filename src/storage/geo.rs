use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::value::Point;
use crate::error::{AdapterError, AdapterResult};

/// Earth radius in meters
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Earth radius in kilometers and miles, for `$maxDistanceIn*` conversions
pub const EARTH_RADIUS_KM: f64 = 6_371.0;
pub const EARTH_RADIUS_MI: f64 = 3_958.8;

/// A geographic point
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    /// Create a new geo point, validating its bounds
    pub fn new(latitude: f64, longitude: f64) -> AdapterResult<Self> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(AdapterError::Geometry(format!(
                "GeoPoint latitude out of bounds: {}",
                latitude
            )));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(AdapterError::Geometry(format!(
                "GeoPoint longitude out of bounds: {}",
                longitude
            )));
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }

    /// Parse geo point from a document value
    /// Supports: { "__type": "GeoPoint", "latitude": .., "longitude": .. } or [lon, lat] (GeoJSON)
    pub fn from_value(value: &Value) -> AdapterResult<Self> {
        if let Some(obj) = value.as_object() {
            if obj.get("__type").and_then(Value::as_str) != Some("GeoPoint") {
                return Err(AdapterError::InvalidQuery(format!(
                    "expected a GeoPoint, got {}",
                    value
                )));
            }
            let lat = obj.get("latitude").and_then(Value::as_f64);
            let lon = obj.get("longitude").and_then(Value::as_f64);
            return match (lat, lon) {
                (Some(lat), Some(lon)) => Self::new(lat, lon),
                _ => Err(AdapterError::InvalidQuery(format!(
                    "GeoPoint requires numeric latitude and longitude: {}",
                    value
                ))),
            };
        }

        if let Some([lon, lat]) = value.as_array().map(Vec::as_slice) {
            if let (Some(lon), Some(lat)) = (lon.as_f64(), lat.as_f64()) {
                return Self::new(lat, lon);
            }
        }

        Err(AdapterError::InvalidQuery(format!(
            "expected a GeoPoint, got {}",
            value
        )))
    }

    pub fn to_value(&self) -> Value {
        json!({
            "__type": "GeoPoint",
            "latitude": self.latitude,
            "longitude": self.longitude,
        })
    }

    /// Storage axis order: x = longitude, y = latitude
    pub fn to_point(&self) -> Point {
        Point::new(self.longitude, self.latitude)
    }

    pub fn from_point(point: &Point) -> Self {
        Self {
            latitude: point.y,
            longitude: point.x,
        }
    }
}

/// Point literal `(x, y)` in storage axis order
pub fn point_literal(point: &GeoPoint) -> String {
    format!("({}, {})", point.longitude, point.latitude)
}

/// Box literal from south-west and north-east corners
pub fn box_literal(south_west: &GeoPoint, north_east: &GeoPoint) -> String {
    format!(
        "(({}, {}), ({}, {}))",
        south_west.longitude, south_west.latitude, north_east.longitude, north_east.latitude
    )
}

/// Polygon literal `((x, y), ...)` from storage points
pub fn polygon_literal(points: &[Point]) -> String {
    let vertices: Vec<String> = points.iter().map(|p| format!("({}, {})", p.x, p.y)).collect();
    format!("({})", vertices.join(", "))
}

// ==================== Polygons ====================

/// Build a closed ring from document coordinates (`[latitude, longitude]`
/// pairs). The first vertex is repeated as the last one unless the input
/// is already closed.
pub fn close_ring(coordinates: &[[f64; 2]]) -> AdapterResult<Vec<Point>> {
    let mut ring = Vec::with_capacity(coordinates.len() + 1);
    for [lat, lon] in coordinates {
        ring.push(GeoPoint::new(*lat, *lon)?.to_point());
    }

    if distinct_vertices(&ring) < 3 {
        return Err(AdapterError::Geometry(
            "GeoJSON: Loop must have at least 3 different vertices".to_string(),
        ));
    }

    if ring.first() != ring.last() {
        ring.push(ring[0]);
    }
    Ok(ring)
}

/// Document coordinates from a stored ring, dropping the closing vertex
pub fn open_ring(points: &[Point]) -> Vec<[f64; 2]> {
    let mut points = points.to_vec();
    if points.len() > 1 && points.first() == points.last() {
        points.pop();
    }
    points.iter().map(|p| [p.y, p.x]).collect()
}

fn distinct_vertices(points: &[Point]) -> usize {
    let mut seen: Vec<(u64, u64)> = points
        .iter()
        .map(|p| (p.x.to_bits(), p.y.to_bits()))
        .collect();
    seen.sort_unstable();
    seen.dedup();
    seen.len()
}

/// Parse document polygon coordinates
pub fn coordinates_from_value(value: &Value) -> AdapterResult<Vec<[f64; 2]>> {
    let coords = value
        .as_array()
        .ok_or_else(|| AdapterError::Geometry(format!("Polygon coordinates must be an array: {}", value)))?;
    coords
        .iter()
        .map(|pair| match pair.as_array().map(Vec::as_slice) {
            Some([a, b]) => match (a.as_f64(), b.as_f64()) {
                (Some(a), Some(b)) => Ok([a, b]),
                _ => Err(AdapterError::Geometry(format!("bad polygon vertex: {}", pair))),
            },
            _ => Err(AdapterError::Geometry(format!("bad polygon vertex: {}", pair))),
        })
        .collect()
}
