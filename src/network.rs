//! Loading the static reference network from GeoJSON.
//!
//! Segments carry `ref`, `osm_id`, `osm_id_from`, `osm_id_to` and `length_km`
//! properties on LineString/MultiLineString features; nodes carry `rcn_ref`
//! and `osm_id` on Point features. Geometries are moved into the working CRS
//! on load.

use crate::config::MatchConfig;
use crate::error::{MatchError, Result};
use crate::model::{LineGeometry, ReferenceNetwork, ReferenceNode, ReferenceSegment};
use crate::projection::Reprojector;
use geojson::{FeatureCollection, GeoJson, JsonObject, JsonValue};
use std::fs;
use std::path::Path;

impl ReferenceNetwork {
    pub fn load(segments_path: &Path, nodes_path: &Path, config: &MatchConfig) -> Result<Self> {
        let reprojector = Reprojector::new(config.network_epsg, config.working_epsg)?;
        let segments = read_segments(segments_path, &reprojector)?;
        let nodes = read_nodes(nodes_path, &reprojector)?;
        tracing::info!(
            "Loaded reference network: {} segments, {} nodes",
            segments.len(),
            nodes.len()
        );
        Ok(Self { segments, nodes })
    }
}

fn read_collection(path: &Path) -> Result<FeatureCollection> {
    let content = fs::read_to_string(path)?;
    let geojson: GeoJson = content.parse()?;
    Ok(FeatureCollection::try_from(geojson)?)
}

pub fn read_segments(path: &Path, reprojector: &Reprojector) -> Result<Vec<ReferenceSegment>> {
    let collection = read_collection(path)?;
    let mut segments = Vec::with_capacity(collection.features.len());

    for (index, feature) in collection.features.into_iter().enumerate() {
        let invalid = |reason: &str| MatchError::InvalidNetwork {
            path: path.to_path_buf(),
            index,
            reason: reason.to_string(),
        };
        let properties = feature.properties.unwrap_or_default();
        let geometry = feature.geometry.ok_or_else(|| invalid("missing geometry"))?;
        let geometry = match geo::Geometry::<f64>::try_from(geometry.value)? {
            geo::Geometry::LineString(line) => LineGeometry::Line(line),
            geo::Geometry::MultiLineString(multi) => LineGeometry::Multi(multi),
            _ => return Err(invalid("segment geometry must be a LineString or MultiLineString")),
        };
        let geometry = reprojector.line(&geometry)?;

        let osm_id = prop_i64(&properties, "osm_id").ok_or_else(|| invalid("missing osm_id"))?;
        let length_km = match prop_f64(&properties, "length_km") {
            Some(length) => length,
            None => geometry.length()? / 1000.0,
        };

        segments.push(ReferenceSegment {
            reference: prop_string(&properties, "ref").unwrap_or_default(),
            osm_id,
            osm_id_from: prop_i64(&properties, "osm_id_from"),
            osm_id_to: prop_i64(&properties, "osm_id_to"),
            length_km,
            geometry,
        });
    }

    Ok(segments)
}

pub fn read_nodes(path: &Path, reprojector: &Reprojector) -> Result<Vec<ReferenceNode>> {
    let collection = read_collection(path)?;
    let mut nodes = Vec::with_capacity(collection.features.len());

    for (index, feature) in collection.features.into_iter().enumerate() {
        let invalid = |reason: &str| MatchError::InvalidNetwork {
            path: path.to_path_buf(),
            index,
            reason: reason.to_string(),
        };
        let properties = feature.properties.unwrap_or_default();
        let geometry = feature.geometry.ok_or_else(|| invalid("missing geometry"))?;
        let point = match geo::Geometry::<f64>::try_from(geometry.value)? {
            geo::Geometry::Point(point) => point,
            _ => return Err(invalid("node geometry must be a Point")),
        };

        nodes.push(ReferenceNode {
            rcn_ref: prop_string(&properties, "rcn_ref").unwrap_or_default(),
            osm_id: prop_i64(&properties, "osm_id").ok_or_else(|| invalid("missing osm_id"))?,
            geometry: reprojector.point(point)?,
        });
    }

    Ok(nodes)
}

/// Integer property; accepts JSON integers, integral floats and numeric strings.
fn prop_i64(properties: &JsonObject, key: &str) -> Option<i64> {
    match properties.get(key)? {
        JsonValue::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && f.fract() == 0.0)
                .map(|f| f as i64)
        }),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn prop_f64(properties: &JsonObject, key: &str) -> Option<f64> {
    match properties.get(key)? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn prop_string(properties: &JsonObject, key: &str) -> Option<String> {
    match properties.get(key)? {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EPSG_WGS84;

    const SEGMENTS: &str = r#"{
      "type": "FeatureCollection",
      "features": [
        {
          "type": "Feature",
          "properties": {"ref": "12-34", "osm_id": 1001, "osm_id_from": "12", "osm_id_to": 34.0, "length_km": 1.25},
          "geometry": {"type": "LineString", "coordinates": [[4.0, 50.0], [4.01, 50.0]]}
        },
        {
          "type": "Feature",
          "properties": {"ref": 7, "osm_id": 1002, "osm_id_from": null},
          "geometry": {"type": "MultiLineString", "coordinates": [[[0, 0], [3, 4]], [[10, 0], [10, 6]]]}
        }
      ]
    }"#;

    const NODES: &str = r#"{
      "type": "FeatureCollection",
      "features": [
        {"type": "Feature", "properties": {"rcn_ref": "12", "osm_id": 12}, "geometry": {"type": "Point", "coordinates": [4.0, 50.0]}}
      ]
    }"#;

    fn identity() -> Reprojector {
        Reprojector::new(EPSG_WGS84, EPSG_WGS84).unwrap()
    }

    #[test]
    fn reads_segments_with_loose_property_types() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("segments.geojson");
        fs::write(&path, SEGMENTS).unwrap();

        let segments = read_segments(&path, &identity()).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].reference, "12-34");
        assert_eq!(segments[0].osm_id_from, Some(12));
        assert_eq!(segments[0].osm_id_to, Some(34));
        assert_eq!(segments[0].length_km, 1.25);
        assert!(matches!(segments[0].geometry, LineGeometry::Line(_)));

        assert_eq!(segments[1].reference, "7");
        assert_eq!(segments[1].osm_id_from, None);
        assert!(matches!(segments[1].geometry, LineGeometry::Multi(_)));
        // length derived from geometry: 5 + 6 units
        assert!((segments[1].length_km - 0.011).abs() < 1e-12);
    }

    #[test]
    fn reads_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.geojson");
        fs::write(&path, NODES).unwrap();

        let nodes = read_nodes(&path, &identity()).unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].rcn_ref, "12");
        assert_eq!(nodes[0].osm_id, 12);
    }

    #[test]
    fn wrong_geometry_kind_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("segments.geojson");
        fs::write(&path, NODES).unwrap();
        let err = read_segments(&path, &identity()).unwrap_err();
        assert!(matches!(err, MatchError::InvalidNetwork { index: 0, .. }));
    }
}
