//! Typed records passed between pipeline stages.

use crate::error::{MatchError, Result};
use chrono::NaiveDate;
use geo::{BoundingRect, Coord, LineString, MultiLineString, Point, Rect};
use geos::Geom;
use serde::Serialize;
use std::fmt;

/// A polyline that is either a single line or several disjoint parts.
#[derive(Debug, Clone, PartialEq)]
pub enum LineGeometry {
    Line(LineString<f64>),
    Multi(MultiLineString<f64>),
}

impl LineGeometry {
    /// Build from collected parts. One part yields a single line.
    pub fn from_parts(mut parts: Vec<LineString<f64>>) -> Option<Self> {
        match parts.len() {
            0 => None,
            1 => parts.pop().map(LineGeometry::Line),
            _ => Some(LineGeometry::Multi(MultiLineString::new(parts))),
        }
    }

    pub fn lines(&self) -> &[LineString<f64>] {
        match self {
            LineGeometry::Line(line) => std::slice::from_ref(line),
            LineGeometry::Multi(multi) => &multi.0,
        }
    }

    pub fn bounding_rect(&self) -> Option<Rect<f64>> {
        match self {
            LineGeometry::Line(line) => line.bounding_rect(),
            LineGeometry::Multi(multi) => multi.bounding_rect(),
        }
    }

    pub fn to_geos(&self) -> Result<geos::Geometry> {
        let geometry = match self {
            LineGeometry::Line(line) => geos::Geometry::try_from(line)?,
            LineGeometry::Multi(multi) => geos::Geometry::try_from(multi)?,
        };
        Ok(geometry)
    }

    /// Planar length in CRS units.
    pub fn length(&self) -> Result<f64> {
        Ok(self.to_geos()?.length()?)
    }

    pub fn from_geos(geometry: &geos::Geometry) -> Result<Self> {
        match geo::Geometry::try_from(geometry)? {
            geo::Geometry::LineString(line) => Ok(LineGeometry::Line(line)),
            geo::Geometry::MultiLineString(multi) => Ok(LineGeometry::Multi(multi)),
            _ => Err(MatchError::UnexpectedGeometry(
                "expected a LineString or MultiLineString".to_string(),
            )),
        }
    }

    /// Apply a fallible coordinate transform to every vertex.
    pub fn try_map_coords<F>(&self, mut f: F) -> Result<Self>
    where
        F: FnMut(Coord<f64>) -> Result<Coord<f64>>,
    {
        let mut map_line = |line: &LineString<f64>| -> Result<LineString<f64>> {
            let coords = line.0.iter().map(|c| f(*c)).collect::<Result<Vec<_>>>()?;
            Ok(LineString::new(coords))
        };
        Ok(match self {
            LineGeometry::Line(line) => LineGeometry::Line(map_line(line)?),
            LineGeometry::Multi(multi) => LineGeometry::Multi(MultiLineString::new(
                multi.0.iter().map(&mut map_line).collect::<Result<Vec<_>>>()?,
            )),
        })
    }

    /// Every part as a multi-line, used by the FlatGeobuf writer.
    pub fn to_multi(&self) -> MultiLineString<f64> {
        match self {
            LineGeometry::Line(line) => MultiLineString::new(vec![line.clone()]),
            LineGeometry::Multi(multi) => multi.clone(),
        }
    }
}

impl From<&LineGeometry> for geo::Geometry<f64> {
    fn from(geometry: &LineGeometry) -> Self {
        match geometry {
            LineGeometry::Line(line) => geo::Geometry::LineString(line.clone()),
            LineGeometry::Multi(multi) => geo::Geometry::MultiLineString(multi.clone()),
        }
    }
}

/// One parsed trajectory from one `<trk>` element.
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub file_name: String,
    pub track_name: Option<String>,
    /// `<file_name>__<index of trk within the file>`
    pub track_uid: String,
    pub track_date: NaiveDate,
    pub geometry: LineGeometry,
    pub activity_type: Option<String>,
}

impl Track {
    pub fn info(&self) -> TrackInfo {
        TrackInfo {
            file_name: self.file_name.clone(),
            track_name: self.track_name.clone(),
            track_date: self.track_date,
            track_uid: self.track_uid.clone(),
        }
    }
}

/// Identifying fields of a track, copied into every output row it produced.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TrackInfo {
    #[serde(rename = "gpx_name")]
    pub file_name: String,
    pub track_name: Option<String>,
    pub track_date: NaiveDate,
    pub track_uid: String,
}

/// A track in the working CRS, with its simplified line and matching corridor.
#[derive(Clone)]
pub struct PreparedTrack {
    pub track: Track,
    pub corridor: geos::Geometry,
    /// Bounding box of the corridor.
    pub envelope: Rect<f64>,
}

impl fmt::Debug for PreparedTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedTrack")
            .field("track", &self.track)
            .field("envelope", &self.envelope)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceSegment {
    pub reference: String,
    pub osm_id: i64,
    pub osm_id_from: Option<i64>,
    pub osm_id_to: Option<i64>,
    pub length_km: f64,
    pub geometry: LineGeometry,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceNode {
    pub rcn_ref: String,
    pub osm_id: i64,
    pub geometry: Point<f64>,
}

/// The static reference network, in the working CRS.
#[derive(Debug, Clone, Default)]
pub struct ReferenceNetwork {
    pub segments: Vec<ReferenceSegment>,
    pub nodes: Vec<ReferenceNode>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchedSegment {
    pub segment: ReferenceSegment,
    pub track: TrackInfo,
    /// Fraction of the segment's length inside the track corridor, in [0, 1].
    pub overlap_percentage: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchedNode {
    pub node: ReferenceNode,
    pub track: TrackInfo,
}

/// A processed track as exported alongside the match tables.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackRecord {
    pub track: Track,
    pub track_length_km: f64,
}

/// Why a stage produced nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptyReason {
    NoTrackFiles,
    NoTracks,
    NoIntersections,
    BelowThreshold,
    NoNodes,
}

impl fmt::Display for EmptyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            EmptyReason::NoTrackFiles => "No GPX files found.",
            EmptyReason::NoTracks => "No valid GPX tracks found.",
            EmptyReason::NoIntersections => "No intersections found.",
            EmptyReason::BelowThreshold => "No segments exceeded threshold.",
            EmptyReason::NoNodes => "No network nodes matched.",
        };
        f.write_str(message)
    }
}

/// Stage output: either rows to pass on, or an explicit empty terminal state.
#[derive(Debug, Clone, PartialEq)]
pub enum Stage<T> {
    Empty(EmptyReason),
    Rows(T),
}

impl<T> Stage<T> {
    pub fn is_empty(&self) -> bool {
        matches!(self, Stage::Empty(_))
    }

    pub fn rows(self) -> Option<T> {
        match self {
            Stage::Rows(rows) => Some(rows),
            Stage::Empty(_) => None,
        }
    }
}
