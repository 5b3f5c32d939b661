//! Spatial join of track corridors against reference segments.
//!
//! The join runs in two steps so progress can be reported between them:
//! [`spatial_join`] finds every (segment, track) pair whose geometries
//! intersect, and [`compute_overlaps`] measures how much of each segment lies
//! inside the corridor and applies the threshold.

use crate::error::Result;
use crate::model::{EmptyReason, MatchedSegment, PreparedTrack, ReferenceSegment, Stage};
use geo::Rect;
use geos::Geom;
use rstar::{RTree, RTreeObject, AABB};
use std::collections::HashMap;

/// Bounding box of one reference segment, keyed by its position in the table.
#[derive(Debug, Clone, Copy)]
pub struct IndexedSegment {
    pub idx: usize,
    min: [f64; 2],
    max: [f64; 2],
}

impl RTreeObject for IndexedSegment {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners(self.min, self.max)
    }
}

/// Build an R-tree over segment bounding boxes.
pub fn build_rtree(segments: &[ReferenceSegment]) -> RTree<IndexedSegment> {
    let indexed: Vec<IndexedSegment> = segments
        .iter()
        .enumerate()
        .filter_map(|(idx, segment)| {
            let bounds = segment.geometry.bounding_rect()?;
            Some(IndexedSegment {
                idx,
                min: [bounds.min().x, bounds.min().y],
                max: [bounds.max().x, bounds.max().y],
            })
        })
        .collect();
    RTree::bulk_load(indexed)
}

fn rect_envelope(rect: &Rect<f64>) -> AABB<[f64; 2]> {
    AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinPair {
    pub segment: usize,
    pub track: usize,
}

/// Result of the intersection test, with the segment geometries it converted.
pub struct SpatialJoin {
    pub pairs: Vec<JoinPair>,
    segment_geoms: HashMap<usize, geos::Geometry>,
}

/// Inner join on `intersects` between segments and track corridors.
pub fn spatial_join(
    segments: &[ReferenceSegment],
    tree: &RTree<IndexedSegment>,
    tracks: &[PreparedTrack],
) -> Result<Stage<SpatialJoin>> {
    let mut pairs = Vec::new();
    let mut segment_geoms: HashMap<usize, geos::Geometry> = HashMap::new();

    for (track_idx, prepared) in tracks.iter().enumerate() {
        let mut candidates: Vec<usize> = tree
            .locate_in_envelope_intersecting(&rect_envelope(&prepared.envelope))
            .map(|indexed| indexed.idx)
            .collect();
        candidates.sort_unstable();

        for segment_idx in candidates {
            if !segment_geoms.contains_key(&segment_idx) {
                let converted = segments[segment_idx].geometry.to_geos()?;
                segment_geoms.insert(segment_idx, converted);
            }
            let geometry = &segment_geoms[&segment_idx];
            if prepared.corridor.intersects(geometry)? {
                pairs.push(JoinPair {
                    segment: segment_idx,
                    track: track_idx,
                });
            }
        }
    }

    tracing::info!("Spatial join found {} segment/track pairs", pairs.len());
    if pairs.is_empty() {
        return Ok(Stage::Empty(EmptyReason::NoIntersections));
    }
    Ok(Stage::Rows(SpatialJoin {
        pairs,
        segment_geoms,
    }))
}

/// Fraction of a segment covered by a corridor, clipped to [0, 1].
///
/// A segment with no length, measured or declared, scores 0.
pub fn overlap_ratio(segment_length: f64, intersection_length: f64, length_km: f64) -> f64 {
    if segment_length > 0.0 && length_km > 0.0 {
        (intersection_length / segment_length).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Measure overlap for every joined pair and keep those at or above `threshold`.
pub fn compute_overlaps(
    join: &SpatialJoin,
    segments: &[ReferenceSegment],
    tracks: &[PreparedTrack],
    threshold: f64,
) -> Result<Stage<Vec<MatchedSegment>>> {
    let mut matched = Vec::new();

    for pair in &join.pairs {
        let segment = &segments[pair.segment];
        let prepared = &tracks[pair.track];
        // every joined segment was converted during the join
        let geometry = &join.segment_geoms[&pair.segment];

        let segment_length = geometry.length()?;
        let intersection = geometry.intersection(&prepared.corridor)?;
        let intersection_length = if intersection.is_empty()? {
            0.0
        } else {
            intersection.length()?
        };
        let overlap_percentage = overlap_ratio(segment_length, intersection_length, segment.length_km);

        if overlap_percentage >= threshold {
            matched.push(MatchedSegment {
                segment: segment.clone(),
                track: prepared.track.info(),
                overlap_percentage,
            });
        }
    }

    tracing::info!(
        "{} of {} pairs reached overlap threshold {}",
        matched.len(),
        join.pairs.len(),
        threshold
    );
    if matched.is_empty() {
        return Ok(Stage::Empty(EmptyReason::BelowThreshold));
    }
    Ok(Stage::Rows(matched))
}

/// Join and filter in one go.
pub fn match_segments(
    segments: &[ReferenceSegment],
    tracks: &[PreparedTrack],
    threshold: f64,
) -> Result<Stage<Vec<MatchedSegment>>> {
    let tree = build_rtree(segments);
    match spatial_join(segments, &tree, tracks)? {
        Stage::Empty(reason) => Ok(Stage::Empty(reason)),
        Stage::Rows(join) => compute_overlaps(&join, segments, tracks, threshold),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::buffer::build_corridors;
    use crate::config::MatchConfig;
    use crate::model::{LineGeometry, Track};
    use chrono::NaiveDate;
    use geo::{line_string, LineString};

    pub(crate) fn segment(osm_id: i64, from: i64, to: i64, line: LineString<f64>) -> ReferenceSegment {
        let length_km = line
            .lines()
            .map(|l| (l.dx() * l.dx() + l.dy() * l.dy()).sqrt())
            .sum::<f64>()
            / 1000.0;
        ReferenceSegment {
            reference: format!("{}-{}", from, to),
            osm_id,
            osm_id_from: Some(from),
            osm_id_to: Some(to),
            length_km,
            geometry: LineGeometry::Line(line),
        }
    }

    pub(crate) fn prepared(uid: &str, line: LineString<f64>) -> Vec<PreparedTrack> {
        let track = Track {
            file_name: "scenario.gpx".into(),
            track_name: Some("Loop".into()),
            track_uid: uid.into(),
            track_date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            geometry: LineGeometry::Line(line),
            activity_type: None,
        };
        build_corridors(vec![track], &MatchConfig::default()).unwrap()
    }

    /// Track along y = 0 from x = 0 to x = 1000; corridor reaches x = 1020.
    pub(crate) fn scenario() -> (Vec<ReferenceSegment>, Vec<PreparedTrack>) {
        let segments = vec![
            // fully ridden
            segment(100, 1, 2, line_string![(x: 0.0, y: 0.0), (x: 1000.0, y: 0.0)]),
            // 400 of its 1000 units inside the corridor
            segment(101, 3, 4, line_string![(x: 620.0, y: 0.0), (x: 1620.0, y: 0.0)]),
            // far away
            segment(102, 5, 6, line_string![(x: 5000.0, y: 5000.0), (x: 6000.0, y: 5000.0)]),
        ];
        let tracks = prepared(
            "scenario.gpx__0",
            line_string![(x: 0.0, y: 0.0), (x: 500.0, y: 0.0), (x: 1000.0, y: 0.0)],
        );
        (segments, tracks)
    }

    #[test]
    fn full_overlap_kept_partial_overlap_rejected() {
        let (segments, tracks) = scenario();
        let matched = match_segments(&segments, &tracks, 0.75).unwrap().rows().unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].segment.osm_id, 100);
        assert!((matched[0].overlap_percentage - 1.0).abs() < 1e-9);
        assert_eq!(matched[0].track.track_uid, "scenario.gpx__0");
    }

    #[test]
    fn partial_overlap_is_measured_on_the_segment() {
        let (segments, tracks) = scenario();
        let all = match_segments(&segments, &tracks, 0.0).unwrap().rows().unwrap();
        let partial = all.iter().find(|m| m.segment.osm_id == 101).unwrap();
        assert!((partial.overlap_percentage - 0.4).abs() < 0.01);
        assert!(all.iter().all(|m| m.segment.osm_id != 102));
    }

    #[test]
    fn overlap_is_always_within_bounds() {
        let (segments, tracks) = scenario();
        let all = match_segments(&segments, &tracks, 0.0).unwrap().rows().unwrap();
        assert!(!all.is_empty());
        for row in &all {
            assert!((0.0..=1.0).contains(&row.overlap_percentage));
        }
    }

    #[test]
    fn raising_threshold_never_adds_rows() {
        let (segments, tracks) = scenario();
        let mut previous = usize::MAX;
        for threshold in [0.0, 0.2, 0.4, 0.6, 0.75, 0.9, 1.0] {
            let count = match match_segments(&segments, &tracks, threshold).unwrap() {
                Stage::Rows(rows) => rows.len(),
                Stage::Empty(_) => 0,
            };
            assert!(count <= previous, "threshold {} produced more rows", threshold);
            previous = count;
        }
    }

    #[test]
    fn zero_length_segment_scores_zero() {
        assert_eq!(overlap_ratio(0.0, 0.0, 1.0), 0.0);
        assert_eq!(overlap_ratio(1000.0, 1000.0, 0.0), 0.0);
        assert_eq!(overlap_ratio(1000.0, 1200.0, 1.0), 1.0);

        let mut degenerate = segment(200, 7, 8, line_string![(x: 10.0, y: 0.0), (x: 990.0, y: 0.0)]);
        degenerate.length_km = 0.0;
        let (_, tracks) = scenario();
        let rows = match_segments(&[degenerate], &tracks, 0.0).unwrap().rows().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].overlap_percentage, 0.0);
    }

    #[test]
    fn empty_results_are_explicit() {
        let (segments, _) = scenario();
        let far = prepared(
            "far.gpx__0",
            line_string![(x: -9000.0, y: -9000.0), (x: -8000.0, y: -9000.0)],
        );
        assert_eq!(
            match_segments(&segments, &far, 0.75).unwrap().rows().map(|r| r.len()),
            None
        );
        assert!(matches!(
            match_segments(&segments, &far, 0.75).unwrap(),
            Stage::Empty(EmptyReason::NoIntersections)
        ));

        // crosses the far segment at right angles: intersects, but barely covers it
        let crossing = prepared(
            "cross.gpx__0",
            line_string![(x: 5500.0, y: 4000.0), (x: 5500.0, y: 6000.0)],
        );
        assert!(matches!(
            match_segments(&segments, &crossing, 0.75).unwrap(),
            Stage::Empty(EmptyReason::BelowThreshold)
        ));
    }

    #[test]
    fn identical_inputs_give_identical_rows() {
        let (segments, tracks) = scenario();
        let first = match_segments(&segments, &tracks, 0.3).unwrap();
        let second = match_segments(&segments, &tracks, 0.3).unwrap();
        assert_eq!(first, second);
    }
}
