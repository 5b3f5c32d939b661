use crate::config::MatchConfig;
use crate::error::{MatchError, Result};
use crate::model::{LineGeometry, PreparedTrack, Track};
use crate::projection::Reprojector;
use geo::{Coord, LineString, Rect};
use geos::{BufferParams, BufferParamsBuilder, Geom};

/// Tracks in the working CRS, minus what could not be transformed.
#[derive(Debug, Default)]
pub struct Reprojected {
    pub tracks: Vec<Track>,
    pub points_dropped: usize,
    pub tracks_dropped: usize,
}

/// Move every track into the working CRS.
///
/// A vertex the projection rejects is dropped on its own. A track left with
/// no part of at least two vertices is dropped as a whole.
pub fn reproject_tracks(tracks: Vec<Track>, reprojector: &Reprojector) -> Reprojected {
    let mut out = Reprojected::default();
    for mut track in tracks {
        let mut parts = Vec::with_capacity(track.geometry.lines().len());
        for line in track.geometry.lines() {
            let mut coords = Vec::with_capacity(line.0.len());
            for coord in &line.0 {
                match reprojector.coord(*coord) {
                    Ok(projected) => coords.push(projected),
                    Err(e) => {
                        tracing::warn!("Dropping point of {}: {}", track.track_uid, e);
                        out.points_dropped += 1;
                    }
                }
            }
            if coords.len() > 1 {
                parts.push(LineString::new(coords));
            }
        }

        match LineGeometry::from_parts(parts) {
            Some(geometry) => {
                track.geometry = geometry;
                out.tracks.push(track);
            }
            None => {
                tracing::warn!("Dropping {}: no projectable geometry left", track.track_uid);
                out.tracks_dropped += 1;
            }
        }
    }
    out
}

/// Simplify each track and buffer it into a matching corridor.
///
/// Simplification preserves topology and runs at half the configured
/// tolerance. The simplified line replaces the track geometry; the corridor
/// is stored next to it.
pub fn build_corridors(tracks: Vec<Track>, config: &MatchConfig) -> Result<Vec<PreparedTrack>> {
    let buf_params: BufferParams = BufferParamsBuilder::default()
        .quadrant_segments(config.buffer_quadrant_segments)
        .build()?;

    let simplify_tol = config.simplify_tolerance / 2.0;
    let radius = config.buffer_distance;

    tracks
        .into_iter()
        .map(|track| prepare_track(track, simplify_tol, radius, &buf_params))
        .collect()
}

fn prepare_track(
    mut track: Track,
    simplify_tol: f64,
    radius: f64,
    buf_params: &BufferParams,
) -> Result<PreparedTrack> {
    let mut line = track.geometry.to_geos()?;
    if simplify_tol > 0.0 {
        line = line.topology_preserve_simplify(simplify_tol)?;
        track.geometry = LineGeometry::from_geos(&line)?;
    }

    let corridor = line.buffer_with_params(radius, buf_params)?;

    let bounds = track.geometry.bounding_rect().ok_or_else(|| {
        MatchError::UnexpectedGeometry(format!("track {} has no extent", track.track_uid))
    })?;
    let envelope = Rect::new(
        Coord {
            x: bounds.min().x - radius,
            y: bounds.min().y - radius,
        },
        Coord {
            x: bounds.max().x + radius,
            y: bounds.max().y + radius,
        },
    );

    Ok(PreparedTrack {
        track,
        corridor,
        envelope,
    })
}
