use crate::error::{MatchError, Result};
use crate::model::{LineGeometry, Track};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use flate2::read::GzDecoder;
use geo::{Coord, LineString};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Parse one GPX (or gzip-compressed GPX) file into tracks, one per `<trk>`.
///
/// `gpx_file` is resolved against `base_dir`. Malformed points and short
/// segments are skipped; a track without usable geometry or without any
/// parseable timestamp is dropped. Only a document that cannot be read as
/// GPX at all is an error.
pub fn parse_single_gpx(gpx_file: &Path, base_dir: &Path) -> Result<Vec<Track>> {
    let path = base_dir.join(gpx_file);
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| gpx_file.display().to_string());

    let file = File::open(&path)?;
    if super::is_gzipped(&path) {
        read_tracks(BufReader::new(GzDecoder::new(file)), &file_name)
    } else {
        read_tracks(BufReader::new(file), &file_name)
    }
}

/// Element whose text content is being collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TextTarget {
    TrackName,
    TrackType,
    FileType,
    PointTime,
}

#[derive(Debug, Default)]
struct TrackBuilder {
    index: usize,
    name: Option<String>,
    activity_type: Option<String>,
    segments: Vec<Vec<Coord<f64>>>,
    date: Option<NaiveDate>,
}

impl TrackBuilder {
    fn build(self, file_name: &str, file_type: Option<&String>) -> Option<Track> {
        let parts: Vec<LineString<f64>> = self
            .segments
            .into_iter()
            .filter(|points| points.len() > 1)
            .map(LineString::new)
            .collect();
        let geometry = LineGeometry::from_parts(parts)?;
        let track_date = self.date?;

        Some(Track {
            file_name: file_name.to_string(),
            track_name: self.name,
            track_uid: format!("{}__{}", file_name, self.index),
            track_date,
            geometry,
            activity_type: self.activity_type.or_else(|| file_type.cloned()),
        })
    }
}

/// Streaming, namespace-agnostic walk over a GPX document.
pub fn read_tracks<R: BufRead>(source: R, file_name: &str) -> Result<Vec<Track>> {
    let mut reader = Reader::from_reader(source);
    let mut buf = Vec::new();

    let mut stack: Vec<Vec<u8>> = Vec::new();
    let mut finished: Vec<TrackBuilder> = Vec::new();
    let mut current: Option<TrackBuilder> = None;
    let mut point: Option<Option<Coord<f64>>> = None;
    let mut file_type: Option<String> = None;
    let mut target: Option<(TextTarget, String)> = None;
    let mut trk_count = 0usize;
    let mut root_seen = false;

    let xml_error = |reader: &Reader<R>, e: quick_xml::Error| MatchError::Xml {
        file: file_name.to_string(),
        reason: format!("{} at byte {}", e, reader.buffer_position()),
    };

    loop {
        let event = match reader.read_event_into(&mut buf) {
            Ok(event) => event,
            Err(e) => return Err(xml_error(&reader, e)),
        };

        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let is_empty = matches!(event, Event::Empty(_));
                let local = e.local_name().as_ref().to_vec();

                if !root_seen {
                    if local != b"gpx" {
                        return Err(MatchError::NotGpx {
                            file: file_name.to_string(),
                            root: String::from_utf8_lossy(&local).into_owned(),
                        });
                    }
                    root_seen = true;
                }

                let parent = stack.last().map(Vec::as_slice);
                match (local.as_slice(), parent) {
                    (b"trk", _) if current.is_none() => {
                        current = Some(TrackBuilder {
                            index: trk_count,
                            ..TrackBuilder::default()
                        });
                        trk_count += 1;
                    }
                    (b"trkseg", Some(b"trk")) => {
                        if let Some(track) = current.as_mut() {
                            track.segments.push(Vec::new());
                        }
                    }
                    (b"trkpt", Some(b"trkseg")) if current.is_some() => {
                        point = Some(point_coord(e));
                    }
                    (b"name", Some(b"trk")) if current.is_some() => {
                        target = Some((TextTarget::TrackName, String::new()));
                    }
                    (b"type", Some(b"trk")) if current.is_some() => {
                        target = Some((TextTarget::TrackType, String::new()));
                    }
                    (b"type", Some(b"gpx")) if stack.len() == 1 && file_type.is_none() => {
                        target = Some((TextTarget::FileType, String::new()));
                    }
                    (b"time", Some(b"trkpt")) if point.is_some() => {
                        target = Some((TextTarget::PointTime, String::new()));
                    }
                    _ => {}
                }

                if is_empty {
                    close_element(
                        &local,
                        &mut current,
                        &mut point,
                        &mut target,
                        &mut file_type,
                        &mut finished,
                    );
                } else {
                    stack.push(local);
                }
            }
            Event::Text(ref t) => {
                if let Some((_, text)) = target.as_mut() {
                    let unescaped = t.unescape().map_err(|e| MatchError::Xml {
                        file: file_name.to_string(),
                        reason: e.to_string(),
                    })?;
                    text.push_str(&unescaped);
                }
            }
            Event::CData(ref c) => {
                if let Some((_, text)) = target.as_mut() {
                    text.push_str(&String::from_utf8_lossy(c));
                }
            }
            Event::End(_) => {
                if let Some(local) = stack.pop() {
                    close_element(
                        &local,
                        &mut current,
                        &mut point,
                        &mut target,
                        &mut file_type,
                        &mut finished,
                    );
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if !root_seen {
        return Err(MatchError::NotGpx {
            file: file_name.to_string(),
            root: String::new(),
        });
    }
    if !stack.is_empty() {
        return Err(MatchError::Xml {
            file: file_name.to_string(),
            reason: format!(
                "document ended inside <{}>",
                String::from_utf8_lossy(&stack[stack.len() - 1])
            ),
        });
    }

    let tracks: Vec<Track> = finished
        .into_iter()
        .filter_map(|builder| {
            let index = builder.index;
            let track = builder.build(file_name, file_type.as_ref());
            if track.is_none() {
                tracing::debug!(
                    "Skipping track {} of {}: no usable points or date",
                    index,
                    file_name
                );
            }
            track
        })
        .collect();

    Ok(tracks)
}

fn close_element(
    local: &[u8],
    current: &mut Option<TrackBuilder>,
    point: &mut Option<Option<Coord<f64>>>,
    target: &mut Option<(TextTarget, String)>,
    file_type: &mut Option<String>,
    finished: &mut Vec<TrackBuilder>,
) {
    match local {
        b"name" | b"type" | b"time" => {
            let Some((kind, text)) = target.take() else {
                return;
            };
            let text = text.trim();
            match kind {
                TextTarget::TrackName => {
                    if let Some(track) = current.as_mut() {
                        track.name = non_empty(text);
                    }
                }
                TextTarget::TrackType => {
                    if let Some(track) = current.as_mut() {
                        track.activity_type = non_empty(text);
                    }
                }
                TextTarget::FileType => *file_type = non_empty(text),
                TextTarget::PointTime => {
                    if let Some(track) = current.as_mut() {
                        if track.date.is_none() {
                            track.date = parse_date(text);
                        }
                    }
                }
            }
        }
        b"trkpt" => {
            if let (Some(Some(coord)), Some(track)) = (point.take(), current.as_mut()) {
                if let Some(segment) = track.segments.last_mut() {
                    segment.push(coord);
                }
            }
        }
        b"trk" => {
            if let Some(track) = current.take() {
                finished.push(track);
            }
        }
        _ => {}
    }
}

fn non_empty(text: &str) -> Option<String> {
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

/// Longitude/latitude of a `<trkpt>`, or `None` if either is missing or invalid.
fn point_coord(element: &BytesStart) -> Option<Coord<f64>> {
    let mut lat: Option<f64> = None;
    let mut lon: Option<f64> = None;

    for attr in element.attributes().flatten() {
        let value = match attr.unescape_value() {
            Ok(value) => value,
            Err(_) => continue,
        };
        match attr.key.local_name().as_ref() {
            b"lat" => lat = value.trim().parse().ok(),
            b"lon" => lon = value.trim().parse().ok(),
            _ => {}
        }
    }

    match (lon, lat) {
        (Some(x), Some(y)) if (-180.0..=180.0).contains(&x) && (-90.0..=90.0).contains(&y) => {
            Some(Coord { x, y })
        }
        _ => None,
    }
}

/// UTC calendar date of a GPX timestamp. Accepts RFC 3339 and a few naive forms.
pub fn parse_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    if let Ok(datetime) = DateTime::parse_from_rfc3339(text) {
        return Some(datetime.with_timezone(&Utc).date_naive());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(datetime) = NaiveDateTime::parse_from_str(text, format) {
            return Some(datetime.date());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d").ok()
}
