//! Writing the result tables and bundling them for download.

use crate::config::{OutputFormat, EPSG_WGS84};
use crate::engine::MatchOutput;
use crate::error::{MatchError, Result};
use crate::model::{MatchedNode, MatchedSegment, TrackInfo, TrackRecord};
use crate::projection::Reprojector;
use fgbfile::FgbFile;
use geo::{Geometry, MultiLineString, Point};
use geojson::{Feature, FeatureCollection, JsonValue};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

pub const SEGMENTS_STEM: &str = "all_matched_segments_wgs84";
pub const NODES_STEM: &str = "all_matched_nodes_wgs84";
pub const TRACKS_STEM: &str = "all_gpx_wgs84";
pub const RESULT_ARCHIVE: &str = "matched_results.zip";

/// Properties of one matched segment row. Missing values become `null`.
#[derive(Serialize)]
pub struct SegmentProperties<'a> {
    #[serde(rename = "ref")]
    pub reference: &'a str,
    pub osm_id: i64,
    pub osm_id_from: Option<i64>,
    pub osm_id_to: Option<i64>,
    pub length_km: f64,
    pub gpx_name: &'a str,
    pub track_name: Option<&'a str>,
    pub track_date: String,
    pub track_uid: &'a str,
    pub overlap_percentage: f64,
}

impl<'a> SegmentProperties<'a> {
    fn new(row: &'a MatchedSegment) -> Self {
        let segment = &row.segment;
        Self {
            reference: &segment.reference,
            osm_id: segment.osm_id,
            osm_id_from: segment.osm_id_from,
            osm_id_to: segment.osm_id_to,
            length_km: segment.length_km,
            gpx_name: &row.track.file_name,
            track_name: row.track.track_name.as_deref(),
            track_date: row.track.track_date.to_string(),
            track_uid: &row.track.track_uid,
            overlap_percentage: row.overlap_percentage,
        }
    }
}

#[derive(Serialize)]
pub struct NodeProperties<'a> {
    pub rcn_ref: &'a str,
    pub osm_id: i64,
    pub gpx_name: &'a str,
    pub track_name: Option<&'a str>,
    pub track_date: String,
    pub track_uid: &'a str,
}

impl<'a> NodeProperties<'a> {
    fn new(row: &'a MatchedNode) -> Self {
        let TrackInfo {
            file_name,
            track_name,
            track_date,
            track_uid,
        } = &row.track;
        Self {
            rcn_ref: &row.node.rcn_ref,
            osm_id: row.node.osm_id,
            gpx_name: file_name,
            track_name: track_name.as_deref(),
            track_date: track_date.to_string(),
            track_uid,
        }
    }
}

#[derive(Serialize)]
pub struct TrackProperties<'a> {
    pub gpx_name: &'a str,
    pub track_name: Option<&'a str>,
    pub track_date: String,
    pub track_uid: &'a str,
    pub activity_type: Option<&'a str>,
    /// Kilometres, measured in the working CRS.
    pub track_length: f64,
}

impl<'a> TrackProperties<'a> {
    fn new(record: &'a TrackRecord) -> Self {
        let track = &record.track;
        Self {
            gpx_name: &track.file_name,
            track_name: track.track_name.as_deref(),
            track_date: track.track_date.to_string(),
            track_uid: &track.track_uid,
            activity_type: track.activity_type.as_deref(),
            track_length: record.track_length_km,
        }
    }
}

// FlatGeobuf takes its column list from the first feature and then fills
// columns by position, so every feature below serializes the same fields in
// the same order. Missing values are written as empty strings.

#[derive(Serialize)]
pub struct SegmentFeature<'a> {
    pub geo: MultiLineString<f64>,
    #[serde(rename = "ref")]
    pub reference: &'a str,
    pub osm_id: i64,
    pub osm_id_from: String,
    pub osm_id_to: String,
    pub length_km: f64,
    pub gpx_name: &'a str,
    pub track_name: &'a str,
    pub track_date: String,
    pub track_uid: &'a str,
    pub overlap_percentage: f64,
}

impl<'a> SegmentFeature<'a> {
    fn new(geo: MultiLineString<f64>, p: SegmentProperties<'a>) -> Self {
        Self {
            geo,
            reference: p.reference,
            osm_id: p.osm_id,
            osm_id_from: id_text(p.osm_id_from),
            osm_id_to: id_text(p.osm_id_to),
            length_km: p.length_km,
            gpx_name: p.gpx_name,
            track_name: p.track_name.unwrap_or_default(),
            track_date: p.track_date,
            track_uid: p.track_uid,
            overlap_percentage: p.overlap_percentage,
        }
    }
}

#[derive(Serialize)]
pub struct NodeFeature<'a> {
    pub geo: Point<f64>,
    pub rcn_ref: &'a str,
    pub osm_id: i64,
    pub gpx_name: &'a str,
    pub track_name: &'a str,
    pub track_date: String,
    pub track_uid: &'a str,
}

impl<'a> NodeFeature<'a> {
    fn new(geo: Point<f64>, p: NodeProperties<'a>) -> Self {
        Self {
            geo,
            rcn_ref: p.rcn_ref,
            osm_id: p.osm_id,
            gpx_name: p.gpx_name,
            track_name: p.track_name.unwrap_or_default(),
            track_date: p.track_date,
            track_uid: p.track_uid,
        }
    }
}

#[derive(Serialize)]
pub struct TrackFeature<'a> {
    pub geo: MultiLineString<f64>,
    pub gpx_name: &'a str,
    pub track_name: &'a str,
    pub track_date: String,
    pub track_uid: &'a str,
    pub activity_type: &'a str,
    pub track_length: f64,
}

impl<'a> TrackFeature<'a> {
    fn new(geo: MultiLineString<f64>, p: TrackProperties<'a>) -> Self {
        Self {
            geo,
            gpx_name: p.gpx_name,
            track_name: p.track_name.unwrap_or_default(),
            track_date: p.track_date,
            track_uid: p.track_uid,
            activity_type: p.activity_type.unwrap_or_default(),
            track_length: p.track_length,
        }
    }
}

fn id_text(id: Option<i64>) -> String {
    id.map(|id| id.to_string()).unwrap_or_default()
}

/// Paths of the written tables, in archive order.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportedTables {
    pub segments: PathBuf,
    pub nodes: PathBuf,
    pub tracks: PathBuf,
}

impl ExportedTables {
    pub fn paths(&self) -> [&Path; 3] {
        [&self.segments, &self.nodes, &self.tracks]
    }
}

/// Reproject the three tables to WGS84 and write them into `out_dir`.
///
/// Empty tables are still written, as empty collections.
pub fn export_tables(
    output: &MatchOutput,
    out_dir: &Path,
    format: OutputFormat,
    working_epsg: i32,
) -> Result<ExportedTables> {
    fs::create_dir_all(out_dir)?;
    let to_wgs84 = Reprojector::new(working_epsg, EPSG_WGS84)?;
    let path_for = |stem: &str| out_dir.join(format!("{}.{}", stem, format.extension()));
    let tables = ExportedTables {
        segments: path_for(SEGMENTS_STEM),
        nodes: path_for(NODES_STEM),
        tracks: path_for(TRACKS_STEM),
    };

    let segment_geoms = output
        .segments
        .iter()
        .map(|row| Ok(to_wgs84.line(&row.segment.geometry)?.to_multi()))
        .collect::<Result<Vec<_>>>()?;
    let node_geoms = output
        .nodes
        .iter()
        .map(|row| to_wgs84.point(row.node.geometry))
        .collect::<Result<Vec<_>>>()?;
    let track_geoms = output
        .tracks
        .iter()
        .map(|record| Ok(to_wgs84.line(&record.track.geometry)?.to_multi()))
        .collect::<Result<Vec<_>>>()?;

    match format {
        OutputFormat::GeoJson => {
            let features = output
                .segments
                .iter()
                .zip(segment_geoms)
                .map(|(row, geom)| {
                    to_feature(Geometry::MultiLineString(geom), &SegmentProperties::new(row))
                })
                .collect::<Result<Vec<_>>>()?;
            write_geojson(features, &tables.segments)?;

            let features = output
                .nodes
                .iter()
                .zip(node_geoms)
                .map(|(row, geom)| to_feature(Geometry::Point(geom), &NodeProperties::new(row)))
                .collect::<Result<Vec<_>>>()?;
            write_geojson(features, &tables.nodes)?;

            let features = output
                .tracks
                .iter()
                .zip(track_geoms)
                .map(|(record, geom)| {
                    to_feature(Geometry::MultiLineString(geom), &TrackProperties::new(record))
                })
                .collect::<Result<Vec<_>>>()?;
            write_geojson(features, &tables.tracks)?;
        }
        OutputFormat::FlatGeobuf => {
            let rows: Vec<_> = output
                .segments
                .iter()
                .zip(segment_geoms)
                .map(|(row, geom)| SegmentFeature::new(geom, SegmentProperties::new(row)))
                .collect();
            write_flatgeobuf(&rows, &tables.segments)?;

            let rows: Vec<_> = output
                .nodes
                .iter()
                .zip(node_geoms)
                .map(|(row, geom)| NodeFeature::new(geom, NodeProperties::new(row)))
                .collect();
            write_flatgeobuf(&rows, &tables.nodes)?;

            let rows: Vec<_> = output
                .tracks
                .iter()
                .zip(track_geoms)
                .map(|(record, geom)| TrackFeature::new(geom, TrackProperties::new(record)))
                .collect();
            write_flatgeobuf(&rows, &tables.tracks)?;
        }
    }

    tracing::info!(
        "Wrote {} segment, {} node and {} track rows to {}",
        output.segments.len(),
        output.nodes.len(),
        output.tracks.len(),
        out_dir.display()
    );
    Ok(tables)
}

fn to_feature<P: Serialize>(geometry: Geometry<f64>, properties: &P) -> Result<Feature> {
    let properties = match serde_json::to_value(properties)? {
        JsonValue::Object(map) => Some(map),
        _ => None,
    };
    Ok(Feature {
        bbox: None,
        geometry: Some(geojson::Geometry::new(geojson::Value::from(&geometry))),
        id: None,
        properties,
        foreign_members: None,
    })
}

pub fn write_geojson(features: Vec<Feature>, path: &Path) -> Result<()> {
    let collection = FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    };
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer(&mut writer, &collection)?;
    writer.flush()?;
    Ok(())
}

pub fn write_flatgeobuf<T: Serialize>(rows: &Vec<T>, path: &Path) -> Result<()> {
    let export_error = |reason: String| MatchError::Export {
        path: path.to_path_buf(),
        reason,
    };
    let path_str = path
        .to_str()
        .ok_or_else(|| export_error("path is not valid UTF-8".to_string()))?;
    FgbFile::create(path_str)
        .map_err(|e| export_error(format!("{:?}", e)))?
        .epsg(EPSG_WGS84)
        .write_features(rows)
        .map_err(|e| export_error(format!("{:?}", e)))?;
    Ok(())
}

/// Bundle the written tables into one deflated archive in `out_dir`.
pub fn create_result_zip(tables: &ExportedTables, out_dir: &Path) -> Result<PathBuf> {
    let zip_path = out_dir.join(RESULT_ARCHIVE);
    let mut zip = ZipWriter::new(BufWriter::new(File::create(&zip_path)?));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for path in tables.paths() {
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| MatchError::Export {
                path: path.to_path_buf(),
                reason: "invalid file name".to_string(),
            })?;
        zip.start_file(name, options)?;
        std::io::copy(&mut File::open(path)?, &mut zip)?;
    }

    zip.finish()?.flush()?;
    tracing::info!("✓ Bundled results into {}", zip_path.display());
    Ok(zip_path)
}
