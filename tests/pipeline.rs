use geo::{line_string, Coord, Point};
use geojson::{FeatureCollection, GeoJson};
use rcn_matcher::config::{EPSG_LAMBERT_2008, EPSG_WGS84};
use rcn_matcher::model::{LineGeometry, ReferenceNode, ReferenceSegment};
use rcn_matcher::projection::Reprojector;
use rcn_matcher::{spawn_run, Engine, MatchConfig, MatchOutput, ProgressHandle, ReferenceNetwork};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

const LAT: f64 = 50.85;

/// About 1 km of riding eastwards through Brussels.
const RIDE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<gpx version="1.1" creator="pipeline-test" xmlns="http://www.topografix.com/GPX/1/1">
  <trk>
    <name>Morning Ride</name>
    <type>cycling</type>
    <trkseg>
      <trkpt lat="50.85" lon="4.350"><time>2024-06-01T08:00:00Z</time></trkpt>
      <trkpt lat="50.85" lon="4.357"><time>2024-06-01T08:01:00Z</time></trkpt>
      <trkpt lat="50.85" lon="4.364"><time>2024-06-01T08:02:00Z</time></trkpt>
    </trkseg>
  </trk>
</gpx>
"#;

fn lambert(lon: f64, lat: f64) -> Coord<f64> {
    Reprojector::new(EPSG_WGS84, EPSG_LAMBERT_2008)
        .unwrap()
        .coord(Coord { x: lon, y: lat })
        .unwrap()
}

fn segment(osm_id: i64, from: i64, to: i64, start: Coord<f64>, end: Coord<f64>) -> ReferenceSegment {
    let line = line_string![start, end];
    let length_km = ((end.x - start.x).powi(2) + (end.y - start.y).powi(2)).sqrt() / 1000.0;
    ReferenceSegment {
        reference: format!("{}-{}", from, to),
        osm_id,
        osm_id_from: Some(from),
        osm_id_to: Some(to),
        length_km,
        geometry: LineGeometry::Line(line),
    }
}

/// One segment the ride covers fully, one it covers about a quarter of and
/// one far to the north.
fn network() -> ReferenceNetwork {
    let ends = [
        (1, lambert(4.350, LAT)),
        (2, lambert(4.364, LAT)),
        (3, lambert(4.3605, LAT)),
        (4, lambert(4.3745, LAT)),
        (5, lambert(4.350, 51.2)),
        (6, lambert(4.364, 51.2)),
    ];
    let at = |id: i64| ends[(id - 1) as usize].1;
    ReferenceNetwork {
        segments: vec![
            segment(100, 1, 2, at(1), at(2)),
            segment(101, 3, 4, at(3), at(4)),
            segment(102, 5, 6, at(5), at(6)),
        ],
        nodes: ends
            .iter()
            .map(|(id, c)| ReferenceNode {
                rcn_ref: id.to_string(),
                osm_id: *id,
                geometry: Point::from(*c),
            })
            .collect(),
    }
}

fn write_zip(path: &Path, entries: &[(&str, &str)]) {
    let mut zip = ZipWriter::new(File::create(path).unwrap());
    for (name, content) in entries {
        zip.start_file(*name, SimpleFileOptions::default()).unwrap();
        zip.write_all(content.as_bytes()).unwrap();
    }
    zip.finish().unwrap();
}

fn read_collection(path: &Path) -> FeatureCollection {
    let content = fs::read_to_string(path).unwrap();
    FeatureCollection::try_from(content.parse::<GeoJson>().unwrap()).unwrap()
}

fn match_keys(output: &MatchOutput) -> (BTreeSet<(String, i64)>, BTreeSet<(String, i64)>) {
    let segments = output
        .segments
        .iter()
        .map(|m| (m.track.track_uid.clone(), m.segment.osm_id))
        .collect();
    let nodes = output
        .nodes
        .iter()
        .map(|m| (m.track.track_uid.clone(), m.node.osm_id))
        .collect();
    (segments, nodes)
}

#[test]
fn empty_archive_finishes_with_empty_tables() {
    let work = tempfile::tempdir().unwrap();
    let input = work.path().join("upload.zip");
    write_zip(&input, &[("readme.txt", "no tracks here")]);
    let out = work.path().join("out");

    let progress = ProgressHandle::new();
    let handle = spawn_run(
        MatchConfig::default(),
        Arc::new(network()),
        progress.clone(),
        input,
        out.clone(),
    )
    .unwrap();
    let summary = handle.join().unwrap().unwrap();

    assert_eq!(summary.empty_reason.as_deref(), Some("No GPX files found."));
    assert_eq!(summary.matched_segments, 0);
    for name in [
        "all_matched_segments_wgs84.geojson",
        "all_matched_nodes_wgs84.geojson",
        "all_gpx_wgs84.geojson",
    ] {
        assert!(read_collection(&out.join(name)).features.is_empty(), "{}", name);
    }
    assert!(out.join("matched_results.zip").exists());

    let view = progress.poll();
    assert_eq!(view.percent, 100);
    assert!(!view.running);
    assert!(!view.button_disabled);
    assert_eq!(view.step, "Finished processing upload.zip");
    assert_eq!(view.result, Some(summary));
}

#[test]
fn ride_matches_the_segment_it_covers() {
    let work = tempfile::tempdir().unwrap();
    let input = work.path().join("rides.zip");
    write_zip(
        &input,
        &[
            ("rides/morning.gpx", RIDE),
            ("rides/broken.gpx", "<gpx><trk><trkseg>"),
            ("__MACOSX/rides/._morning.gpx", "junk"),
        ],
    );
    let out = work.path().join("out");

    let progress = ProgressHandle::new();
    let handle = spawn_run(
        MatchConfig::default(),
        Arc::new(network()),
        progress.clone(),
        input,
        out.clone(),
    )
    .unwrap();
    let summary = handle.join().unwrap().unwrap();

    assert_eq!(summary.report.files_total, 2);
    assert_eq!(summary.report.files_contributing, 1);
    assert_eq!(summary.report.files_failed.len(), 1);
    assert_eq!(summary.tracks, 1);
    assert_eq!(summary.matched_segments, 1);
    assert_eq!(summary.matched_nodes, 2);
    assert_eq!(summary.empty_reason, None);

    let segments = read_collection(&out.join("all_matched_segments_wgs84.geojson"));
    let props = segments.features[0].properties.as_ref().unwrap();
    assert_eq!(props["osm_id"], 100);
    assert_eq!(props["gpx_name"], "morning.gpx");
    assert_eq!(props["track_name"], "Morning Ride");
    assert_eq!(props["track_uid"], "morning.gpx__0");
    assert_eq!(props["track_date"], "2024-06-01");
    assert!(props["overlap_percentage"].as_f64().unwrap() > 0.99);

    let nodes = read_collection(&out.join("all_matched_nodes_wgs84.geojson"));
    let ids: BTreeSet<i64> = nodes
        .features
        .iter()
        .map(|f| f.properties.as_ref().unwrap()["osm_id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, BTreeSet::from([1, 2]));

    let tracks = read_collection(&out.join("all_gpx_wgs84.geojson"));
    let props = tracks.features[0].properties.as_ref().unwrap();
    assert_eq!(props["activity_type"], "cycling");
    let length = props["track_length"].as_f64().unwrap();
    assert!((0.9..1.1).contains(&length), "track length {}", length);

    assert_eq!(progress.poll().percent, 100);
}

#[test]
fn partial_segment_is_kept_under_a_low_threshold() {
    let work = tempfile::tempdir().unwrap();
    fs::write(work.path().join("morning.gpx"), RIDE).unwrap();

    let config = MatchConfig {
        intersect_threshold: 0.1,
        ..MatchConfig::default()
    };
    let network = network();
    let progress = ProgressHandle::new();
    let output = Engine::new(&config, &network, &progress)
        .process_input(work.path())
        .unwrap();

    let (segments, nodes) = match_keys(&output);
    let ids: BTreeSet<i64> = segments.iter().map(|(_, id)| *id).collect();
    assert_eq!(ids, BTreeSet::from([100, 101]));
    let partial = output
        .segments
        .iter()
        .find(|m| m.segment.osm_id == 101)
        .unwrap();
    assert!(
        (0.2..0.35).contains(&partial.overlap_percentage),
        "overlap {}",
        partial.overlap_percentage
    );
    assert_eq!(nodes.len(), 4);
}

#[test]
fn sequential_and_parallel_runs_agree() {
    let work = tempfile::tempdir().unwrap();
    for i in 0..6 {
        fs::write(work.path().join(format!("ride_{}.gpx", i)), RIDE).unwrap();
    }
    fs::write(work.path().join("broken.gpx"), "<gpx><trk>").unwrap();
    let network = network();

    let sequential = MatchConfig {
        constrained_mode: true,
        ..MatchConfig::default()
    };
    let parallel = MatchConfig {
        parallel_min_files: 1,
        parallel_min_cores: 1,
        max_workers: 4,
        ..MatchConfig::default()
    };

    let run = |config: &MatchConfig| {
        let progress = ProgressHandle::new();
        progress.begin("Preparing").unwrap();
        let output = Engine::new(config, &network, &progress)
            .process_directory(work.path())
            .unwrap();
        assert_eq!(progress.snapshot().percent, 100);
        output
    };
    let a = run(&sequential);
    let b = run(&parallel);

    assert_eq!(match_keys(&a), match_keys(&b));
    assert_eq!(a.segments.len(), 6);
    assert_eq!(a.report.files_failed.len(), 1);
    assert_eq!(b.report.files_failed.len(), 1);
    assert_eq!(a.report.tracks_parsed, b.report.tracks_parsed);
}

#[test]
fn point_outside_the_projection_does_not_abort_the_batch() {
    let work = tempfile::tempdir().unwrap();
    fs::write(work.path().join("morning.gpx"), RIDE).unwrap();
    let polar = RIDE.replace(
        r#"<trkpt lat="50.85" lon="4.357">"#,
        r#"<trkpt lat="-90" lon="4"><time>2024-06-01T08:00:30Z</time></trkpt>
      <trkpt lat="50.85" lon="4.357">"#,
    );
    fs::write(work.path().join("polar.gpx"), polar).unwrap();

    let config = MatchConfig::default();
    let network = network();
    let progress = ProgressHandle::new();
    let output = Engine::new(&config, &network, &progress)
        .process_input(work.path())
        .unwrap();

    assert_eq!(output.report.points_unprojectable, 1);
    assert_eq!(output.report.tracks_unprojectable, 0);
    assert_eq!(output.tracks.len(), 2);
    let (segments, _) = match_keys(&output);
    assert_eq!(
        segments,
        BTreeSet::from([
            ("morning.gpx__0".to_string(), 100),
            ("polar.gpx__0".to_string(), 100),
        ])
    );
}
