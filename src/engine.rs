//! Orchestration of one matching run, from uploaded tracks to exported tables.

use crate::archive::extract_archive;
use crate::buffer::{build_corridors, reproject_tracks};
use crate::config::{MatchConfig, EPSG_LAMBERT_2008, EPSG_WGS84};
use crate::error::{MatchError, Result};
use crate::io;
use crate::matcher::{build_rtree, compute_overlaps, spatial_join};
use crate::model::{EmptyReason, MatchedNode, MatchedSegment, ReferenceNetwork, Stage, TrackRecord};
use crate::nodes::extract_nodes;
use crate::parsers::{discover_track_files, parse_single_gpx};
use crate::progress::ProgressHandle;
use crate::projection::Reprojector;
use crate::strategy::{available_cores, parse_files, ExecutionStrategy, ParseReport};
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// The three result tables of a run, in the working CRS.
#[derive(Debug, Clone, Default)]
pub struct MatchOutput {
    pub segments: Vec<MatchedSegment>,
    pub nodes: Vec<MatchedNode>,
    pub tracks: Vec<TrackRecord>,
    pub report: ParseReport,
    /// Set when a stage came up empty and the run stopped early.
    pub empty_reason: Option<EmptyReason>,
}

/// Payload stored in the progress state once a run has finished.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub input: String,
    pub matched_segments: usize,
    pub matched_nodes: usize,
    pub tracks: usize,
    pub report: ParseReport,
    pub empty_reason: Option<String>,
    pub tables: Vec<PathBuf>,
    pub archive: PathBuf,
}

pub struct Engine<'a> {
    config: &'a MatchConfig,
    network: &'a ReferenceNetwork,
    progress: &'a ProgressHandle,
}

impl<'a> Engine<'a> {
    pub fn new(
        config: &'a MatchConfig,
        network: &'a ReferenceNetwork,
        progress: &'a ProgressHandle,
    ) -> Self {
        Self {
            config,
            network,
            progress,
        }
    }

    /// Run the pipeline on a zip archive or a directory of track files.
    pub fn process_input(&self, input: &Path) -> Result<MatchOutput> {
        if input.is_dir() {
            return self.process_directory(input);
        }
        let extracted = extract_archive(input)?;
        self.process_directory(extracted.path())
    }

    pub fn process_directory(&self, dir: &Path) -> Result<MatchOutput> {
        let files = discover_track_files(dir);
        if files.is_empty() {
            return Ok(self.stop_empty(EmptyReason::NoTrackFiles, MatchOutput::default()));
        }

        let strategy = ExecutionStrategy::select(self.config, files.len(), available_cores());
        tracing::info!("Processing {} files with {:?}", files.len(), strategy);
        let parsed = parse_files(&files, dir, strategy, parse_single_gpx, self.progress)?;
        let mut output = MatchOutput {
            report: parsed.report,
            ..MatchOutput::default()
        };
        if parsed.tracks.is_empty() {
            return Ok(self.stop_empty(EmptyReason::NoTracks, output));
        }

        self.progress.set_show_dots(true);
        self.progress.update(
            format!("Reprojecting GPX geometries to {}", crs_label(self.config.working_epsg)),
            55,
        );
        let to_working = Reprojector::new(EPSG_WGS84, self.config.working_epsg)?;
        let reprojected = reproject_tracks(parsed.tracks, &to_working);
        output.report.points_unprojectable = reprojected.points_dropped;
        output.report.tracks_unprojectable = reprojected.tracks_dropped;
        if reprojected.tracks.is_empty() {
            return Ok(self.stop_empty(EmptyReason::NoTracks, output));
        }
        let tracks = reprojected.tracks;

        self.progress.update("Buffering GPX geometries", 60);
        let prepared = build_corridors(tracks, self.config)?;
        output.tracks = prepared
            .iter()
            .map(|p| {
                Ok(TrackRecord {
                    track: p.track.clone(),
                    track_length_km: p.track.geometry.length()? / 1000.0,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        self.progress.update("Matching all GPX tracks with bike network", 65);
        let segments = &self.network.segments;
        let tree = build_rtree(segments);
        let join = match spatial_join(segments, &tree, &prepared)? {
            Stage::Rows(join) => join,
            Stage::Empty(reason) => return Ok(self.stop_empty(reason, output)),
        };

        self.progress.update("Calculating intersection lengths", 75);
        output.segments =
            match compute_overlaps(&join, segments, &prepared, self.config.intersect_threshold)? {
                Stage::Rows(rows) => rows,
                Stage::Empty(reason) => return Ok(self.stop_empty(reason, output)),
            };

        self.progress.update("Extracting matched bike nodes", 90);
        // segments without known endpoints are still a result
        output.nodes = extract_nodes(&output.segments, &self.network.nodes)
            .rows()
            .unwrap_or_default();

        self.progress.set_show_dots(false);
        self.progress.update("Processing done!", 100);
        Ok(output)
    }

    fn stop_empty(&self, reason: EmptyReason, mut output: MatchOutput) -> MatchOutput {
        tracing::info!("{}", reason);
        self.progress.set_show_dots(false);
        self.progress.update(reason.to_string(), 100);
        output.empty_reason = Some(reason);
        output
    }
}

/// Run the pipeline and export its tables. Progress is left to the caller.
pub fn run(
    config: &MatchConfig,
    network: &ReferenceNetwork,
    progress: &ProgressHandle,
    input: &Path,
    output_dir: &Path,
) -> Result<RunSummary> {
    let output = Engine::new(config, network, progress).process_input(input)?;
    let tables = io::export_tables(&output, output_dir, config.output_format, config.working_epsg)?;
    let archive = io::create_result_zip(&tables, output_dir)?;

    Ok(RunSummary {
        input: display_name(input),
        matched_segments: output.segments.len(),
        matched_nodes: output.nodes.len(),
        tracks: output.tracks.len(),
        report: output.report,
        empty_reason: output.empty_reason.map(|reason| reason.to_string()),
        tables: tables.paths().iter().map(|p| p.to_path_buf()).collect(),
        archive,
    })
}

/// Start a run on its own thread and return immediately.
///
/// The progress handle is reset first; a second call while a run is active
/// fails with [`MatchError::RunInProgress`]. Whatever happens on the run
/// thread, the handle ends in a non-running state.
pub fn spawn_run(
    config: MatchConfig,
    network: Arc<ReferenceNetwork>,
    progress: ProgressHandle,
    input: PathBuf,
    output_dir: PathBuf,
) -> Result<JoinHandle<Result<RunSummary>>> {
    let name = display_name(&input);
    progress.begin(format!("Preparing to process {}", name))?;

    let worker_progress = progress.clone();
    let spawned = thread::Builder::new()
        .name("rcn-match-run".to_string())
        .spawn(move || {
            let progress = worker_progress;
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                run(&config, &network, &progress, &input, &output_dir)
            }))
            .unwrap_or_else(|payload| {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(MatchError::WorkerPanicked(message))
            });

            match &result {
                Ok(summary) => {
                    tracing::info!("Finished processing {}", name);
                    progress.finish(format!("Finished processing {}", name), summary.clone());
                }
                Err(e) => {
                    tracing::error!("Processing {} failed: {}", name, e);
                    progress.fail(format!("Processing failed: {}", e));
                }
            }
            result
        });

    spawned.map_err(|e| {
        progress.fail(format!("Processing failed: {}", e));
        MatchError::Io(e)
    })
}

fn crs_label(epsg: i32) -> String {
    if epsg == EPSG_LAMBERT_2008 {
        "Lambert 2008".to_string()
    } else {
        format!("EPSG:{}", epsg)
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn engine_output(dir: &Path) -> (MatchOutput, ProgressHandle) {
        let config = MatchConfig::default();
        let network = ReferenceNetwork::default();
        let progress = ProgressHandle::new();
        progress.begin("Preparing").unwrap();
        let output = Engine::new(&config, &network, &progress)
            .process_directory(dir)
            .unwrap();
        (output, progress)
    }

    #[test]
    fn directory_without_tracks_is_an_empty_success() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("notes.txt"), "not a track").unwrap();

        let (output, progress) = engine_output(dir.path());
        assert_eq!(output.empty_reason, Some(EmptyReason::NoTrackFiles));
        assert!(output.segments.is_empty() && output.nodes.is_empty() && output.tracks.is_empty());

        let state = progress.snapshot();
        assert_eq!(state.percent, 100);
        assert_eq!(state.current_step, "No GPX files found.");
    }

    #[test]
    fn unreadable_tracks_stop_with_no_tracks() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("broken.gpx"), "<gpx><trk>").unwrap();

        let (output, _) = engine_output(dir.path());
        assert_eq!(output.empty_reason, Some(EmptyReason::NoTracks));
        assert_eq!(output.report.files_total, 1);
        assert_eq!(output.report.files_failed.len(), 1);
    }

    #[test]
    fn failed_run_leaves_progress_idle() {
        let work = tempfile::tempdir().unwrap();
        let missing = work.path().join("missing.zip");
        let progress = ProgressHandle::new();
        let handle = spawn_run(
            MatchConfig::default(),
            Arc::new(ReferenceNetwork::default()),
            progress.clone(),
            missing,
            work.path().join("out"),
        )
        .unwrap();

        assert!(handle.join().unwrap().is_err());
        let view = progress.poll();
        assert!(!view.running);
        assert!(view.step.starts_with("Processing failed"));
        assert!(view.result.is_none());
    }
}
