//! Sequential vs. parallel parsing of a batch of track files.

use crate::config::MatchConfig;
use crate::error::{MatchError, Result};
use crate::model::Track;
use crate::progress::{parse_percent, ProgressHandle};
use serde::Serialize;
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::mpsc;

/// Parses one file (relative to a base directory) into tracks.
///
/// Must not touch shared mutable state: it runs on pool workers.
pub type ParseFn = fn(&Path, &Path) -> Result<Vec<Track>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStrategy {
    Sequential,
    Parallel { workers: usize },
}

impl ExecutionStrategy {
    /// Parallel only when the deployment allows it, the machine has the cores
    /// and the batch is large enough to pay for the pool.
    pub fn select(config: &MatchConfig, file_count: usize, available_cores: usize) -> Self {
        let use_parallel = !config.constrained_mode
            && available_cores >= config.parallel_min_cores
            && file_count >= config.parallel_min_files;

        if use_parallel {
            ExecutionStrategy::Parallel {
                workers: config.max_workers.min(available_cores).max(1),
            }
        } else {
            ExecutionStrategy::Sequential
        }
    }
}

pub fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileFailure {
    pub file: String,
    pub reason: String,
}

/// Per-batch accounting of which files produced data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParseReport {
    pub files_total: usize,
    pub files_contributing: usize,
    pub files_failed: Vec<FileFailure>,
    pub tracks_parsed: usize,
    /// Vertices outside the working projection's domain.
    pub points_unprojectable: usize,
    /// Tracks with no projectable geometry left.
    pub tracks_unprojectable: usize,
}

impl ParseReport {
    /// Files that parsed cleanly but held no usable track.
    pub fn files_without_tracks(&self) -> usize {
        self.files_total - self.files_contributing - self.files_failed.len()
    }
}

#[derive(Debug, Default)]
pub struct ParseOutcome {
    pub tracks: Vec<Track>,
    pub report: ParseReport,
}

impl ParseOutcome {
    fn record(&mut self, file: &Path, result: Result<Vec<Track>>) {
        match result {
            Ok(tracks) => {
                tracing::debug!("Parsed {} track(s) from {}", tracks.len(), file.display());
                if !tracks.is_empty() {
                    self.report.files_contributing += 1;
                    self.report.tracks_parsed += tracks.len();
                    self.tracks.extend(tracks);
                }
            }
            Err(e) => {
                tracing::warn!("Error processing {}: {}", file.display(), e);
                self.report.files_failed.push(FileFailure {
                    file: file.display().to_string(),
                    reason: e.to_string(),
                });
            }
        }
    }
}

/// Run `parse` over `files` with the chosen strategy.
///
/// Progress is reported after each finished file, in completion order.
/// A failing file is recorded in the report and the batch carries on.
pub fn parse_files(
    files: &[PathBuf],
    base_dir: &Path,
    strategy: ExecutionStrategy,
    parse: ParseFn,
    progress: &ProgressHandle,
) -> Result<ParseOutcome> {
    let total = files.len();
    let mut outcome = ParseOutcome::default();
    outcome.report.files_total = total;
    progress.set_show_dots(false);

    match strategy {
        ExecutionStrategy::Sequential => {
            tracing::info!("Parsing {} files sequentially", total);
            for (i, file) in files.iter().enumerate() {
                let result = run_worker(parse, file, base_dir);
                outcome.record(file, result);
                let done = i + 1;
                progress.update(
                    format!("Parsing GPX files: {}/{}", done, total),
                    parse_percent(done, total),
                );
            }
        }
        ExecutionStrategy::Parallel { workers } => {
            tracing::info!("Parsing {} files on {} workers", total, workers);
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(workers)
                .thread_name(|i| format!("gpx-parse-{}", i))
                .build()?;

            let (tx, rx) = mpsc::channel();
            for file in files {
                let tx = tx.clone();
                let file = file.clone();
                let base_dir = base_dir.to_path_buf();
                pool.spawn(move || {
                    let result = run_worker(parse, &file, &base_dir);
                    // receiver only hangs up if the coordinator is gone
                    let _ = tx.send((file, result));
                });
            }
            drop(tx);

            for (i, (file, result)) in rx.iter().enumerate() {
                outcome.record(&file, result);
                let done = i + 1;
                progress.update(
                    format!("Parsing GPX files (parallel): {}/{}", done, total),
                    parse_percent(done, total),
                );
            }
        }
    }

    tracing::info!(
        "Parsed {} tracks from {} of {} files ({} failed)",
        outcome.report.tracks_parsed,
        outcome.report.files_contributing,
        total,
        outcome.report.files_failed.len()
    );
    Ok(outcome)
}

/// Call the parser, turning a panic into a per-file failure.
fn run_worker(parse: ParseFn, file: &Path, base_dir: &Path) -> Result<Vec<Track>> {
    panic::catch_unwind(AssertUnwindSafe(|| parse(file, base_dir))).unwrap_or_else(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Err(MatchError::WorkerPanicked(message))
    })
}
