pub mod gpx;

use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub use gpx::parse_single_gpx;

/// Whether a file name looks like a track file this crate can read.
pub fn is_track_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
        return false;
    };
    // macOS archives carry `._name.gpx` resource forks next to the real files
    if name.starts_with("._") {
        return false;
    }
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".gpx") || lower.ends_with(".gpx.gz")
}

pub(crate) fn is_gzipped(path: &Path) -> bool {
    path.extension()
        .map_or(false, |ext| ext.eq_ignore_ascii_case("gz"))
}

/// Find all track files below `data_dir`, as paths relative to it.
///
/// The result is sorted so sequential runs are reproducible.
pub fn discover_track_files(data_dir: &Path) -> Vec<PathBuf> {
    tracing::debug!("Searching for track files in {}", data_dir.display());

    let files: Vec<PathBuf> = WalkDir::new(data_dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.file_name() != "__MACOSX")
        .filter_map(|e| e.ok())
        .filter(|entry| entry.file_type().is_file() && is_track_file(entry.path()))
        .filter_map(|entry| {
            entry
                .path()
                .strip_prefix(data_dir)
                .ok()
                .map(Path::to_path_buf)
        })
        .collect();

    tracing::info!("Found {} track files", files.len());
    files
}
