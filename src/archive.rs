use crate::error::Result;
use std::fs::File;
use std::path::Path;
use tempfile::TempDir;
use zip::ZipArchive;

/// Unpack a zip archive into a fresh temporary directory.
///
/// The directory is removed when the returned handle is dropped.
pub fn extract_archive(archive_path: &Path) -> Result<TempDir> {
    let dir = tempfile::Builder::new().prefix("rcn-upload-").tempdir()?;
    let file = File::open(archive_path)?;
    let mut archive = ZipArchive::new(file)?;
    tracing::info!(
        "Extracting {} entries from {} into {}",
        archive.len(),
        archive_path.display(),
        dir.path().display()
    );
    archive.extract(dir.path())?;
    Ok(dir)
}
