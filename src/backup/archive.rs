// pgstash/src/backup/archive.rs
use std::fs::File;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::{error, info, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::errors::{BackupError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub path: PathBuf,
    pub files: usize,
    pub skipped: usize,
}

/// Creates a ZIP archive of every regular file below `source_dir`.
///
/// Entry names are relative to `source_dir` and always use `/` separators. Non-regular
/// files (symlinks, sockets, ...) and files that fail to copy are skipped with a warning;
/// only failing to create or finalise the archive itself is an error.
///
/// # Arguments
/// * `source_dir` - The directory whose contents will be archived.
/// * `archive_dest_path` - Where the `.zip` file is written. Must lie outside `source_dir`.
pub fn create_zip_archive(source_dir: &Path, archive_dest_path: &Path) -> Result<ArchiveSummary> {
    if !source_dir.is_dir() {
        return Err(BackupError::Archive(format!(
            "Source for archival is not a directory: {}",
            source_dir.display()
        )));
    }

    info!(
        source = %source_dir.display(),
        archive = %archive_dest_path.display(),
        "Creating zip archive"
    );

    let archive_file = File::create(archive_dest_path).map_err(|e| {
        BackupError::Archive(format!(
            "Failed to create archive file {}: {}",
            archive_dest_path.display(),
            e
        ))
    })?;
    let mut zip_writer = ZipWriter::new(archive_file);
    let mut files = 0;
    let mut skipped = 0;

    for entry in WalkDir::new(source_dir).follow_links(false).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                error!(error = %e, "Failed to walk staging directory entry");
                skipped += 1;
                continue;
            }
        };
        let path = entry.path();
        if entry.file_type().is_dir() {
            continue;
        }
        if !entry.file_type().is_file() {
            warn!(path = %path.display(), "Not a regular file, skipping");
            skipped += 1;
            continue;
        }

        let Some(name) = archive_entry_name(source_dir, path) else {
            error!(path = %path.display(), "Failed to compute relative archive path");
            skipped += 1;
            continue;
        };

        match append_file(&mut zip_writer, path, &name) {
            Ok(()) => files += 1,
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to write file to archive, skipping");
                skipped += 1;
            }
        }
    }

    zip_writer.finish().map_err(|e| {
        BackupError::Archive(format!(
            "Failed to finish archive {}: {}",
            archive_dest_path.display(),
            e
        ))
    })?;

    info!(archive = %archive_dest_path.display(), files, skipped, "Created archive");
    Ok(ArchiveSummary {
        path: archive_dest_path.to_path_buf(),
        files,
        skipped,
    })
}

/// Relative path of `path` below `base`, joined with `/` regardless of host OS.
fn archive_entry_name(base: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(base).ok()?;
    let mut segments = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(segment) => segments.push(segment.to_str()?.to_string()),
            _ => return None,
        }
    }
    if segments.is_empty() {
        return None;
    }
    Some(segments.join("/"))
}

fn append_file(zip_writer: &mut ZipWriter<File>, path: &Path, name: &str) -> io::Result<()> {
    let mut source = File::open(path)?;
    let size = source.metadata()?.len();
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(size >= u64::from(u32::MAX));

    zip_writer.start_file(name, options).map_err(io::Error::other)?;
    if let Err(e) = io::copy(&mut source, zip_writer) {
        // Drop the half-written entry so the archive stays readable.
        zip_writer.abort_file().map_err(io::Error::other)?;
        return Err(e);
    }
    Ok(())
}
