//! Zip archive builder for multi-path and directory shares
//!
//! The archive lives in a temporary file that is removed when the returned
//! [`Archive`] is dropped, so callers keep it alive until the session ends.
//! A cancelled or failed build removes its partial file before returning.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use tempfile::TempPath;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use walkdir::WalkDir;
use zip::result::ZipError;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Download name used when several paths are bundled together
pub const DEFAULT_ARCHIVE_NAME: &str = "fshare-archive.zip";

/// Zip entries above this size need the zip64 extension
const ZIP64_THRESHOLD: u64 = u32::MAX as u64;

/// Copy granularity; cancellation is checked between chunks
const COPY_CHUNK: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("nothing to archive")]
    Empty,

    #[error("compression cancelled")]
    Cancelled,

    #[error("failed to create temporary archive: {0}")]
    TempFile(#[source] io::Error),

    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to walk {}: {source}", .path.display())]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("failed to write archive: {0}")]
    Zip(#[from] zip::result::ZipError),
}

/// Kind of top-level item that was just added
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    File,
    Directory,
}

/// Reported once per top-level path after it has been added
#[derive(Debug, Clone, Copy)]
pub struct ArchiveProgress<'a> {
    /// 1-based position of the item
    pub index: usize,
    pub total: usize,
    pub item: &'a Path,
    pub kind: ItemKind,
}

/// A finished archive on disk
#[derive(Debug)]
pub struct Archive {
    path: TempPath,
    size: u64,
    entries: usize,
}

impl Archive {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Compressed size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of files and directories stored
    pub fn entries(&self) -> usize {
        self.entries
    }
}

/// Compress `paths` into a temporary zip file
///
/// Files are stored under their base name; directories are stored
/// recursively relative to their parent, so `photos/` keeps its own
/// name as the top folder. Symlinks are skipped.
///
/// # Arguments
/// * `paths` - files and directories to include
/// * `cancel` - checked between entries and while copying; once cancelled
///   the partial archive is removed and `ArchiveError::Cancelled` returned
/// * `progress` - called after each top-level path is added
pub fn build_archive<F>(
    paths: &[PathBuf],
    cancel: &CancellationToken,
    progress: F,
) -> Result<Archive, ArchiveError>
where
    F: FnMut(ArchiveProgress<'_>),
{
    build_archive_in(&std::env::temp_dir(), paths, cancel, progress)
}

fn build_archive_in<F>(
    dir: &Path,
    paths: &[PathBuf],
    cancel: &CancellationToken,
    mut progress: F,
) -> Result<Archive, ArchiveError>
where
    F: FnMut(ArchiveProgress<'_>),
{
    if paths.is_empty() {
        return Err(ArchiveError::Empty);
    }

    let temp = tempfile::Builder::new()
        .prefix("fshare-")
        .suffix(".zip")
        .tempfile_in(dir)
        .map_err(ArchiveError::TempFile)?;
    let (file, temp_path) = temp.into_parts();

    let mut zip = ZipWriter::new(file);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut entries = 0;

    for (index, item) in paths.iter().enumerate() {
        check_cancelled(cancel)?;
        let kind = if item.is_dir() {
            let base = item.parent().unwrap_or_else(|| Path::new(""));
            for entry in WalkDir::new(item).sort_by_file_name() {
                check_cancelled(cancel)?;
                let entry = entry.map_err(|source| ArchiveError::Walk {
                    path: item.clone(),
                    source,
                })?;
                let name = entry_name(entry.path(), base);
                if name.is_empty() {
                    continue;
                }

                if entry.file_type().is_dir() {
                    zip.add_directory(name, options)?;
                    entries += 1;
                } else if entry.file_type().is_file() {
                    add_file(&mut zip, entry.path(), name, options, cancel)?;
                    entries += 1;
                }
            }
            ItemKind::Directory
        } else {
            add_file(&mut zip, item, file_name(item), options, cancel)?;
            entries += 1;
            ItemKind::File
        };

        progress(ArchiveProgress {
            index: index + 1,
            total: paths.len(),
            item,
            kind,
        });
    }

    let file = zip.finish()?;
    let size = file
        .metadata()
        .map_err(|source| ArchiveError::Read {
            path: temp_path.to_path_buf(),
            source,
        })?
        .len();

    debug!(path = %temp_path.display(), size, entries, "Archive created");

    Ok(Archive {
        path: temp_path,
        size,
        entries,
    })
}

/// Download name for an archive of `paths`
///
/// A lone directory gives `<dir>.zip`, anything else the generic name.
pub fn archive_download_name(paths: &[PathBuf]) -> String {
    match paths {
        [single] if single.is_dir() => {
            let name = file_name(single);
            if name.is_empty() {
                DEFAULT_ARCHIVE_NAME.to_string()
            } else {
                format!("{}.zip", name)
            }
        }
        _ => DEFAULT_ARCHIVE_NAME.to_string(),
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<(), ArchiveError> {
    if cancel.is_cancelled() {
        Err(ArchiveError::Cancelled)
    } else {
        Ok(())
    }
}

fn add_file(
    zip: &mut ZipWriter<File>,
    path: &Path,
    name: String,
    options: FileOptions,
    cancel: &CancellationToken,
) -> Result<(), ArchiveError> {
    let read_err = |source| ArchiveError::Read {
        path: path.to_path_buf(),
        source,
    };

    let mut source = File::open(path).map_err(read_err)?;
    let len = source.metadata().map_err(read_err)?.len();

    zip.start_file(name, options.large_file(len >= ZIP64_THRESHOLD))?;

    let mut buf = vec![0u8; COPY_CHUNK];
    loop {
        check_cancelled(cancel)?;
        let n = match source.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(read_err(e)),
        };
        zip.write_all(&buf[..n]).map_err(ZipError::from)?;
    }
    Ok(())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Zip entry names always use `/`, whatever the platform separator
fn entry_name(path: &Path, base: &Path) -> String {
    path.strip_prefix(base)
        .unwrap_or(path)
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
