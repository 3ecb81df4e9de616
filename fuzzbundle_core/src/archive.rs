use flate2::Compression;
use flate2::write::GzEncoder;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tar::{EntryType, Header};
use thiserror::Error;
use tracing::debug;

/// Defines errors that can arise while writing the bundle archive.
///
/// Conflicts are treated as hard errors because two distinct files claiming
/// the same archive path would overwrite each other at extraction time.
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// The same archive path was claimed by two different source files.
    #[error("archive path {archive_path:?} has two source files: {existing:?} and {new:?}")]
    Conflict {
        archive_path: String,
        existing: PathBuf,
        new: PathBuf,
    },

    /// `write_file` was called with a directory as the source.
    #[error("file is a directory: {0}")]
    IsDirectory(PathBuf),

    /// The source exists but is neither a regular file nor a directory
    /// (e.g. a device node or socket).
    #[error("not a regular file: {0}")]
    NotRegular(PathBuf),

    /// An I/O error occurred while reading a source file or writing to the
    /// underlying sink.
    #[error("archive I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Streaming writer for a gzip-compressed tar archive.
///
/// Besides the tar stream itself, the writer maintains an in-memory manifest
/// mapping archive paths (forward-slash normalized) to the absolute source
/// paths they were written from. The manifest is the single source of truth
/// for "is this already staged" queries, which callers use to implement
/// deduplication and conflict policies.
///
/// Writes are streamed directly to the underlying sink. Callers that need an
/// atomic result must write to a temporary path and rename afterwards.
///
/// Not safe for concurrent use; the manifest map is unsynchronized and
/// conflict detection relies on check-then-write being uninterrupted.
pub struct ArchiveWriter<W: Write> {
    tar: tar::Builder<GzEncoder<W>>,
    manifest: HashMap<String, PathBuf>,
}

impl<W: Write> ArchiveWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            tar: tar::Builder::new(GzEncoder::new(sink, Compression::default())),
            manifest: HashMap::new(),
        }
    }

    /// Writes the contents of `source_path` to the archive under
    /// `archive_path`, so that extraction recreates the file there.
    ///
    /// Symlinks are followed: the linked-to file's content is written, not a
    /// symlink entry. The source's mode bits (notably the executable bit)
    /// are preserved. Writing the same (archive path, source path) pair
    /// twice is a no-op; writing the same archive path with a different
    /// source is a [`ArchiveError::Conflict`].
    pub fn write_file(
        &mut self,
        archive_path: &str,
        source_path: &Path,
    ) -> Result<(), ArchiveError> {
        let metadata = fs::metadata(source_path)?;
        if metadata.is_dir() {
            return Err(ArchiveError::IsDirectory(source_path.to_path_buf()));
        }
        self.write_file_or_empty_dir(archive_path, source_path)
    }

    /// Same as [`write_file`](Self::write_file) but creates an empty
    /// directory entry when passed a directory instead of failing.
    fn write_file_or_empty_dir(
        &mut self,
        archive_path: &str,
        source_path: &Path,
    ) -> Result<(), ArchiveError> {
        let archive_path = normalize_archive_path(archive_path);

        if let Some(existing) = self.manifest.get(&archive_path) {
            if existing == source_path {
                debug!(
                    "Skipping file {:?}, was already added to the archive",
                    source_path
                );
                return Ok(());
            }
            return Err(ArchiveError::Conflict {
                archive_path,
                existing: existing.clone(),
                new: source_path.to_path_buf(),
            });
        }

        // fs::metadata follows symlinks, so the metadata here never
        // describes a symlink itself.
        let metadata = fs::metadata(source_path)?;

        if metadata.is_dir() {
            let mut header = Header::new_gnu();
            header.set_entry_type(EntryType::Directory);
            header.set_size(0);
            header.set_mode(file_mode(&metadata));
            header.set_mtime(mtime_secs(&metadata));
            self.tar
                .append_data(&mut header, &archive_path, io::empty())?;
            // Directory entries get the same idempotence and conflict
            // treatment as files.
            self.manifest
                .insert(archive_path, source_path.to_path_buf());
            return Ok(());
        }

        if !metadata.is_file() {
            return Err(ArchiveError::NotRegular(source_path.to_path_buf()));
        }

        let file = File::open(source_path)?;
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(metadata.len());
        header.set_mode(file_mode(&metadata));
        header.set_mtime(mtime_secs(&metadata));
        self.tar.append_data(&mut header, &archive_path, file)?;

        self.manifest
            .insert(archive_path, source_path.to_path_buf());
        Ok(())
    }

    /// Adds a hard-link entry to the archive. On extraction, a hard link to
    /// `target` named `link_name` is created.
    ///
    /// The conflict check is symmetric with [`write_file`](Self::write_file):
    /// writing the same link twice is a no-op, mapping `link_name` to a
    /// different target is an error.
    pub fn write_hard_link(&mut self, target: &str, link_name: &str) -> Result<(), ArchiveError> {
        let target = normalize_archive_path(target);
        let link_name = normalize_archive_path(link_name);

        if let Some(existing) = self.manifest.get(&link_name) {
            if *existing == Path::new(&target) {
                debug!("Skipping link {:?}, was already added to the archive", link_name);
                return Ok(());
            }
            return Err(ArchiveError::Conflict {
                archive_path: link_name,
                existing: existing.clone(),
                new: PathBuf::from(target),
            });
        }

        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Link);
        header.set_size(0);
        self.tar.append_link(&mut header, &link_name, &target)?;

        self.manifest.insert(link_name, PathBuf::from(target));
        Ok(())
    }

    /// Traverses `source_dir` recursively and writes all regular files and
    /// symlink targets found to the archive, each joined onto
    /// `archive_base_path` by its path relative to `source_dir`. Directory
    /// entries are written as well so that empty directories round-trip.
    ///
    /// Entries are visited in lexical order to keep the archive layout
    /// deterministic.
    pub fn write_dir(
        &mut self,
        archive_base_path: &str,
        source_dir: &Path,
    ) -> Result<(), ArchiveError> {
        self.write_file_or_empty_dir(archive_base_path, source_dir)?;
        self.write_dir_entries(archive_base_path, source_dir)
    }

    fn write_dir_entries(
        &mut self,
        archive_base_path: &str,
        dir: &Path,
    ) -> Result<(), ArchiveError> {
        let mut entries = fs::read_dir(dir)?.collect::<Result<Vec<_>, _>>()?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let path = entry.path();
            let name = entry.file_name();
            let archive_path = join_archive_path(archive_base_path, &name.to_string_lossy());

            // file_type() does not follow symlinks; a symlink to a file is
            // written as the target file's content by write_file_or_empty_dir.
            if entry.file_type()?.is_dir() {
                self.write_file_or_empty_dir(&archive_path, &path)?;
                self.write_dir_entries(&archive_path, &path)?;
            } else {
                self.write_file_or_empty_dir(&archive_path, &path)?;
            }
        }
        Ok(())
    }

    /// Returns true if `archive_path` has already been written.
    pub fn has_file_entry(&self, archive_path: &str) -> bool {
        self.manifest
            .contains_key(&normalize_archive_path(archive_path))
    }

    /// Returns the source path recorded for `archive_path`, if any.
    pub fn get_source_path(&self, archive_path: &str) -> Option<&Path> {
        self.manifest
            .get(&normalize_archive_path(archive_path))
            .map(PathBuf::as_path)
    }

    /// Finalizes the tar stream and the gzip stream and returns the
    /// underlying sink. The sink itself is not closed; the caller owns it.
    pub fn close(self) -> Result<W, ArchiveError> {
        let gzip = self.tar.into_inner()?;
        Ok(gzip.finish()?)
    }
}

/// Joins two archive path segments with a forward slash.
pub fn join_archive_path(base: &str, rest: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.is_empty() {
        rest.to_string()
    } else {
        format!("{base}/{rest}")
    }
}

fn normalize_archive_path(path: &str) -> String {
    path.replace('\\', "/")
}

#[cfg(unix)]
fn file_mode(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode()
}

#[cfg(not(unix))]
fn file_mode(metadata: &fs::Metadata) -> u32 {
    if metadata.is_dir() { 0o755 } else { 0o644 }
}

fn mtime_secs(metadata: &fs::Metadata) -> u64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
