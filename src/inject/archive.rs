//! Archive builder: host file or directory subtree to a lazy entry stream.
//!
//! Walks are depth-first and sorted by file name, so every directory is emitted
//! before anything inside it. Entries only carry metadata and the host path of
//! their content; file handles are opened by the consumer one entry at a time.

use serde::{Deserialize, Serialize};
use std::fs::{self, File, FileType, Metadata};
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, warn};
use typed_path::{Utf8UnixPath, Utf8UnixPathBuf};
use walkdir::WalkDir;

use super::permissions::{DirectoryModePolicy, normalize_mode};
use super::resolver::SourceKind;
use super::{CopyOptions, InjectError, Result};

/// Relative path of the walked root inside a directory payload.
pub const ROOT_ENTRY: &str = ".";

/// Kind of an archive entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Regular file with content
    File,
    /// Directory
    Directory,
}

/// Treatment of symbolic links found on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymlinkPolicy {
    /// Fail with [`InjectError::UnsupportedFileType`]
    #[default]
    Reject,
    /// Copy whatever the link points at
    Follow,
    /// Leave links inside a directory tree out of the archive
    Skip,
}

/// A single file or directory destined for the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    relative_path: Utf8UnixPathBuf,
    kind: EntryKind,
    mode: u32,
    size: u64,
    mtime: u64,
    source: Option<PathBuf>,
}

impl ArchiveEntry {
    /// A directory entry with no host counterpart, used for destinations that
    /// must be created ahead of the payload.
    pub fn synthetic_directory(relative_path: impl Into<Utf8UnixPathBuf>, mode: u32) -> Self {
        Self {
            relative_path: relative_path.into(),
            kind: EntryKind::Directory,
            mode,
            size: 0,
            mtime: now_secs(),
            source: None,
        }
    }

    /// Path relative to the archive root, `/`-separated.
    pub fn relative_path(&self) -> &Utf8UnixPath {
        &self.relative_path
    }

    /// Entry kind.
    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    /// Normalised mode bits.
    pub fn mode(&self) -> u32 {
        self.mode
    }

    /// Content length in bytes (zero for directories).
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Modification time in seconds since the epoch.
    pub fn mtime(&self) -> u64 {
        self.mtime
    }

    /// Host path the entry was derived from.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Whether this entry is the root of a directory payload.
    pub fn is_root(&self) -> bool {
        self.relative_path.as_str() == ROOT_ENTRY
    }

    /// Open the host file backing this entry.
    pub fn open(&self) -> Result<File> {
        match (&self.kind, &self.source) {
            (EntryKind::File, Some(source)) => {
                File::open(source).map_err(|e| InjectError::from_io(source, e))
            }
            _ => Err(InjectError::Archive(format!(
                "entry {} has no file content",
                self.relative_path
            ))),
        }
    }

    /// The same entry under a different archive path.
    pub fn with_path(mut self, relative_path: impl Into<Utf8UnixPathBuf>) -> Self {
        self.relative_path = relative_path.into();
        self
    }
}

/// Turns host paths into entry streams.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArchiveBuilder {
    symlinks: SymlinkPolicy,
    directory_mode: DirectoryModePolicy,
}

impl ArchiveBuilder {
    /// Builder with default policies.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder configured from copy options.
    pub fn from_options(options: &CopyOptions) -> Self {
        Self {
            symlinks: options.symlinks,
            directory_mode: options.directory_mode,
        }
    }

    /// Set the symlink policy.
    pub fn symlinks(mut self, policy: SymlinkPolicy) -> Self {
        self.symlinks = policy;
        self
    }

    /// Set the directory mode policy.
    pub fn directory_mode(mut self, policy: DirectoryModePolicy) -> Self {
        self.directory_mode = policy;
        self
    }

    /// Whether `host_path` would be copied as a file or a directory.
    pub fn source_kind(&self, host_path: &Path) -> Result<SourceKind> {
        let meta = self.inspect(host_path)?;
        if meta.is_dir() {
            Ok(SourceKind::Directory)
        } else if meta.is_file() {
            Ok(SourceKind::File)
        } else {
            Err(unsupported(host_path, &meta.file_type()))
        }
    }

    /// Start a one-shot entry stream for `host_path` with `forced_mode` applied.
    ///
    /// A regular file yields a single entry named after the file. A directory yields
    /// its root as `.` followed by the rest of the subtree, parents first.
    ///
    /// # Errors
    ///
    /// Fails up front if the host path is missing, unreadable, or not a regular file
    /// or directory. Problems deeper in a tree surface as stream items.
    pub fn build(&self, host_path: impl AsRef<Path>, forced_mode: u32) -> Result<EntryStream> {
        let host_path = host_path.as_ref();
        let meta = self.inspect(host_path)?;
        let name = source_name(host_path)?;

        if meta.is_file() {
            File::open(host_path).map_err(|e| InjectError::from_io(host_path, e))?;

            let entry = ArchiveEntry {
                relative_path: Utf8UnixPathBuf::from(name.as_str()),
                kind: EntryKind::File,
                mode: normalize_mode(EntryKind::File, forced_mode, self.directory_mode),
                size: meta.len(),
                mtime: mtime_secs(&meta),
                source: Some(host_path.to_path_buf()),
            };

            debug!("Archiving file {} as {}", host_path.display(), name);
            return Ok(EntryStream {
                kind: SourceKind::File,
                name,
                inner: Inner::Single(Some(entry)),
            });
        }

        if meta.is_dir() {
            fs::read_dir(host_path).map_err(|e| InjectError::from_io(host_path, e))?;

            let walker = WalkDir::new(host_path)
                .follow_links(self.symlinks == SymlinkPolicy::Follow)
                .sort_by_file_name()
                .into_iter();

            debug!("Archiving directory {} as {}", host_path.display(), name);
            return Ok(EntryStream {
                kind: SourceKind::Directory,
                name,
                inner: Inner::Walk {
                    walker,
                    root: host_path.to_path_buf(),
                    builder: *self,
                    forced_mode,
                    done: false,
                },
            });
        }

        Err(unsupported(host_path, &meta.file_type()))
    }

    fn inspect(&self, path: &Path) -> Result<Metadata> {
        let meta = fs::symlink_metadata(path).map_err(|e| InjectError::from_io(path, e))?;
        if !meta.file_type().is_symlink() {
            return Ok(meta);
        }

        match self.symlinks {
            SymlinkPolicy::Follow => fs::metadata(path).map_err(|e| InjectError::from_io(path, e)),
            SymlinkPolicy::Reject | SymlinkPolicy::Skip => Err(InjectError::UnsupportedFileType {
                path: path.to_path_buf(),
                kind: "symbolic link".to_string(),
            }),
        }
    }
}

/// Lazy, finite, non-restartable sequence of archive entries.
///
/// The stream ends after the first error.
pub struct EntryStream {
    kind: SourceKind,
    name: String,
    inner: Inner,
}

enum Inner {
    Single(Option<ArchiveEntry>),
    Walk {
        walker: walkdir::IntoIter,
        root: PathBuf,
        builder: ArchiveBuilder,
        forced_mode: u32,
        done: bool,
    },
}

impl EntryStream {
    /// Whether the source is a file or a directory.
    pub fn source_kind(&self) -> SourceKind {
        self.kind
    }

    /// Base name of the source on the host.
    pub fn source_name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for EntryStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryStream")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Iterator for EntryStream {
    type Item = Result<ArchiveEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.inner {
            Inner::Single(entry) => entry.take().map(Ok),
            Inner::Walk {
                walker,
                root,
                builder,
                forced_mode,
                done,
            } => {
                if *done {
                    return None;
                }
                let item = next_walked(walker, root, builder, *forced_mode);
                if matches!(item, Some(Err(_)) | None) {
                    *done = true;
                }
                item
            }
        }
    }
}

fn next_walked(
    walker: &mut walkdir::IntoIter,
    root: &Path,
    builder: &ArchiveBuilder,
    forced_mode: u32,
) -> Option<Result<ArchiveEntry>> {
    loop {
        let dent = match walker.next()? {
            Ok(dent) => dent,
            Err(e) => return Some(Err(walk_error(e))),
        };

        let file_type = dent.file_type();
        if file_type.is_symlink() {
            match builder.symlinks {
                SymlinkPolicy::Skip => {
                    warn!("Skipping symbolic link {}", dent.path().display());
                    continue;
                }
                _ => return Some(Err(unsupported(dent.path(), &file_type))),
            }
        }

        let kind = if file_type.is_dir() {
            EntryKind::Directory
        } else if file_type.is_file() {
            EntryKind::File
        } else {
            return Some(Err(unsupported(dent.path(), &file_type)));
        };

        let meta = match dent.metadata() {
            Ok(meta) => meta,
            Err(e) => return Some(Err(walk_error(e))),
        };

        let relative_path = match relative_entry_path(root, dent.path()) {
            Ok(path) => path,
            Err(e) => return Some(Err(e)),
        };

        return Some(Ok(ArchiveEntry {
            relative_path,
            kind,
            mode: normalize_mode(kind, forced_mode, builder.directory_mode),
            size: if kind == EntryKind::File { meta.len() } else { 0 },
            mtime: mtime_secs(&meta),
            source: Some(dent.into_path()),
        }));
    }
}

fn relative_entry_path(root: &Path, path: &Path) -> Result<Utf8UnixPathBuf> {
    let relative = path
        .strip_prefix(root)
        .map_err(|e| InjectError::Archive(format!("{}: {}", path.display(), e)))?;

    let mut entry_path = Utf8UnixPathBuf::new();
    for component in relative.components() {
        if let Component::Normal(name) = component {
            let name = name.to_str().ok_or_else(|| InjectError::UnsupportedFileType {
                path: path.to_path_buf(),
                kind: "non-UTF-8 file name".to_string(),
            })?;
            entry_path.push(name);
        }
    }

    if entry_path.as_str().is_empty() {
        return Ok(Utf8UnixPathBuf::from(ROOT_ENTRY));
    }
    Ok(entry_path)
}

fn source_name(path: &Path) -> Result<String> {
    let name = match path.file_name() {
        Some(name) => name.to_os_string(),
        None => fs::canonicalize(path)
            .map_err(|e| InjectError::from_io(path, e))?
            .file_name()
            .map(ToOwned::to_owned)
            .ok_or_else(|| {
                InjectError::InvalidDestination(format!(
                    "cannot derive an entry name from {}",
                    path.display()
                ))
            })?,
    };

    name.into_string()
        .map_err(|_| InjectError::UnsupportedFileType {
            path: path.to_path_buf(),
            kind: "non-UTF-8 file name".to_string(),
        })
}

fn walk_error(err: walkdir::Error) -> InjectError {
    let path = err.path().map(Path::to_path_buf).unwrap_or_default();
    if err.loop_ancestor().is_some() {
        return InjectError::UnsupportedFileType {
            path,
            kind: "symbolic link loop".to_string(),
        };
    }

    match err.into_io_error() {
        Some(io) => InjectError::from_io(&path, io),
        None => InjectError::Archive(format!("failed to walk {}", path.display())),
    }
}

fn unsupported(path: &Path, file_type: &FileType) -> InjectError {
    InjectError::UnsupportedFileType {
        path: path.to_path_buf(),
        kind: describe(file_type).to_string(),
    }
}

fn describe(file_type: &FileType) -> &'static str {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        if file_type.is_socket() {
            return "socket";
        }
        if file_type.is_fifo() {
            return "fifo";
        }
        if file_type.is_block_device() {
            return "block device";
        }
        if file_type.is_char_device() {
            return "character device";
        }
    }

    if file_type.is_symlink() {
        "symbolic link"
    } else {
        "special file"
    }
}

fn mtime_secs(meta: &Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
