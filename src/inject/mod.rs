//! Host-to-container file injection.
//!
//! This module moves files and directory trees from the host filesystem into a
//! container, either before the container's first process starts or while it is
//! already running.
//!
//! ## Architecture
//!
//! - [`archive`]: walks a host file or directory into a lazy stream of [`ArchiveEntry`] values
//! - [`permissions`]: forces the requested mode onto every entry
//! - [`tarball`]: encodes entries into a chunked ustar stream, optionally gzip-compressed
//! - [`resolver`]: decides where a payload lands given what already exists at the destination
//! - [`staging`]: pre-create injection, merging every [`CopySpec`] of a request into one tree
//! - [`copier`]: live copies into a running container
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ctr_inject::container::{Container, ContainerRequest, MemoryRuntime};
//! use ctr_inject::inject::{CopyContext, CopySpec};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = Arc::new(MemoryRuntime::new());
//!     let ctx = CopyContext::with_timeout(std::time::Duration::from_secs(30));
//!
//!     let request = ContainerRequest::builder()
//!         .image("docker.io/bash")
//!         .file(CopySpec::new("testdata/hello.sh", "/hello.sh", 0o700))
//!         .cmd(vec!["bash", "/hello.sh"])
//!         .started(true)
//!         .build()?;
//!
//!     let container = Container::create(runtime, request, &ctx).await?;
//!     container
//!         .copy_dir_to_container(&ctx, "testdata", "/scripts", 0o700)
//!         .await?;
//!     container.terminate(&ctx).await?;
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod context;
pub mod copier;
pub mod permissions;
pub mod resolver;
pub mod staging;
pub mod tarball;

pub use archive::{ArchiveBuilder, ArchiveEntry, EntryKind, EntryStream, SymlinkPolicy};
pub use context::CopyContext;
pub use copier::LiveCopier;
pub use permissions::{DirectoryModePolicy, normalize_mode};
pub use resolver::{CopyPhase, CopyStrategy, CopyTarget, EffectiveDestination, SourceKind};
pub use staging::{PathProbe, PreCreateInjector, StagedFiles, StagedNode};
pub use tarball::{ArchiveCompression, ArchiveEncoder, ArchiveStream, stream_archive};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use typed_path::{Utf8UnixComponent, Utf8UnixPath, Utf8UnixPathBuf};

use crate::container::ContainerError;

/// One file-injection request: a host path, the container path it should end up at,
/// and the permission bits forced onto everything derived from the host path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopySpec {
    /// File or directory on the host
    pub host_path: PathBuf,
    /// Absolute destination inside the container
    pub container_path: String,
    /// POSIX permission bits applied to every derived entry
    pub mode: u32,
}

impl CopySpec {
    /// Create a new copy specification.
    pub fn new(host_path: impl Into<PathBuf>, container_path: impl Into<String>, mode: u32) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.into(),
            mode,
        }
    }

    /// Host path as given.
    pub fn host_path(&self) -> &Path {
        &self.host_path
    }
}

/// Knobs shared by the pre-create and live copy paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CopyOptions {
    /// What to do with symbolic links found on the host
    pub symlinks: SymlinkPolicy,
    /// How the requested mode is applied to directories
    pub directory_mode: DirectoryModePolicy,
    /// Compression applied to the archive sent to the runtime
    pub compression: ArchiveCompression,
    /// Live copies only: create missing ancestors of the destination
    pub create_missing_parents: bool,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            symlinks: SymlinkPolicy::Reject,
            directory_mode: DirectoryModePolicy::Traversable,
            compression: ArchiveCompression::Gzip,
            create_missing_parents: false,
        }
    }
}

/// File injection errors.
#[derive(Debug, thiserror::Error)]
pub enum InjectError {
    /// Host path does not exist
    #[error("Host path not found: {}", .0.display())]
    NotFound(PathBuf),

    /// Host path unreadable, or the runtime refused the write
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Destination unusable for a pre-create copy (missing parent, file in the way)
    #[error("Invalid destination: {0}")]
    InvalidDestination(String),

    /// Destination parent missing inside a running container
    #[error("Destination not found in container: {0}")]
    DestinationNotFound(String),

    /// Live copies need a running container
    #[error("Container {id} is not running (state: {state})")]
    ContainerNotRunning {
        /// Container ID
        id: String,
        /// Observed state
        state: String,
    },

    /// Sockets, devices, FIFOs, and symlinks under the rejecting policy
    #[error("Unsupported file type ({kind}): {}", path.display())]
    UnsupportedFileType {
        /// Offending host path
        path: PathBuf,
        /// What was found
        kind: String,
    },

    /// Cancelled or deadline exceeded
    #[error("Copy operation canceled")]
    Canceled,

    /// Communication with the container runtime failed
    #[error("Container runtime transport failure: {0}")]
    TransportFailure(String),

    /// Local archive encoding failed
    #[error("Archive error: {0}")]
    Archive(String),
}

impl InjectError {
    /// Whether a caller may reasonably retry the same operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, InjectError::TransportFailure(_))
    }

    /// Classify an I/O error observed on a host path.
    pub(crate) fn from_io(path: &Path, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => InjectError::NotFound(path.to_path_buf()),
            std::io::ErrorKind::PermissionDenied => {
                InjectError::PermissionDenied(format!("{}: {}", path.display(), err))
            }
            _ => InjectError::Archive(format!("{}: {}", path.display(), err)),
        }
    }

    /// Turn a missing-destination error into its pre-create counterpart.
    pub(crate) fn into_pre_create(self) -> Self {
        match self {
            InjectError::DestinationNotFound(msg) => InjectError::InvalidDestination(msg),
            other => other,
        }
    }
}

impl From<ContainerError> for InjectError {
    fn from(err: ContainerError) -> Self {
        match err {
            ContainerError::PathNotFound(path) => InjectError::DestinationNotFound(path),
            ContainerError::PermissionDenied(msg) => InjectError::PermissionDenied(msg),
            other => InjectError::TransportFailure(other.to_string()),
        }
    }
}

/// Result type for injection operations.
pub type Result<T> = std::result::Result<T, InjectError>;

/// Normalise a container path lexically.
///
/// The path must be absolute. `.` components are dropped and `..` never climbs above `/`.
pub fn normalize_container_path(raw: &str) -> Result<Utf8UnixPathBuf> {
    let path = Utf8UnixPath::new(raw);
    if !path.is_absolute() {
        return Err(InjectError::InvalidDestination(format!(
            "container path must be absolute: {:?}",
            raw
        )));
    }

    let mut normalized = Utf8UnixPathBuf::from("/");
    for component in path.components() {
        match component {
            Utf8UnixComponent::RootDir | Utf8UnixComponent::CurDir => {}
            Utf8UnixComponent::ParentDir => {
                normalized.pop();
            }
            Utf8UnixComponent::Normal(name) => normalized.push(name),
        }
    }

    Ok(normalized)
}
