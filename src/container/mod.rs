//! Container runtime collaborators.
//!
//! The injection core never talks to a daemon directly. It goes through the
//! [`ContainerRuntime`] trait, which has two implementations:
//!
//! - [`DockerRuntime`]: Docker/Podman via the bollard API
//! - [`MemoryRuntime`]: an in-memory fake with a per-container filesystem tree
//!
//! ## Architecture
//!
//! - `client`: Docker/Podman API client wrapper with connection management
//! - `docker`: bollard-backed [`ContainerRuntime`]
//! - `config`: [`ContainerRequest`] builder, including files to inject at creation
//! - `executor`: command execution within running containers
//! - `handle`: the [`Container`] handle callers copy files through
//! - `memory`: in-memory runtime for tests and dry runs
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ctr_inject::container::{Container, ContainerRequest, DockerRuntime};
//! use ctr_inject::inject::{CopyContext, CopySpec};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = Arc::new(DockerRuntime::new().await?);
//!     let ctx = CopyContext::with_timeout(std::time::Duration::from_secs(30));
//!
//!     let request = ContainerRequest::builder()
//!         .image("docker.io/bash:5.2.26")
//!         .file(CopySpec::new("testdata/waitForHello.sh", "/waitForHello.sh", 0o700))
//!         .cmd(vec!["bash", "/waitForHello.sh"])
//!         .started(true)
//!         .build()?;
//!
//!     let container = Container::create(runtime, request, &ctx).await?;
//!     container
//!         .copy_file_to_container(&ctx, "testdata/hello.sh", "/scripts/hello.sh", 0o700)
//!         .await?;
//!     container.terminate(&ctx).await?;
//!     Ok(())
//! }
//! ```

mod client;
mod config;
mod docker;
mod executor;
mod handle;
mod memory;

pub use client::{ContainerClient, ContainerClientConfig};
pub use config::{ContainerRequest, ContainerRequestBuilder};
pub use docker::{DockerRuntime, DockerRuntimeConfig};
pub use executor::{ExecConfig, ExecOutput};
pub use handle::Container;
pub use memory::{MemoryNode, MemoryRuntime};

use async_trait::async_trait;
use typed_path::Utf8UnixPath;

use crate::inject::{ArchiveStream, CopyTarget};

/// Container runtime errors.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    /// Docker/Podman API error
    #[error("Container API error: {0}")]
    ApiError(#[from] bollard::errors::Error),

    /// Container not found
    #[error("Container not found: {0}")]
    NotFound(String),

    /// Path inside the container not found
    #[error("Path not found in container: {0}")]
    PathNotFound(String),

    /// The runtime refused a write
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Archive content clashes with what exists in the container
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Container configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Container execution error
    #[error("Execution error: {0}")]
    ExecutionError(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// General error
    #[error("Container error: {0}")]
    Other(String),
}

/// Result type for container operations.
pub type Result<T> = std::result::Result<T, ContainerError>;

/// Container state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    /// Container exists but has not been started
    Created,
    /// Container is running
    Running,
    /// Container is paused
    Paused,
    /// Container is restarting
    Restarting,
    /// Container has exited
    Exited,
    /// Container is dead
    Dead,
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ContainerState::Created => "created",
            ContainerState::Running => "running",
            ContainerState::Paused => "paused",
            ContainerState::Restarting => "restarting",
            ContainerState::Exited => "exited",
            ContainerState::Dead => "dead",
        };
        f.write_str(name)
    }
}

/// Operations the injection core needs from a container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a container without starting it; returns its ID.
    async fn create_container(&self, request: &ContainerRequest) -> Result<String>;

    /// Start a created container.
    async fn start_container(&self, id: &str) -> Result<()>;

    /// Stop a running container.
    async fn stop_container(&self, id: &str) -> Result<()>;

    /// Remove a container, stopping it first if needed.
    async fn remove_container(&self, id: &str) -> Result<()>;

    /// Current lifecycle state.
    async fn state(&self, id: &str) -> Result<ContainerState>;

    /// What exists at `path` inside the container.
    async fn stat_path(&self, id: &str, path: &Utf8UnixPath) -> Result<CopyTarget>;

    /// Extract a tar archive (plain or gzip) into the existing directory `dest_dir`.
    ///
    /// `archive` is read once, chunk by chunk; an error item aborts the upload.
    async fn copy_archive_to_container(
        &self,
        id: &str,
        dest_dir: &Utf8UnixPath,
        archive: ArchiveStream,
    ) -> Result<()>;

    /// Run a command inside a running container.
    async fn exec(&self, id: &str, cmd: &[String]) -> Result<ExecOutput>;
}
