//! # ctr-inject
//!
//! Places host files and directory trees inside containers, either into a
//! running container or into one that has been created but not yet started.
//!
//! ## Architecture Overview
//!
//! - **[`inject`]**: Archive construction, destination resolution, staging
//!   for containers that have not started, and live copies
//! - **[`container`]**: The runtime abstraction with a Docker/Podman backend
//!   and an in-memory backend, plus the container handle that runs
//!   injection as part of creation
//! - **[`cli`]**: Argument parsing and configuration discovery
//! - **[`env`]**: Paths, labels and defaults shared across the crate
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ctr_inject::container::{Container, ContainerRequest, DockerRuntime};
//! use ctr_inject::inject::{CopyContext, CopySpec};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = Arc::new(DockerRuntime::new().await?);
//!     let request = ContainerRequest::builder()
//!         .image("docker.io/bash:5.2.26")
//!         .file(CopySpec::new("testdata/hello.sh", "/hello.sh", 0o700))
//!         .cmd(["bash", "/hello.sh"])
//!         .started(true)
//!         .build()?;
//!
//!     let ctx = CopyContext::with_timeout(Duration::from_secs(30));
//!     let container = Container::create(runtime, request, &ctx).await?;
//!     println!("started {}", container.id());
//!     Ok(())
//! }
//! ```

/// Host-to-container file injection.
///
/// Builds tar archives from host paths, resolves where they land inside the
/// container, and delivers them before start or into a running container.
pub mod inject;

/// Container runtime backends and the container handle.
pub mod container;

/// Environment constants and path utilities.
///
/// Centralizes all hardcoded paths and directory names used throughout
/// the application for easier maintenance and consistency.
pub mod env;

// CLI module for command-line interface
pub mod cli;

pub use container::{Container, ContainerRequest, ContainerRuntime, DockerRuntime, MemoryRuntime};
pub use inject::{CopyContext, CopyOptions, CopySpec, InjectError, LiveCopier, PreCreateInjector};
