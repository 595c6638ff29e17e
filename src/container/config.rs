//! Container creation requests.
//!
//! Provides a fluent API for describing a container to create, including the
//! host files that must be in its filesystem before the first process starts.

use crate::container::{ContainerError, Result};
use crate::inject::{CopyOptions, CopySpec};
use std::collections::HashMap;

/// Container request builder.
///
/// Provides a fluent interface for constructing creation requests with sane
/// defaults and validation.
pub struct ContainerRequestBuilder {
    image: Option<String>,
    name: Option<String>,
    cmd: Option<Vec<String>>,
    entrypoint: Option<Vec<String>>,
    working_dir: Option<String>,
    env: Vec<String>,
    labels: HashMap<String, String>,
    user: Option<String>,
    readonly_rootfs: bool,
    files: Vec<CopySpec>,
    copy_options: CopyOptions,
    started: bool,
}

impl Default for ContainerRequestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerRequestBuilder {
    /// Create a new request builder.
    pub fn new() -> Self {
        Self {
            image: None,
            name: None,
            cmd: None,
            entrypoint: None,
            working_dir: None,
            env: Vec::new(),
            labels: HashMap::new(),
            user: None,
            readonly_rootfs: false,
            files: Vec::new(),
            copy_options: CopyOptions::default(),
            started: false,
        }
    }

    /// Set the container image.
    pub fn image<S: Into<String>>(mut self, image: S) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Set the container name (generated from the runtime's prefix if unset).
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the command to run in the container.
    pub fn cmd<I, S>(mut self, cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cmd = Some(cmd.into_iter().map(|s| s.into()).collect());
        self
    }

    /// Set the entrypoint for the container.
    pub fn entrypoint<I, S>(mut self, entrypoint: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entrypoint = Some(entrypoint.into_iter().map(|s| s.into()).collect());
        self
    }

    /// Set the working directory in the container.
    pub fn working_dir<S: Into<String>>(mut self, dir: S) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Add an environment variable.
    pub fn env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.env.push(format!("{}={}", key.into(), value.into()));
        self
    }

    /// Add a label to the container.
    pub fn label<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Set user to run as in the container.
    pub fn user<S: Into<String>>(mut self, user: S) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Make root filesystem read-only.
    pub fn readonly_rootfs(mut self, enable: bool) -> Self {
        self.readonly_rootfs = enable;
        self
    }

    /// Add a host file or directory to materialise before the container starts.
    ///
    /// Files are applied in the order they are added; a later file wins where two
    /// write the same container path.
    pub fn file(mut self, spec: CopySpec) -> Self {
        self.files.push(spec);
        self
    }

    /// Add several files at once.
    pub fn files<I: IntoIterator<Item = CopySpec>>(mut self, specs: I) -> Self {
        self.files.extend(specs);
        self
    }

    /// Options applied when staging [`Self::file`] entries.
    pub fn copy_options(mut self, options: CopyOptions) -> Self {
        self.copy_options = options;
        self
    }

    /// Start the container once its files are in place.
    pub fn started(mut self, started: bool) -> Self {
        self.started = started;
        self
    }

    /// Build the request.
    ///
    /// # Errors
    ///
    /// Returns error if required fields are missing or invalid.
    pub fn build(self) -> Result<ContainerRequest> {
        let image = self
            .image
            .filter(|image| !image.trim().is_empty())
            .ok_or_else(|| ContainerError::ConfigError("Image is required".to_string()))?;

        if let Some(spec) = self
            .files
            .iter()
            .find(|spec| !spec.container_path.starts_with('/'))
        {
            return Err(ContainerError::ConfigError(format!(
                "Container path must be absolute: {}",
                spec.container_path
            )));
        }

        Ok(ContainerRequest {
            image,
            name: self.name,
            cmd: self.cmd,
            entrypoint: self.entrypoint,
            working_dir: self.working_dir,
            env: if self.env.is_empty() {
                None
            } else {
                Some(self.env)
            },
            labels: if self.labels.is_empty() {
                None
            } else {
                Some(self.labels)
            },
            user: self.user,
            readonly_rootfs: self.readonly_rootfs,
            files: self.files,
            copy_options: self.copy_options,
            started: self.started,
        })
    }
}

/// Everything needed to create a container.
#[derive(Debug, Clone)]
pub struct ContainerRequest {
    /// Image name
    pub image: String,
    /// Container name
    pub name: Option<String>,
    /// Command to run
    pub cmd: Option<Vec<String>>,
    /// Entrypoint
    pub entrypoint: Option<Vec<String>>,
    /// Working directory
    pub working_dir: Option<String>,
    /// Environment variables
    pub env: Option<Vec<String>>,
    /// Labels
    pub labels: Option<HashMap<String, String>>,
    /// User
    pub user: Option<String>,
    /// Read-only root filesystem
    pub readonly_rootfs: bool,
    /// Files materialised before the first process starts, in order
    pub files: Vec<CopySpec>,
    /// Options used to stage `files`
    pub copy_options: CopyOptions,
    /// Whether to start the container after creation
    pub started: bool,
}

impl ContainerRequest {
    /// Create a new request builder.
    pub fn builder() -> ContainerRequestBuilder {
        ContainerRequestBuilder::new()
    }

    /// Get the image name.
    pub fn image(&self) -> &str {
        &self.image
    }

    /// Get the working directory.
    pub fn working_dir(&self) -> Option<&str> {
        self.working_dir.as_deref()
    }
}
