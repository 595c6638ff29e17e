//! Docker/Podman-backed [`ContainerRuntime`].
//!
//! Handles image pulling, container creation and cleanup, and the archive
//! endpoints used to probe and populate container filesystems.

use crate::container::{
    ContainerClient, ContainerError, ContainerRequest, ContainerRuntime, ContainerState,
    ExecConfig, ExecOutput, Result, executor,
};
use crate::inject::{ArchiveStream, CopyTarget};
use async_trait::async_trait;
use futures::stream::StreamExt;
use tracing::{debug, info, warn};
use typed_path::{Utf8UnixComponent, Utf8UnixPath, Utf8UnixPathBuf};

/// Symlink hops followed while probing a path.
const MAX_LINK_HOPS: usize = 8;

/// Size of one tar header block.
const TAR_BLOCK: usize = 512;

/// Bytes read while looking for the first archive entry before giving up.
const MAX_HEAD_BYTES: usize = 1024 * 1024;

/// Docker runtime configuration.
#[derive(Debug, Clone)]
pub struct DockerRuntimeConfig {
    /// Automatically pull images if not present
    pub auto_pull: bool,
    /// Container name prefix
    pub name_prefix: String,
    /// Default stop timeout in seconds
    pub stop_timeout: i64,
}

impl Default for DockerRuntimeConfig {
    fn default() -> Self {
        Self {
            auto_pull: true,
            name_prefix: crate::env::DEFAULT_NAME_PREFIX.to_string(),
            stop_timeout: 10,
        }
    }
}

/// Container runtime talking to a Docker or Podman daemon.
pub struct DockerRuntime {
    client: ContainerClient,
    config: DockerRuntimeConfig,
}

impl DockerRuntime {
    /// Connect with default configuration.
    ///
    /// # Errors
    ///
    /// Returns error if connection to container runtime fails.
    pub async fn new() -> Result<Self> {
        Self::with_config(DockerRuntimeConfig::default()).await
    }

    /// Connect with custom configuration.
    ///
    /// # Errors
    ///
    /// Returns error if connection to container runtime fails.
    pub async fn with_config(config: DockerRuntimeConfig) -> Result<Self> {
        let client = ContainerClient::new().await?;
        Ok(Self { client, config })
    }

    /// Create a runtime with an existing client.
    pub fn with_client(client: ContainerClient, config: DockerRuntimeConfig) -> Self {
        Self { client, config }
    }

    /// Get the underlying client.
    pub fn client(&self) -> &ContainerClient {
        &self.client
    }

    /// Pull a container image if not present locally.
    ///
    /// # Errors
    ///
    /// Returns error if image pull fails.
    pub async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.client.image_exists(image).await? {
            debug!("Image {} already exists locally", image);
            return Ok(());
        }

        info!("Pulling image: {}", image);
        self.pull_image(image).await
    }

    /// Pull a container image from registry.
    ///
    /// # Errors
    ///
    /// Returns error if image pull fails.
    pub async fn pull_image(&self, image: &str) -> Result<()> {
        let mut stream = self.client.docker().create_image(
            Some(bollard::image::CreateImageOptions {
                from_image: image,
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!("Pull status: {}", status);
                    }
                }
                Err(e) => {
                    return Err(ContainerError::ApiError(e));
                }
            }
        }

        info!("Successfully pulled image: {}", image);
        Ok(())
    }

    /// Read the first entry of the archive the daemon returns for `path`.
    ///
    /// Only as much of the download as the first entry needs is read; the rest
    /// of a directory's archive is dropped unread.
    async fn head_entry(&self, id: &str, path: &Utf8UnixPath) -> Result<Option<HeadEntry>> {
        let options = bollard::query_parameters::DownloadFromContainerOptionsBuilder::default()
            .path(path.as_str())
            .build();
        let mut stream = Box::pin(self.client.docker().download_from_container(id, Some(options)));

        let mut head = Vec::with_capacity(TAR_BLOCK);
        loop {
            match stream.next().await {
                Some(Ok(chunk)) => head.extend_from_slice(&chunk),
                Some(Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 404,
                    ..
                })) => return Ok(None),
                Some(Err(e)) => return Err(ContainerError::ApiError(e)),
                None => {
                    return first_entry(&head).map(Some).ok_or_else(|| {
                        ContainerError::Other(format!("Truncated archive while reading {}", path))
                    });
                }
            }

            if head.len() >= TAR_BLOCK {
                if let Some(entry) = first_entry(&head) {
                    return Ok(Some(entry));
                }
            }
            if head.len() > MAX_HEAD_BYTES {
                return Err(ContainerError::Other(format!(
                    "No archive entry within the first {} bytes for {}",
                    MAX_HEAD_BYTES, path
                )));
            }
        }
    }
}

/// Type and link target of the first real entry of an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
struct HeadEntry {
    kind: tar::EntryType,
    link: Option<String>,
}

/// First entry of a possibly incomplete archive, after PAX and GNU long-name
/// extension headers are applied. `None` until enough bytes are present.
fn first_entry(bytes: &[u8]) -> Option<HeadEntry> {
    let mut archive = tar::Archive::new(bytes);
    let entry = archive.entries().ok()?.next()?.ok()?;
    let link = entry
        .link_name()
        .ok()
        .flatten()
        .and_then(|link| link.to_str().map(str::to_owned));
    Some(HeadEntry {
        kind: entry.header().entry_type(),
        link,
    })
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create_container(&self, request: &ContainerRequest) -> Result<String> {
        if self.config.auto_pull {
            self.ensure_image(request.image()).await?;
        }

        let container_name = request
            .name
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.config.name_prefix, uuid::Uuid::new_v4()));

        let options = bollard::container::CreateContainerOptions {
            name: container_name.as_str(),
            ..Default::default()
        };

        debug!("Creating container: {}", container_name);

        use bollard::container::Config as BollardConfig;

        let mut labels = request.labels.clone().unwrap_or_default();
        labels.insert(crate::env::MANAGED_LABEL.to_string(), "true".to_string());

        let bollard_config = BollardConfig {
            image: Some(request.image.clone()),
            cmd: request.cmd.clone(),
            entrypoint: request.entrypoint.clone(),
            working_dir: request.working_dir.clone(),
            env: request.env.clone(),
            labels: Some(labels),
            user: request.user.clone(),
            host_config: Some(bollard::service::HostConfig {
                readonly_rootfs: Some(request.readonly_rootfs),
                ..Default::default()
            }),
            ..Default::default()
        };

        let response = self
            .client
            .docker()
            .create_container(Some(options), bollard_config)
            .await?;

        info!("Created container: {} ({})", container_name, response.id);

        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        debug!("Starting container: {}", id);

        self.client
            .docker()
            .start_container(id, None::<bollard::container::StartContainerOptions<String>>)
            .await?;

        info!("Started container: {}", id);
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        debug!("Stopping container: {}", id);

        self.client
            .docker()
            .stop_container(
                id,
                Some(bollard::container::StopContainerOptions {
                    t: self.config.stop_timeout,
                }),
            )
            .await?;

        info!("Stopped container: {}", id);
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        if self.state(id).await? == ContainerState::Running {
            if let Err(e) = self.stop_container(id).await {
                warn!("Failed to stop container {}: {}", id, e);
            }
        }

        debug!("Removing container: {}", id);

        self.client
            .docker()
            .remove_container(
                id,
                Some(bollard::container::RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await?;

        info!("Removed container: {}", id);
        Ok(())
    }

    async fn state(&self, id: &str) -> Result<ContainerState> {
        self.client.container_state(id).await
    }

    async fn stat_path(&self, id: &str, path: &Utf8UnixPath) -> Result<CopyTarget> {
        let mut current = path.to_owned();
        for _ in 0..MAX_LINK_HOPS {
            if current.as_str() == "/" {
                return Ok(CopyTarget::directory(path));
            }

            let head = match self.head_entry(id, &current).await? {
                Some(head) => head,
                None => return Ok(CopyTarget::missing(path)),
            };

            match head.kind {
                tar::EntryType::Directory => return Ok(CopyTarget::directory(path)),
                tar::EntryType::Symlink => {
                    let link = head.link.ok_or_else(|| {
                        ContainerError::Other(format!("Unreadable symlink at {}", current))
                    })?;
                    debug!("Probe of {} follows symlink to {}", current, link);
                    current = follow_link(&current, &link);
                }
                _ => return Ok(CopyTarget::file(path)),
            }
        }

        Err(ContainerError::Other(format!(
            "Too many levels of symbolic links at {}",
            path
        )))
    }

    async fn copy_archive_to_container(
        &self,
        id: &str,
        dest_dir: &Utf8UnixPath,
        archive: ArchiveStream,
    ) -> Result<()> {
        debug!("Streaming archive to {}:{}", id, dest_dir);

        let options = bollard::query_parameters::UploadToContainerOptionsBuilder::default()
            .path(dest_dir.as_str())
            .build();

        self.client
            .docker()
            .upload_to_container(id, Some(options), bollard::body_try_stream(archive))
            .await
            .map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                } => ContainerError::PathNotFound(dest_dir.to_string()),
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 403,
                    message,
                } => ContainerError::PermissionDenied(message),
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 400,
                    message,
                } => ContainerError::Conflict(message),
                e => ContainerError::ApiError(e),
            })
    }

    async fn exec(&self, id: &str, cmd: &[String]) -> Result<ExecOutput> {
        let config = ExecConfig::builder().cmd(cmd.iter().cloned()).build();
        executor::execute(self.client.docker(), id, &config).await
    }
}

/// Absolute, lexically normalised target of a symlink found at `at`.
fn follow_link(at: &Utf8UnixPath, link: &str) -> Utf8UnixPathBuf {
    let base = at
        .parent()
        .map(|p| p.to_owned())
        .unwrap_or_else(|| Utf8UnixPathBuf::from("/"));
    let joined = base.join(link);

    let mut resolved = Utf8UnixPathBuf::from("/");
    for component in joined.components() {
        match component {
            Utf8UnixComponent::ParentDir => {
                resolved.pop();
            }
            Utf8UnixComponent::Normal(name) => resolved.push(name),
            _ => {}
        }
    }
    resolved
}
