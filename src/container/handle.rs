//! Container handle.
//!
//! A [`Container`] is what callers hold after creation. It owns a reference to the
//! runtime and exposes the public copy surface: files attached to the creation
//! request, and live copies afterwards.

use crate::container::{ContainerRequest, ContainerRuntime, ContainerState, ExecOutput};
use crate::inject::{
    CopyContext, CopyOptions, CopyTarget, InjectError, LiveCopier, PathProbe, PreCreateInjector,
};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use typed_path::{Utf8UnixPath, Utf8UnixPathBuf};

/// Probes the filesystem of a created container.
struct RuntimeProbe<'a> {
    runtime: &'a dyn ContainerRuntime,
    id: &'a str,
}

#[async_trait]
impl PathProbe for RuntimeProbe<'_> {
    async fn probe(&self, path: &Utf8UnixPath) -> crate::inject::Result<CopyTarget> {
        Ok(self.runtime.stat_path(self.id, path).await?)
    }
}

/// Handle on a container created through a [`ContainerRuntime`].
pub struct Container {
    runtime: Arc<dyn ContainerRuntime>,
    id: String,
    options: CopyOptions,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.id)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Container {
    /// Create a container, materialise the request's files, and start it if asked.
    ///
    /// Files land in the container before its first process runs. If any file
    /// fails, the container is removed again and the error returned.
    ///
    /// Creation itself is awaited to completion even when `ctx` fires meanwhile,
    /// so a container the runtime made is always known and can be removed.
    ///
    /// # Errors
    ///
    /// Returns [`InjectError::TransportFailure`] if the runtime rejects creation,
    /// or the first file error.
    pub async fn create(
        runtime: Arc<dyn ContainerRuntime>,
        request: ContainerRequest,
        ctx: &CopyContext,
    ) -> crate::inject::Result<Self> {
        let id = runtime.create_container(&request).await?;

        let container = Self {
            runtime,
            id,
            options: request.copy_options.clone(),
        };

        if let Err(e) = container.prepare(&request, ctx).await {
            warn!(
                "Setting up container {} failed, removing it: {}",
                container.id, e
            );
            if let Err(cleanup) = container.runtime.remove_container(&container.id).await {
                warn!("Failed to remove container {}: {}", container.id, cleanup);
            }
            return Err(e);
        }

        Ok(container)
    }

    async fn prepare(&self, request: &ContainerRequest, ctx: &CopyContext) -> crate::inject::Result<()> {
        ctx.check()?;
        if !request.files.is_empty() {
            let probe = RuntimeProbe {
                runtime: self.runtime.as_ref(),
                id: &self.id,
            };
            let staged = PreCreateInjector::new(request.copy_options.clone())
                .attach(&request.files, &probe, ctx)
                .await?;

            if !staged.is_empty() {
                debug!(
                    "Injecting {} entries into {} before start",
                    staged.len(),
                    self.id
                );
                let (body, encoder) = staged.archive(request.copy_options.compression, ctx);
                let upload = ctx
                    .run(async {
                        Ok(self
                            .runtime
                            .copy_archive_to_container(&self.id, Utf8UnixPath::new("/"), body)
                            .await?)
                    })
                    .await;
                encoder
                    .finish(upload)
                    .await
                    .map_err(InjectError::into_pre_create)?;
                info!(
                    "Injected {} files into container {}",
                    request.files.len(),
                    self.id
                );
            }
        }

        if request.started {
            self.start(ctx).await?;
        }
        Ok(())
    }

    /// Container ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The runtime this container lives in.
    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// Current lifecycle state.
    pub async fn state(&self, ctx: &CopyContext) -> crate::inject::Result<ContainerState> {
        ctx.run(async { Ok(self.runtime.state(&self.id).await?) })
            .await
    }

    /// Start the container.
    pub async fn start(&self, ctx: &CopyContext) -> crate::inject::Result<()> {
        ctx.run(async { Ok(self.runtime.start_container(&self.id).await?) })
            .await
    }

    /// Run a command inside the container.
    pub async fn exec<I, S>(&self, ctx: &CopyContext, cmd: I) -> crate::inject::Result<ExecOutput>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let cmd: Vec<String> = cmd.into_iter().map(Into::into).collect();
        ctx.run(async { Ok(self.runtime.exec(&self.id, &cmd).await?) })
            .await
    }

    /// Copy a host file to `container_path`, returning where it landed.
    ///
    /// An existing directory at `container_path` receives the file under its own
    /// name. The container must be running.
    pub async fn copy_file_to_container(
        &self,
        ctx: &CopyContext,
        host_path: impl AsRef<Path>,
        container_path: &str,
        mode: u32,
    ) -> crate::inject::Result<Utf8UnixPathBuf> {
        self.copier()
            .copy_file(ctx, host_path, container_path, mode)
            .await
    }

    /// Copy a host directory into `container_path`, returning the tree's root.
    ///
    /// The container must be running.
    pub async fn copy_dir_to_container(
        &self,
        ctx: &CopyContext,
        host_path: impl AsRef<Path>,
        container_path: &str,
        mode: u32,
    ) -> crate::inject::Result<Utf8UnixPathBuf> {
        self.copier()
            .copy_directory(ctx, host_path, container_path, mode)
            .await
    }

    /// Stop and remove the container.
    pub async fn terminate(self, ctx: &CopyContext) -> crate::inject::Result<()> {
        ctx.run(async { Ok(self.runtime.remove_container(&self.id).await?) })
            .await
    }

    fn copier(&self) -> LiveCopier<'_> {
        LiveCopier::new(self.runtime.as_ref(), &self.id, self.options.clone())
    }
}
