//! Live copies into a running container.

use tracing::{debug, info};
use typed_path::{Utf8UnixPath, Utf8UnixPathBuf};

use super::archive::{ArchiveBuilder, EntryKind, EntryStream};
use super::context::CopyContext;
use super::permissions::normalize_mode;
use super::resolver::{CopyPhase, CopyTarget, EffectiveDestination, SourceKind, resolve};
use super::tarball::stream_archive;
use super::{CopyOptions, InjectError, Result, normalize_container_path};
use crate::container::{ContainerRuntime, ContainerState};

/// Streams host files and trees into one running container.
///
/// Calls against the same container are not serialised; overlapping destinations
/// written concurrently interleave in no particular order.
pub struct LiveCopier<'a> {
    runtime: &'a dyn ContainerRuntime,
    id: &'a str,
    options: CopyOptions,
}

impl<'a> LiveCopier<'a> {
    /// Create a copier for container `id`.
    pub fn new(runtime: &'a dyn ContainerRuntime, id: &'a str, options: CopyOptions) -> Self {
        Self {
            runtime,
            id,
            options,
        }
    }

    /// Copy a single file to `container_path`.
    ///
    /// If `container_path` is an existing directory the file lands inside it under
    /// its own name. A directory host path is copied as a tree.
    pub async fn copy_file(
        &self,
        ctx: &CopyContext,
        host_path: impl AsRef<std::path::Path>,
        container_path: &str,
        mode: u32,
    ) -> Result<Utf8UnixPathBuf> {
        let stream = self.prepare(ctx, host_path.as_ref(), mode).await?;
        if stream.source_kind() == SourceKind::Directory {
            debug!(
                "{} is a directory, copying it as a tree",
                host_path.as_ref().display()
            );
        }
        self.send(ctx, stream, container_path, mode).await
    }

    /// Merge a directory tree into `container_path`.
    ///
    /// The tree keeps its own name: copying `testdata` to `/scripts` produces
    /// `/scripts/testdata/...`, creating `/scripts` if only its parent exists.
    pub async fn copy_directory(
        &self,
        ctx: &CopyContext,
        host_path: impl AsRef<std::path::Path>,
        container_path: &str,
        mode: u32,
    ) -> Result<Utf8UnixPathBuf> {
        let host_path = host_path.as_ref();
        let stream = self.prepare(ctx, host_path, mode).await?;
        if stream.source_kind() != SourceKind::Directory {
            return Err(InjectError::UnsupportedFileType {
                path: host_path.to_path_buf(),
                kind: "regular file where a directory was expected".to_string(),
            });
        }
        self.send(ctx, stream, container_path, mode).await
    }

    async fn prepare(
        &self,
        ctx: &CopyContext,
        host_path: &std::path::Path,
        mode: u32,
    ) -> Result<EntryStream> {
        self.ensure_running(ctx).await?;

        let builder = ArchiveBuilder::from_options(&self.options);
        let host_path = host_path.to_path_buf();
        tokio::task::spawn_blocking(move || builder.build(&host_path, mode))
            .await
            .map_err(|e| InjectError::Archive(format!("walk task failed: {}", e)))?
    }

    async fn ensure_running(&self, ctx: &CopyContext) -> Result<()> {
        let state = ctx
            .run(async { Ok(self.runtime.state(self.id).await?) })
            .await?;
        if state != ContainerState::Running {
            return Err(InjectError::ContainerNotRunning {
                id: self.id.to_string(),
                state: state.to_string(),
            });
        }
        Ok(())
    }

    async fn stat(&self, ctx: &CopyContext, path: &Utf8UnixPath) -> Result<CopyTarget> {
        ctx.run(async { Ok(self.runtime.stat_path(self.id, path).await?) })
            .await
    }

    async fn send(
        &self,
        ctx: &CopyContext,
        stream: EntryStream,
        container_path: &str,
        mode: u32,
    ) -> Result<Utf8UnixPathBuf> {
        let destination = normalize_container_path(container_path)?;
        let effective = self
            .destination(ctx, stream.source_kind(), stream.source_name(), &destination)
            .await?;

        let dir_mode = normalize_mode(EntryKind::Directory, mode, self.options.directory_mode);
        let placement = effective.clone();
        let entries = effective
            .leading_directories(dir_mode)
            .into_iter()
            .map(Ok)
            .chain(stream.map(move |entry| entry.map(|e| placement.place(e))));
        let (body, encoder) = stream_archive(entries, self.options.compression, ctx);

        let target = effective.target_path();
        debug!(
            "Streaming archive to {}:{} ({:?})",
            self.id,
            effective.upload_dir(),
            effective.strategy()
        );
        let upload = ctx
            .run(async {
                Ok(self
                    .runtime
                    .copy_archive_to_container(self.id, effective.upload_dir(), body)
                    .await?)
            })
            .await;
        let sent = encoder.finish(upload).await?;
        debug!("Uploaded {} archive bytes to {}", sent, self.id);

        info!("Copied into container {} at {}", self.id, target);
        Ok(target)
    }

    async fn destination(
        &self,
        ctx: &CopyContext,
        kind: SourceKind,
        name: &str,
        destination: &Utf8UnixPath,
    ) -> Result<EffectiveDestination> {
        let target = self.stat(ctx, destination).await?;
        let parent_path = destination
            .parent()
            .map(|p| p.to_owned())
            .unwrap_or_else(|| Utf8UnixPathBuf::from("/"));
        let parent = self.stat(ctx, &parent_path).await?;

        match resolve(kind, name, destination, &target, &parent, CopyPhase::Live) {
            Err(InjectError::DestinationNotFound(_)) if self.options.create_missing_parents => {
                let ancestor = self.existing_ancestor(ctx, &parent_path).await?;
                debug!(
                    "Creating missing directories between {} and {}",
                    ancestor, parent_path
                );
                let assumed = CopyTarget::directory(parent_path.clone());
                resolve(kind, name, destination, &target, &assumed, CopyPhase::Live)?
                    .rebase(&ancestor)
            }
            other => other,
        }
    }

    /// Nearest existing directory above `path`.
    async fn existing_ancestor(
        &self,
        ctx: &CopyContext,
        path: &Utf8UnixPath,
    ) -> Result<Utf8UnixPathBuf> {
        let mut current = path.to_owned();
        while let Some(parent) = current.parent().map(|p| p.to_owned()) {
            let probed = self.stat(ctx, &parent).await?;
            if probed.is_existing_directory() {
                return Ok(parent);
            }
            if probed.exists {
                return Err(InjectError::InvalidDestination(format!(
                    "{} is not a directory",
                    parent
                )));
            }
            current = parent;
        }
        Ok(Utf8UnixPathBuf::from("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{ContainerRequest, MemoryNode, MemoryRuntime};
    use std::fs;
    use tempfile::TempDir;

    async fn running(runtime: &MemoryRuntime) -> String {
        let request = ContainerRequest::builder()
            .image("docker.io/bash:5.2.26")
            .build()
            .unwrap();
        let id = runtime.create_container(&request).await.unwrap();
        runtime.start_container(&id).await.unwrap();
        id
    }

    fn fixtures() -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        let testdata = dir.path().join("testdata");
        fs::create_dir_all(testdata.join("nested")).unwrap();
        fs::write(testdata.join("hello.sh"), b"echo hello\n").unwrap();
        fs::write(testdata.join("nested/data.txt"), b"data").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_copy_file_to_new_path() {
        let dir = fixtures();
        let runtime = MemoryRuntime::new();
        let id = running(&runtime).await;

        let copier = LiveCopier::new(&runtime, &id, CopyOptions::default());
        let placed = copier
            .copy_file(
                &CopyContext::new(),
                dir.path().join("testdata/hello.sh"),
                "/tmp/run.sh",
                0o700,
            )
            .await
            .unwrap();

        assert_eq!(placed.as_str(), "/tmp/run.sh");
        match runtime.node(&id, "/tmp/run.sh").await {
            Some(MemoryNode::File { mode, content }) => {
                assert_eq!(mode, 0o700);
                assert_eq!(&content[..], b"echo hello\n");
            }
            other => panic!("unexpected node: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_copy_file_into_existing_directory() {
        let dir = fixtures();
        let runtime = MemoryRuntime::new();
        let id = running(&runtime).await;

        let copier = LiveCopier::new(&runtime, &id, CopyOptions::default());
        let placed = copier
            .copy_file(
                &CopyContext::new(),
                dir.path().join("testdata/hello.sh"),
                "/tmp",
                0o644,
            )
            .await
            .unwrap();

        assert_eq!(placed.as_str(), "/tmp/hello.sh");
        assert!(matches!(
            runtime.node(&id, "/tmp").await,
            Some(MemoryNode::Directory { .. })
        ));
    }

    #[tokio::test]
    async fn test_copy_directory_creates_destination() {
        let dir = fixtures();
        let runtime = MemoryRuntime::new();
        let id = running(&runtime).await;

        let copier = LiveCopier::new(&runtime, &id, CopyOptions::default());
        copier
            .copy_directory(
                &CopyContext::new(),
                dir.path().join("testdata"),
                "/scripts",
                0o700,
            )
            .await
            .unwrap();

        assert!(matches!(
            runtime.node(&id, "/scripts").await,
            Some(MemoryNode::Directory { mode: 0o700 })
        ));
        assert!(matches!(
            runtime.node(&id, "/scripts/testdata/nested/data.txt").await,
            Some(MemoryNode::File { mode: 0o700, .. })
        ));
    }

    #[tokio::test]
    async fn test_copy_directory_rejects_file_source() {
        let dir = fixtures();
        let runtime = MemoryRuntime::new();
        let id = running(&runtime).await;

        let err = LiveCopier::new(&runtime, &id, CopyOptions::default())
            .copy_directory(
                &CopyContext::new(),
                dir.path().join("testdata/hello.sh"),
                "/scripts",
                0o700,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, InjectError::UnsupportedFileType { .. }));
    }

    #[tokio::test]
    async fn test_missing_parent() {
        let dir = fixtures();
        let runtime = MemoryRuntime::new();
        let id = running(&runtime).await;
        let host = dir.path().join("testdata/hello.sh");

        let err = LiveCopier::new(&runtime, &id, CopyOptions::default())
            .copy_file(&CopyContext::new(), &host, "/opt/tools/hello.sh", 0o700)
            .await
            .unwrap_err();
        assert!(matches!(err, InjectError::DestinationNotFound(p) if p == "/opt/tools"));

        let options = CopyOptions {
            create_missing_parents: true,
            ..CopyOptions::default()
        };
        let placed = LiveCopier::new(&runtime, &id, options)
            .copy_file(&CopyContext::new(), &host, "/opt/tools/hello.sh", 0o700)
            .await
            .unwrap();
        assert_eq!(placed.as_str(), "/opt/tools/hello.sh");
        assert!(matches!(
            runtime.node(&id, "/opt/tools").await,
            Some(MemoryNode::Directory { mode: 0o700 })
        ));
    }

    #[tokio::test]
    async fn test_requires_running_container() {
        let dir = fixtures();
        let runtime = MemoryRuntime::new();
        let request = ContainerRequest::builder().image("alpine").build().unwrap();
        let id = runtime.create_container(&request).await.unwrap();

        let err = LiveCopier::new(&runtime, &id, CopyOptions::default())
            .copy_file(
                &CopyContext::new(),
                dir.path().join("testdata/hello.sh"),
                "/hello.sh",
                0o700,
            )
            .await
            .unwrap_err();
        assert!(
            matches!(err, InjectError::ContainerNotRunning { ref state, .. } if state == "created")
        );
    }
}
