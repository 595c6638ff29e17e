//! Pre-create injection.
//!
//! Every [`CopySpec`] of a creation request is resolved, in list order, into a
//! single staged tree keyed by absolute container path. The tree is then streamed
//! as one archive and extracted at `/` before the container's first process
//! starts. Later specs win on conflicting paths.

use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::{debug, info};
use typed_path::{Utf8UnixPath, Utf8UnixPathBuf};

use super::archive::{ArchiveBuilder, ArchiveEntry, EntryKind};
use super::context::CopyContext;
use super::permissions::normalize_mode;
use super::resolver::{CopyPhase, CopyTarget, SourceKind, resolve};
use super::tarball::{ArchiveCompression, ArchiveEncoder, ArchiveStream, stream_archive};
use super::{CopyOptions, CopySpec, InjectError, Result, normalize_container_path};

/// Answers "what exists at this path?" for the filesystem a container is created from.
#[async_trait]
pub trait PathProbe: Send + Sync {
    /// Probe `path`.
    async fn probe(&self, path: &Utf8UnixPath) -> Result<CopyTarget>;
}

/// Staged archive entry, stored under its path relative to `/`.
pub type StagedNode = ArchiveEntry;

/// Files and directories waiting to be materialised at container creation.
#[derive(Debug, Clone, Default)]
pub struct StagedFiles {
    nodes: BTreeMap<Utf8UnixPathBuf, StagedNode>,
}

impl StagedFiles {
    /// An empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of staged entries.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Staged entry at an absolute container path.
    pub fn get(&self, path: &str) -> Option<&StagedNode> {
        self.nodes.get(Utf8UnixPath::new(path))
    }

    /// Absolute container paths, parents before children.
    pub fn paths(&self) -> impl Iterator<Item = &Utf8UnixPath> {
        self.nodes.keys().map(|p| p.as_path())
    }

    /// What the staged tree alone says about `path`; `/` always exists.
    pub fn lookup(&self, path: &Utf8UnixPath) -> Option<CopyTarget> {
        if path.as_str() == "/" {
            return Some(CopyTarget::directory("/"));
        }
        self.nodes.get(path).map(|node| match node.kind() {
            EntryKind::Directory => CopyTarget::directory(path),
            EntryKind::File => CopyTarget::file(path),
        })
    }

    /// Stage `entry` (archive path relative to `upload_dir`), replacing whatever is
    /// staged at the same path.
    ///
    /// A directory over a directory keeps the existing children. Anything else
    /// replaces the node and drops its staged descendants.
    pub fn insert(&mut self, upload_dir: &Utf8UnixPath, entry: ArchiveEntry) {
        let absolute = upload_dir.join(entry.relative_path());
        let relative = absolute
            .strip_prefix(Utf8UnixPath::new("/"))
            .map(|p| p.to_owned())
            .unwrap_or_else(|_| absolute.clone());

        let keeps_children = entry.kind() == EntryKind::Directory
            && self
                .nodes
                .get(&absolute)
                .is_some_and(|existing| existing.kind() == EntryKind::Directory);

        if !keeps_children && self.nodes.contains_key(&absolute) {
            debug!("Replacing staged path {}", absolute);
            let prefix = format!("{}/", absolute);
            self.nodes.retain(|path, _| !path.as_str().starts_with(&prefix));
        }

        self.nodes.insert(absolute, entry.with_path(relative));
    }

    /// Entries in archive order, named relative to `/`.
    pub fn entries(&self) -> impl Iterator<Item = Result<ArchiveEntry>> + '_ {
        self.nodes.values().cloned().map(Ok)
    }

    /// Start encoding the staged tree as one archive to extract at `/`.
    pub fn archive(
        &self,
        compression: ArchiveCompression,
        ctx: &CopyContext,
    ) -> (ArchiveStream, ArchiveEncoder) {
        let entries: Vec<_> = self.entries().collect();
        stream_archive(entries, compression, ctx)
    }
}

/// Resolves creation-time copy specs into a [`StagedFiles`] tree.
#[derive(Debug, Clone, Default)]
pub struct PreCreateInjector {
    options: CopyOptions,
}

impl PreCreateInjector {
    /// Create an injector.
    pub fn new(options: CopyOptions) -> Self {
        Self { options }
    }

    /// Stage every spec in order.
    ///
    /// Paths are checked against the staged tree first, then against `probe`
    /// (the image the container is created from).
    ///
    /// # Errors
    ///
    /// The first failing spec aborts the whole batch. Missing parents surface as
    /// [`InjectError::InvalidDestination`].
    pub async fn attach(
        &self,
        specs: &[CopySpec],
        probe: &dyn PathProbe,
        ctx: &CopyContext,
    ) -> Result<StagedFiles> {
        let mut staged = StagedFiles::new();
        for spec in specs {
            ctx.check()?;
            self.stage(&mut staged, spec, probe, ctx)
                .await
                .map_err(InjectError::into_pre_create)?;
        }

        debug!("Staged {} entries from {} specs", staged.len(), specs.len());
        Ok(staged)
    }

    async fn stage(
        &self,
        staged: &mut StagedFiles,
        spec: &CopySpec,
        probe: &dyn PathProbe,
        ctx: &CopyContext,
    ) -> Result<()> {
        let destination = normalize_container_path(&spec.container_path)?;

        let builder = ArchiveBuilder::from_options(&self.options);
        let host_path = spec.host_path.clone();
        let mode = spec.mode;
        let (kind, name, entries) = tokio::task::spawn_blocking(move || {
            let stream = builder.build(&host_path, mode)?;
            let kind = stream.source_kind();
            let name = stream.source_name().to_string();
            let entries = stream.collect::<Result<Vec<_>>>()?;
            Ok::<_, InjectError>((kind, name, entries))
        })
        .await
        .map_err(|e| InjectError::Archive(format!("walk task failed: {}", e)))??;

        let target = lookup(staged, probe, &destination, ctx).await?;
        let parent_path = destination
            .parent()
            .map(|p| p.to_owned())
            .unwrap_or_else(|| Utf8UnixPathBuf::from("/"));
        let parent = lookup(staged, probe, &parent_path, ctx).await?;

        let effective = resolve(
            kind,
            &name,
            &destination,
            &target,
            &parent,
            CopyPhase::PreCreate,
        )?;

        let dir_mode = normalize_mode(EntryKind::Directory, mode, self.options.directory_mode);
        for dir in effective.leading_directories(dir_mode) {
            staged.insert(effective.upload_dir(), dir);
        }
        let count = entries.len();
        for entry in entries {
            staged.insert(effective.upload_dir(), effective.place(entry));
        }

        info!(
            "Staged {} {} as {} ({} entries, {:?})",
            match kind {
                SourceKind::File => "file",
                SourceKind::Directory => "directory",
            },
            spec.host_path.display(),
            effective.target_path(),
            count,
            effective.strategy()
        );
        Ok(())
    }
}

async fn lookup(
    staged: &StagedFiles,
    probe: &dyn PathProbe,
    path: &Utf8UnixPath,
    ctx: &CopyContext,
) -> Result<CopyTarget> {
    if let Some(target) = staged.lookup(path) {
        return Ok(target);
    }
    ctx.run(probe.probe(path)).await
}
