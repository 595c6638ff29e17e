//! In-memory container runtime.
//!
//! Keeps one filesystem tree per container and applies uploaded archives the way
//! the Docker archive endpoint does: the destination directory must exist, files
//! and directories cannot replace each other, and missing intermediate
//! directories inside the archive are created. Used by tests and `--dry-run`.

use crate::container::{
    ContainerError, ContainerRequest, ContainerRuntime, ContainerState, ExecOutput, Result,
};
use crate::inject::{ArchiveStream, CopyTarget};
use async_trait::async_trait;
use bytes::Bytes;
use flate2::read::GzDecoder;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;
use typed_path::{Utf8UnixComponent, Utf8UnixPath, Utf8UnixPathBuf};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Directories every fresh container starts with unless configured otherwise.
const DEFAULT_IMAGE_DIRS: &[&str] = &[
    "/bin",
    "/etc",
    "/home",
    "/root",
    "/tmp",
    "/usr",
    "/usr/bin",
    "/usr/local",
    "/usr/local/bin",
    "/var",
];

/// A node in a container's filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryNode {
    /// Directory
    Directory {
        /// Permission bits
        mode: u32,
    },
    /// Regular file
    File {
        /// Permission bits
        mode: u32,
        /// Content
        content: Bytes,
    },
}

impl MemoryNode {
    /// Permission bits.
    pub fn mode(&self) -> u32 {
        match self {
            MemoryNode::Directory { mode } | MemoryNode::File { mode, .. } => *mode,
        }
    }

    fn is_dir(&self) -> bool {
        matches!(self, MemoryNode::Directory { .. })
    }
}

#[derive(Debug)]
struct MemoryContainer {
    request: ContainerRequest,
    state: ContainerState,
    fs: BTreeMap<Utf8UnixPathBuf, MemoryNode>,
}

/// Container runtime with no daemon behind it.
#[derive(Debug)]
pub struct MemoryRuntime {
    containers: RwLock<HashMap<String, MemoryContainer>>,
    image_dirs: Vec<Utf8UnixPathBuf>,
    create_delay: Option<Duration>,
    upload_delay: Option<Duration>,
    chunk_delay: Option<Duration>,
    fail_next_upload: AtomicBool,
    uploads: AtomicUsize,
    received: AtomicU64,
}

impl Default for MemoryRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRuntime {
    /// A runtime whose images contain a small Unix-like directory skeleton.
    pub fn new() -> Self {
        Self::with_image_dirs(DEFAULT_IMAGE_DIRS.iter().copied())
    }

    /// A runtime whose images contain exactly `dirs` (plus `/`).
    pub fn with_image_dirs<I, S>(dirs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            containers: RwLock::new(HashMap::new()),
            image_dirs: dirs
                .into_iter()
                .map(|d| Utf8UnixPathBuf::from(d.as_ref()))
                .collect(),
            create_delay: None,
            upload_delay: None,
            chunk_delay: None,
            fail_next_upload: AtomicBool::new(false),
            uploads: AtomicUsize::new(0),
            received: AtomicU64::new(0),
        }
    }

    /// Answer create requests `delay` after the container already exists, like a
    /// daemon whose response is slow to arrive.
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    /// Delay every upload by `delay` before any of the archive is read.
    pub fn with_upload_delay(mut self, delay: Duration) -> Self {
        self.upload_delay = Some(delay);
        self
    }

    /// Wait `delay` before reading each chunk of an uploaded archive.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    /// Make the next upload fail as if the daemon connection dropped.
    pub fn fail_next_upload(&self) {
        self.fail_next_upload.store(true, Ordering::SeqCst);
    }

    /// Number of archives applied so far.
    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    /// Archive bytes read so far, including uploads that never completed.
    pub fn bytes_received(&self) -> u64 {
        self.received.load(Ordering::SeqCst)
    }

    /// IDs of containers that still exist.
    pub async fn container_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.containers.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Node at `path` inside container `id`.
    pub async fn node(&self, id: &str, path: &str) -> Option<MemoryNode> {
        let containers = self.containers.read().await;
        let container = containers.get(id)?;
        container.fs.get(&lexical(Utf8UnixPath::new(path))).cloned()
    }

    /// Every path under `root` inside container `id`, sorted, `root` excluded.
    pub async fn tree(&self, id: &str, root: &str) -> Vec<String> {
        let containers = self.containers.read().await;
        let Some(container) = containers.get(id) else {
            return Vec::new();
        };
        let root = lexical(Utf8UnixPath::new(root));
        container
            .fs
            .keys()
            .filter(|path| *path != &root && path.starts_with(&root))
            .map(|path| path.to_string())
            .collect()
    }

    /// Reject uploads the daemon would refuse before reading the body.
    async fn check_upload(&self, id: &str, dest_dir: &Utf8UnixPath) -> Result<()> {
        let containers = self.containers.read().await;
        let container = containers
            .get(id)
            .ok_or_else(|| ContainerError::NotFound(id.to_string()))?;
        if container.request.readonly_rootfs {
            return Err(ContainerError::PermissionDenied(
                "container rootfs is marked read-only".to_string(),
            ));
        }

        match container.fs.get(dest_dir) {
            Some(node) if node.is_dir() => Ok(()),
            Some(_) => Err(ContainerError::Conflict(format!(
                "extraction point is not a directory: {}",
                dest_dir
            ))),
            None => Err(ContainerError::PathNotFound(dest_dir.to_string())),
        }
    }
}

#[async_trait]
impl ContainerRuntime for MemoryRuntime {
    async fn create_container(&self, request: &ContainerRequest) -> Result<String> {
        let id = uuid::Uuid::new_v4().simple().to_string();

        let mut fs = BTreeMap::new();
        fs.insert(Utf8UnixPathBuf::from("/"), MemoryNode::Directory { mode: 0o755 });
        for dir in &self.image_dirs {
            fs.insert(lexical(dir), MemoryNode::Directory { mode: 0o755 });
        }

        debug!("Created in-memory container {} from {}", id, request.image);
        self.containers.write().await.insert(
            id.clone(),
            MemoryContainer {
                request: request.clone(),
                state: ContainerState::Created,
                fs,
            },
        );
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let mut containers = self.containers.write().await;
        let container = get_mut(&mut containers, id)?;
        match container.state {
            ContainerState::Created | ContainerState::Exited => {
                container.state = ContainerState::Running;
                Ok(())
            }
            ContainerState::Running => Ok(()),
            other => Err(ContainerError::Conflict(format!(
                "cannot start container {} in state {}",
                id, other
            ))),
        }
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        let mut containers = self.containers.write().await;
        let container = get_mut(&mut containers, id)?;
        if container.state == ContainerState::Running {
            container.state = ContainerState::Exited;
        }
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.containers
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| ContainerError::NotFound(id.to_string()))
    }

    async fn state(&self, id: &str) -> Result<ContainerState> {
        let containers = self.containers.read().await;
        containers
            .get(id)
            .map(|c| c.state)
            .ok_or_else(|| ContainerError::NotFound(id.to_string()))
    }

    async fn stat_path(&self, id: &str, path: &Utf8UnixPath) -> Result<CopyTarget> {
        let containers = self.containers.read().await;
        let container = containers
            .get(id)
            .ok_or_else(|| ContainerError::NotFound(id.to_string()))?;

        Ok(match container.fs.get(&lexical(path)) {
            Some(node) if node.is_dir() => CopyTarget::directory(path),
            Some(_) => CopyTarget::file(path),
            None => CopyTarget::missing(path),
        })
    }

    async fn copy_archive_to_container(
        &self,
        id: &str,
        dest_dir: &Utf8UnixPath,
        mut archive: ArchiveStream,
    ) -> Result<()> {
        if let Some(delay) = self.upload_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_next_upload.swap(false, Ordering::SeqCst) {
            return Err(ContainerError::Other("connection reset by daemon".to_string()));
        }

        let dest_dir = lexical(dest_dir);
        self.check_upload(id, &dest_dir).await?;

        let mut body = Vec::new();
        while let Some(chunk) = archive.next().await {
            if let Some(delay) = self.chunk_delay {
                tokio::time::sleep(delay).await;
            }
            let chunk = chunk
                .map_err(|e| ContainerError::Other(format!("archive stream failed: {}", e)))?;
            self.received.fetch_add(chunk.len() as u64, Ordering::SeqCst);
            body.extend_from_slice(&chunk);
        }

        let mut containers = self.containers.write().await;
        let container = get_mut(&mut containers, id)?;
        extract(&mut container.fs, &dest_dir, &body)?;
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn exec(&self, id: &str, cmd: &[String]) -> Result<ExecOutput> {
        let mut containers = self.containers.write().await;
        let container = get_mut(&mut containers, id)?;
        if container.state != ContainerState::Running {
            return Err(ContainerError::ExecutionError(format!(
                "container {} is not running",
                id
            )));
        }

        debug!("Executing in in-memory container {}: {:?}", id, cmd);
        Ok(run_command(&mut container.fs, cmd))
    }
}

fn get_mut<'a>(
    containers: &'a mut HashMap<String, MemoryContainer>,
    id: &str,
) -> Result<&'a mut MemoryContainer> {
    containers
        .get_mut(id)
        .ok_or_else(|| ContainerError::NotFound(id.to_string()))
}

/// Absolute, lexically normalised form of `path`.
fn lexical(path: &Utf8UnixPath) -> Utf8UnixPathBuf {
    let mut normalized = Utf8UnixPathBuf::from("/");
    for component in path.components() {
        match component {
            Utf8UnixComponent::ParentDir => {
                normalized.pop();
            }
            Utf8UnixComponent::Normal(name) => normalized.push(name),
            _ => {}
        }
    }
    normalized
}

fn extract(
    fs: &mut BTreeMap<Utf8UnixPathBuf, MemoryNode>,
    dest_dir: &Utf8UnixPath,
    archive: &[u8],
) -> Result<()> {
    let reader: Box<dyn Read + '_> = if archive.starts_with(&GZIP_MAGIC) {
        Box::new(GzDecoder::new(archive))
    } else {
        Box::new(archive)
    };

    let mut tar = tar::Archive::new(reader);
    let entries = tar
        .entries()
        .map_err(|e| ContainerError::Other(format!("invalid archive: {}", e)))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| ContainerError::Other(format!("invalid archive: {}", e)))?;
        let raw = entry
            .path()
            .map_err(|e| ContainerError::Other(format!("invalid entry path: {}", e)))?
            .to_str()
            .map(str::to_owned)
            .ok_or_else(|| ContainerError::Other("non-UTF-8 entry path".to_string()))?;
        let path = lexical(&dest_dir.join(raw.as_str()));
        let mode = entry.header().mode().unwrap_or(0o644) & 0o7777;

        ensure_parents(fs, &path)?;

        match entry.header().entry_type() {
            tar::EntryType::Directory => match fs.get_mut(&path) {
                Some(MemoryNode::Directory { mode: existing }) => *existing = mode,
                Some(MemoryNode::File { .. }) => {
                    return Err(ContainerError::Conflict(format!(
                        "cannot overwrite non-directory {} with directory",
                        path
                    )));
                }
                None => {
                    fs.insert(path, MemoryNode::Directory { mode });
                }
            },
            tar::EntryType::Regular => {
                if fs.get(&path).is_some_and(MemoryNode::is_dir) {
                    return Err(ContainerError::Conflict(format!(
                        "cannot overwrite directory {} with non-directory",
                        path
                    )));
                }
                let mut content = Vec::new();
                entry.read_to_end(&mut content)?;
                fs.insert(
                    path,
                    MemoryNode::File {
                        mode,
                        content: Bytes::from(content),
                    },
                );
            }
            other => {
                return Err(ContainerError::Other(format!(
                    "unsupported entry type {:?} at {}",
                    other, path
                )));
            }
        }
    }

    Ok(())
}

/// Create missing ancestors of `path` with mode 0755; fail if one is a file.
fn ensure_parents(fs: &mut BTreeMap<Utf8UnixPathBuf, MemoryNode>, path: &Utf8UnixPath) -> Result<()> {
    let mut ancestors: Vec<Utf8UnixPathBuf> = path
        .ancestors()
        .skip(1)
        .map(|p| p.to_owned())
        .collect();
    ancestors.reverse();

    for ancestor in ancestors {
        match fs.get(&ancestor) {
            Some(node) if node.is_dir() => {}
            Some(_) => {
                return Err(ContainerError::Conflict(format!(
                    "{} is not a directory",
                    ancestor
                )));
            }
            None => {
                fs.insert(ancestor, MemoryNode::Directory { mode: 0o755 });
            }
        }
    }
    Ok(())
}

/// The handful of commands tests use to prepare and inspect a container.
fn run_command(fs: &mut BTreeMap<Utf8UnixPathBuf, MemoryNode>, cmd: &[String]) -> ExecOutput {
    let args: Vec<&str> = cmd.iter().map(String::as_str).collect();
    match args.as_slice() {
        ["mkdir", "-p", paths @ ..] if !paths.is_empty() => {
            for raw in paths {
                let path = lexical(Utf8UnixPath::new(raw));
                if let Err(e) = ensure_parents(fs, &path) {
                    return ExecOutput::failed(1, format!("mkdir: {}\n", e));
                }
                match fs.get(&path) {
                    Some(node) if node.is_dir() => {}
                    Some(_) => {
                        return ExecOutput::failed(1, format!("mkdir: {}: File exists\n", raw));
                    }
                    None => {
                        fs.insert(path, MemoryNode::Directory { mode: 0o755 });
                    }
                }
            }
            ExecOutput::ok("")
        }
        ["cat", raw] => match fs.get(&lexical(Utf8UnixPath::new(raw))) {
            Some(MemoryNode::File { content, .. }) => {
                ExecOutput::ok(String::from_utf8_lossy(content).into_owned())
            }
            Some(MemoryNode::Directory { .. }) => {
                ExecOutput::failed(1, format!("cat: {}: Is a directory\n", raw))
            }
            None => ExecOutput::failed(1, format!("cat: {}: No such file or directory\n", raw)),
        },
        ["test", flag, raw] => {
            let node = fs.get(&lexical(Utf8UnixPath::new(raw)));
            let holds = match *flag {
                "-e" => node.is_some(),
                "-d" => node.is_some_and(MemoryNode::is_dir),
                "-f" => node.is_some_and(|n| !n.is_dir()),
                "-x" => node.is_some_and(|n| n.mode() & 0o111 != 0),
                _ => return ExecOutput::failed(2, format!("test: unknown operator {}\n", flag)),
            };
            if holds {
                ExecOutput::ok("")
            } else {
                ExecOutput::failed(1, "")
            }
        }
        ["stat", "-c", "%a", raw] => match fs.get(&lexical(Utf8UnixPath::new(raw))) {
            Some(node) => ExecOutput::ok(format!("{:o}\n", node.mode())),
            None => ExecOutput::failed(1, format!("stat: cannot stat '{}'\n", raw)),
        },
        ["ls", raw] => {
            let dir = lexical(Utf8UnixPath::new(raw));
            if !fs.get(&dir).is_some_and(MemoryNode::is_dir) {
                return ExecOutput::failed(2, format!("ls: cannot access '{}'\n", raw));
            }
            let names: Vec<&str> = fs
                .keys()
                .filter(|p| p.parent() == Some(dir.as_path()))
                .filter_map(|p| p.file_name())
                .collect();
            let mut out = names.join("\n");
            if !out.is_empty() {
                out.push('\n');
            }
            ExecOutput::ok(out)
        }
        _ => ExecOutput::failed(127, format!("{}: command not found\n", cmd.join(" "))),
    }
}
