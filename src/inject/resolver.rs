//! Path resolver: where does a payload land?
//!
//! Placement rules, given what currently exists at the destination:
//!
//! | source    | destination            | result                                         |
//! |-----------|------------------------|------------------------------------------------|
//! | file      | missing, parent exists | file written at the destination                |
//! | file      | existing file          | file overwritten                               |
//! | file      | existing directory     | file written at `destination/<basename>`       |
//! | directory | existing directory     | tree merged at `destination/<basename>`        |
//! | directory | missing, parent exists | destination created, tree at `destination/<basename>` |
//! | directory | existing file          | [`InjectError::InvalidDestination`]            |
//!
//! A directory always keeps its own name, so copying `testdata` to `/scripts` yields
//! `/scripts/testdata/...` whether or not `/scripts` existed, and repeating the copy
//! writes the same paths again.

use typed_path::{Utf8UnixComponent, Utf8UnixPath, Utf8UnixPathBuf};

use super::archive::ArchiveEntry;
use super::{InjectError, Result};

/// Whether the host side is a single file or a directory tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Regular file
    File,
    /// Directory tree
    Directory,
}

/// What a probe found at a container path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyTarget {
    /// Probed path
    pub path: Utf8UnixPathBuf,
    /// Whether anything exists there
    pub exists: bool,
    /// Whether it is a directory
    pub is_directory: bool,
}

impl CopyTarget {
    /// Nothing at `path`.
    pub fn missing(path: impl Into<Utf8UnixPathBuf>) -> Self {
        Self {
            path: path.into(),
            exists: false,
            is_directory: false,
        }
    }

    /// A directory at `path`.
    pub fn directory(path: impl Into<Utf8UnixPathBuf>) -> Self {
        Self {
            path: path.into(),
            exists: true,
            is_directory: true,
        }
    }

    /// A non-directory at `path`.
    pub fn file(path: impl Into<Utf8UnixPathBuf>) -> Self {
        Self {
            path: path.into(),
            exists: true,
            is_directory: false,
        }
    }

    /// Whether an existing directory was found.
    pub fn is_existing_directory(&self) -> bool {
        self.exists && self.is_directory
    }
}

/// Which injection path is asking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyPhase {
    /// Files staged into a container before its first process starts
    PreCreate,
    /// Files streamed into a running container
    Live,
}

/// The copy semantics picked for a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyStrategy {
    /// Write the file at the destination path verbatim
    FileToPath,
    /// Destination is a directory; write the file inside it under its own name
    FileIntoDirectory,
    /// Merge a directory payload into the destination
    DirectoryMerge,
}

/// The outcome of resolution: an existing directory to upload into and the
/// archive paths, relative to it, for the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveDestination {
    strategy: CopyStrategy,
    upload_dir: Utf8UnixPathBuf,
    create_dirs: Vec<Utf8UnixPathBuf>,
    root: Utf8UnixPathBuf,
}

impl EffectiveDestination {
    /// Chosen strategy.
    pub fn strategy(&self) -> CopyStrategy {
        self.strategy
    }

    /// Existing container directory the archive is extracted into.
    pub fn upload_dir(&self) -> &Utf8UnixPath {
        &self.upload_dir
    }

    /// Directories, relative to [`Self::upload_dir`], that must be created before the payload.
    pub fn created_dirs(&self) -> &[Utf8UnixPathBuf] {
        &self.create_dirs
    }

    /// Archive path of the payload root, relative to [`Self::upload_dir`].
    pub fn root(&self) -> &Utf8UnixPath {
        &self.root
    }

    /// Absolute container path of the payload root.
    pub fn target_path(&self) -> Utf8UnixPathBuf {
        self.upload_dir.join(&self.root)
    }

    /// Move an entry from its source-relative path to its archive path.
    pub fn place(&self, entry: ArchiveEntry) -> ArchiveEntry {
        let path = match self.strategy {
            CopyStrategy::FileToPath | CopyStrategy::FileIntoDirectory => self.root.clone(),
            CopyStrategy::DirectoryMerge if entry.is_root() => self.root.clone(),
            CopyStrategy::DirectoryMerge => self.root.join(entry.relative_path()),
        };
        entry.with_path(path)
    }

    /// Synthetic entries for [`Self::created_dirs`], parents first.
    pub fn leading_directories(&self, mode: u32) -> Vec<ArchiveEntry> {
        self.create_dirs
            .iter()
            .map(|dir| ArchiveEntry::synthetic_directory(dir.clone(), mode))
            .collect()
    }

    /// Upload into `ancestor` instead, creating every directory between it and the
    /// current upload directory.
    pub fn rebase(self, ancestor: &Utf8UnixPath) -> Result<Self> {
        let missing = self.upload_dir.strip_prefix(ancestor).map_err(|_| {
            InjectError::InvalidDestination(format!(
                "{} is not an ancestor of {}",
                ancestor, self.upload_dir
            ))
        })?;

        let mut create_dirs = Vec::new();
        let mut prefix = Utf8UnixPathBuf::new();
        for component in missing.components() {
            if let Utf8UnixComponent::Normal(name) = component {
                prefix.push(name);
                create_dirs.push(prefix.clone());
            }
        }
        create_dirs.extend(self.create_dirs.iter().map(|dir| prefix.join(dir)));

        Ok(Self {
            strategy: self.strategy,
            root: prefix.join(&self.root),
            upload_dir: ancestor.to_owned(),
            create_dirs,
        })
    }
}

/// Decide how a source named `source_name` lands at `destination`.
///
/// `target` describes `destination` itself and `parent` its parent directory; both
/// come from the caller's probe. `destination` must already be normalised.
pub fn resolve(
    source: SourceKind,
    source_name: &str,
    destination: &Utf8UnixPath,
    target: &CopyTarget,
    parent: &CopyTarget,
    phase: CopyPhase,
) -> Result<EffectiveDestination> {
    if source_name.is_empty() || source_name.contains('/') {
        return Err(InjectError::InvalidDestination(format!(
            "invalid source name {:?}",
            source_name
        )));
    }

    if target.is_existing_directory() {
        let strategy = match source {
            SourceKind::File => CopyStrategy::FileIntoDirectory,
            SourceKind::Directory => CopyStrategy::DirectoryMerge,
        };
        return Ok(EffectiveDestination {
            strategy,
            upload_dir: destination.to_owned(),
            create_dirs: Vec::new(),
            root: Utf8UnixPathBuf::from(source_name),
        });
    }

    if target.exists && source == SourceKind::Directory {
        return Err(InjectError::InvalidDestination(format!(
            "{} exists and is not a directory",
            destination
        )));
    }

    let (parent_path, name) = match (destination.parent(), destination.file_name()) {
        (Some(parent_path), Some(name)) => (parent_path, name),
        _ => {
            return Err(InjectError::InvalidDestination(format!(
                "{} has no parent directory",
                destination
            )));
        }
    };

    if !parent.exists {
        return Err(match phase {
            CopyPhase::PreCreate => InjectError::InvalidDestination(format!(
                "parent directory {} does not exist",
                parent_path
            )),
            CopyPhase::Live => InjectError::DestinationNotFound(parent_path.to_string()),
        });
    }
    if !parent.is_directory {
        return Err(InjectError::InvalidDestination(format!(
            "{} is not a directory",
            parent_path
        )));
    }

    Ok(match source {
        SourceKind::File => EffectiveDestination {
            strategy: CopyStrategy::FileToPath,
            upload_dir: parent_path.to_owned(),
            create_dirs: Vec::new(),
            root: Utf8UnixPathBuf::from(name),
        },
        SourceKind::Directory => EffectiveDestination {
            strategy: CopyStrategy::DirectoryMerge,
            upload_dir: parent_path.to_owned(),
            create_dirs: vec![Utf8UnixPathBuf::from(name)],
            root: Utf8UnixPath::new(name).join(source_name),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(p: &str) -> &Utf8UnixPath {
        Utf8UnixPath::new(p)
    }

    #[test]
    fn test_file_to_missing_path() {
        let dest = resolve(
            SourceKind::File,
            "hello.sh",
            path("/scripts/run.sh"),
            &CopyTarget::missing("/scripts/run.sh"),
            &CopyTarget::directory("/scripts"),
            CopyPhase::Live,
        )
        .unwrap();

        assert_eq!(dest.strategy(), CopyStrategy::FileToPath);
        assert_eq!(dest.upload_dir().as_str(), "/scripts");
        assert_eq!(dest.root().as_str(), "run.sh");
        assert!(dest.created_dirs().is_empty());
        assert_eq!(dest.target_path().as_str(), "/scripts/run.sh");
    }

    #[test]
    fn test_file_overwrites_existing_file() {
        let dest = resolve(
            SourceKind::File,
            "hello.sh",
            path("/hello.sh"),
            &CopyTarget::file("/hello.sh"),
            &CopyTarget::directory("/"),
            CopyPhase::Live,
        )
        .unwrap();
        assert_eq!(dest.strategy(), CopyStrategy::FileToPath);
        assert_eq!(dest.target_path().as_str(), "/hello.sh");
    }

    #[test]
    fn test_file_into_existing_directory_falls_back() {
        let dest = resolve(
            SourceKind::File,
            "hello.sh",
            path("/scripts"),
            &CopyTarget::directory("/scripts"),
            &CopyTarget::directory("/"),
            CopyPhase::Live,
        )
        .unwrap();

        assert_eq!(dest.strategy(), CopyStrategy::FileIntoDirectory);
        assert_eq!(dest.upload_dir().as_str(), "/scripts");
        assert_eq!(dest.target_path().as_str(), "/scripts/hello.sh");
    }

    #[test]
    fn test_directory_into_existing_directory() {
        let dest = resolve(
            SourceKind::Directory,
            "testdata",
            path("/scripts"),
            &CopyTarget::directory("/scripts"),
            &CopyTarget::directory("/"),
            CopyPhase::Live,
        )
        .unwrap();

        assert_eq!(dest.strategy(), CopyStrategy::DirectoryMerge);
        assert_eq!(dest.target_path().as_str(), "/scripts/testdata");
        assert!(dest.created_dirs().is_empty());
    }

    #[test]
    fn test_directory_into_missing_directory() {
        let dest = resolve(
            SourceKind::Directory,
            "testdata",
            path("/scripts"),
            &CopyTarget::missing("/scripts"),
            &CopyTarget::directory("/"),
            CopyPhase::Live,
        )
        .unwrap();

        assert_eq!(dest.strategy(), CopyStrategy::DirectoryMerge);
        assert_eq!(dest.upload_dir().as_str(), "/");
        assert_eq!(dest.created_dirs(), &[Utf8UnixPathBuf::from("scripts")]);
        assert_eq!(dest.target_path().as_str(), "/scripts/testdata");
    }

    #[test]
    fn test_directory_onto_file_is_invalid() {
        let err = resolve(
            SourceKind::Directory,
            "testdata",
            path("/etc/hosts"),
            &CopyTarget::file("/etc/hosts"),
            &CopyTarget::directory("/etc"),
            CopyPhase::Live,
        )
        .unwrap_err();
        assert!(matches!(err, InjectError::InvalidDestination(_)));
    }

    #[test]
    fn test_missing_parent_depends_on_phase() {
        let target = CopyTarget::missing("/x/y");
        let parent = CopyTarget::missing("/x");

        let err = resolve(
            SourceKind::File,
            "y",
            path("/x/y"),
            &target,
            &parent,
            CopyPhase::PreCreate,
        )
        .unwrap_err();
        assert!(matches!(err, InjectError::InvalidDestination(_)));

        let err = resolve(SourceKind::File, "y", path("/x/y"), &target, &parent, CopyPhase::Live)
            .unwrap_err();
        assert!(matches!(err, InjectError::DestinationNotFound(p) if p == "/x"));
    }

    #[test]
    fn test_parent_that_is_a_file() {
        let err = resolve(
            SourceKind::File,
            "y",
            path("/x/y"),
            &CopyTarget::missing("/x/y"),
            &CopyTarget::file("/x"),
            CopyPhase::Live,
        )
        .unwrap_err();
        assert!(matches!(err, InjectError::InvalidDestination(_)));
    }

    #[test]
    fn test_place_entries() {
        let dest = resolve(
            SourceKind::Directory,
            "testdata",
            path("/scripts"),
            &CopyTarget::directory("/scripts"),
            &CopyTarget::directory("/"),
            CopyPhase::Live,
        )
        .unwrap();

        let root = dest.place(ArchiveEntry::synthetic_directory(".", 0o755));
        assert_eq!(root.relative_path().as_str(), "testdata");

        let nested = dest.place(ArchiveEntry::synthetic_directory("a/b", 0o755));
        assert_eq!(nested.relative_path().as_str(), "testdata/a/b");
    }

    #[test]
    fn test_rebase_onto_ancestor() {
        let dest = resolve(
            SourceKind::File,
            "hello.sh",
            path("/opt/tools/bin/hello.sh"),
            &CopyTarget::missing("/opt/tools/bin/hello.sh"),
            &CopyTarget::directory("/opt/tools/bin"),
            CopyPhase::Live,
        )
        .unwrap()
        .rebase(path("/opt"))
        .unwrap();

        assert_eq!(dest.upload_dir().as_str(), "/opt");
        assert_eq!(
            dest.created_dirs(),
            &[
                Utf8UnixPathBuf::from("tools"),
                Utf8UnixPathBuf::from("tools/bin")
            ]
        );
        assert_eq!(dest.root().as_str(), "tools/bin/hello.sh");
        assert_eq!(dest.target_path().as_str(), "/opt/tools/bin/hello.sh");

        let dirs = dest.leading_directories(0o755);
        assert_eq!(dirs.len(), 2);
        assert_eq!(dirs[1].relative_path().as_str(), "tools/bin");
    }

    #[test]
    fn test_rebase_rejects_non_ancestor() {
        let dest = resolve(
            SourceKind::File,
            "a",
            path("/x/a"),
            &CopyTarget::missing("/x/a"),
            &CopyTarget::directory("/x"),
            CopyPhase::Live,
        )
        .unwrap();
        assert!(dest.rebase(path("/y")).is_err());
    }
}
