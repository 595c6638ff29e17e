//! Permission normalisation for archive entries.
//!
//! Host-observed mode bits are never carried into the container: every entry gets
//! the caller's requested mode. Directories are the one exception, governed by
//! [`DirectoryModePolicy`].

use serde::{Deserialize, Serialize};

use super::EntryKind;

/// Bits that are meaningful in a tar header mode field.
pub const MODE_MASK: u32 = 0o7777;

/// How the requested mode applies to directory entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectoryModePolicy {
    /// Directories get `x` for every class that has `r` (`0o644` becomes `0o755`)
    #[default]
    Traversable,
    /// Directories get the requested mode verbatim
    Exact,
}

/// Compute the mode to record for an entry of `kind` given the requested mode.
pub fn normalize_mode(kind: EntryKind, requested: u32, policy: DirectoryModePolicy) -> u32 {
    let mode = requested & MODE_MASK;
    match (kind, policy) {
        (EntryKind::File, _) | (EntryKind::Directory, DirectoryModePolicy::Exact) => mode,
        (EntryKind::Directory, DirectoryModePolicy::Traversable) => mode | ((mode & 0o444) >> 2),
    }
}
