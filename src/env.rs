//! Environment constants and path utilities.
//!
//! This module centralizes hardcoded paths, file names, and defaults used
//! throughout the crate.

use std::path::{Path, PathBuf};

/// Hidden per-project configuration directory
pub const APP_DIR_NAME: &str = ".ctr-inject";

/// Configuration file name inside a configuration directory
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Stand-alone configuration file name in the working directory
pub const LOCAL_CONFIG_FILE_NAME: &str = "ctr-inject.toml";

/// System-wide configuration directory
pub const SYSTEM_CONFIG_DIR: &str = "/etc/ctr-inject";

/// Prefix for generated container names
pub const DEFAULT_NAME_PREFIX: &str = "ctr-inject";

/// Label set on every container this crate creates
pub const MANAGED_LABEL: &str = "ctr-inject.managed";

/// Default deadline for one copy operation, in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default container stop timeout, in seconds
pub const DEFAULT_STOP_TIMEOUT_SECS: i64 = 10;

/// Default permission bits for injected files
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// Environment variable overriding the log filter
pub const LOG_ENV_VAR: &str = "CTR_INJECT_LOG";

/// Build the project configuration directory path from a root
pub fn app_dir_path(root: &Path) -> PathBuf {
    root.join(APP_DIR_NAME)
}

/// Build the project configuration file path from a root
pub fn config_file_path(root: &Path) -> PathBuf {
    app_dir_path(root).join(CONFIG_FILE_NAME)
}

/// Candidate configuration files, most specific first.
pub fn config_search_paths(cwd: &Path, home: Option<&Path>) -> Vec<PathBuf> {
    let mut paths = vec![cwd.join(LOCAL_CONFIG_FILE_NAME), config_file_path(cwd)];
    if let Some(home) = home {
        paths.push(config_file_path(home));
    }
    paths.push(Path::new(SYSTEM_CONFIG_DIR).join(CONFIG_FILE_NAME));
    paths
}
