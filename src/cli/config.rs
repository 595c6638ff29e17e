//! Configuration discovery and loading
//!
//! This module handles the configuration discovery hierarchy:
//! 1. Current directory: ./ctr-inject.toml or ./.ctr-inject/config.toml
//! 2. User config: ~/.ctr-inject/config.toml
//! 3. System config: /etc/ctr-inject/config.toml
//! 4. Built-in defaults

use crate::container::DockerRuntimeConfig;
use crate::env;
use crate::inject::CopyOptions;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::env as std_env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// `[runtime]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Deadline for one CLI operation, in seconds
    pub timeout_secs: u64,
    /// Pull missing images before creating containers
    pub auto_pull: bool,
    /// Prefix for generated container names
    pub name_prefix: String,
    /// Seconds to wait for a container to stop
    pub stop_timeout: i64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            timeout_secs: env::DEFAULT_TIMEOUT_SECS,
            auto_pull: true,
            name_prefix: env::DEFAULT_NAME_PREFIX.to_string(),
            stop_timeout: env::DEFAULT_STOP_TIMEOUT_SECS,
        }
    }
}

impl RuntimeSettings {
    /// Deadline for one CLI operation.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Settings for the Docker runtime.
    pub fn docker_config(&self) -> DockerRuntimeConfig {
        DockerRuntimeConfig {
            auto_pull: self.auto_pull,
            name_prefix: self.name_prefix.clone(),
            stop_timeout: self.stop_timeout,
        }
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InjectConfig {
    /// `[copy]` table
    pub copy: CopyOptions,
    /// `[runtime]` table
    pub runtime: RuntimeSettings,
}

impl InjectConfig {
    /// Load from TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: InjectConfig = toml::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Configuration discovery system
pub struct ConfigDiscovery;

impl ConfigDiscovery {
    /// Load `explicit` if given, else the first file found in the hierarchy, else defaults.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<InjectConfig> {
        if let Some(path) = explicit {
            info!("Loading configuration override from: {:?}", path);
            return InjectConfig::from_toml_file(path);
        }
        Self::discover_config()
    }

    /// Discover and load configuration using the hierarchy
    pub fn discover_config() -> anyhow::Result<InjectConfig> {
        if let Some(config_path) = Self::find_config_file() {
            info!("Loading configuration from: {:?}", config_path);
            return InjectConfig::from_toml_file(config_path);
        }

        debug!("No configuration file found, using defaults");
        Ok(InjectConfig::default())
    }

    /// Find configuration file using discovery hierarchy
    pub fn find_config_file() -> Option<PathBuf> {
        for candidate in Self::get_config_candidates() {
            debug!("Checking for config file: {:?}", candidate);
            if candidate.is_file() {
                debug!("Found config file: {:?}", candidate);
                return Some(candidate);
            }
        }

        None
    }

    /// Get list of configuration file candidates in priority order
    fn get_config_candidates() -> Vec<PathBuf> {
        let cwd = std_env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let home = Self::get_home_dir();
        env::config_search_paths(&cwd, home.as_deref())
    }

    /// Get home directory path
    fn get_home_dir() -> Option<PathBuf> {
        std_env::var("HOME")
            .ok()
            .or_else(|| std_env::var("USERPROFILE").ok())
            .map(PathBuf::from)
    }

    /// Show configuration discovery information for debugging
    pub fn show_discovery_info(active: &InjectConfig) -> anyhow::Result<()> {
        println!("Configuration Discovery Hierarchy:");
        println!();

        for (i, candidate) in Self::get_config_candidates().iter().enumerate() {
            let status = if candidate.exists() {
                if candidate.is_file() {
                    "✓ EXISTS"
                } else {
                    "✗ NOT A FILE"
                }
            } else {
                "✗ NOT FOUND"
            };

            println!("  {}. {:?} - {}", i + 1, candidate, status);
        }

        println!();
        match Self::find_config_file() {
            Some(found) => println!("Active configuration: {:?}", found),
            None => println!("Active configuration: Built-in defaults"),
        }
        println!();
        print!("{}", active.to_toml_string()?);
        Ok(())
    }
}
