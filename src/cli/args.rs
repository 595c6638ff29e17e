//! Command line argument parsing
//!
//! This module handles CLI argument parsing with subcommands:
//! - `copy`: Copy a host file or directory into a running container
//! - `run`: Create a container with files injected before its first process starts
//! - `show-config`: Show configuration discovery information

use crate::env;
use crate::inject::CopySpec;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug)]
pub enum ExecutionMode {
    Copy(CopyConfig),
    Run(RunConfig),
    ShowConfig,
}

#[derive(Debug)]
pub struct CopyConfig {
    pub host_path: PathBuf,
    pub container: String,
    pub container_path: String,
    pub mode: u32,
    pub directory: bool,
    pub timeout: Option<Duration>,
}

#[derive(Debug)]
pub struct RunConfig {
    pub image: String,
    pub name: Option<String>,
    pub files: Vec<CopySpec>,
    pub start: bool,
    pub dry_run: bool,
    pub cmd: Vec<String>,
}

#[derive(Debug, Parser)]
#[command(name = "ctr-inject")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Inject host files and directory trees into containers")]
#[command(long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Args {
    /// Configuration file path (skips discovery)
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,
    /// Enable verbose output
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Copy a host file or directory into a running container
    Copy {
        /// File or directory on the host
        host_path: PathBuf,
        /// Container name or ID
        container: String,
        /// Absolute destination inside the container
        container_path: String,
        /// Permission bits, in octal
        #[arg(short = 'm', long = "mode", value_parser = parse_mode, default_value = "0644")]
        mode: u32,
        /// Require a directory source and merge it into the destination
        #[arg(short = 'd', long = "dir")]
        directory: bool,
        /// Deadline in seconds (overrides the configured timeout)
        #[arg(short = 't', long = "timeout")]
        timeout: Option<u64>,
    },
    /// Create a container with files in place before it starts
    Run {
        /// Image to create the container from
        #[arg(short = 'i', long = "image")]
        image: String,
        /// Container name
        #[arg(long = "name")]
        name: Option<String>,
        /// File to inject, as HOST:CONTAINER[:MODE] (repeatable, applied in order)
        #[arg(short = 'f', long = "file", value_name = "HOST:CONTAINER[:MODE]", value_parser = parse_file_spec)]
        files: Vec<CopySpec>,
        /// Create the container but do not start it
        #[arg(long = "no-start")]
        no_start: bool,
        /// Stage the files against an in-memory container and print the result
        #[arg(short = 'n', long = "dry-run")]
        dry_run: bool,
        /// Command to run in the container
        #[arg(last = true)]
        cmd: Vec<String>,
    },
    /// Show configuration discovery information
    ShowConfig,
}

impl Args {
    pub fn parse() -> Self {
        Parser::parse()
    }

    pub fn mode(&self) -> Result<ExecutionMode, String> {
        match &self.command {
            Some(Commands::Copy {
                host_path,
                container,
                container_path,
                mode,
                directory,
                timeout,
            }) => Ok(ExecutionMode::Copy(CopyConfig {
                host_path: host_path.clone(),
                container: container.clone(),
                container_path: container_path.clone(),
                mode: *mode,
                directory: *directory,
                timeout: timeout.map(Duration::from_secs),
            })),
            Some(Commands::Run {
                image,
                name,
                files,
                no_start,
                dry_run,
                cmd,
            }) => Ok(ExecutionMode::Run(RunConfig {
                image: image.clone(),
                name: name.clone(),
                files: files.clone(),
                start: !*no_start,
                dry_run: *dry_run,
                cmd: cmd.clone(),
            })),
            Some(Commands::ShowConfig) => Ok(ExecutionMode::ShowConfig),
            None => Err(
                "No command specified. Use 'ctr-inject --help' to see available commands."
                    .to_string(),
            ),
        }
    }
}

/// Parse permission bits written in octal: `0700`, `700`, or `0o700`.
pub fn parse_mode(raw: &str) -> Result<u32, String> {
    let digits = raw
        .strip_prefix("0o")
        .or_else(|| raw.strip_prefix("0O"))
        .unwrap_or(raw);
    let mode = u32::from_str_radix(digits, 8)
        .map_err(|_| format!("invalid octal mode: {:?}", raw))?;
    if mode > 0o7777 {
        return Err(format!("mode out of range: {:?}", raw));
    }
    Ok(mode)
}

/// Parse `HOST:CONTAINER[:MODE]`.
pub fn parse_file_spec(raw: &str) -> Result<CopySpec, String> {
    let mut parts = raw.splitn(3, ':');
    let host = parts.next().filter(|s| !s.is_empty());
    let container = parts.next().filter(|s| !s.is_empty());
    let (host, container) = match (host, container) {
        (Some(host), Some(container)) => (host, container),
        _ => return Err(format!("expected HOST:CONTAINER[:MODE], got {:?}", raw)),
    };
    if !container.starts_with('/') {
        return Err(format!("container path must be absolute: {:?}", container));
    }

    let mode = match parts.next() {
        Some(mode) => parse_mode(mode)?,
        None => env::DEFAULT_FILE_MODE,
    };
    Ok(CopySpec::new(host, container, mode))
}
