//! CLI-specific functionality
//!
//! This module contains all CLI-related code including argument parsing
//! and configuration discovery.

pub mod args;
pub mod config;

pub use args::{Args, CopyConfig, ExecutionMode, RunConfig};
pub use config::{ConfigDiscovery, InjectConfig, RuntimeSettings};
