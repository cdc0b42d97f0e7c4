//! Weirding - portable OS modules on removable drives
//!
//! Provisions a removable block device with a bootable operating system
//! image and a small manifest that marks it as a module.
//!
//! # Architecture
//!
//! - [`cli`] - Command-line parsing, prompts and output formatting
//! - [`core`] - Device discovery, image catalog and cache, the writer and
//!   the provisioning state machine
//! - [`infra`] - Infrastructure layer (block platform, network, filesystem, locks)
//! - [`config`] - Defaults and constants
//! - [`error`] - Error types and handling

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod infra;

#[cfg(test)]
pub mod test_utils;
