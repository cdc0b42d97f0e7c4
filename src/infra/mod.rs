//! Infrastructure layer
//!
//! Handles I/O: block devices, network, filesystem and lock files.

pub mod dirs;
pub mod download;
pub mod filesystem;
pub mod lock;
pub mod platform;
