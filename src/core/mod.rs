//! Core provisioning logic
//!
//! Block-device side effects go through [`crate::infra::platform::BlockPlatform`]
//! so every stage can run against a fake platform in tests.
//!
//! # Submodules
//!
//! - [`device`] - Device records and discovery
//! - [`validator`] - Suitability rules
//! - [`catalog`] - Image index, static fallback and request resolution
//! - [`releases`] - Ubuntu release mirror as a live index
//! - [`acquire`] - Content-addressed image cache and verified downloads
//! - [`writer`] - Raw image writing with read-back verification
//! - [`manifest`] - Module manifest and its injection
//! - [`orchestrator`] - The provisioning state machine
//! - [`relabel`] - Filesystem relabelling
//! - [`global_config`] - User configuration (`config.toml`)

pub mod acquire;
pub mod catalog;
pub mod device;
pub mod global_config;
pub mod manifest;
pub mod orchestrator;
pub mod relabel;
pub mod releases;
pub mod validator;
pub mod writer;
