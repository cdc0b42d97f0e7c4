//! Configuration constants
//!
//! Compile-time defaults and remote endpoints. Runtime overrides live in
//! [`crate::core::global_config`].

pub mod defaults;
pub mod urls;
