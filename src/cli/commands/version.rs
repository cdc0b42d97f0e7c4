//! CLI command for `weirding version`

use anyhow::Result;
use serde::Serialize;

/// Build information embedded by `build.rs`
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct BuildInfo {
    pub version: &'static str,
    pub git_sha: &'static str,
    pub built_at: &'static str,
    pub target: &'static str,
    pub rustc: &'static str,
}

impl BuildInfo {
    /// Values captured at compile time
    pub fn current() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            git_sha: option_env!("VERGEN_GIT_SHA").unwrap_or("unknown"),
            built_at: option_env!("VERGEN_BUILD_TIMESTAMP").unwrap_or("unknown"),
            target: option_env!("VERGEN_CARGO_TARGET_TRIPLE").unwrap_or("unknown"),
            rustc: option_env!("VERGEN_RUSTC_SEMVER").unwrap_or("unknown"),
        }
    }
}

/// Execute the version command
pub fn execute(json: bool) -> Result<()> {
    let info = BuildInfo::current();
    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        println!("weirding {}", info.version);
        println!("commit:  {}", info.git_sha);
        println!("built:   {}", info.built_at);
        println!("target:  {}", info.target);
        println!("rustc:   {}", info.rustc);
    }
    Ok(())
}
