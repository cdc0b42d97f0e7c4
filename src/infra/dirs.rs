//! Platform-specific directory management
//!
//! Provides paths for the image cache, configuration and runtime state.
//! Follows XDG Base Directory conventions on Linux.
//!
//! Environment variables can override default directories:
//! - `WEIRDING_CACHE_DIR` - Override cache directory
//! - `WEIRDING_CONFIG_DIR` - Override config directory
//! - `WEIRDING_RUNTIME_DIR` - Override runtime directory (locks, mount points)

use std::env;
use std::path::{Path, PathBuf};

/// Environment variable names for directory overrides
pub const ENV_CACHE_DIR: &str = "WEIRDING_CACHE_DIR";
pub const ENV_CONFIG_DIR: &str = "WEIRDING_CONFIG_DIR";
pub const ENV_RUNTIME_DIR: &str = "WEIRDING_RUNTIME_DIR";

/// Application name used in directory paths
const APP_NAME: &str = "weirding";

/// Subdirectory names
const IMAGES_SUBDIR: &str = "images";
const CATALOG_SUBDIR: &str = "catalog";
const LOCKS_SUBDIR: &str = "locks";
const MOUNT_SUBDIR: &str = "mnt";

/// Directory provider for weirding
#[derive(Debug, Clone)]
pub struct WeirdingDirs {
    cache_dir: PathBuf,
    config_dir: PathBuf,
    runtime_dir: PathBuf,
}

impl WeirdingDirs {
    /// Create a new `WeirdingDirs` instance
    ///
    /// Checks environment variables first, then falls back to platform defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cache_dir: Self::resolve(ENV_CACHE_DIR, Self::platform_cache_dir),
            config_dir: Self::resolve(ENV_CONFIG_DIR, Self::platform_config_dir),
            runtime_dir: Self::resolve(ENV_RUNTIME_DIR, Self::platform_runtime_dir),
        }
    }

    /// Root all directories under one base path (tests, portable installs)
    #[must_use]
    pub fn rooted_at(base: &Path) -> Self {
        Self {
            cache_dir: base.join("cache"),
            config_dir: base.join("config"),
            runtime_dir: base.join("run"),
        }
    }

    /// Cache directory (`~/.cache/weirding`)
    #[must_use]
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir.clone()
    }

    /// Config directory (`~/.config/weirding`)
    #[must_use]
    pub fn config_dir(&self) -> PathBuf {
        self.config_dir.clone()
    }

    /// Runtime directory for locks and temporary mount points
    #[must_use]
    pub fn runtime_dir(&self) -> PathBuf {
        self.runtime_dir.clone()
    }

    /// Content-addressed image cache
    #[must_use]
    pub fn images_dir(&self) -> PathBuf {
        self.cache_dir.join(IMAGES_SUBDIR)
    }

    /// Last-known-good copy of the live image index
    #[must_use]
    pub fn catalog_dir(&self) -> PathBuf {
        self.cache_dir.join(CATALOG_SUBDIR)
    }

    /// Per-device lock files
    #[must_use]
    pub fn locks_dir(&self) -> PathBuf {
        self.runtime_dir.join(LOCKS_SUBDIR)
    }

    /// Scratch mount points used during manifest injection
    #[must_use]
    pub fn mount_dir(&self) -> PathBuf {
        self.runtime_dir.join(MOUNT_SUBDIR)
    }

    /// Path to `config.toml` in the config directory
    #[must_use]
    pub fn global_config_path(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    fn resolve(var: &str, fallback: fn() -> PathBuf) -> PathBuf {
        match env::var(var) {
            Ok(path) if !path.is_empty() => PathBuf::from(path),
            _ => fallback(),
        }
    }

    fn platform_cache_dir() -> PathBuf {
        dirs::cache_dir()
            .map(|p| p.join(APP_NAME))
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .map(|h| h.join(".cache").join(APP_NAME))
                    .unwrap_or_else(|| PathBuf::from(".").join(".cache").join(APP_NAME))
            })
    }

    fn platform_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|p| p.join(APP_NAME))
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .map(|h| h.join(".config").join(APP_NAME))
                    .unwrap_or_else(|| PathBuf::from(".").join(".config").join(APP_NAME))
            })
    }

    /// `$XDG_RUNTIME_DIR/weirding`, else `/run/weirding` (we normally run as root)
    fn platform_runtime_dir() -> PathBuf {
        dirs::runtime_dir()
            .map(|p| p.join(APP_NAME))
            .unwrap_or_else(|| PathBuf::from("/run").join(APP_NAME))
    }
}

impl Default for WeirdingDirs {
    fn default() -> Self {
        Self::new()
    }
}
