//! Global configuration management
//!
//! Reads `config.toml` from the config directory. Every key is optional; a
//! missing file or key falls back to the built-in defaults.
//!
//! ```toml
//! [catalog]
//! # Unset: read the Ubuntu release mirror. Empty: built-in table only.
//! index_url = "https://example.org/weirding/images.json"
//! mirror = "https://releases.ubuntu.com"
//! releases = ["24.04", "22.04"]
//! ttl = 3600
//! static_fallback = true
//!
//! [device]
//! min_size_bytes = 34359738368
//! require_removable = true
//! boot_device = "/dev/nvme0n1"
//!
//! [write]
//! block_size = 4194304
//! sync_interval_bytes = 67108864
//!
//! [acquire]
//! retries = 3
//! connect_timeout = 30
//! base_delay_ms = 1000
//!
//! [module]
//! name = "weirding"
//! services = { ollama = 11434, jupyter = 8888, ssh = 22 }
//! ```

use crate::config::{defaults, urls};
use crate::core::catalog::{CatalogSettings, IndexSource};
use crate::core::releases::UbuntuReleases;
use crate::core::validator::ValidationPolicy;
use crate::core::writer::WriteSettings;
use crate::infra::dirs::WeirdingDirs;
use crate::infra::download::DownloadManager;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Global configuration error types
#[derive(Error, Debug)]
pub enum GlobalConfigError {
    /// Failed to read config file
    #[error("Failed to read config file '{path}': {error}")]
    ReadError { path: String, error: String },

    /// Failed to parse config file
    #[error("Failed to parse config file '{path}': {error}")]
    ParseError { path: String, error: String },
}

impl From<GlobalConfigError> for crate::error::ProvisionError {
    fn from(error: GlobalConfigError) -> Self {
        Self::Config(error.to_string())
    }
}

/// Global configuration for weirding
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default)]
    pub catalog: CatalogConfig,

    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub write: WriteConfig,

    #[serde(default)]
    pub acquire: AcquireConfig,

    #[serde(default)]
    pub module: ModuleConfig,
}

/// Image catalog settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// JSON index URL replacing the Ubuntu mirror; empty disables the live index
    pub index_url: Option<String>,

    /// Ubuntu mirror root
    pub mirror: Option<String>,

    /// Ubuntu release directories read from the mirror
    pub releases: Option<Vec<String>>,

    /// Index freshness window in seconds
    pub ttl: Option<u64>,

    /// Fall back to the built-in table when no index is available
    pub static_fallback: Option<bool>,
}

/// Device eligibility settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub min_size_bytes: Option<u64>,

    pub require_removable: Option<bool>,

    /// System boot device; detected from the `/` mount when unset
    pub boot_device: Option<String>,
}

/// Raw write settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteConfig {
    pub block_size: Option<usize>,

    pub sync_interval_bytes: Option<u64>,
}

/// Download settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquireConfig {
    /// Download-and-verify attempts per image
    pub retries: Option<u32>,

    /// Connect timeout in seconds
    pub connect_timeout: Option<u64>,

    pub base_delay_ms: Option<u64>,
}

/// Manifest defaults
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleConfig {
    pub name: Option<String>,

    /// Service name to port
    pub services: Option<BTreeMap<String, u16>>,
}

impl GlobalConfig {
    /// Load global configuration from the config directory
    ///
    /// If the config file doesn't exist, returns default configuration.
    ///
    /// # Errors
    ///
    /// Returns `GlobalConfigError::ParseError` if the config file exists but
    /// contains invalid TOML.
    pub fn load(dirs: &WeirdingDirs) -> Result<Self, GlobalConfigError> {
        Self::load_from_path(&dirs.global_config_path())
    }

    /// Load global configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, GlobalConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|e| GlobalConfigError::ReadError {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;

        toml::from_str(&content).map_err(|e| GlobalConfigError::ParseError {
            path: path.display().to_string(),
            error: e.to_string(),
        })
    }

    /// Catalog settings with defaults applied
    #[must_use]
    pub fn catalog_settings(&self) -> CatalogSettings {
        let source = match self.catalog.index_url.as_deref() {
            Some("") => None,
            Some(url) => Some(IndexSource::Json {
                url: url.to_string(),
            }),
            None => Some(IndexSource::Ubuntu(UbuntuReleases {
                base_url: self
                    .catalog
                    .mirror
                    .clone()
                    .unwrap_or_else(|| urls::UBUNTU_RELEASES.to_string()),
                releases: self.catalog.releases.clone().unwrap_or_else(|| {
                    defaults::UBUNTU_LTS_RELEASES
                        .iter()
                        .map(|r| (*r).to_string())
                        .collect()
                }),
            })),
        };
        CatalogSettings {
            source,
            ttl: Duration::from_secs(self.catalog.ttl.unwrap_or(defaults::CATALOG_CACHE_TTL)),
            static_fallback: self.catalog.static_fallback.unwrap_or(true),
        }
    }

    /// Device validation policy with defaults applied
    #[must_use]
    pub fn validation_policy(&self) -> ValidationPolicy {
        ValidationPolicy {
            min_size_bytes: self
                .device
                .min_size_bytes
                .unwrap_or(defaults::MIN_DEVICE_SIZE_BYTES),
            require_removable: self.device.require_removable.unwrap_or(true),
            boot_device: self.device.boot_device.clone(),
        }
    }

    /// Writer settings with defaults applied
    #[must_use]
    pub fn write_settings(&self) -> WriteSettings {
        WriteSettings {
            block_size: self.write.block_size.unwrap_or(defaults::WRITE_BLOCK_SIZE),
            sync_interval_bytes: self
                .write
                .sync_interval_bytes
                .unwrap_or(defaults::SYNC_INTERVAL_BYTES),
        }
    }

    /// Acquisition attempts per image
    #[must_use]
    pub fn acquire_attempts(&self) -> u32 {
        self.acquire.retries.unwrap_or(defaults::MAX_ACQUIRE_ATTEMPTS)
    }

    /// HTTP client configured from `[acquire]`
    #[must_use]
    pub fn download_manager(&self) -> DownloadManager {
        DownloadManager::with_config(
            defaults::MAX_DOWNLOAD_RETRIES,
            self.acquire
                .base_delay_ms
                .unwrap_or(defaults::DOWNLOAD_BASE_DELAY_MS),
            self.acquire
                .connect_timeout
                .unwrap_or(defaults::CONNECT_TIMEOUT_SECS),
        )
    }

    /// Module name written into manifests
    #[must_use]
    pub fn module_name(&self) -> &str {
        self.module
            .name
            .as_deref()
            .unwrap_or(defaults::DEFAULT_MODULE_NAME)
    }

    /// Services declared in manifests
    #[must_use]
    pub fn services(&self) -> Vec<(String, u16)> {
        match &self.module.services {
            Some(services) => services.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            None => defaults::DEFAULT_SERVICES
                .iter()
                .map(|(name, port)| ((*name).to_string(), *port))
                .collect(),
        }
    }
}
