//! CLI command implementations
//!
//! Each command is implemented in its own submodule. [`AppContext`] builds the
//! long-lived pipeline objects once per process from the directories and the
//! global config.

pub mod cache;
pub mod list_drives;
pub mod list_images;
pub mod relabel_drive;
pub mod setup_module;
pub mod version;

use anyhow::Result;
use clap::Subcommand;
use std::sync::Arc;

use crate::core::acquire::{ImageAcquirer, ImageCache};
use crate::core::catalog::ImageCatalog;
use crate::core::device::DeviceScanner;
use crate::core::global_config::GlobalConfig;
use crate::core::manifest::ManifestInjector;
use crate::core::orchestrator::ProvisioningOrchestrator;
use crate::core::validator::DeviceValidator;
use crate::core::writer::DeviceWriter;
use crate::error::ProvisionError;
use crate::infra::dirs::WeirdingDirs;
use crate::infra::platform::{BlockPlatform, LinuxPlatform};

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List storage devices and whether they can become a module
    ListDrives {
        /// Include fixed disks, not only removable ones
        #[arg(short, long)]
        all: bool,
    },

    /// List installable images
    ListImages {
        /// Refresh the image index even if the cached copy is fresh
        #[arg(long)]
        refresh: bool,
    },

    /// Write an image to a removable device and turn it into a module
    SetupModule {
        /// Operating system family
        #[arg(long, default_value = "ubuntu")]
        os: String,

        /// Release version or prefix (e.g. 24.04); newest when omitted
        #[arg(long)]
        version: Option<String>,

        /// Edition (desktop, server)
        #[arg(long)]
        variant: Option<String>,

        /// Module name written into the manifest
        #[arg(long)]
        name: Option<String>,

        /// Re-hash a cached image before using it
        #[arg(long)]
        reverify: bool,
    },

    /// Change the filesystem label of a device's first partition
    RelabelDrive {
        /// Device path (e.g. /dev/sdb)
        device: String,

        /// New label (letters, digits, '-' and '_'; at most 11 characters)
        label: String,
    },

    /// Manage the image cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },

    /// Show version and build information
    Version,
}

/// Cache subcommands
#[derive(Subcommand, Debug)]
pub enum CacheCommands {
    /// List cached images with their verification state
    List,
    /// Delete every cached image and partial download
    Clean,
    /// Re-hash every cached image
    Verify,
}

impl Commands {
    /// Execute the command
    pub async fn run(self, json: bool) -> Result<()> {
        match self {
            Self::Version => version::execute(json),
            Self::ListDrives { all } => list_drives::execute(&AppContext::load()?, all, json),
            Self::ListImages { refresh } => {
                list_images::execute(&AppContext::load()?, refresh, json).await
            }
            Self::SetupModule {
                os,
                version,
                variant,
                name,
                reverify,
            } => {
                require_root("setup-module")?;
                let options = setup_module::SetupOptions {
                    os,
                    version,
                    variant,
                    name,
                    reverify,
                };
                setup_module::execute(&AppContext::load()?, options).await
            }
            Self::RelabelDrive { device, label } => {
                require_root("relabel-drive")?;
                relabel_drive::execute(&AppContext::load()?, &device, &label)
            }
            Self::Cache { command } => {
                let ctx = AppContext::load()?;
                match command {
                    CacheCommands::List => cache::execute_list(&ctx, json),
                    CacheCommands::Clean => cache::execute_clean(&ctx),
                    CacheCommands::Verify => cache::execute_verify(&ctx).await,
                }
            }
        }
    }
}

/// Fail unless running with an effective uid of 0
pub fn require_root(command: &str) -> Result<(), ProvisionError> {
    if rustix::process::geteuid().is_root() {
        Ok(())
    } else {
        Err(ProvisionError::PermissionDenied {
            reason: format!("{command} needs root privileges (try: sudo weirding {command})"),
        })
    }
}

/// Process-wide pipeline objects
pub struct AppContext {
    pub dirs: WeirdingDirs,
    pub config: GlobalConfig,
    pub platform: Arc<dyn BlockPlatform>,
}

impl AppContext {
    /// Resolve directories and load `config.toml`
    pub fn load() -> Result<Self, ProvisionError> {
        let dirs = WeirdingDirs::new();
        let config = GlobalConfig::load(&dirs)?;
        Ok(Self::with_platform(dirs, config, Arc::new(LinuxPlatform)))
    }

    pub fn with_platform(
        dirs: WeirdingDirs,
        config: GlobalConfig,
        platform: Arc<dyn BlockPlatform>,
    ) -> Self {
        Self {
            dirs,
            config,
            platform,
        }
    }

    pub fn scanner(&self) -> DeviceScanner {
        DeviceScanner::new(self.platform.clone())
    }

    pub fn validator(&self) -> DeviceValidator {
        DeviceValidator::new(self.config.validation_policy())
    }

    pub fn catalog(&self) -> ImageCatalog {
        ImageCatalog::new(
            self.config.catalog_settings(),
            &self.dirs.catalog_dir(),
            self.config.download_manager(),
        )
    }

    pub fn cache(&self) -> ImageCache {
        ImageCache::new(self.dirs.images_dir())
    }

    pub fn acquirer(&self) -> ImageAcquirer {
        ImageAcquirer::new(self.cache(), self.config.download_manager())
            .with_max_attempts(self.config.acquire_attempts())
    }

    pub fn orchestrator(&self) -> ProvisioningOrchestrator {
        ProvisioningOrchestrator::new(
            self.scanner(),
            self.validator(),
            self.catalog(),
            self.acquirer(),
            DeviceWriter::new(self.platform.clone(), self.validator(), self.dirs.locks_dir())
                .with_settings(self.config.write_settings()),
            ManifestInjector::new(self.platform.clone(), self.dirs.mount_dir()),
        )
    }
}
