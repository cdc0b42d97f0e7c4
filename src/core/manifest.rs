//! Module manifest (weirding.json)
//!
//! A small JSON record written to the data partition of a freshly provisioned
//! device so hosts can recognise it as a module. Re-provisioning overwrites the
//! file in place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::defaults;
use crate::core::catalog::ImageDescriptor;
use crate::core::device::PartitionInfo;
use crate::error::ProvisionError;
use crate::infra::filesystem;
use crate::infra::platform::BlockPlatform;

/// Filesystems the manifest can be written to
const WRITABLE_FILESYSTEMS: &[&str] = &[
    "vfat", "exfat", "ext2", "ext3", "ext4", "ntfs", "btrfs", "xfs",
];

/// A service the module offers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub enabled: bool,
    pub port: u16,
}

/// The image a module was written from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestImage {
    pub os_family: String,
    pub version: String,
    pub variant: String,
    pub digest: String,
}

/// Identification record of a module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Schema version
    pub version: String,
    pub module_name: String,
    /// Creation time, whole seconds in UTC
    pub created: DateTime<Utc>,
    pub bootable: bool,
    pub portable: bool,
    pub services: BTreeMap<String, ServiceSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ManifestImage>,
}

impl Manifest {
    /// Fresh manifest created now with every service enabled
    pub fn new<I, S>(module_name: &str, services: I) -> Self
    where
        I: IntoIterator<Item = (S, u16)>,
        S: Into<String>,
    {
        let now = Utc::now();
        Self {
            version: defaults::MANIFEST_SCHEMA_VERSION.to_string(),
            module_name: module_name.to_string(),
            created: DateTime::from_timestamp(now.timestamp(), 0).unwrap_or(now),
            bootable: true,
            portable: true,
            services: services
                .into_iter()
                .map(|(name, port)| (name.into(), ServiceSpec { enabled: true, port }))
                .collect(),
            image: None,
        }
    }

    /// Record the image the module was written from
    #[must_use]
    pub fn with_image(mut self, descriptor: &ImageDescriptor) -> Self {
        self.image = Some(ManifestImage {
            os_family: descriptor.os_family.clone(),
            version: descriptor.version.clone(),
            variant: descriptor.variant.clone(),
            digest: descriptor.digest.to_string(),
        });
        self
    }

    /// Parse from JSON
    pub fn from_json(content: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }

    /// Serialize to pretty-printed JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl Default for Manifest {
    fn default() -> Self {
        Self::new(
            defaults::DEFAULT_MODULE_NAME,
            defaults::DEFAULT_SERVICES.iter().copied(),
        )
    }
}

/// Where a manifest ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectionReport {
    pub partition: String,
    /// Path relative to the partition root
    pub file: PathBuf,
}

/// Writes manifests onto provisioned devices
pub struct ManifestInjector {
    platform: Arc<dyn BlockPlatform>,
    mount_dir: PathBuf,
}

impl ManifestInjector {
    /// Injector mounting partitions below `mount_dir`
    pub fn new(platform: Arc<dyn BlockPlatform>, mount_dir: PathBuf) -> Self {
        Self {
            platform,
            mount_dir,
        }
    }

    /// Mount the data partition of `device`, write the manifest, unmount
    pub fn inject(
        &self,
        device: &str,
        manifest: &Manifest,
    ) -> Result<InjectionReport, ProvisionError> {
        let fail = |reason: String| ProvisionError::ManifestError {
            device: device.to_string(),
            reason,
        };

        self.platform
            .reread_partitions(device)
            .map_err(|e| fail(format!("partition table could not be re-read: {e}")))?;
        let records = self
            .platform
            .scan()
            .map_err(|e| fail(format!("device could not be rescanned: {e}")))?;
        let record = records
            .iter()
            .find(|r| r.path() == device)
            .ok_or_else(|| fail("device disappeared after writing".to_string()))?;
        let partition = data_partition(record.partitions())
            .ok_or_else(|| fail("no writable data partition on the written image".to_string()))?;

        let json = manifest
            .to_json()
            .map_err(|e| fail(format!("manifest could not be encoded: {e}")))?;

        if let Some(existing) = partition.mount_points.first() {
            tracing::debug!(
                partition = %partition.path,
                mount_point = %existing,
                "Partition already mounted"
            );
            write_manifest(Path::new(existing), &json).map_err(fail)?;
        } else {
            let target = self.mount_dir.join(partition_name(&partition.path));
            filesystem::create_dir_all(&target).map_err(|e| fail(e.to_string()))?;
            self.platform
                .mount(&partition.path, &target)
                .map_err(|e| fail(format!("{} could not be mounted: {e}", partition.path)))?;

            let written = write_manifest(&target, &json);
            if let Err(e) = self.platform.unmount(&target.to_string_lossy()) {
                tracing::warn!(
                    partition = %partition.path,
                    error = %e,
                    "Could not unmount data partition"
                );
            }
            let _ = std::fs::remove_dir(&target);
            written.map_err(fail)?;
        }

        tracing::info!(device, partition = %partition.path, "Manifest written");
        Ok(InjectionReport {
            partition: partition.path.clone(),
            file: PathBuf::from(defaults::MANIFEST_FILE_NAME),
        })
    }
}

fn data_partition(partitions: &[PartitionInfo]) -> Option<&PartitionInfo> {
    partitions.iter().find(|p| {
        p.fstype
            .as_deref()
            .is_some_and(|fs| WRITABLE_FILESYSTEMS.contains(&fs.to_ascii_lowercase().as_str()))
    })
}

fn partition_name(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

fn write_manifest(root: &Path, json: &str) -> Result<(), String> {
    filesystem::write_atomic(&root.join(defaults::MANIFEST_FILE_NAME), json.as_bytes())
        .map_err(|e| e.to_string())
}
