//! Filesystem relabelling for `relabel-drive`
//!
//! Labels are sanitized to characters every supported filesystem accepts and
//! truncated to the FAT limit. The tool that applies the label depends on the
//! partition's filesystem.

use std::sync::Arc;

use crate::config::defaults;
use crate::core::device::DeviceRecord;
use crate::error::ProvisionError;
use crate::infra::platform::BlockPlatform;

/// Tool used to write a filesystem label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelTool {
    /// ext2/3/4
    E2label,
    /// FAT12/16/32
    Fatlabel,
    /// exFAT
    Exfatlabel,
    /// NTFS
    Ntfslabel,
}

impl LabelTool {
    /// Tool for a filesystem type as reported by lsblk
    pub fn for_fstype(fstype: &str) -> Option<Self> {
        match fstype.to_ascii_lowercase().as_str() {
            "ext2" | "ext3" | "ext4" => Some(Self::E2label),
            "vfat" | "fat" | "fat16" | "fat32" | "msdos" => Some(Self::Fatlabel),
            "exfat" => Some(Self::Exfatlabel),
            "ntfs" | "ntfs3" => Some(Self::Ntfslabel),
            _ => None,
        }
    }

    /// Executable name
    pub fn program(self) -> &'static str {
        match self {
            Self::E2label => "e2label",
            Self::Fatlabel => "fatlabel",
            Self::Exfatlabel => "exfatlabel",
            Self::Ntfslabel => "ntfslabel",
        }
    }

    /// Final label text for this filesystem (FAT labels are upper case)
    pub fn prepare(self, label: &str) -> String {
        match self {
            Self::Fatlabel => label.to_ascii_uppercase(),
            _ => label.to_string(),
        }
    }
}

/// Replace unsupported characters with `_` and truncate to the label limit
pub fn sanitize_label(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(defaults::MAX_LABEL_LEN)
        .collect()
}

/// Outcome of relabelling one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelabelResult {
    /// Partition that received the label
    pub partition: String,
    /// Label actually written
    pub label: String,
    /// Tool used
    pub tool: LabelTool,
}

/// Applies filesystem labels through the platform adapter
pub struct Relabeler {
    platform: Arc<dyn BlockPlatform>,
}

impl Relabeler {
    /// Create a relabeler over `platform`
    pub fn new(platform: Arc<dyn BlockPlatform>) -> Self {
        Self { platform }
    }

    /// Unmount `device` and label its first partition
    ///
    /// The system boot device is refused, as is a first partition whose
    /// filesystem has no supported labelling tool.
    pub fn relabel(
        &self,
        device: &DeviceRecord,
        requested: &str,
        boot_device: Option<&str>,
    ) -> Result<RelabelResult, ProvisionError> {
        let refuse = |reason: &str| ProvisionError::ValidationFailed {
            device: device.path().to_string(),
            reason: reason.to_string(),
        };

        if boot_device == Some(device.path()) || device.hosts_root_filesystem() {
            return Err(refuse("system boot device"));
        }

        let sanitized = sanitize_label(requested);
        if sanitized.is_empty() {
            return Err(refuse("label is empty after removing unsupported characters"));
        }

        let partition = device
            .partitions()
            .first()
            .ok_or_else(|| refuse("device has no partitions"))?;
        let fstype = partition.fstype.as_deref().unwrap_or("unknown");
        let tool = LabelTool::for_fstype(fstype).ok_or_else(|| {
            refuse(&format!(
                "cannot label a {fstype} filesystem (supported: ext2-4, FAT, exFAT, NTFS)"
            ))
        })?;

        for mount_point in device.mount_points() {
            self.platform
                .unmount(mount_point)
                .map_err(|e| ProvisionError::from_platform(device.path(), e))?;
        }

        let label = tool.prepare(&sanitized);
        tracing::info!(partition = %partition.path, %label, tool = tool.program(), "Relabelling");
        self.platform
            .set_label(tool, &partition.path, &label)
            .map_err(|e| ProvisionError::from_platform(device.path(), e))?;

        Ok(RelabelResult {
            partition: partition.path.clone(),
            label,
            tool,
        })
    }
}
