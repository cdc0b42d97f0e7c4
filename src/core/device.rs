//! Storage device records and enumeration
//!
//! A [`DeviceRecord`] is a strictly-typed snapshot of one whole block device.
//! Records are recreated on every scan and never change afterwards; the
//! validator produces a new record carrying its verdict instead of mutating
//! the scanned one.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::error::ProvisionError;
use crate::infra::platform::BlockPlatform;

/// Bus or connection class reported for a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BusClass {
    Usb,
    Sata,
    Nvme,
    Scsi,
    Mmc,
    Virtio,
    Unknown,
}

impl BusClass {
    /// Map an lsblk `TRAN` value to a bus class
    pub fn from_transport(transport: &str) -> Self {
        match transport.trim().to_ascii_lowercase().as_str() {
            "usb" => Self::Usb,
            "sata" | "ata" => Self::Sata,
            "nvme" => Self::Nvme,
            "scsi" | "sas" | "iscsi" | "fc" => Self::Scsi,
            "mmc" => Self::Mmc,
            "virtio" => Self::Virtio,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for BusClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Usb => "USB",
            Self::Sata => "SATA",
            Self::Nvme => "NVMe",
            Self::Scsi => "SCSI",
            Self::Mmc => "MMC",
            Self::Virtio => "virtio",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// A partition on a scanned device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionInfo {
    /// Partition device path (e.g. `/dev/sdb1`)
    pub path: String,
    /// Size in bytes
    pub size_bytes: u64,
    /// Filesystem type, if detected
    pub fstype: Option<String>,
    /// Filesystem label, if any
    pub label: Option<String>,
    /// Current mount points
    pub mount_points: Vec<String>,
}

/// Suitability verdict for provisioning
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "lowercase")]
pub enum Suitability {
    /// Not yet assessed by the validator
    Unassessed,
    /// Eligible for provisioning
    Suitable,
    /// Not eligible, with the first failing reason
    Unsuitable { reason: String },
}

impl Suitability {
    /// Whether the verdict allows provisioning
    pub fn is_suitable(&self) -> bool {
        matches!(self, Self::Suitable)
    }

    /// Human-readable reason for the verdict
    pub fn reason(&self) -> &str {
        match self {
            Self::Unassessed => "not assessed",
            Self::Suitable => "suitable",
            Self::Unsuitable { reason } => reason,
        }
    }
}

/// Snapshot of one whole block device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceRecord {
    path: String,
    size_bytes: u64,
    bus: BusClass,
    removable: bool,
    mount_points: Vec<String>,
    label: String,
    serial: Option<String>,
    partitions: Vec<PartitionInfo>,
    suitability: Suitability,
}

impl DeviceRecord {
    /// Create a record for `path` with no mounts, partitions or verdict
    pub fn new(path: impl Into<String>, size_bytes: u64, bus: BusClass, removable: bool) -> Self {
        let path = path.into();
        let label = path.rsplit('/').next().unwrap_or(&path).to_string();
        Self {
            path,
            size_bytes,
            bus,
            removable,
            mount_points: Vec::new(),
            label,
            serial: None,
            partitions: Vec::new(),
            suitability: Suitability::Unassessed,
        }
    }

    /// Set the human label
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Set the serial number
    #[must_use]
    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = Some(serial.into());
        self
    }

    /// Mount points of the whole device itself (not its partitions)
    #[must_use]
    pub fn with_device_mounts(mut self, mounts: Vec<String>) -> Self {
        self.mount_points.extend(mounts);
        self
    }

    /// Attach partitions; their mount points are appended in order
    #[must_use]
    pub fn with_partitions(mut self, partitions: Vec<PartitionInfo>) -> Self {
        for partition in &partitions {
            self.mount_points
                .extend(partition.mount_points.iter().cloned());
        }
        self.partitions = partitions;
        self
    }

    pub(crate) fn with_suitability(mut self, suitability: Suitability) -> Self {
        self.suitability = suitability;
        self
    }

    /// Stable device path (e.g. `/dev/sdb`)
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Total size in bytes
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Connection class
    pub fn bus(&self) -> BusClass {
        self.bus
    }

    /// Removable or hot-pluggable
    pub fn removable(&self) -> bool {
        self.removable
    }

    /// All current mount points, device first then partitions
    pub fn mount_points(&self) -> &[String] {
        &self.mount_points
    }

    /// Whether anything on the device is mounted
    pub fn is_mounted(&self) -> bool {
        !self.mount_points.is_empty()
    }

    /// Whether the device hosts the running root filesystem
    pub fn hosts_root_filesystem(&self) -> bool {
        self.mount_points.iter().any(|m| m == "/")
    }

    /// Vendor and model, or the kernel name
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Serial number, if reported
    pub fn serial(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    /// Partitions in table order
    pub fn partitions(&self) -> &[PartitionInfo] {
        &self.partitions
    }

    /// Validator verdict
    pub fn suitability(&self) -> &Suitability {
        &self.suitability
    }

    /// Shorthand for `suitability().is_suitable()`
    pub fn is_suitable(&self) -> bool {
        self.suitability.is_suitable()
    }

    /// Check that `current` still identifies the device this record describes
    ///
    /// Path, size and serial must all agree; a reused device node that now
    /// points at a different disk fails here.
    pub fn identity_mismatch(&self, current: &DeviceRecord) -> Option<String> {
        if current.path != self.path {
            return Some(format!("path is now {}", current.path));
        }
        if current.size_bytes != self.size_bytes {
            return Some(format!(
                "size changed from {} to {} bytes",
                self.size_bytes, current.size_bytes
            ));
        }
        if current.serial != self.serial {
            return Some("serial number changed".to_string());
        }
        None
    }
}

/// Path of the disk hosting the running root filesystem, if visible
pub fn boot_device_path(records: &[DeviceRecord]) -> Option<String> {
    records
        .iter()
        .find(|r| r.hosts_root_filesystem())
        .map(|r| r.path().to_string())
}

/// Format a byte count for display (binary units)
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{size:.1} {}", UNITS[unit])
    }
}

/// Enumerates whole block devices through the platform adapter
#[derive(Clone)]
pub struct DeviceScanner {
    platform: Arc<dyn BlockPlatform>,
}

impl DeviceScanner {
    /// Create a scanner over `platform`
    pub fn new(platform: Arc<dyn BlockPlatform>) -> Self {
        Self { platform }
    }

    /// Current devices in enumeration order
    ///
    /// An empty list is a valid result. Failure to run the enumeration at all
    /// is [`ProvisionError::ScanUnavailable`] and is not retried.
    pub fn scan(&self) -> Result<Vec<DeviceRecord>, ProvisionError> {
        let records = self
            .platform
            .scan()
            .map_err(|e| ProvisionError::ScanUnavailable {
                reason: e.to_string(),
            })?;
        tracing::debug!(count = records.len(), "Scanned block devices");
        Ok(records)
    }

    /// Fresh record for `path`, or `None` if it disappeared
    pub fn find(&self, path: &str) -> Result<Option<DeviceRecord>, ProvisionError> {
        Ok(self.scan()?.into_iter().find(|r| r.path() == path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partition(path: &str, mounts: &[&str]) -> PartitionInfo {
        PartitionInfo {
            path: path.to_string(),
            size_bytes: 1024,
            fstype: Some("vfat".to_string()),
            label: None,
            mount_points: mounts.iter().map(|m| (*m).to_string()).collect(),
        }
    }

    #[test]
    fn test_bus_class_from_transport() {
        assert_eq!(BusClass::from_transport("usb"), BusClass::Usb);
        assert_eq!(BusClass::from_transport("NVME"), BusClass::Nvme);
        assert_eq!(BusClass::from_transport("sata"), BusClass::Sata);
        assert_eq!(BusClass::from_transport(""), BusClass::Unknown);
        assert_eq!(BusClass::from_transport("firewire"), BusClass::Unknown);
    }

    #[test]
    fn test_mount_points_follow_partition_order() {
        let record = DeviceRecord::new("/dev/sdb", 64, BusClass::Usb, true).with_partitions(vec![
            partition("/dev/sdb1", &["/media/a"]),
            partition("/dev/sdb2", &[]),
            partition("/dev/sdb3", &["/media/c", "/srv/c"]),
        ]);
        assert_eq!(record.mount_points(), ["/media/a", "/media/c", "/srv/c"]);
        assert!(record.is_mounted());
        assert!(!record.hosts_root_filesystem());
    }

    #[test]
    fn test_boot_device_path() {
        let records = vec![
            DeviceRecord::new("/dev/sdb", 64, BusClass::Usb, true),
            DeviceRecord::new("/dev/nvme0n1", 64, BusClass::Nvme, false)
                .with_partitions(vec![partition("/dev/nvme0n1p2", &["/"])]),
        ];
        assert_eq!(boot_device_path(&records), Some("/dev/nvme0n1".to_string()));
        assert_eq!(boot_device_path(&records[..1]), None);
    }

    #[test]
    fn test_identity_mismatch() {
        let original = DeviceRecord::new("/dev/sdb", 100, BusClass::Usb, true).with_serial("A1");
        let same = original.clone();
        let resized = DeviceRecord::new("/dev/sdb", 200, BusClass::Usb, true).with_serial("A1");
        let swapped = DeviceRecord::new("/dev/sdb", 100, BusClass::Usb, true).with_serial("B2");

        assert!(original.identity_mismatch(&same).is_none());
        assert!(original.identity_mismatch(&resized).unwrap().contains("size"));
        assert!(original.identity_mismatch(&swapped).unwrap().contains("serial"));
    }

    #[test]
    fn test_default_label_is_kernel_name() {
        let record = DeviceRecord::new("/dev/sdc", 1, BusClass::Unknown, false);
        assert_eq!(record.label(), "sdc");
        assert_eq!(record.suitability(), &Suitability::Unassessed);
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.5 KiB");
        assert_eq!(format_size(32 * 1024 * 1024 * 1024), "32.0 GiB");
    }
}
