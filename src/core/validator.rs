//! Device suitability rules
//!
//! A device is suitable when it is removable, at least the minimum size, not
//! the system boot device and not hosting a mounted root filesystem. Checks
//! run in a fixed order and the first failure is the reason, so the system
//! disk is always reported as the boot device rather than as "too small".

use crate::config::defaults;
use crate::core::device::{boot_device_path, format_size, DeviceRecord, Suitability};

/// Reason text for the system boot device
pub const REASON_BOOT_DEVICE: &str = "system boot device";
/// Reason text for a device hosting `/`
pub const REASON_MOUNTED_ROOT: &str = "mounted root filesystem";
/// Reason text for a fixed disk
pub const REASON_NOT_REMOVABLE: &str = "not removable";

/// Policy applied by the validator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationPolicy {
    /// Smallest acceptable device
    pub min_size_bytes: u64,
    /// Reject fixed disks
    pub require_removable: bool,
    /// Explicit boot device; detected from the `/` mount when `None`
    pub boot_device: Option<String>,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            min_size_bytes: defaults::MIN_DEVICE_SIZE_BYTES,
            require_removable: true,
            boot_device: None,
        }
    }
}

/// Computes suitability verdicts; reads records only
#[derive(Debug, Clone, Default)]
pub struct DeviceValidator {
    policy: ValidationPolicy,
}

impl DeviceValidator {
    /// Create a validator with `policy`
    pub fn new(policy: ValidationPolicy) -> Self {
        Self { policy }
    }

    /// Active policy
    pub fn policy(&self) -> &ValidationPolicy {
        &self.policy
    }

    /// Verdict for one record given the resolved boot device path
    pub fn verdict(&self, record: &DeviceRecord, boot_device: Option<&str>) -> Suitability {
        let unsuitable = |reason: String| Suitability::Unsuitable { reason };

        if boot_device == Some(record.path()) {
            return unsuitable(REASON_BOOT_DEVICE.to_string());
        }
        if record.hosts_root_filesystem() {
            return unsuitable(REASON_MOUNTED_ROOT.to_string());
        }
        if self.policy.require_removable && !record.removable() {
            return unsuitable(REASON_NOT_REMOVABLE.to_string());
        }
        if record.size_bytes() < self.policy.min_size_bytes {
            return unsuitable(format!(
                "too small ({} < {})",
                format_size(record.size_bytes()),
                format_size(self.policy.min_size_bytes)
            ));
        }
        Suitability::Suitable
    }

    /// Fresh record carrying the verdict
    pub fn assess(&self, record: &DeviceRecord, boot_device: Option<&str>) -> DeviceRecord {
        let verdict = self.verdict(record, boot_device);
        tracing::debug!(device = record.path(), verdict = verdict.reason(), "Assessed device");
        record.clone().with_suitability(verdict)
    }

    /// Boot device from the policy override, else the disk mounted at `/`
    pub fn boot_device(&self, records: &[DeviceRecord]) -> Option<String> {
        self.policy
            .boot_device
            .clone()
            .or_else(|| boot_device_path(records))
    }

    /// Assess every record of one scan, preserving order
    pub fn assess_all(&self, records: &[DeviceRecord]) -> Vec<DeviceRecord> {
        let boot = self.boot_device(records);
        records
            .iter()
            .map(|r| self.assess(r, boot.as_deref()))
            .collect()
    }
}
