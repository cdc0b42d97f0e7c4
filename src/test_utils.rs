//! Test utilities
//!
//! An in-memory [`FakePlatform`] standing in for real block devices, image
//! builders, and proptest generators.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::core::device::{BusClass, DeviceRecord, PartitionInfo};
use crate::core::relabel::LabelTool;
use crate::error::PlatformError;
use crate::infra::platform::{BlockPlatform, DeviceHandle};

/// One GiB
pub const GIB: u64 = 1024 * 1024 * 1024;

/// Removable USB stick with one partition mounted at each of `mounts`
pub fn usb_stick(path: &str, size_bytes: u64, mounts: &[&str]) -> DeviceRecord {
    let partitions = mounts
        .iter()
        .enumerate()
        .map(|(i, mount)| PartitionInfo {
            path: format!("{path}{}", i + 1),
            size_bytes: size_bytes / mounts.len() as u64,
            fstype: Some("vfat".to_string()),
            label: None,
            mount_points: vec![(*mount).to_string()],
        })
        .collect();
    DeviceRecord::new(path, size_bytes, BusClass::Usb, true)
        .with_label("Test Stick")
        .with_serial(format!("SER-{}", path.trim_start_matches("/dev/")))
        .with_partitions(partitions)
}

/// Internal system disk hosting `/`
pub fn system_disk(path: &str, size_bytes: u64) -> DeviceRecord {
    DeviceRecord::new(path, size_bytes, BusClass::Nvme, false)
        .with_label("System SSD")
        .with_partitions(vec![PartitionInfo {
            path: format!("{path}p1"),
            size_bytes,
            fstype: Some("ext4".to_string()),
            label: None,
            mount_points: vec!["/".to_string()],
        }])
}

/// Freshly written module layout: an ISO partition and a FAT data partition
pub fn provisioned_layout(path: &str, size_bytes: u64) -> Vec<PartitionInfo> {
    vec![
        PartitionInfo {
            path: format!("{path}1"),
            size_bytes: 6 * GIB,
            fstype: Some("iso9660".to_string()),
            label: Some("Ubuntu".to_string()),
            mount_points: Vec::new(),
        },
        PartitionInfo {
            path: format!("{path}2"),
            size_bytes: size_bytes - 6 * GIB,
            fstype: Some("vfat".to_string()),
            label: None,
            mount_points: Vec::new(),
        },
    ]
}

/// Image bytes carrying an MBR boot signature
pub fn bootable_image(len: usize) -> Vec<u8> {
    let mut data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    if len >= 512 {
        data[510] = 0x55;
        data[511] = 0xAA;
    }
    data
}

#[derive(Default)]
struct FakeState {
    devices: Vec<DeviceRecord>,
    mounted: HashSet<String>,
    busy: HashSet<String>,
    unmounted: Vec<String>,
    mounts: Vec<(String, PathBuf)>,
    labels: Vec<(String, String)>,
    disk: Arc<Mutex<Vec<u8>>>,
    syncs: Arc<Mutex<usize>>,
    open_error: Option<fn(&str) -> PlatformError>,
    fail_writes_from: Option<u64>,
    corrupt_reads: bool,
    scan_unavailable: bool,
    mount_fails: bool,
    rereads: usize,
}

/// In-memory block platform
///
/// Every device shares one backing buffer which records what was written.
pub struct FakePlatform {
    state: Mutex<FakeState>,
}

impl FakePlatform {
    /// Platform exposing `devices`, with their partition mounts active
    pub fn new(devices: Vec<DeviceRecord>) -> Self {
        let platform = Self {
            state: Mutex::new(FakeState::default()),
        };
        platform.set_devices(devices);
        platform
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Replace the visible devices (hot-plug, swap, repartition)
    pub fn set_devices(&self, devices: Vec<DeviceRecord>) {
        let mut state = self.state();
        state.mounted = devices
            .iter()
            .flat_map(|d| d.mount_points().iter().cloned())
            .collect();
        state.devices = devices;
    }

    /// Make `umount` of `mount_point` fail with busy
    pub fn mark_busy(&self, mount_point: &str) {
        self.state().busy.insert(mount_point.to_string());
    }

    /// Make `open_exclusive` fail with the given error
    pub fn fail_open(&self, error: fn(&str) -> PlatformError) {
        self.state().open_error = Some(error);
    }

    /// Make writes at or past `offset` fail
    pub fn fail_writes_from(&self, offset: u64) {
        self.state().fail_writes_from = Some(offset);
    }

    /// Return flipped bytes from read-back
    pub fn corrupt_reads(&self) {
        self.state().corrupt_reads = true;
    }

    /// Make enumeration fail as if lsblk were missing
    pub fn scan_unavailable(&self) {
        self.state().scan_unavailable = true;
    }

    /// Make `mount` fail
    pub fn fail_mounts(&self) {
        self.state().mount_fails = true;
    }

    /// Bytes written to the backing disk
    pub fn disk_contents(&self) -> Vec<u8> {
        self.state().disk.lock().unwrap().clone()
    }

    /// Number of device syncs
    pub fn sync_count(&self) -> usize {
        *self.state().syncs.lock().unwrap()
    }

    /// Mount points successfully unmounted, in order
    pub fn unmounted(&self) -> Vec<String> {
        self.state().unmounted.clone()
    }

    /// Currently active scratch mounts (partition, target)
    pub fn active_mounts(&self) -> Vec<(String, PathBuf)> {
        self.state().mounts.clone()
    }

    /// Labels applied (partition, label)
    pub fn labels(&self) -> Vec<(String, String)> {
        self.state().labels.clone()
    }

    /// Number of partition table rescans
    pub fn reread_count(&self) -> usize {
        self.state().rereads
    }
}

impl BlockPlatform for FakePlatform {
    fn scan(&self) -> Result<Vec<DeviceRecord>, PlatformError> {
        let state = self.state();
        if state.scan_unavailable {
            return Err(PlatformError::ToolMissing {
                tool: "lsblk".to_string(),
            });
        }
        Ok(state
            .devices
            .iter()
            .map(|d| {
                let partitions = d
                    .partitions()
                    .iter()
                    .map(|p| PartitionInfo {
                        mount_points: p
                            .mount_points
                            .iter()
                            .filter(|m| state.mounted.contains(*m))
                            .cloned()
                            .collect(),
                        ..p.clone()
                    })
                    .collect();
                let mut record =
                    DeviceRecord::new(d.path(), d.size_bytes(), d.bus(), d.removable())
                        .with_label(d.label())
                        .with_partitions(partitions);
                if let Some(serial) = d.serial() {
                    record = record.with_serial(serial);
                }
                record
            })
            .collect())
    }

    fn unmount(&self, mount_point: &str) -> Result<(), PlatformError> {
        let mut state = self.state();
        if state.busy.contains(mount_point) {
            return Err(PlatformError::Busy {
                path: mount_point.to_string(),
            });
        }
        let before = state.mounts.len();
        state
            .mounts
            .retain(|(_, target)| target.to_string_lossy() != mount_point);
        if !state.mounted.remove(mount_point) && before == state.mounts.len() {
            return Err(PlatformError::ToolFailed {
                tool: "umount".to_string(),
                message: format!("{mount_point}: not mounted"),
            });
        }
        state.unmounted.push(mount_point.to_string());
        Ok(())
    }

    fn open_exclusive(&self, device: &str) -> Result<Box<dyn DeviceHandle>, PlatformError> {
        let state = self.state();
        if let Some(error) = state.open_error {
            return Err(error(device));
        }
        let record = state
            .devices
            .iter()
            .find(|d| d.path() == device)
            .ok_or_else(|| PlatformError::NotFound {
                path: device.to_string(),
            })?;
        let still_mounted = record
            .mount_points()
            .iter()
            .any(|m| state.mounted.contains(m));
        if still_mounted {
            return Err(PlatformError::Busy {
                path: device.to_string(),
            });
        }
        Ok(Box::new(FakeHandle {
            disk: state.disk.clone(),
            syncs: state.syncs.clone(),
            size: record.size_bytes(),
            fail_writes_from: state.fail_writes_from,
            corrupt_reads: state.corrupt_reads,
        }))
    }

    fn reread_partitions(&self, _device: &str) -> Result<(), PlatformError> {
        self.state().rereads += 1;
        Ok(())
    }

    fn mount(&self, partition: &str, target: &Path) -> Result<(), PlatformError> {
        let mut state = self.state();
        if state.mount_fails {
            return Err(PlatformError::ToolFailed {
                tool: "mount".to_string(),
                message: format!("wrong fs type on {partition}"),
            });
        }
        state
            .mounts
            .push((partition.to_string(), target.to_path_buf()));
        Ok(())
    }

    fn set_label(
        &self,
        _tool: LabelTool,
        partition: &str,
        label: &str,
    ) -> Result<(), PlatformError> {
        self.state()
            .labels
            .push((partition.to_string(), label.to_string()));
        Ok(())
    }
}

struct FakeHandle {
    disk: Arc<Mutex<Vec<u8>>>,
    syncs: Arc<Mutex<usize>>,
    size: u64,
    fail_writes_from: Option<u64>,
    corrupt_reads: bool,
}

impl DeviceHandle for FakeHandle {
    fn write_chunk(&mut self, offset: u64, data: &[u8]) -> Result<(), PlatformError> {
        if self.fail_writes_from.is_some_and(|limit| offset >= limit) {
            return Err(PlatformError::Io {
                path: "fake".to_string(),
                error: "Input/output error".to_string(),
            });
        }
        let mut disk = self.disk.lock().unwrap();
        let start = offset as usize;
        let end = start + data.len();
        if disk.len() < end {
            disk.resize(end, 0);
        }
        disk[start..end].copy_from_slice(data);
        Ok(())
    }

    fn read_range(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, PlatformError> {
        let disk = self.disk.lock().unwrap();
        let available = self.size.saturating_sub(offset).min(len as u64) as usize;
        let start = offset as usize;
        let mut out: Vec<u8> = (0..available)
            .map(|i| disk.get(start + i).copied().unwrap_or(0))
            .collect();
        if self.corrupt_reads {
            for byte in &mut out {
                *byte = !*byte;
            }
        }
        Ok(out)
    }

    fn sync(&mut self) -> Result<(), PlatformError> {
        *self.syncs.lock().unwrap() += 1;
        Ok(())
    }
}

pub mod generators {
    use super::GIB;
    use crate::core::device::{BusClass, DeviceRecord, PartitionInfo};
    use proptest::prelude::*;

    /// Generate a valid SHA256 hash (64 hex characters)
    pub fn sha256_hash() -> impl Strategy<Value = String> {
        "[0-9a-f]{64}"
    }

    /// Generate a dotted release version such as `24.04` or `22.04.3`
    pub fn release_version() -> impl Strategy<Value = String> {
        (10u32..40, prop_oneof![Just(4u32), Just(10u32)], proptest::option::of(0u32..6)).prop_map(
            |(year, month, point)| match point {
                Some(p) => format!("{year}.{month:02}.{p}"),
                None => format!("{year}.{month:02}"),
            },
        )
    }

    fn bus_class() -> impl Strategy<Value = BusClass> {
        prop_oneof![
            Just(BusClass::Usb),
            Just(BusClass::Sata),
            Just(BusClass::Nvme),
            Just(BusClass::Mmc),
            Just(BusClass::Unknown),
        ]
    }

    fn mount_point() -> impl Strategy<Value = String> {
        prop_oneof![
            2 => Just("/".to_string()),
            3 => "/media/[a-z]{1,8}",
            1 => Just("/boot/efi".to_string()),
        ]
    }

    /// Generate an arbitrary scanned device record
    pub fn device_record() -> impl Strategy<Value = DeviceRecord> {
        (
            "sd[a-h]",
            0u64..(256 * GIB),
            bus_class(),
            any::<bool>(),
            proptest::collection::vec(proptest::collection::vec(mount_point(), 0..2), 0..3),
        )
            .prop_map(|(name, size, bus, removable, partition_mounts)| {
                let path = format!("/dev/{name}");
                let partitions = partition_mounts
                    .into_iter()
                    .enumerate()
                    .map(|(i, mounts)| PartitionInfo {
                        path: format!("{path}{}", i + 1),
                        size_bytes: size / 4,
                        fstype: Some("ext4".to_string()),
                        label: None,
                        mount_points: mounts,
                    })
                    .collect();
                DeviceRecord::new(path, size, bus, removable).with_partitions(partitions)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::generators::*;
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_fake_unmount_clears_mounts() {
        let platform = FakePlatform::new(vec![usb_stick("/dev/sdb", 64 * GIB, &["/media/a"])]);
        assert!(platform.open_exclusive("/dev/sdb").is_err());

        platform.unmount("/media/a").unwrap();
        let rescanned = platform.scan().unwrap();
        assert!(!rescanned[0].is_mounted());
        assert!(platform.open_exclusive("/dev/sdb").is_ok());
    }

    #[test]
    fn test_fake_busy_mount() {
        let platform = FakePlatform::new(vec![usb_stick("/dev/sdb", 64 * GIB, &["/media/a"])]);
        platform.mark_busy("/media/a");
        assert!(matches!(
            platform.unmount("/media/a"),
            Err(PlatformError::Busy { .. })
        ));
    }

    #[test]
    fn test_bootable_image_signature() {
        let image = bootable_image(1024);
        assert_eq!(&image[510..512], &[0x55, 0xAA]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn test_sha256_hash_generator(hash in sha256_hash()) {
            prop_assert_eq!(hash.len(), 64);
            prop_assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        }

        #[test]
        fn test_release_version_generator(version in release_version()) {
            prop_assert!(version.split('.').all(|p| p.parse::<u32>().is_ok()));
        }
    }
}
