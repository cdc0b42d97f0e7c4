//! Platform adapter for block devices
//!
//! Everything that touches real hardware goes through [`BlockPlatform`]:
//! enumeration, unmounting, exclusive raw access, partition table rescans,
//! mounting and filesystem relabelling. Core logic only sees this trait, so
//! tests drive it with an in-memory fake.

mod linux;
pub mod lsblk;

pub use linux::LinuxPlatform;

use std::path::Path;

use crate::core::device::DeviceRecord;
use crate::core::relabel::LabelTool;
use crate::error::PlatformError;

/// Exclusive raw handle on a whole device
pub trait DeviceHandle: Send {
    /// Write `data` at byte `offset`
    fn write_chunk(&mut self, offset: u64, data: &[u8]) -> Result<(), PlatformError>;

    /// Read up to `len` bytes at `offset`; shorter only at end of device
    fn read_range(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, PlatformError>;

    /// Flush everything written so far to stable storage
    fn sync(&mut self) -> Result<(), PlatformError>;
}

/// Operating system operations on block devices
pub trait BlockPlatform: Send + Sync {
    /// Enumerate whole disks (no loop, ram or zram devices)
    fn scan(&self) -> Result<Vec<DeviceRecord>, PlatformError>;

    /// Unmount a single mount point
    fn unmount(&self, mount_point: &str) -> Result<(), PlatformError>;

    /// Open `device` for raw read/write, failing if anything else holds it
    fn open_exclusive(&self, device: &str) -> Result<Box<dyn DeviceHandle>, PlatformError>;

    /// Ask the kernel to re-read the partition table of `device`
    fn reread_partitions(&self, device: &str) -> Result<(), PlatformError>;

    /// Mount `partition` at `target`
    fn mount(&self, partition: &str, target: &Path) -> Result<(), PlatformError>;

    /// Set the filesystem label of `partition`
    fn set_label(&self, tool: LabelTool, partition: &str, label: &str)
        -> Result<(), PlatformError>;
}
