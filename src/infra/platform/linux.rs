//! Linux implementation of the platform adapter
//!
//! Enumeration uses `lsblk --json`, mount management shells out to
//! `mount`/`umount`, and raw access opens the device node with `O_EXCL`,
//! which the kernel refuses while any partition is mounted or claimed.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::Path;
use std::process::{Command, Output};

use super::lsblk::{parse_lsblk, LSBLK_COLUMNS};
use super::{BlockPlatform, DeviceHandle};
use crate::core::device::DeviceRecord;
use crate::core::relabel::LabelTool;
use crate::error::PlatformError;

/// Block device access through util-linux tools and device nodes
#[derive(Debug, Default, Clone)]
pub struct LinuxPlatform;

impl LinuxPlatform {
    /// Create the Linux platform adapter
    pub fn new() -> Self {
        Self
    }

    /// Run `tool` with `args`, failing if it is missing or exits non-zero
    fn run(tool: &str, args: &[&str]) -> Result<Output, PlatformError> {
        let program = which::which(tool).map_err(|_| PlatformError::ToolMissing {
            tool: tool.to_string(),
        })?;

        tracing::debug!(tool, ?args, "Running system tool");
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| PlatformError::ToolFailed {
                tool: tool.to_string(),
                message: e.to_string(),
            })?;

        if output.status.success() {
            Ok(output)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            tracing::debug!(tool, status = ?output.status.code(), %stderr, "System tool failed");
            Err(classify_failure(tool, args, output.status.code(), &stderr))
        }
    }
}

/// Map a failed tool run onto a [`PlatformError`]
///
/// Stderr only selects the variant. It never becomes part of the message.
fn classify_failure(tool: &str, args: &[&str], code: Option<i32>, stderr: &str) -> PlatformError {
    let target = args.last().copied().unwrap_or_default().to_string();
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("target is busy") || lower.contains("device is busy") {
        PlatformError::Busy { path: target }
    } else if lower.contains("permission denied") || lower.contains("must be superuser") {
        PlatformError::PermissionDenied { path: target }
    } else {
        let mut message = match code {
            Some(code) => format!("exited with status {code}"),
            None => "was terminated by a signal".to_string(),
        };
        if let Some(device) = args.iter().find(|a| a.starts_with("/dev/")) {
            message.push_str(&format!(" on {device}"));
        }
        PlatformError::ToolFailed {
            tool: tool.to_string(),
            message,
        }
    }
}

impl BlockPlatform for LinuxPlatform {
    fn scan(&self) -> Result<Vec<DeviceRecord>, PlatformError> {
        let output = Self::run("lsblk", &["--json", "--bytes", "--output", LSBLK_COLUMNS])?;
        parse_lsblk(&String::from_utf8_lossy(&output.stdout))
    }

    fn unmount(&self, mount_point: &str) -> Result<(), PlatformError> {
        Self::run("umount", &[mount_point]).map(|_| ())
    }

    fn open_exclusive(&self, device: &str) -> Result<Box<dyn DeviceHandle>, PlatformError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(rustix::fs::OFlags::EXCL.bits() as i32)
            .open(device)
            .map_err(|e| PlatformError::from_io(device, &e))?;
        tracing::debug!(device, "Opened device exclusively");
        Ok(Box::new(LinuxDevice {
            file,
            path: device.to_string(),
        }))
    }

    fn reread_partitions(&self, device: &str) -> Result<(), PlatformError> {
        match Self::run("blockdev", &["--rereadpt", device]) {
            Ok(_) => {}
            Err(PlatformError::ToolMissing { .. }) => {
                Self::run("partprobe", &[device])?;
            }
            Err(e) => return Err(e),
        }
        // udev creates the partition nodes asynchronously
        if let Err(e) = Self::run("udevadm", &["settle"]) {
            tracing::debug!(error = %e, "udevadm settle unavailable");
        }
        Ok(())
    }

    fn mount(&self, partition: &str, target: &Path) -> Result<(), PlatformError> {
        let target = target.to_string_lossy();
        Self::run("mount", &[partition, target.as_ref()]).map(|_| ())
    }

    fn set_label(
        &self,
        tool: LabelTool,
        partition: &str,
        label: &str,
    ) -> Result<(), PlatformError> {
        Self::run(tool.program(), &[partition, label]).map(|_| ())
    }
}

/// Raw handle on an exclusively opened device node
struct LinuxDevice {
    file: File,
    path: String,
}

impl DeviceHandle for LinuxDevice {
    fn write_chunk(&mut self, offset: u64, data: &[u8]) -> Result<(), PlatformError> {
        self.file
            .write_all_at(data, offset)
            .map_err(|e| PlatformError::from_io(&self.path, &e))
    }

    fn read_range(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, PlatformError> {
        let mut buffer = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let read = self
                .file
                .read_at(&mut buffer[filled..], offset + filled as u64)
                .map_err(|e| PlatformError::from_io(&self.path, &e))?;
            if read == 0 {
                break;
            }
            filled += read;
        }
        buffer.truncate(filled);
        Ok(buffer)
    }

    fn sync(&mut self) -> Result<(), PlatformError> {
        self.file
            .sync_all()
            .map_err(|e| PlatformError::from_io(&self.path, &e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_classify_busy_umount() {
        let err = classify_failure(
            "umount",
            &["/media/usb"],
            Some(32),
            "umount: /media/usb: target is busy.",
        );
        assert!(matches!(err, PlatformError::Busy { ref path } if path == "/media/usb"));
    }

    #[test]
    fn test_classify_permission() {
        let err = classify_failure(
            "mount",
            &["/dev/sdb1", "/mnt"],
            Some(1),
            "mount: only root can do that; must be superuser",
        );
        assert!(matches!(err, PlatformError::PermissionDenied { .. }));
    }

    #[test]
    fn test_classify_generic_failure() {
        let err = classify_failure("e2label", &["/dev/sdb1", "X"], Some(1), "");
        assert!(matches!(
            err,
            PlatformError::ToolFailed { ref message, .. }
                if message == "exited with status 1 on /dev/sdb1"
        ));
    }

    #[test]
    fn test_tool_stderr_stays_out_of_the_message() {
        let stderr =
            "lsblk: failed to access sysfs directory: /sys/dev/block: No such file or directory";
        let err = classify_failure("lsblk", &["--json", "--bytes"], Some(32), stderr);
        let message = err.to_string();
        assert_eq!(message, "'lsblk' failed: exited with status 32");
        assert!(!message.contains("sysfs"));
    }

    #[test]
    fn test_killed_tool() {
        let err = classify_failure("mount", &["/dev/sdb2", "/mnt/w"], None, "");
        assert_eq!(
            err.to_string(),
            "'mount' failed: was terminated by a signal on /dev/sdb2"
        );
    }

    #[test]
    fn test_missing_tool() {
        let err = LinuxPlatform::run("weirding-no-such-tool", &[]).unwrap_err();
        assert!(matches!(err, PlatformError::ToolMissing { .. }));
    }

    #[test]
    fn test_device_handle_on_regular_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("disk.img");
        std::fs::write(&path, vec![0u8; 8192]).unwrap();
        let path_str = path.to_string_lossy().to_string();

        let mut handle = LinuxPlatform::new().open_exclusive(&path_str).unwrap();
        handle.write_chunk(4096, b"weirding").unwrap();
        handle.sync().unwrap();

        assert_eq!(handle.read_range(4096, 8).unwrap(), b"weirding");
        assert_eq!(handle.read_range(8190, 16).unwrap().len(), 2);
    }

    #[test]
    fn test_open_missing_device() {
        let err = LinuxPlatform::new()
            .open_exclusive("/dev/weirding-missing")
            .err()
            .unwrap();
        assert!(matches!(err, PlatformError::NotFound { .. }));
    }
}
