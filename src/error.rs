//! Error types for weirding
//!
//! Domain-specific error types using thiserror. Infrastructure errors are
//! converted into [`ProvisionError`] at the core boundary so that every
//! failure a user sees names the device or image involved in plain words.

use std::path::PathBuf;
use thiserror::Error;

/// Download errors
#[derive(Error, Debug)]
pub enum DownloadError {
    /// Network error
    #[error("Network error downloading '{url}': {error}")]
    NetworkError { url: String, error: String },

    /// Server rejected the request
    #[error("Server returned HTTP {status} for '{url}'")]
    HttpStatus { url: String, status: u16 },

    /// IO error
    #[error("IO error for '{path}': {error}")]
    IoError { path: PathBuf, error: String },

    /// Download was cancelled between chunks
    #[error("Download of '{url}' was cancelled")]
    Cancelled { url: String },
}

/// Filesystem errors
#[derive(Error, Debug)]
pub enum FilesystemError {
    /// Failed to create directory
    #[error("Failed to create directory '{path}': {error}")]
    CreateDir { path: PathBuf, error: String },

    /// Failed to write file
    #[error("Failed to write file '{path}': {error}")]
    WriteFile { path: PathBuf, error: String },

    /// Failed to read file
    #[error("Failed to read file '{path}': {error}")]
    ReadFile { path: PathBuf, error: String },
}

/// Advisory lock errors
#[derive(Error, Debug)]
pub enum LockError {
    /// Another holder owns the lock
    #[error("'{resource}' is locked by another weirding process")]
    Contended { resource: String },

    /// Lock file could not be opened or locked
    #[error("Failed to lock '{path}': {error}")]
    Io { path: PathBuf, error: String },
}

/// Errors raised by the platform adapter (block devices and mount tools)
#[derive(Error, Debug)]
pub enum PlatformError {
    /// A required system tool is not installed
    #[error("Required tool '{tool}' is not installed or not in PATH")]
    ToolMissing { tool: String },

    /// A system tool ran but failed
    #[error("'{tool}' failed: {message}")]
    ToolFailed { tool: String, message: String },

    /// Tool output could not be understood
    #[error("Could not parse output of '{tool}': {error}")]
    Parse { tool: String, error: String },

    /// Device or mount point is in use
    #[error("'{path}' is busy")]
    Busy { path: String },

    /// Insufficient privileges
    #[error("Permission denied for '{path}'")]
    PermissionDenied { path: String },

    /// Device does not exist
    #[error("Device '{path}' not found")]
    NotFound { path: String },

    /// Generic I/O failure on a device or file
    #[error("I/O error on '{path}': {error}")]
    Io { path: String, error: String },
}

impl PlatformError {
    /// Classify a std I/O error raised while touching `path`
    pub fn from_io(path: &str, error: &std::io::Error) -> Self {
        match error.kind() {
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied {
                path: path.to_string(),
            },
            std::io::ErrorKind::NotFound => Self::NotFound {
                path: path.to_string(),
            },
            _ if error.raw_os_error() == Some(rustix::io::Errno::BUSY.raw_os_error()) => {
                Self::Busy {
                    path: path.to_string(),
                }
            }
            _ => Self::Io {
                path: path.to_string(),
                error: error.to_string(),
            },
        }
    }
}

/// Top-level provisioning error type
///
/// The variants follow the provisioning taxonomy: everything raised before
/// the raw write starts is non-destructive, everything raised after is
/// terminal for that write job.
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// Device enumeration cannot run at all
    #[error("Cannot list storage devices: {reason}")]
    ScanUnavailable { reason: String },

    /// A device is not eligible for provisioning
    #[error("Device {device} cannot be used: {reason}")]
    ValidationFailed { device: String, reason: String },

    /// No device passed validation
    #[error("No suitable removable device found ({scanned} device(s) scanned)")]
    NoSuitableDevice { scanned: usize },

    /// The selected device no longer matches what was confirmed
    #[error("Device {device} changed since it was selected: {reason}")]
    DeviceChanged { device: String, reason: String },

    /// The catalog entry has no pinned digest
    #[error("Catalog entry for {image} has no pinned SHA-256 digest; refusing to use it")]
    CatalogIncomplete { image: String },

    /// The catalog could not be loaded and no fallback exists
    #[error("Image catalog is unavailable: {reason}")]
    CatalogUnavailable { reason: String },

    /// No catalog entry matches the request
    #[error("No image found for {request}")]
    ImageNotFound { request: String },

    /// Downloaded bytes never matched the pinned digest
    #[error(
        "Image {image} failed verification after {attempts} attempt(s): \
         expected SHA-256 {expected}, got {actual}"
    )]
    IntegrityMismatch {
        image: String,
        expected: String,
        actual: String,
        attempts: u32,
    },

    /// Image could not be downloaded
    #[error("Could not download image {image}: {reason}")]
    DownloadFailed { image: String, reason: String },

    /// Device or one of its mounts is in use
    #[error("Device {device} is busy: {reason}")]
    DeviceBusy { device: String, reason: String },

    /// Insufficient privileges
    #[error("Permission denied: {reason}")]
    PermissionDenied { reason: String },

    /// Source image carries no boot signature
    #[error("Image {image} is not bootable: no MBR, GPT or ISO 9660 signature found")]
    NotBootable { image: String },

    /// Image does not fit on the device
    #[error("Image {image} ({image_bytes} bytes) does not fit on {device} ({device_bytes} bytes)")]
    ImageTooLarge {
        image: String,
        device: String,
        image_bytes: u64,
        device_bytes: u64,
    },

    /// Read-back verification failed after the write
    #[error("Write to {device} is incomplete: {reason}. Re-run setup to write the device again")]
    WriteIncomplete { device: String, reason: String },

    /// I/O failed while streaming the image
    #[error("Writing to {device} failed after {bytes_written} bytes: {reason}")]
    WriteFailed {
        device: String,
        bytes_written: u64,
        reason: String,
    },

    /// Manifest could not be written (non-fatal to provisioning)
    #[error("Could not write module manifest to {device}: {reason}")]
    ManifestError { device: String, reason: String },

    /// The run was cancelled
    #[error("Provisioning cancelled during {stage}")]
    Cancelled { stage: String },

    /// Configuration problem
    #[error("Configuration error: {0}")]
    Config(String),

    /// Local I/O failure outside the device
    #[error("I/O error on '{path}': {error}")]
    Io { path: PathBuf, error: String },

    /// Illegal orchestrator state transition
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProvisionError {
    /// Whether the caller may retry after resolving the cause
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DeviceBusy { .. } | Self::DownloadFailed { .. } | Self::CatalogUnavailable { .. }
        )
    }

    /// Whether the error leaves the overall provisioning outcome intact
    pub fn is_non_fatal(&self) -> bool {
        matches!(self, Self::ManifestError { .. } | Self::ValidationFailed { .. })
    }

    /// Process exit code for this error class
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ValidationFailed { .. }
            | Self::NoSuitableDevice { .. }
            | Self::DeviceChanged { .. }
            | Self::ImageTooLarge { .. } => 2,
            Self::IntegrityMismatch { .. } | Self::NotBootable { .. } => 3,
            Self::CatalogIncomplete { .. }
            | Self::CatalogUnavailable { .. }
            | Self::ImageNotFound { .. }
            | Self::DownloadFailed { .. } => 4,
            Self::DeviceBusy { .. } => 5,
            Self::PermissionDenied { .. } => 6,
            Self::WriteIncomplete { .. } | Self::WriteFailed { .. } => 7,
            Self::Cancelled { .. } => 130,
            _ => 1,
        }
    }

    /// Map a platform failure on `device` into the provisioning taxonomy
    pub fn from_platform(device: &str, error: PlatformError) -> Self {
        match error {
            PlatformError::Busy { path } => Self::DeviceBusy {
                device: device.to_string(),
                reason: format!("{path} is in use by another process"),
            },
            PlatformError::PermissionDenied { path } => Self::PermissionDenied {
                reason: format!("cannot access {path}; run weirding as root"),
            },
            PlatformError::NotFound { path } => Self::DeviceChanged {
                device: device.to_string(),
                reason: format!("{path} is no longer present"),
            },
            PlatformError::ToolMissing { tool } => Self::ScanUnavailable {
                reason: format!("required tool '{tool}' is not installed"),
            },
            other => Self::Io {
                path: PathBuf::from(device),
                error: other.to_string(),
            },
        }
    }
}

impl From<LockError> for ProvisionError {
    fn from(error: LockError) -> Self {
        match error {
            LockError::Contended { resource } => Self::DeviceBusy {
                device: resource,
                reason: "another weirding run is using it".to_string(),
            },
            LockError::Io { path, error } => Self::Io { path, error },
        }
    }
}

impl From<FilesystemError> for ProvisionError {
    fn from(error: FilesystemError) -> Self {
        match error {
            FilesystemError::CreateDir { path, error }
            | FilesystemError::WriteFile { path, error }
            | FilesystemError::ReadFile { path, error } => Self::Io { path, error },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_device() {
        let err = ProvisionError::DeviceBusy {
            device: "/dev/sdb".to_string(),
            reason: "/media/usb is still mounted".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("/dev/sdb"));
        assert!(message.contains("/media/usb"));
    }

    #[test]
    fn test_exit_codes_are_non_zero() {
        let errors = vec![
            ProvisionError::ScanUnavailable {
                reason: "lsblk missing".to_string(),
            },
            ProvisionError::PermissionDenied {
                reason: "not root".to_string(),
            },
            ProvisionError::WriteIncomplete {
                device: "/dev/sdb".to_string(),
                reason: "signature mismatch".to_string(),
            },
            ProvisionError::Internal("bad".to_string()),
        ];
        for err in errors {
            assert_ne!(err.exit_code(), 0, "{err}");
        }
    }

    #[test]
    fn test_retryable_classification() {
        assert!(ProvisionError::DeviceBusy {
            device: "/dev/sdb".to_string(),
            reason: String::new(),
        }
        .is_retryable());
        assert!(!ProvisionError::WriteIncomplete {
            device: "/dev/sdb".to_string(),
            reason: String::new(),
        }
        .is_retryable());
        assert!(!ProvisionError::PermissionDenied {
            reason: String::new(),
        }
        .is_retryable());
    }

    #[test]
    fn test_platform_busy_maps_to_device_busy() {
        let err = ProvisionError::from_platform(
            "/dev/sdb",
            PlatformError::Busy {
                path: "/dev/sdb1".to_string(),
            },
        );
        assert!(matches!(err, ProvisionError::DeviceBusy { .. }));
    }

    #[test]
    fn test_lock_contention_maps_to_device_busy() {
        let err: ProvisionError = LockError::Contended {
            resource: "/dev/sdb".to_string(),
        }
        .into();
        assert!(matches!(
            err,
            ProvisionError::DeviceBusy { ref device, .. } if device == "/dev/sdb"
        ));
    }
}
