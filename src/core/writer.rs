//! Raw image writer
//!
//! Streams a verified image onto a whole device. Every step before the first
//! byte is written is a gate: host-wide device lock, boot signature, size,
//! device identity, suitability, unmount, exclusive open. After the stream the
//! device is synced and a bounded read-back confirms the boot region and the
//! end of the image landed.
//!
//! Cancellation is only observed between chunks. A cancelled job syncs what it
//! already wrote and reports [`WriteStatus::Cancelled`]; it is never resumed.

use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::defaults;
use crate::core::acquire::VerifiedImage;
use crate::core::device::DeviceRecord;
use crate::core::validator::DeviceValidator;
use crate::error::{PlatformError, ProvisionError};
use crate::infra::lock::{device_lock_name, FileLock};
use crate::infra::platform::{BlockPlatform, DeviceHandle};

/// Bytes that must be readable to test every boot signature
pub const SIGNATURE_SPAN: usize = 32774;

const MBR_SIGNATURE: (usize, &[u8]) = (510, &[0x55, 0xAA]);
const GPT_SIGNATURE: (usize, &[u8]) = (512, b"EFI PART");
const ISO9660_SIGNATURE: (usize, &[u8]) = (32769, b"CD001");

/// Whether `head` (the first bytes of an image or device) is bootable
pub fn has_boot_signature(head: &[u8]) -> bool {
    [MBR_SIGNATURE, GPT_SIGNATURE, ISO9660_SIGNATURE]
        .iter()
        .any(|(offset, magic)| head.get(*offset..offset + magic.len()) == Some(*magic))
}

/// Lifecycle of a write job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Pending,
    Writing,
    Verifying,
    Complete,
    Cancelled,
    Failed,
}

impl fmt::Display for WriteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Writing => "writing",
            Self::Verifying => "verifying",
            Self::Complete => "complete",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        })
    }
}

/// Receives write progress
pub trait WriteProgress: Send + Sync {
    /// Called after every chunk
    fn on_chunk(&self, bytes_written: u64, total_bytes: u64);

    /// Called on every status change
    fn on_status(&self, _status: WriteStatus) {}
}

impl<F> WriteProgress for F
where
    F: Fn(u64, u64) + Send + Sync,
{
    fn on_chunk(&self, bytes_written: u64, total_bytes: u64) {
        self(bytes_written, total_bytes);
    }
}

/// Chunking and durability settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteSettings {
    pub block_size: usize,
    pub sync_interval_bytes: u64,
}

impl Default for WriteSettings {
    fn default() -> Self {
        Self {
            block_size: defaults::WRITE_BLOCK_SIZE,
            sync_interval_bytes: defaults::SYNC_INTERVAL_BYTES,
        }
    }
}

/// One image onto one device
#[derive(Debug)]
pub struct WriteJob {
    source: VerifiedImage,
    device: DeviceRecord,
    bytes_written: u64,
    status: WriteStatus,
}

impl WriteJob {
    /// Job writing `source` onto the confirmed `device`
    pub fn new(source: VerifiedImage, device: DeviceRecord) -> Self {
        Self {
            source,
            device,
            bytes_written: 0,
            status: WriteStatus::Pending,
        }
    }

    pub fn source(&self) -> &VerifiedImage {
        &self.source
    }

    pub fn device(&self) -> &DeviceRecord {
        &self.device
    }

    pub fn status(&self) -> WriteStatus {
        self.status
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

/// Terminal report of a write job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteResult {
    pub device: String,
    pub status: WriteStatus,
    /// Bytes handed to the device
    pub bytes_written: u64,
    /// Bytes known durable after the last sync
    pub flushed_bytes: u64,
    pub total_bytes: u64,
}

/// Writes verified images to block devices
pub struct DeviceWriter {
    platform: Arc<dyn BlockPlatform>,
    validator: DeviceValidator,
    locks_dir: PathBuf,
    settings: WriteSettings,
}

impl DeviceWriter {
    /// Writer taking device locks under `locks_dir`
    pub fn new(
        platform: Arc<dyn BlockPlatform>,
        validator: DeviceValidator,
        locks_dir: PathBuf,
    ) -> Self {
        Self {
            platform,
            validator,
            locks_dir,
            settings: WriteSettings::default(),
        }
    }

    #[must_use]
    pub fn with_settings(mut self, settings: WriteSettings) -> Self {
        self.settings = WriteSettings {
            block_size: settings.block_size.max(512),
            sync_interval_bytes: settings.sync_interval_bytes.max(1),
        };
        self
    }

    /// Run `job` to a terminal state
    ///
    /// Blocking; call from `spawn_blocking` inside async code. Errors raised
    /// before the stream starts leave the device untouched.
    pub fn write(
        &self,
        mut job: WriteJob,
        progress: &dyn WriteProgress,
        cancel: &CancellationToken,
    ) -> Result<WriteResult, ProvisionError> {
        let device = job.device.path().to_string();
        let lock_path = self.locks_dir.join(device_lock_name(&device));
        let _lock = FileLock::try_acquire(&lock_path, &device)?;

        let mut source = self.open_source(&job)?;
        let total = job.source.size_bytes();
        if total > job.device.size_bytes() {
            return Err(ProvisionError::ImageTooLarge {
                image: job.source.image().to_string(),
                device,
                image_bytes: total,
                device_bytes: job.device.size_bytes(),
            });
        }

        let current = self.revalidate(&job.device)?;
        self.unmount_all(&current)?;

        let mut handle = self
            .platform
            .open_exclusive(&device)
            .map_err(|e| ProvisionError::from_platform(&device, e))?;

        if cancel.is_cancelled() {
            return Ok(Self::finish(&mut job, progress, WriteStatus::Cancelled, 0, total));
        }

        Self::set_status(&mut job, progress, WriteStatus::Writing);
        tracing::info!(
            device = %device,
            image = job.source.image(),
            bytes = total,
            "Writing image"
        );

        let streamed = self.stream(&mut job, &mut source, handle.as_mut(), progress, cancel);
        let flushed = match streamed {
            Ok(Some(flushed)) => {
                tracing::warn!(device = %device, bytes = job.bytes_written, "Write cancelled");
                return Ok(Self::finish(&mut job, progress, WriteStatus::Cancelled, flushed, total));
            }
            Ok(None) => total,
            Err(e) => {
                job.status = WriteStatus::Failed;
                progress.on_status(WriteStatus::Failed);
                return Err(e);
            }
        };

        Self::set_status(&mut job, progress, WriteStatus::Verifying);
        if let Err(reason) = verify(&mut source, handle.as_mut(), total) {
            job.status = WriteStatus::Failed;
            progress.on_status(WriteStatus::Failed);
            return Err(ProvisionError::WriteIncomplete { device, reason });
        }

        tracing::info!(device = %device, bytes = total, "Image written and verified");
        Ok(Self::finish(&mut job, progress, WriteStatus::Complete, flushed, total))
    }

    fn open_source(&self, job: &WriteJob) -> Result<File, ProvisionError> {
        let path = job.source.path();
        let io_error = |e: std::io::Error| ProvisionError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        };
        let mut file = File::open(path).map_err(io_error)?;
        let mut head = vec![0u8; SIGNATURE_SPAN];
        let len = read_full(&mut file, &mut head).map_err(io_error)?;
        if !has_boot_signature(&head[..len]) {
            return Err(ProvisionError::NotBootable {
                image: job.source.image().to_string(),
            });
        }
        file.seek(SeekFrom::Start(0)).map_err(io_error)?;
        Ok(file)
    }

    /// Fresh record for the confirmed device, which must be the same disk and still suitable
    fn revalidate(&self, confirmed: &DeviceRecord) -> Result<DeviceRecord, ProvisionError> {
        let path = confirmed.path();
        let records = self
            .platform
            .scan()
            .map_err(|e| ProvisionError::ScanUnavailable {
                reason: e.to_string(),
            })?;
        let current = records
            .iter()
            .find(|r| r.path() == path)
            .ok_or_else(|| ProvisionError::DeviceChanged {
                device: path.to_string(),
                reason: "device is no longer present".to_string(),
            })?;
        if let Some(reason) = confirmed.identity_mismatch(current) {
            return Err(ProvisionError::DeviceChanged {
                device: path.to_string(),
                reason,
            });
        }

        let boot = self.validator.boot_device(&records);
        let assessed = self.validator.assess(current, boot.as_deref());
        if !assessed.is_suitable() {
            return Err(ProvisionError::ValidationFailed {
                device: path.to_string(),
                reason: assessed.suitability().reason().to_string(),
            });
        }
        Ok(assessed)
    }

    fn unmount_all(&self, device: &DeviceRecord) -> Result<(), ProvisionError> {
        for mount_point in device.mount_points() {
            tracing::debug!(device = device.path(), mount_point = %mount_point, "Unmounting");
            self.platform.unmount(mount_point).map_err(|e| match e {
                PlatformError::PermissionDenied { .. } => {
                    ProvisionError::from_platform(device.path(), e)
                }
                other => {
                    tracing::debug!(error = %other, "umount failed");
                    ProvisionError::DeviceBusy {
                        device: device.path().to_string(),
                        reason: format!("{mount_point} could not be unmounted"),
                    }
                }
            })?;
        }
        Ok(())
    }

    /// Stream the image; `Some(flushed)` when cancelled, `None` when complete
    fn stream(
        &self,
        job: &mut WriteJob,
        source: &mut File,
        handle: &mut dyn DeviceHandle,
        progress: &dyn WriteProgress,
        cancel: &CancellationToken,
    ) -> Result<Option<u64>, ProvisionError> {
        let device = job.device.path().to_string();
        let total = job.source.size_bytes();
        let mut buf = vec![0u8; self.settings.block_size];
        let mut flushed = 0u64;

        let write_failed = |bytes_written: u64, reason: String| ProvisionError::WriteFailed {
            device: device.clone(),
            bytes_written,
            reason,
        };

        loop {
            if cancel.is_cancelled() {
                if job.bytes_written > flushed {
                    handle
                        .sync()
                        .map_err(|e| write_failed(job.bytes_written, e.to_string()))?;
                    flushed = job.bytes_written;
                }
                return Ok(Some(flushed));
            }

            let n = read_full(source, &mut buf).map_err(|e| ProvisionError::Io {
                path: job.source.path().to_path_buf(),
                error: e.to_string(),
            })?;
            if n == 0 {
                break;
            }

            handle
                .write_chunk(job.bytes_written, &buf[..n])
                .map_err(|e| write_failed(job.bytes_written, e.to_string()))?;
            job.bytes_written += n as u64;

            if job.bytes_written - flushed >= self.settings.sync_interval_bytes {
                handle
                    .sync()
                    .map_err(|e| write_failed(job.bytes_written, e.to_string()))?;
                flushed = job.bytes_written;
                tracing::debug!(device = %device, flushed, "Synced");
            }
            progress.on_chunk(job.bytes_written, total);
        }

        handle
            .sync()
            .map_err(|e| write_failed(job.bytes_written, e.to_string()))?;
        Ok(None)
    }

    fn set_status(job: &mut WriteJob, progress: &dyn WriteProgress, status: WriteStatus) {
        job.status = status;
        progress.on_status(status);
    }

    fn finish(
        job: &mut WriteJob,
        progress: &dyn WriteProgress,
        status: WriteStatus,
        flushed_bytes: u64,
        total_bytes: u64,
    ) -> WriteResult {
        Self::set_status(job, progress, status);
        WriteResult {
            device: job.device.path().to_string(),
            status,
            bytes_written: job.bytes_written,
            flushed_bytes,
            total_bytes,
        }
    }
}

/// Compare the head and tail of the written span with the source
fn verify(source: &mut File, handle: &mut dyn DeviceHandle, total: u64) -> Result<(), String> {
    let head_len = defaults::VERIFY_HEAD_BYTES.min(total);
    let tail_start = total.saturating_sub(defaults::VERIFY_TAIL_BYTES).max(head_len);

    let expected_head = read_source(source, 0, head_len)?;
    let actual_head = handle
        .read_range(0, expected_head.len())
        .map_err(|e| format!("could not read back the device: {e}"))?;
    if !has_boot_signature(&actual_head) {
        return Err("no boot signature on the device after writing".to_string());
    }
    if actual_head != expected_head {
        return Err("boot region on the device differs from the image".to_string());
    }

    if tail_start < total {
        let expected_tail = read_source(source, tail_start, total - tail_start)?;
        let actual_tail = handle
            .read_range(tail_start, expected_tail.len())
            .map_err(|e| format!("could not read back the device: {e}"))?;
        if actual_tail != expected_tail {
            return Err("end of the image on the device differs from the image".to_string());
        }
    }
    Ok(())
}

fn read_source(source: &mut File, offset: u64, len: u64) -> Result<Vec<u8>, String> {
    let reread = |e: std::io::Error| format!("could not re-read the image: {e}");
    let mut buf = vec![0u8; usize::try_from(len).map_err(|e| e.to_string())?];
    source.seek(SeekFrom::Start(offset)).map_err(reread)?;
    let n = read_full(source, &mut buf).map_err(reread)?;
    buf.truncate(n);
    Ok(buf)
}

/// Fill `buf` unless EOF comes first; returns bytes read
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
