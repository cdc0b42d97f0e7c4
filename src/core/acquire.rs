//! Image acquisition and the content-addressed image cache
//!
//! Images are stored under the cache directory keyed by their SHA-256 digest:
//!
//! ```text
//! images/<digest>.img        verified image
//! images/<digest>.img.part   partial download, resumed with HTTP ranges
//! images/<digest>.meta.json  sidecar: url, size, state, timestamps
//! images/<digest>.lock       flock serializing acquisitions of one digest
//! ```
//!
//! An entry only becomes [`VerificationState::Verified`] after the digest of
//! the complete file equals the pinned digest. Only verified entries convert
//! into a [`VerifiedImage`], the single type the writer accepts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use crate::config::defaults;
use crate::core::catalog::{ImageDescriptor, Sha256Digest};
use crate::error::{DownloadError, ProvisionError};
use crate::infra::download::{DownloadManager, ProgressCallback};
use crate::infra::filesystem;
use crate::infra::lock::FileLock;

const IMAGE_EXT: &str = "img";
const PART_EXT: &str = "img.part";
const META_EXT: &str = "meta.json";
const LOCK_EXT: &str = "lock";

/// Verification state of a cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationState {
    Unverified,
    Verified,
    Corrupt,
}

impl fmt::Display for VerificationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unverified => "unverified",
            Self::Verified => "verified",
            Self::Corrupt => "corrupt",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheMeta {
    digest: Sha256Digest,
    image: String,
    url: String,
    size_bytes: u64,
    state: VerificationState,
    created_at: DateTime<Utc>,
    verified_at: Option<DateTime<Utc>>,
}

/// A cached image and what is known about it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    path: PathBuf,
    digest: Sha256Digest,
    image: String,
    size_bytes: u64,
    state: VerificationState,
    verified_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    /// Local image path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Digest the entry is keyed by
    pub fn digest(&self) -> &Sha256Digest {
        &self.digest
    }

    /// Image identifier from the catalog
    pub fn image(&self) -> &str {
        &self.image
    }

    /// Size on disk in bytes
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Verification state
    pub fn state(&self) -> VerificationState {
        self.state
    }

    /// When the digest was last confirmed
    pub fn verified_at(&self) -> Option<DateTime<Utc>> {
        self.verified_at
    }

    /// Convert into the writer's input; refused unless verified
    pub fn into_verified(self) -> Result<VerifiedImage, ProvisionError> {
        if self.state == VerificationState::Verified {
            Ok(VerifiedImage {
                path: self.path,
                digest: self.digest,
                image: self.image,
                size_bytes: self.size_bytes,
            })
        } else {
            Err(ProvisionError::IntegrityMismatch {
                image: self.image,
                expected: self.digest.to_string(),
                actual: format!("({} cache entry)", self.state),
                attempts: 0,
            })
        }
    }
}

/// An image whose digest has been confirmed
///
/// Only [`CacheEntry::into_verified`] creates one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedImage {
    path: PathBuf,
    digest: Sha256Digest,
    image: String,
    size_bytes: u64,
}

impl VerifiedImage {
    /// Local image path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Confirmed digest
    pub fn digest(&self) -> &Sha256Digest {
        &self.digest
    }

    /// Image identifier from the catalog
    pub fn image(&self) -> &str {
        &self.image
    }

    /// Size in bytes
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    #[cfg(test)]
    pub(crate) fn for_tests(path: &Path, image: &str) -> Self {
        let size_bytes = std::fs::metadata(path).map_or(0, |m| m.len());
        Self {
            path: path.to_path_buf(),
            digest: Sha256Digest::parse(&"0".repeat(64)).expect("zero digest is valid hex"),
            image: image.to_string(),
            size_bytes,
        }
    }
}

/// Content-addressed image store
#[derive(Debug, Clone)]
pub struct ImageCache {
    dir: PathBuf,
}

impl ImageCache {
    /// Cache rooted at `dir`
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Cache directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file(&self, digest: &Sha256Digest, ext: &str) -> PathBuf {
        self.dir.join(format!("{digest}.{ext}"))
    }

    /// Path of the verified image for `digest`
    pub fn image_path(&self, digest: &Sha256Digest) -> PathBuf {
        self.file(digest, IMAGE_EXT)
    }

    fn part_path(&self, digest: &Sha256Digest) -> PathBuf {
        self.file(digest, PART_EXT)
    }

    fn meta_path(&self, digest: &Sha256Digest) -> PathBuf {
        self.file(digest, META_EXT)
    }

    fn lock_path(&self, digest: &Sha256Digest) -> PathBuf {
        self.file(digest, LOCK_EXT)
    }

    fn read_meta(&self, digest: &Sha256Digest) -> Option<CacheMeta> {
        let content = filesystem::read_file(&self.meta_path(digest)).ok()?;
        serde_json::from_str(&content)
            .map_err(|e| tracing::warn!(%digest, error = %e, "Ignoring unreadable cache sidecar"))
            .ok()
    }

    fn write_meta(&self, meta: &CacheMeta) -> Result<(), ProvisionError> {
        let bytes = serde_json::to_vec_pretty(meta)
            .map_err(|e| ProvisionError::Internal(format!("cache sidecar: {e}")))?;
        filesystem::write_atomic(&self.meta_path(&meta.digest), &bytes)?;
        Ok(())
    }

    fn entry_from(&self, meta: &CacheMeta) -> CacheEntry {
        CacheEntry {
            path: self.image_path(&meta.digest),
            digest: meta.digest.clone(),
            image: meta.image.clone(),
            size_bytes: meta.size_bytes,
            state: meta.state,
            verified_at: meta.verified_at,
        }
    }

    /// Entry for `digest` if a complete image is present
    pub fn lookup(&self, digest: &Sha256Digest) -> Option<CacheEntry> {
        let meta = self.read_meta(digest)?;
        let on_disk = std::fs::metadata(self.image_path(digest)).ok()?;
        if on_disk.len() != meta.size_bytes {
            tracing::warn!(%digest, "Cached image size differs from its sidecar");
            return None;
        }
        Some(self.entry_from(&meta))
    }

    /// All entries with a sidecar, sorted by image name
    pub fn list(&self) -> Vec<CacheEntry> {
        let mut entries: Vec<CacheEntry> = walkdir::WalkDir::new(&self.dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(Result::ok)
            .filter_map(|e| {
                let name = e.file_name().to_str()?.to_string();
                let digest = Sha256Digest::parse(name.strip_suffix(&format!(".{META_EXT}"))?)?;
                let meta = self.read_meta(&digest)?;
                Some(self.entry_from(&meta))
            })
            .collect();
        entries.sort_by(|a, b| a.image.cmp(&b.image));
        entries
    }

    /// Recompute the digest of a cached image
    ///
    /// A mismatch marks the entry corrupt and deletes the image file. Waits
    /// for any acquisition of the same digest to finish first.
    pub fn reverify(&self, digest: &Sha256Digest) -> Result<CacheEntry, ProvisionError> {
        let _lock = FileLock::acquire(&self.lock_path(digest))?;
        self.reverify_locked(digest)
    }

    /// [`Self::reverify`] for a caller already holding the digest lock
    fn reverify_locked(&self, digest: &Sha256Digest) -> Result<CacheEntry, ProvisionError> {
        let mut meta = self
            .read_meta(digest)
            .ok_or_else(|| ProvisionError::ImageNotFound {
                request: format!("cached image {digest}"),
            })?;
        let path = self.image_path(digest);
        let actual = filesystem::sha256_file(&path)?;

        if digest.matches(&actual) {
            meta.state = VerificationState::Verified;
            meta.verified_at = Some(Utc::now());
        } else {
            tracing::warn!(
                image = %meta.image,
                expected = %digest,
                %actual,
                "Cached image is corrupt"
            );
            meta.state = VerificationState::Corrupt;
            meta.verified_at = None;
            let _ = std::fs::remove_file(&path);
        }
        self.write_meta(&meta)?;
        Ok(self.entry_from(&meta))
    }

    /// Remove every cached image, partial download and sidecar
    ///
    /// Lock files stay. Files of a digest whose lock is held by a running
    /// acquisition are skipped and counted in [`CleanSummary::skipped`].
    pub fn clean(&self) -> Result<CleanSummary, ProvisionError> {
        let mut summary = CleanSummary::default();
        // Held until every file of the digest is gone; `None` means in use
        let mut locks: HashMap<Sha256Digest, Option<FileLock>> = HashMap::new();
        for entry in walkdir::WalkDir::new(&self.dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
        {
            let is_lock = entry
                .path()
                .extension()
                .is_some_and(|ext| ext == LOCK_EXT);
            if is_lock {
                continue;
            }
            let owner = entry
                .file_name()
                .to_str()
                .and_then(|name| name.split('.').next())
                .and_then(Sha256Digest::parse);
            if let Some(digest) = owner {
                let lock = locks.entry(digest).or_insert_with_key(|digest| {
                    FileLock::try_acquire(&self.lock_path(digest), digest.as_str()).ok()
                });
                if lock.is_none() {
                    tracing::info!(file = %entry.path().display(), "Skipping cache file in use");
                    summary.skipped += 1;
                    continue;
                }
            }
            let size = entry.metadata().map_or(0, |m| m.len());
            std::fs::remove_file(entry.path()).map_err(|e| ProvisionError::Io {
                path: entry.path().to_path_buf(),
                error: e.to_string(),
            })?;
            summary.removed += 1;
            summary.freed_bytes += size;
        }
        Ok(summary)
    }
}

/// Result of [`ImageCache::clean`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanSummary {
    /// Files deleted
    pub removed: usize,
    /// Bytes freed by the deleted files
    pub freed_bytes: u64,
    /// Files left because an acquisition holds their digest
    pub skipped: usize,
}

/// Per-call acquisition options
#[derive(Debug, Clone, Copy, Default)]
pub struct AcquireOptions {
    /// Recompute the digest of an already verified entry before reuse
    pub reverify: bool,
}

/// Downloads and verifies images into the cache
#[derive(Debug, Clone)]
pub struct ImageAcquirer {
    cache: ImageCache,
    downloader: DownloadManager,
    max_attempts: u32,
}

impl ImageAcquirer {
    /// Create an acquirer over `cache`
    pub fn new(cache: ImageCache, downloader: DownloadManager) -> Self {
        Self {
            cache,
            downloader,
            max_attempts: defaults::MAX_ACQUIRE_ATTEMPTS,
        }
    }

    /// Override the integrity retry budget
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Underlying cache
    pub fn cache(&self) -> &ImageCache {
        &self.cache
    }

    /// Return a verified cache entry for `descriptor`, downloading if needed
    ///
    /// Concurrent calls for the same digest (in this or another process)
    /// serialize on the digest lock; the later caller reuses the entry the
    /// first one verified.
    pub async fn acquire(
        &self,
        descriptor: &ImageDescriptor,
        options: AcquireOptions,
        cancel: &CancellationToken,
        progress: Option<ProgressCallback>,
    ) -> Result<CacheEntry, ProvisionError> {
        let digest = &descriptor.digest;
        filesystem::create_dir_all(self.cache.dir())?;

        let lock_path = self.cache.lock_path(digest);
        let waiting = tokio::task::spawn_blocking(move || FileLock::acquire(&lock_path));
        let _lock = tokio::select! {
            () = cancel.cancelled() => {
                return Err(ProvisionError::Cancelled { stage: "image acquisition".to_string() });
            }
            joined = waiting => joined
                .map_err(|e| ProvisionError::Internal(format!("cache lock task: {e}")))??,
        };

        if let Some(entry) = self.reuse(descriptor, options).await? {
            return Ok(entry);
        }

        let mut last_actual = String::new();
        for attempt in 1..=self.max_attempts {
            if cancel.is_cancelled() {
                return Err(ProvisionError::Cancelled {
                    stage: "image acquisition".to_string(),
                });
            }
            tracing::info!(image = %descriptor, attempt, "Downloading image");
            match self.attempt(descriptor, cancel, progress.as_ref()).await? {
                Ok(entry) => return Ok(entry),
                Err(actual) => last_actual = actual,
            }
        }

        Err(ProvisionError::IntegrityMismatch {
            image: descriptor.id(),
            expected: digest.to_string(),
            actual: last_actual,
            attempts: self.max_attempts,
        })
    }

    /// Existing verified entry, re-hashed only when asked
    async fn reuse(
        &self,
        descriptor: &ImageDescriptor,
        options: AcquireOptions,
    ) -> Result<Option<CacheEntry>, ProvisionError> {
        let digest = &descriptor.digest;
        let Some(entry) = self.cache.lookup(digest) else {
            return Ok(None);
        };

        match entry.state() {
            VerificationState::Verified if !options.reverify => {
                tracing::info!(image = %descriptor, "Using cached image");
                Ok(Some(entry))
            }
            VerificationState::Verified => {
                let cache = self.cache.clone();
                let digest = digest.clone();
                let entry = tokio::task::spawn_blocking(move || cache.reverify_locked(&digest))
                    .await
                    .map_err(|e| ProvisionError::Internal(format!("reverify task: {e}")))??;
                Ok((entry.state() == VerificationState::Verified).then_some(entry))
            }
            VerificationState::Unverified | VerificationState::Corrupt => {
                let _ = std::fs::remove_file(self.cache.image_path(digest));
                Ok(None)
            }
        }
    }

    /// One download-and-verify pass
    ///
    /// The outer error aborts acquisition; the inner error is a digest
    /// mismatch carrying the computed digest, which consumes one attempt.
    async fn attempt(
        &self,
        descriptor: &ImageDescriptor,
        cancel: &CancellationToken,
        progress: Option<&ProgressCallback>,
    ) -> Result<Result<CacheEntry, String>, ProvisionError> {
        let digest = &descriptor.digest;
        let part = self.cache.part_path(digest);
        let mut meta = CacheMeta {
            digest: digest.clone(),
            image: descriptor.id(),
            url: descriptor.url.clone(),
            size_bytes: 0,
            state: VerificationState::Unverified,
            created_at: Utc::now(),
            verified_at: None,
        };
        self.cache.write_meta(&meta)?;

        let downloaded = self
            .downloader
            .download_resumable(&descriptor.url, &part, cancel, progress)
            .await
            .map_err(|e| match e {
                DownloadError::Cancelled { .. } => ProvisionError::Cancelled {
                    stage: "image download".to_string(),
                },
                other => ProvisionError::DownloadFailed {
                    image: descriptor.id(),
                    reason: other.to_string(),
                },
            })?;

        let hash_path = part.clone();
        let actual = tokio::task::spawn_blocking(move || filesystem::sha256_file(&hash_path))
            .await
            .map_err(|e| ProvisionError::Internal(format!("hash task: {e}")))??;

        if !digest.matches(&actual) {
            tracing::warn!(
                image = %descriptor,
                expected = %digest,
                %actual,
                "Downloaded image failed verification"
            );
            let _ = tokio::fs::remove_file(&part).await;
            meta.state = VerificationState::Corrupt;
            self.cache.write_meta(&meta)?;
            return Ok(Err(actual));
        }

        let image_path = self.cache.image_path(digest);
        tokio::fs::rename(&part, &image_path)
            .await
            .map_err(|e| ProvisionError::Io {
                path: image_path.clone(),
                error: e.to_string(),
            })?;

        meta.size_bytes = downloaded.size;
        meta.state = VerificationState::Verified;
        meta.verified_at = Some(Utc::now());
        self.cache.write_meta(&meta)?;
        tracing::info!(image = %descriptor, bytes = downloaded.size, "Image verified");
        Ok(Ok(self.cache.entry_from(&meta)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::filesystem::compute_checksum;
    use tempfile::TempDir;

    fn seed_entry(cache: &ImageCache, content: &[u8], state: VerificationState) -> Sha256Digest {
        let digest = Sha256Digest::parse(&compute_checksum(content)).unwrap();
        std::fs::create_dir_all(cache.dir()).unwrap();
        std::fs::write(cache.image_path(&digest), content).unwrap();
        cache
            .write_meta(&CacheMeta {
                digest: digest.clone(),
                image: "ubuntu-24.04.2-server-amd64".to_string(),
                url: "https://example.invalid/image.iso".to_string(),
                size_bytes: content.len() as u64,
                state,
                created_at: Utc::now(),
                verified_at: None,
            })
            .unwrap();
        digest
    }

    #[test]
    fn test_lookup_and_list() {
        let temp = TempDir::new().unwrap();
        let cache = ImageCache::new(temp.path().join("images"));
        let digest = seed_entry(&cache, b"image bytes", VerificationState::Verified);

        let entry = cache.lookup(&digest).unwrap();
        assert_eq!(entry.state(), VerificationState::Verified);
        assert_eq!(entry.size_bytes(), 11);
        assert_eq!(cache.list().len(), 1);
    }

    #[test]
    fn test_lookup_ignores_truncated_image() {
        let temp = TempDir::new().unwrap();
        let cache = ImageCache::new(temp.path().to_path_buf());
        let digest = seed_entry(&cache, b"image bytes", VerificationState::Verified);
        std::fs::write(cache.image_path(&digest), b"image").unwrap();

        assert!(cache.lookup(&digest).is_none());
    }

    #[test]
    fn test_reverify_detects_corruption() {
        let temp = TempDir::new().unwrap();
        let cache = ImageCache::new(temp.path().to_path_buf());
        let digest = seed_entry(&cache, b"image bytes", VerificationState::Verified);
        std::fs::write(cache.image_path(&digest), b"IMAGE BYTES").unwrap();

        let entry = cache.reverify(&digest).unwrap();

        assert_eq!(entry.state(), VerificationState::Corrupt);
        assert!(!cache.image_path(&digest).exists());
        assert!(entry.into_verified().is_err());
    }

    #[test]
    fn test_reverify_confirms_good_entry() {
        let temp = TempDir::new().unwrap();
        let cache = ImageCache::new(temp.path().to_path_buf());
        let digest = seed_entry(&cache, b"image bytes", VerificationState::Unverified);

        let entry = cache.reverify(&digest).unwrap();
        assert_eq!(entry.state(), VerificationState::Verified);
        assert!(entry.verified_at().is_some());
        assert!(entry.into_verified().is_ok());
    }

    #[test]
    fn test_unverified_entry_is_not_writable() {
        let temp = TempDir::new().unwrap();
        let cache = ImageCache::new(temp.path().to_path_buf());
        let digest = seed_entry(&cache, b"image bytes", VerificationState::Unverified);

        let err = cache.lookup(&digest).unwrap().into_verified().unwrap_err();
        assert!(matches!(err, ProvisionError::IntegrityMismatch { .. }));
    }

    #[test]
    fn test_clean_keeps_lock_files() {
        let temp = TempDir::new().unwrap();
        let cache = ImageCache::new(temp.path().to_path_buf());
        let digest = seed_entry(&cache, b"image bytes", VerificationState::Verified);
        std::fs::write(cache.lock_path(&digest), b"").unwrap();

        let summary = cache.clean().unwrap();

        assert_eq!(summary.removed, 2);
        assert!(summary.freed_bytes >= 11);
        assert_eq!(summary.skipped, 0);
        assert!(cache.list().is_empty());
        assert!(cache.lock_path(&digest).exists());
    }

    #[test]
    fn test_clean_skips_image_being_acquired() {
        let temp = TempDir::new().unwrap();
        let cache = ImageCache::new(temp.path().to_path_buf());
        let busy = seed_entry(&cache, b"image bytes", VerificationState::Verified);
        let idle = seed_entry(&cache, b"other bytes", VerificationState::Verified);
        let _held = FileLock::acquire(&cache.lock_path(&busy)).unwrap();

        let summary = cache.clean().unwrap();

        assert_eq!(summary.removed, 2);
        assert_eq!(summary.skipped, 2);
        assert!(cache.lookup(&busy).is_some());
        assert!(cache.lookup(&idle).is_none());
    }

    #[test]
    fn test_reverify_waits_for_digest_lock() {
        let temp = TempDir::new().unwrap();
        let cache = ImageCache::new(temp.path().to_path_buf());
        let digest = seed_entry(&cache, b"image bytes", VerificationState::Unverified);
        let held = FileLock::acquire(&cache.lock_path(&digest)).unwrap();

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let worker = {
            let cache = cache.clone();
            let digest = digest.clone();
            std::thread::spawn(move || {
                let entry = cache.reverify(&digest);
                let _ = done_tx.send(());
                entry
            })
        };

        assert!(done_rx
            .recv_timeout(std::time::Duration::from_millis(200))
            .is_err());
        drop(held);
        let entry = worker.join().unwrap().unwrap();
        assert_eq!(entry.state(), VerificationState::Verified);
    }
}
