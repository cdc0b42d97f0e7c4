//! Image catalog
//!
//! Resolves an OS family and optional version to an [`ImageDescriptor`] with a
//! pinned SHA-256 digest. Entries come from a live index (the Ubuntu release
//! mirror by default, or a JSON document), refreshed when the cached copy is
//! older than the TTL, or from a built-in table when no index is available. A
//! failed refresh falls back to the last-known-good copy. Entries without a
//! valid digest are never returned.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::releases::UbuntuReleases;
use crate::config::{defaults, urls};
use crate::error::{DownloadError, ProvisionError};
use crate::infra::download::DownloadManager;
use crate::infra::filesystem;

/// File holding the last-known-good index
const INDEX_CACHE_FILE: &str = "index.json";

/// Lower-case hex SHA-256 digest, validated on construction
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Sha256Digest(String);

impl Sha256Digest {
    /// Parse a 64-character hex digest (any case)
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        (trimmed.len() == 64 && trimmed.chars().all(|c| c.is_ascii_hexdigit()))
            .then(|| Self(trimmed.to_ascii_lowercase()))
    }

    /// Hex string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `actual` (hex, any case) equals this digest
    pub fn matches(&self, actual: &str) -> bool {
        self.0.eq_ignore_ascii_case(actual)
    }
}

impl TryFrom<String> for Sha256Digest {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("'{value}' is not a SHA-256 digest"))
    }
}

impl From<Sha256Digest> for String {
    fn from(digest: Sha256Digest) -> Self {
        digest.0
    }
}

impl fmt::Display for Sha256Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One raw catalog entry, as listed in the index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Display name
    #[serde(default)]
    pub name: String,
    /// OS family (e.g. `ubuntu`)
    pub os_family: String,
    /// Release version (e.g. `24.04.2`)
    pub version: String,
    /// Edition (e.g. `desktop`, `server`)
    #[serde(default = "default_variant")]
    pub variant: String,
    /// CPU architecture
    #[serde(default = "default_architecture")]
    pub architecture: String,
    /// Download URL
    pub url: String,
    /// Pinned digest; absent or malformed entries cannot be resolved
    #[serde(default)]
    pub sha256: Option<String>,
    /// Declared size in bytes
    #[serde(default)]
    pub size_bytes: u64,
    /// Capability tags (e.g. `ai_optimized`, `gpu:nvidia`)
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_variant() -> String {
    "desktop".to_string()
}

fn default_architecture() -> String {
    "amd64".to_string()
}

impl CatalogEntry {
    /// Stable identifier such as `ubuntu-24.04.2-server-amd64`
    pub fn id(&self) -> String {
        format!(
            "{}-{}-{}-{}",
            self.os_family, self.version, self.variant, self.architecture
        )
    }

    /// Whether the entry carries a usable digest
    pub fn is_pinned(&self) -> bool {
        self.sha256.as_deref().and_then(Sha256Digest::parse).is_some()
    }

    fn to_descriptor(&self) -> Result<ImageDescriptor, ProvisionError> {
        let digest = self
            .sha256
            .as_deref()
            .and_then(Sha256Digest::parse)
            .ok_or_else(|| ProvisionError::CatalogIncomplete { image: self.id() })?;
        Ok(ImageDescriptor {
            os_family: self.os_family.clone(),
            version: self.version.clone(),
            variant: self.variant.clone(),
            architecture: self.architecture.clone(),
            name: self.name.clone(),
            url: self.url.clone(),
            digest,
            size_bytes: self.size_bytes,
            tags: self.tags.clone(),
        })
    }
}

/// A resolved image with a pinned digest
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageDescriptor {
    pub os_family: String,
    pub version: String,
    pub variant: String,
    pub architecture: String,
    pub name: String,
    pub url: String,
    pub digest: Sha256Digest,
    pub size_bytes: u64,
    pub tags: Vec<String>,
}

impl ImageDescriptor {
    /// Stable identifier such as `ubuntu-24.04.2-server-amd64`
    pub fn id(&self) -> String {
        format!(
            "{}-{}-{}-{}",
            self.os_family, self.version, self.variant, self.architecture
        )
    }
}

impl fmt::Display for ImageDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id())
    }
}

/// What the caller asked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRequest {
    pub os_family: String,
    pub version: Option<String>,
    pub variant: Option<String>,
}

impl ImageRequest {
    /// Latest release of `os_family`, first listed variant
    pub fn latest(os_family: &str) -> Self {
        Self {
            os_family: os_family.to_string(),
            version: None,
            variant: None,
        }
    }

    fn matches(&self, entry: &CatalogEntry) -> bool {
        entry.os_family.eq_ignore_ascii_case(&self.os_family)
            && self
                .version
                .as_deref()
                .map_or(true, |v| version_matches(&entry.version, v))
            && self
                .variant
                .as_deref()
                .map_or(true, |v| entry.variant.eq_ignore_ascii_case(v))
    }
}

impl Default for ImageRequest {
    fn default() -> Self {
        Self::latest(defaults::DEFAULT_OS_FAMILY)
    }
}

impl fmt::Display for ImageRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.os_family)?;
        if let Some(version) = &self.version {
            write!(f, " {version}")?;
        }
        if let Some(variant) = &self.variant {
            write!(f, " ({variant})")?;
        }
        Ok(())
    }
}

/// `24.04` matches `24.04` and `24.04.2`, but not `24.041`
fn version_matches(candidate: &str, requested: &str) -> bool {
    candidate == requested
        || candidate
            .strip_prefix(requested)
            .is_some_and(|rest| rest.starts_with('.'))
}

/// Compare dotted release versions numerically (`24.04.10` > `24.04.2`)
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parts = |v: &str| -> Vec<u64> {
        v.split('.')
            .map(|p| {
                p.chars()
                    .take_while(char::is_ascii_digit)
                    .collect::<String>()
                    .parse()
                    .unwrap_or(0)
            })
            .collect()
    };
    let (a, b) = (parts(a), parts(b));
    let len = a.len().max(b.len());
    (0..len)
        .map(|i| {
            a.get(i)
                .copied()
                .unwrap_or(0)
                .cmp(&b.get(i).copied().unwrap_or(0))
        })
        .find(|o| o.is_ne())
        .unwrap_or(Ordering::Equal)
}

/// Capability tags carried by the stock Ubuntu images
pub(crate) fn default_tags() -> Vec<String> {
    ["ai_optimized", "container_ready", "gpu:intel", "gpu:amd", "gpu:nvidia"]
        .iter()
        .map(|t| (*t).to_string())
        .collect()
}

/// Built-in table used when no live index is available
pub fn static_entries() -> Vec<CatalogEntry> {
    let tags = default_tags();
    vec![
        CatalogEntry {
            name: "Ubuntu 24.04.2 LTS Desktop".to_string(),
            os_family: "ubuntu".to_string(),
            version: "24.04.2".to_string(),
            variant: "desktop".to_string(),
            architecture: "amd64".to_string(),
            url: format!(
                "{}/24.04/ubuntu-24.04.2-desktop-amd64.iso",
                urls::UBUNTU_RELEASES
            ),
            sha256: Some(
                "d7fe3d6a0419667d2f8eff12796996328daa2d4f90cd9f87aa9371b362f987bf".to_string(),
            ),
            size_bytes: 5900 * 1024 * 1024,
            tags: tags.clone(),
        },
        CatalogEntry {
            name: "Ubuntu 24.04.2 LTS Server".to_string(),
            os_family: "ubuntu".to_string(),
            version: "24.04.2".to_string(),
            variant: "server".to_string(),
            architecture: "amd64".to_string(),
            url: format!(
                "{}/24.04/ubuntu-24.04.2-live-server-amd64.iso",
                urls::UBUNTU_RELEASES
            ),
            sha256: Some(
                "d6dab0c3a657988501b4bd76f1297c053df710e06e0c3aece60dead24f270b4d".to_string(),
            ),
            size_bytes: 3000 * 1024 * 1024,
            tags,
        },
    ]
}

/// Where a snapshot's entries came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogSource {
    /// Fetched during this call
    Live { fetched_at: DateTime<Utc> },
    /// Cached copy within the TTL, or last-known-good after a failed refresh
    Cached { fetched_at: DateTime<Utc>, stale: bool },
    /// Built-in table
    Static,
}

impl fmt::Display for CatalogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Live { fetched_at } => write!(f, "live index (fetched {fetched_at})"),
            Self::Cached { fetched_at, stale } => {
                let note = if *stale { ", stale" } else { "" };
                write!(f, "cached index (fetched {fetched_at}{note})")
            }
            Self::Static => f.write_str("built-in table"),
        }
    }
}

/// Entries available at one point in time
#[derive(Debug, Clone)]
pub struct CatalogSnapshot {
    pub source: CatalogSource,
    pub entries: Vec<CatalogEntry>,
}

impl CatalogSnapshot {
    /// Resolve `request` to the highest matching version
    ///
    /// Among equal versions the first listed entry wins. The chosen entry
    /// must carry a pinned digest; a lower version is never substituted.
    pub fn resolve(&self, request: &ImageRequest) -> Result<ImageDescriptor, ProvisionError> {
        let mut best: Option<&CatalogEntry> = None;
        for entry in self.entries.iter().filter(|e| request.matches(e)) {
            let better = best.map_or(true, |b| {
                compare_versions(&entry.version, &b.version) == Ordering::Greater
            });
            if better {
                best = Some(entry);
            }
        }

        let entry = best.ok_or_else(|| ProvisionError::ImageNotFound {
            request: request.to_string(),
        })?;
        let descriptor = entry.to_descriptor()?;
        tracing::info!(image = %descriptor, source = %self.source, "Resolved image");
        Ok(descriptor)
    }
}

#[derive(Debug, Deserialize)]
struct RemoteIndex {
    images: Vec<CatalogEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedIndex {
    source: String,
    fetched_at: DateTime<Utc>,
    images: Vec<CatalogEntry>,
}

/// Where the live index comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexSource {
    /// JSON document `{ "images": [...] }`
    Json { url: String },
    /// Release directories and `SHA256SUMS` on an Ubuntu mirror
    Ubuntu(UbuntuReleases),
}

impl IndexSource {
    /// Stock mirror with the supported LTS releases
    pub fn ubuntu_default() -> Self {
        Self::Ubuntu(UbuntuReleases {
            base_url: urls::UBUNTU_RELEASES.to_string(),
            releases: defaults::UBUNTU_LTS_RELEASES
                .iter()
                .map(|r| (*r).to_string())
                .collect(),
        })
    }

    /// Identifies the cached index so a changed source is never served stale
    fn cache_key(&self) -> String {
        match self {
            Self::Json { url } => url.clone(),
            Self::Ubuntu(mirror) => mirror.cache_key(),
        }
    }

    async fn fetch(
        &self,
        downloader: &DownloadManager,
    ) -> Result<Vec<CatalogEntry>, DownloadError> {
        match self {
            Self::Json { url } => Ok(downloader.fetch_json::<RemoteIndex>(url).await?.images),
            Self::Ubuntu(mirror) => mirror.fetch(downloader).await,
        }
    }
}

/// Catalog settings
#[derive(Debug, Clone)]
pub struct CatalogSettings {
    /// Live index; `None` uses only the built-in table
    pub source: Option<IndexSource>,
    /// Freshness window of the cached index
    pub ttl: Duration,
    /// Use the built-in table when no index is available
    pub static_fallback: bool,
}

impl Default for CatalogSettings {
    fn default() -> Self {
        Self {
            source: Some(IndexSource::ubuntu_default()),
            ttl: Duration::from_secs(defaults::CATALOG_CACHE_TTL),
            static_fallback: true,
        }
    }
}

/// Image catalog backed by a live index and the built-in table
#[derive(Debug, Clone)]
pub struct ImageCatalog {
    settings: CatalogSettings,
    cache_path: PathBuf,
    downloader: DownloadManager,
}

impl ImageCatalog {
    /// Create a catalog caching its index under `catalog_dir`
    pub fn new(settings: CatalogSettings, catalog_dir: &Path, downloader: DownloadManager) -> Self {
        Self {
            settings,
            cache_path: catalog_dir.join(INDEX_CACHE_FILE),
            downloader,
        }
    }

    /// Current entries, refreshing the index when stale or when `force_refresh`
    pub async fn snapshot(&self, force_refresh: bool) -> Result<CatalogSnapshot, ProvisionError> {
        let Some(source) = self.settings.source.as_ref() else {
            return self.static_snapshot("no live index configured");
        };
        let key = source.cache_key();

        let cached = self.load_cached(&key);
        let now = Utc::now();
        if !force_refresh {
            if let Some(fresh) = cached.as_ref().filter(|c| !self.is_stale(c, now)) {
                tracing::debug!(fetched_at = %fresh.fetched_at, "Using cached image index");
                return Ok(CatalogSnapshot {
                    source: CatalogSource::Cached {
                        fetched_at: fresh.fetched_at,
                        stale: false,
                    },
                    entries: fresh.images.clone(),
                });
            }
        }

        match source.fetch(&self.downloader).await {
            Ok(images) => {
                let record = CachedIndex {
                    source: key.clone(),
                    fetched_at: now,
                    images,
                };
                self.save_cached(&record);
                tracing::info!(count = record.images.len(), "Refreshed image index");
                Ok(CatalogSnapshot {
                    source: CatalogSource::Live { fetched_at: now },
                    entries: record.images,
                })
            }
            Err(e) => {
                tracing::warn!(source = %key, error = %e, "Image index refresh failed");
                match cached {
                    Some(cached) => Ok(CatalogSnapshot {
                        source: CatalogSource::Cached {
                            fetched_at: cached.fetched_at,
                            stale: self.is_stale(&cached, now),
                        },
                        entries: cached.images,
                    }),
                    None => self.static_snapshot(&e.to_string()),
                }
            }
        }
    }

    /// Resolve `request` against the current snapshot
    pub async fn resolve(&self, request: &ImageRequest) -> Result<ImageDescriptor, ProvisionError> {
        self.snapshot(false).await?.resolve(request)
    }

    fn static_snapshot(&self, reason: &str) -> Result<CatalogSnapshot, ProvisionError> {
        if self.settings.static_fallback {
            Ok(CatalogSnapshot {
                source: CatalogSource::Static,
                entries: static_entries(),
            })
        } else {
            Err(ProvisionError::CatalogUnavailable {
                reason: reason.to_string(),
            })
        }
    }

    fn is_stale(&self, cached: &CachedIndex, now: DateTime<Utc>) -> bool {
        let ttl = i64::try_from(self.settings.ttl.as_secs()).unwrap_or(i64::MAX);
        (now - cached.fetched_at).num_seconds() >= ttl
    }

    fn load_cached(&self, key: &str) -> Option<CachedIndex> {
        let content = filesystem::read_file(&self.cache_path).ok()?;
        match serde_json::from_str::<CachedIndex>(&content) {
            Ok(cached) if cached.source == key => Some(cached),
            Ok(_) => {
                tracing::debug!("Cached image index is for another source");
                None
            }
            Err(e) => {
                tracing::warn!(
                    path = %self.cache_path.display(),
                    error = %e,
                    "Ignoring unreadable image index cache"
                );
                None
            }
        }
    }

    fn save_cached(&self, record: &CachedIndex) {
        let result = serde_json::to_vec_pretty(record)
            .map_err(|e| e.to_string())
            .and_then(|bytes| {
                filesystem::write_atomic(&self.cache_path, &bytes).map_err(|e| e.to_string())
            });
        if let Err(e) = result {
            tracing::warn!(
                path = %self.cache_path.display(),
                error = %e,
                "Could not cache image index"
            );
        }
    }
}
