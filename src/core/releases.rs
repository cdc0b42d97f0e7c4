//! Ubuntu release mirror as an image index
//!
//! Every LTS directory on the mirror lists its ISOs, and the `SHA256SUMS`
//! file next to them pins the digests. An ISO missing from the checksum file
//! is still listed, without a digest, so resolving it fails with
//! [`ProvisionError::CatalogIncomplete`](crate::error::ProvisionError).

use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::sync::OnceLock;

use super::catalog::CatalogEntry;
use crate::error::DownloadError;
use crate::infra::download::DownloadManager;

/// Approximate desktop ISO size; the listing carries no exact byte count
const DESKTOP_ISO_BYTES: u64 = 5900 * 1024 * 1024;

/// Approximate live-server ISO size
const SERVER_ISO_BYTES: u64 = 3000 * 1024 * 1024;

/// Mirror root plus the release directories to read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UbuntuReleases {
    pub base_url: String,
    pub releases: Vec<String>,
}

impl UbuntuReleases {
    /// Key under which the fetched index is cached
    pub fn cache_key(&self) -> String {
        format!("{}#{}", self.base_url.trim_end_matches('/'), self.releases.join(","))
    }

    /// Read every release directory
    ///
    /// A release whose listing cannot be fetched is skipped. Failing to read
    /// any release at all is an error, so the caller can fall back.
    pub async fn fetch(
        &self,
        downloader: &DownloadManager,
    ) -> Result<Vec<CatalogEntry>, DownloadError> {
        let mut entries = Vec::new();
        let mut last_error = None;
        for release in &self.releases {
            match self.fetch_release(downloader, release).await {
                Ok(found) => entries.extend(found),
                Err(e) => {
                    tracing::warn!(release = %release, error = %e, "Skipping Ubuntu release");
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) if entries.is_empty() => Err(e),
            _ => Ok(entries),
        }
    }

    async fn fetch_release(
        &self,
        downloader: &DownloadManager,
        release: &str,
    ) -> Result<Vec<CatalogEntry>, DownloadError> {
        let dir = format!("{}/{release}", self.base_url.trim_end_matches('/'));
        let listing = downloader.fetch_text(&format!("{dir}/")).await?;
        let sums = match downloader.fetch_text(&format!("{dir}/SHA256SUMS")).await {
            Ok(body) => parse_sha256sums(&body),
            Err(e) => {
                tracing::warn!(release, error = %e, "No SHA256SUMS; images stay unpinned");
                HashMap::new()
            }
        };

        let entries: Vec<CatalogEntry> = iso_names(&listing)
            .into_iter()
            .filter_map(|file| {
                let sha256 = sums.get(&file).cloned();
                entry_for(&dir, &file, sha256)
            })
            .collect();
        tracing::debug!(release, count = entries.len(), "Read Ubuntu release directory");
        Ok(entries)
    }
}

/// ISO file names linked from a directory listing, deduplicated and sorted
fn iso_names(listing: &str) -> BTreeSet<String> {
    static ISO_RE: OnceLock<Option<Regex>> = OnceLock::new();
    let Some(re) = ISO_RE
        .get_or_init(|| {
            Regex::new(r#"href="(ubuntu-[0-9][0-9.]*-(?:desktop|live-server)-amd64\.iso)""#).ok()
        })
        .as_ref()
    else {
        return BTreeSet::new();
    };
    re.captures_iter(listing)
        .map(|c| c[1].to_string())
        .collect()
}

/// File name to lower-case digest, from `<hex> *<file>` or `<hex>  <file>` lines
fn parse_sha256sums(body: &str) -> HashMap<String, String> {
    body.lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let digest = parts.next()?;
            let file = parts.next()?.trim_start_matches('*');
            Some((file.to_string(), digest.to_ascii_lowercase()))
        })
        .collect()
}

/// `ubuntu-24.04.2-live-server-amd64.iso` becomes a 24.04.2 server entry
fn entry_for(dir: &str, file: &str, sha256: Option<String>) -> Option<CatalogEntry> {
    let rest = file.strip_prefix("ubuntu-")?.strip_suffix("-amd64.iso")?;
    let (version, edition) = rest.split_once('-')?;
    let (variant, size_bytes) = match edition {
        "desktop" => ("desktop", DESKTOP_ISO_BYTES),
        "live-server" => ("server", SERVER_ISO_BYTES),
        _ => return None,
    };
    let title = if variant == "desktop" { "Desktop" } else { "Server" };
    Some(CatalogEntry {
        name: format!("Ubuntu {version} LTS {title}"),
        os_family: "ubuntu".to_string(),
        version: version.to_string(),
        variant: variant.to_string(),
        architecture: "amd64".to_string(),
        url: format!("{dir}/{file}"),
        sha256,
        size_bytes,
        tags: super::catalog::default_tags(),
    })
}
