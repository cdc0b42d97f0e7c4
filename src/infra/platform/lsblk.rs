//! `lsblk --json` parsing
//!
//! lsblk output differs between util-linux releases: flags may be booleans,
//! `"0"`/`"1"` strings or numbers, sizes may be byte counts or suffixed
//! strings such as `"58.6G"`, and newer versions report `mountpoints` as an
//! array while older ones report a single `mountpoint`. All of that is
//! normalised here. Rows that still do not make sense are skipped with a
//! warning instead of failing the whole scan.

use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;

use crate::core::device::{BusClass, DeviceRecord, PartitionInfo};
use crate::error::PlatformError;

/// Columns requested from lsblk
pub const LSBLK_COLUMNS: &str =
    "NAME,PATH,SIZE,MODEL,VENDOR,SERIAL,RM,HOTPLUG,TRAN,TYPE,FSTYPE,LABEL,MOUNTPOINT";

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    #[serde(default)]
    blockdevices: Vec<LsblkRow>,
}

#[derive(Debug, Deserialize)]
struct LsblkRow {
    name: Option<String>,
    path: Option<String>,
    size: Option<LsblkValue>,
    model: Option<String>,
    vendor: Option<String>,
    serial: Option<String>,
    rm: Option<LsblkValue>,
    hotplug: Option<LsblkValue>,
    tran: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    fstype: Option<String>,
    label: Option<String>,
    mountpoint: Option<String>,
    mountpoints: Option<Vec<Option<String>>>,
    #[serde(default)]
    children: Vec<LsblkRow>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LsblkValue {
    Bool(bool),
    Number(u64),
    Text(String),
}

impl LsblkValue {
    fn as_flag(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Number(n) => *n != 0,
            Self::Text(s) => matches!(s.trim(), "1" | "true"),
        }
    }

    fn as_bytes(&self) -> Option<u64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(s) => parse_size(s),
            Self::Bool(_) => None,
        }
    }
}

impl LsblkRow {
    fn device_path(&self) -> Option<String> {
        match (&self.path, &self.name) {
            (Some(path), _) if !path.is_empty() => Some(path.clone()),
            (_, Some(name)) if !name.is_empty() => Some(format!("/dev/{name}")),
            _ => None,
        }
    }

    fn mounts(&self) -> Vec<String> {
        let mut mounts: Vec<String> = self
            .mountpoints
            .iter()
            .flatten()
            .flatten()
            .filter(|m| !m.is_empty())
            .cloned()
            .collect();
        if let Some(mount) = &self.mountpoint {
            if !mount.is_empty() && !mounts.contains(mount) {
                mounts.insert(0, mount.clone());
            }
        }
        mounts
    }

    /// Mount points of this row and every nested child (LVM, crypt)
    fn all_mounts(&self) -> Vec<String> {
        let mut mounts = self.mounts();
        for child in &self.children {
            for mount in child.all_mounts() {
                if !mounts.contains(&mount) {
                    mounts.push(mount);
                }
            }
        }
        mounts
    }

    fn human_label(&self) -> Option<String> {
        let joined = [self.vendor.as_deref(), self.model.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        (!joined.is_empty()).then_some(joined)
    }
}

/// Parse a size reported by lsblk into bytes
///
/// Plain integers are bytes; suffixed values use binary multiples
/// (`K`, `M`, `G`, `T`, `P`, `E`), as lsblk prints them.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
pub fn parse_size(raw: &str) -> Option<u64> {
    static SIZE_RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = SIZE_RE
        .get_or_init(|| Regex::new(r"^\s*([0-9]+(?:[.,][0-9]+)?)\s*([KMGTPE])?i?B?\s*$").ok())
        .as_ref()?;

    let caps = re.captures(raw)?;
    let number: f64 = caps.get(1)?.as_str().replace(',', ".").parse().ok()?;
    let exponent = match caps.get(2).map(|m| m.as_str()) {
        None => 0,
        Some("K") => 1,
        Some("M") => 2,
        Some("G") => 3,
        Some("T") => 4,
        Some("P") => 5,
        Some(_) => 6,
    };
    let bytes = number * 1024f64.powi(exponent);
    if bytes.is_finite() && bytes >= 0.0 && bytes < u64::MAX as f64 {
        Some(bytes as u64)
    } else {
        None
    }
}

/// Parse `lsblk --json` output into device records
///
/// Only whole disks are returned, in lsblk order. A document that is not
/// lsblk JSON at all is an error; individual malformed rows are skipped.
pub fn parse_lsblk(json: &str) -> Result<Vec<DeviceRecord>, PlatformError> {
    let output: LsblkOutput = serde_json::from_str(json).map_err(|e| PlatformError::Parse {
        tool: "lsblk".to_string(),
        error: e.to_string(),
    })?;

    let mut records = Vec::new();
    for row in &output.blockdevices {
        let kind = row.kind.as_deref().unwrap_or("disk");
        // loop, ram, zram and rom devices are never provisioning targets
        if kind != "disk" {
            tracing::trace!(name = ?row.name, kind, "Skipping non-disk device");
            continue;
        }
        match row_to_record(row) {
            Ok(record) => records.push(record),
            Err(reason) => {
                tracing::warn!(name = ?row.name, %reason, "Skipping malformed lsblk row");
            }
        }
    }
    Ok(records)
}

fn row_to_record(row: &LsblkRow) -> Result<DeviceRecord, String> {
    let path = row.device_path().ok_or("missing device name")?;
    let size = row
        .size
        .as_ref()
        .and_then(LsblkValue::as_bytes)
        .ok_or_else(|| format!("unparseable size for {path}"))?;
    let removable = row.rm.as_ref().is_some_and(LsblkValue::as_flag)
        || row.hotplug.as_ref().is_some_and(LsblkValue::as_flag);
    let bus = row
        .tran
        .as_deref()
        .map_or(BusClass::Unknown, BusClass::from_transport);

    let partitions = row
        .children
        .iter()
        .filter(|child| child.kind.as_deref().unwrap_or("part") == "part")
        .filter_map(|child| {
            let part_path = child.device_path()?;
            Some(PartitionInfo {
                path: part_path,
                size_bytes: child.size.as_ref().and_then(LsblkValue::as_bytes).unwrap_or(0),
                fstype: child.fstype.clone().filter(|s| !s.is_empty()),
                label: child.label.clone().filter(|s| !s.is_empty()),
                mount_points: child.all_mounts(),
            })
        })
        .collect();

    let mut record = DeviceRecord::new(path, size, bus, removable)
        .with_device_mounts(row.mounts())
        .with_partitions(partitions);
    if let Some(label) = row.human_label() {
        record = record.with_label(label);
    }
    if let Some(serial) = row.serial.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        record = record.with_serial(serial);
    }
    Ok(record)
}
