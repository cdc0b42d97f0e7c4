//! Output formatting and progress indicators
//!
//! Progress bars, status prefixes, the device table and error display.

use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use crate::core::device::{format_size, DeviceRecord};
use crate::error::ProvisionError;

/// Create a spinner for operations with unknown duration
pub fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
            .template("{spinner:.blue} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(80));
    pb
}

/// Create a progress bar for image downloads
pub fn create_download_bar(total: u64) -> ProgressBar {
    byte_bar(
        total,
        "{spinner:.green} Downloading [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})",
    )
}

/// Create a progress bar for raw device writes
pub fn create_write_bar(total: u64) -> ProgressBar {
    byte_bar(
        total,
        "{spinner:.red} Writing     [{bar:40.red/yellow}] \
         {bytes}/{total_bytes} {bytes_per_sec} ({eta})",
    )
}

fn byte_bar(total: u64, template: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(template)
            .map(|style| style.progress_chars("█▓▒░"))
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    pb
}

/// Status message prefixes
pub mod status {
    /// Success prefix (green checkmark)
    pub const SUCCESS: &str = "✓";

    /// Error prefix (red X)
    pub const ERROR: &str = "✗";

    /// Warning prefix (yellow triangle)
    pub const WARNING: &str = "⚠";

    /// Info prefix (blue circle)
    pub const INFO: &str = "ℹ";
}

/// One row of `list-drives`
#[derive(Debug, Serialize)]
pub struct DeviceRow<'a> {
    pub path: &'a str,
    pub size_bytes: u64,
    pub bus: String,
    pub removable: bool,
    pub mounted: bool,
    pub suitable: bool,
    pub reason: &'a str,
    pub label: &'a str,
}

impl<'a> From<&'a DeviceRecord> for DeviceRow<'a> {
    fn from(record: &'a DeviceRecord) -> Self {
        Self {
            path: record.path(),
            size_bytes: record.size_bytes(),
            bus: record.bus().to_string(),
            removable: record.removable(),
            mounted: record.is_mounted(),
            suitable: record.is_suitable(),
            reason: record.suitability().reason(),
            label: record.label(),
        }
    }
}

/// Render assessed devices as an aligned table
pub fn device_table(records: &[DeviceRecord]) -> String {
    let yes_no = |flag: bool| if flag { "yes" } else { "no" };
    let mut out = format!(
        "{:<16} {:>10} {:<7} {:<9} {:<7} {:<8} {}\n",
        "DEVICE", "SIZE", "BUS", "REMOVABLE", "MOUNTED", "SUITABLE", "REASON"
    );
    for record in records {
        let row = DeviceRow::from(record);
        out.push_str(&format!(
            "{:<16} {:>10} {:<7} {:<9} {:<7} {:<8} {}\n",
            row.path,
            format_size(row.size_bytes),
            row.bus,
            yes_no(row.removable),
            yes_no(row.mounted),
            yes_no(row.suitable),
            row.reason
        ));
    }
    out
}

/// Print an error and its causes to stderr
pub fn display_error(error: &anyhow::Error) {
    eprintln!("{} {error}", status::ERROR);
    for cause in error.chain().skip(1) {
        eprintln!("  caused by: {cause}");
    }
    if let Some(provision) = error.downcast_ref::<ProvisionError>() {
        if provision.is_retryable() {
            eprintln!("{} This can be retried once the cause is resolved.", status::INFO);
        }
    }
}

/// Process exit code for an error reaching `main`
pub fn exit_code(error: &anyhow::Error) -> i32 {
    error
        .downcast_ref::<ProvisionError>()
        .map_or(1, ProvisionError::exit_code)
}
