//! CLI command for `weirding relabel-drive`

use anyhow::Result;

use super::AppContext;
use crate::cli::output::status;
use crate::core::relabel::Relabeler;
use crate::error::ProvisionError;

/// Execute the relabel-drive command
pub fn execute(ctx: &AppContext, device: &str, label: &str) -> Result<()> {
    let records = ctx.scanner().scan()?;
    let record = records
        .iter()
        .find(|r| r.path() == device)
        .ok_or_else(|| ProvisionError::ValidationFailed {
            device: device.to_string(),
            reason: "no such disk (run list-drives --all to see device paths)".to_string(),
        })?;
    let boot = ctx.validator().boot_device(&records);

    let result = Relabeler::new(ctx.platform.clone()).relabel(record, label, boot.as_deref())?;

    println!(
        "{} {} is now labelled '{}' ({})",
        status::SUCCESS,
        result.partition,
        result.label,
        result.tool.program()
    );
    Ok(())
}
