//! CLI command for `weirding list-drives`

use anyhow::Result;

use super::AppContext;
use crate::cli::output::{device_table, status, DeviceRow};
use crate::core::device::DeviceRecord;

/// Devices to show: removable ones, or every disk with `all`
pub fn visible(records: Vec<DeviceRecord>, all: bool) -> Vec<DeviceRecord> {
    records
        .into_iter()
        .filter(|r| all || r.removable())
        .collect()
}

/// Execute the list-drives command
pub fn execute(ctx: &AppContext, all: bool, json: bool) -> Result<()> {
    let records = ctx.scanner().scan()?;
    let assessed = visible(ctx.validator().assess_all(&records), all);

    if json {
        let rows: Vec<DeviceRow<'_>> = assessed.iter().map(DeviceRow::from).collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if assessed.is_empty() {
        println!("{} No removable devices found (use --all to include fixed disks)", status::INFO);
        return Ok(());
    }

    print!("{}", device_table(&assessed));
    let suitable = assessed.iter().filter(|r| r.is_suitable()).count();
    println!("\n{suitable} suitable device(s)");
    Ok(())
}
