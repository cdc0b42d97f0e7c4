//! CLI command for `weirding cache`
//!
//! Lists, cleans and re-verifies the content-addressed image cache.

use anyhow::Result;
use serde::Serialize;

use super::AppContext;
use crate::cli::output::status;
use crate::core::acquire::{CacheEntry, VerificationState};
use crate::core::device::format_size;

#[derive(Debug, Serialize)]
struct CacheRow<'a> {
    image: &'a str,
    digest: &'a str,
    size_bytes: u64,
    state: String,
    path: String,
}

impl<'a> From<&'a CacheEntry> for CacheRow<'a> {
    fn from(entry: &'a CacheEntry) -> Self {
        Self {
            image: entry.image(),
            digest: entry.digest().as_str(),
            size_bytes: entry.size_bytes(),
            state: entry.state().to_string(),
            path: entry.path().display().to_string(),
        }
    }
}

/// Execute cache list subcommand
pub fn execute_list(ctx: &AppContext, json: bool) -> Result<()> {
    let entries = ctx.cache().list();

    if json {
        let rows: Vec<CacheRow<'_>> = entries.iter().map(CacheRow::from).collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!("Location: {}", ctx.cache().dir().display());
    if entries.is_empty() {
        println!("{} Cache is empty", status::INFO);
        return Ok(());
    }
    let total: u64 = entries.iter().map(CacheEntry::size_bytes).sum();
    for entry in &entries {
        println!(
            "  {:<36} {:>10}  {:<10} {}",
            entry.image(),
            format_size(entry.size_bytes()),
            entry.state(),
            &entry.digest().as_str()[..12]
        );
    }
    println!("\n{} image(s), {}", entries.len(), format_size(total));
    Ok(())
}

/// Execute cache clean subcommand
pub fn execute_clean(ctx: &AppContext) -> Result<()> {
    let summary = ctx.cache().clean()?;
    if summary.removed == 0 && summary.skipped == 0 {
        println!("{} Cache was already empty", status::SUCCESS);
    } else {
        println!(
            "{} Removed {} file(s), {} freed",
            status::SUCCESS,
            summary.removed,
            format_size(summary.freed_bytes)
        );
    }
    if summary.skipped > 0 {
        println!(
            "{} Kept {} file(s) of images in use by another run",
            status::WARNING,
            summary.skipped
        );
    }
    Ok(())
}

/// Execute cache verify subcommand
pub async fn execute_verify(ctx: &AppContext) -> Result<()> {
    let cache = ctx.cache();
    let mut corrupt = 0;
    for entry in cache.list() {
        let spinner = crate::cli::output::create_spinner(&format!("Verifying {}", entry.image()));
        let worker = cache.clone();
        let digest = entry.digest().clone();
        let checked = tokio::task::spawn_blocking(move || worker.reverify(&digest)).await??;
        spinner.finish_and_clear();

        match checked.state() {
            VerificationState::Verified => println!("{} {}", status::SUCCESS, checked.image()),
            _ => {
                corrupt += 1;
                println!("{} {} is corrupt and was removed", status::ERROR, checked.image());
            }
        }
    }
    if corrupt > 0 {
        anyhow::bail!("{corrupt} cached image(s) failed verification");
    }
    Ok(())
}
