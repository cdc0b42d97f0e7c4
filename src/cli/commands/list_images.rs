//! CLI command for `weirding list-images`

use anyhow::Result;
use serde::Serialize;

use super::AppContext;
use crate::cli::output::status;
use crate::core::acquire::ImageCache;
use crate::core::catalog::{CatalogEntry, Sha256Digest};
use crate::core::device::format_size;

#[derive(Debug, Serialize)]
struct ImageRow {
    id: String,
    name: String,
    size_bytes: u64,
    pinned: bool,
    cache: String,
    tags: Vec<String>,
}

fn row(entry: &CatalogEntry, cache: &ImageCache) -> ImageRow {
    let cached = entry
        .sha256
        .as_deref()
        .and_then(Sha256Digest::parse)
        .and_then(|digest| cache.lookup(&digest));
    ImageRow {
        id: entry.id(),
        name: entry.name.clone(),
        size_bytes: entry.size_bytes,
        pinned: entry.is_pinned(),
        cache: cached.map_or_else(|| "not cached".to_string(), |c| c.state().to_string()),
        tags: entry.tags.clone(),
    }
}

/// Execute the list-images command
pub async fn execute(ctx: &AppContext, refresh: bool, json: bool) -> Result<()> {
    let snapshot = ctx.catalog().snapshot(refresh).await?;
    let cache = ctx.cache();
    let rows: Vec<ImageRow> = snapshot.entries.iter().map(|e| row(e, &cache)).collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!("{} Images from {}\n", status::INFO, snapshot.source);
    for row in &rows {
        let pin = if row.pinned { "" } else { "  (no pinned digest)" };
        println!(
            "  {:<36} {:>10}  {:<10}{pin}",
            row.id,
            format_size(row.size_bytes),
            row.cache
        );
        if !row.tags.is_empty() {
            println!("  {:<36} tags: {}", "", row.tags.join(", "));
        }
    }
    Ok(())
}
