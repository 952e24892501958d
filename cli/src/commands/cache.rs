use anyhow::{Result, bail};
use serde::Serialize;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use coop_core::cache::CacheStorage;

use super::helpers::{format_bytes, print_json, truncate};

pub(crate) fn cmd_cache_list(cache: &CacheStorage, current: &str, json: bool) -> Result<()> {
    let buckets = cache.list_buckets()?;

    if json {
        return print_json(&buckets);
    }
    if buckets.is_empty() {
        eprintln!("No cache buckets. Run `coop install` or start the server to populate one.");
        return Ok(());
    }

    #[derive(Tabled)]
    struct BucketRow {
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Entries")]
        entries: i64,
        #[tabled(rename = "Size")]
        size: String,
        #[tabled(rename = "Created")]
        created: String,
        #[tabled(rename = "")]
        current: &'static str,
    }

    let rows: Vec<BucketRow> = buckets
        .iter()
        .map(|b| BucketRow {
            name: b.name.clone(),
            entries: b.entries,
            size: format_bytes(b.bytes),
            created: b.created_at.chars().take(19).collect(),
            current: if b.name == current { "current" } else { "" },
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(1..3)).with(Alignment::right()))
        .to_string();
    println!("{table}");
    Ok(())
}

pub(crate) fn cmd_cache_show(cache: &CacheStorage, name: &str, json: bool) -> Result<()> {
    if !cache.has_bucket(name)? {
        bail!("No cache bucket named '{name}'");
    }
    let entries = cache.list_entries(name)?;

    if json {
        return print_json(&entries);
    }
    if entries.is_empty() {
        eprintln!("Cache bucket '{name}' is empty.");
        return Ok(());
    }

    #[derive(Tabled)]
    struct EntryRow {
        #[tabled(rename = "Request")]
        request: String,
        #[tabled(rename = "Status")]
        status: u16,
        #[tabled(rename = "Type")]
        content_type: String,
        #[tabled(rename = "Size")]
        size: String,
    }

    let rows: Vec<EntryRow> = entries
        .iter()
        .map(|e| EntryRow {
            request: truncate(&e.request_key, 50),
            status: e.status,
            content_type: e.content_type.as_deref().map(|t| truncate(t, 30)).unwrap_or_default(),
            size: format_bytes(e.bytes),
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(3..4)).with(Alignment::right()))
        .to_string();
    println!("{table}");
    Ok(())
}

pub(crate) fn cmd_cache_clear(
    cache: &CacheStorage,
    name: Option<&str>,
    all: bool,
    json: bool,
) -> Result<()> {
    let targets = match (name, all) {
        (Some(_), true) => bail!("Pass either a cache name or --all, not both"),
        (Some(n), false) => vec![n.to_string()],
        (None, true) => cache.bucket_names()?,
        (None, false) => bail!("Specify a cache name to clear, or --all"),
    };

    let mut cleared = Vec::new();
    for bucket in &targets {
        if cache.delete_bucket(bucket)? {
            cleared.push(bucket.clone());
        }
    }

    if json {
        #[derive(Serialize)]
        struct Cleared<'a> {
            cleared: &'a [String],
        }
        return print_json(&Cleared { cleared: &cleared });
    }
    match (cleared.is_empty(), name) {
        (true, Some(n)) => bail!("No cache bucket named '{n}'"),
        (true, None) => println!("No cache buckets to clear."),
        (false, _) => {
            for bucket in &cleared {
                println!("Cleared {bucket}");
            }
        }
    }
    Ok(())
}
