use anyhow::Result;
use serde::Serialize;

use coop_core::models::Collection;

use crate::worker::sync::SyncReport;
use crate::worker::{Worker, WorkerStatus};

use super::helpers::print_json;

pub(crate) async fn cmd_install(worker: &Worker, json: bool) -> Result<()> {
    let report = worker.on_install().await?;

    if json {
        print_json(&report)?;
    } else {
        println!(
            "Installed {} ({} assets, {} bytes)",
            report.cache_name,
            report.assets.len(),
            report.bytes
        );
        for asset in &report.assets {
            println!("  {asset}");
        }
    }
    Ok(())
}

pub(crate) async fn cmd_activate(worker: &Worker, json: bool) -> Result<()> {
    let report = worker.on_activate().await?;

    if json {
        print_json(&report)?;
    } else {
        println!("Activated {}", report.cache_name);
        if report.deleted.is_empty() {
            println!("  No stale caches to delete");
        }
        for name in &report.deleted {
            println!("  Deleted stale cache {name}");
        }
    }
    Ok(())
}

pub(crate) async fn cmd_sync(worker: &Worker, tag: &str, json: bool) -> Result<()> {
    let report = worker.on_sync(tag).await?;

    if json {
        print_json(&report)?;
    } else if report.attempted == 0 {
        println!("{tag}: nothing to sync");
    } else {
        println!(
            "{tag}: synced {}/{} record(s)",
            report.synced, report.attempted
        );
        for failure in &report.failures {
            println!("  {} failed: {}", failure.key, failure.reason);
        }
        for key in &report.superseded {
            println!("  {key} changed while it was being sent");
        }
    }

    if !report.is_complete() {
        anyhow::bail!("{}", unsynced_message(&report));
    }
    Ok(())
}

fn unsynced_message(report: &SyncReport) -> String {
    format!(
        "{} record(s) left unsynced; run `coop sync {}` again, or keep `coop serve` \
         running to retry them when the origin is reachable",
        report.failures.len() + report.superseded.len(),
        report.tag
    )
}

#[derive(Serialize)]
struct StatusOutput {
    #[serde(flatten)]
    worker: WorkerStatus,
    online: bool,
    unsynced: Vec<UnsyncedCount>,
}

#[derive(Serialize)]
struct UnsyncedCount {
    collection: Collection,
    count: i64,
}

pub(crate) async fn cmd_status(worker: &Worker, json: bool) -> Result<()> {
    let online = worker.origin_reachable().await;
    let unsynced = worker
        .store()
        .with(|db| {
            Collection::ALL
                .into_iter()
                .map(|collection| {
                    Ok(UnsyncedCount {
                        collection,
                        count: db.count_unsynced(collection)?,
                    })
                })
                .collect::<Result<Vec<_>>>()
        })
        .await?;
    let status = StatusOutput {
        worker: worker.status(),
        online,
        unsynced,
    };

    if json {
        return print_json(&status);
    }

    let w = &status.worker;
    println!("Worker:   {}", w.state);
    println!("Cache:    {}", w.cache_name);
    println!(
        "Active:   {}",
        w.active_version.as_deref().unwrap_or("(none)")
    );
    println!(
        "Origin:   {} ({})",
        w.origin,
        if status.online { "online" } else { "offline" }
    );
    for count in &status.unsynced {
        if count.count > 0 {
            println!("Unsynced: {} in {}", count.count, count.collection);
        }
    }
    if status.unsynced.iter().all(|c| c.count == 0) {
        println!("Unsynced: none");
    }
    Ok(())
}
