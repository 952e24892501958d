use anyhow::{Result, bail};
use tabled::{Table, Tabled, settings::Style};

use coop_core::db::Database;
use coop_core::models::{Collection, RECORD_ID_FIELD, SYNCED_FIELD, SyncRecord};

use super::helpers::{json_error, parse_filter, parse_record_json, print_json, truncate};

pub(crate) fn cmd_records_add(db: &Database, collection: &str, data: &str, json: bool) -> Result<()> {
    let collection = Collection::parse(collection)?;
    let record = SyncRecord::from_value(parse_record_json(data)?)?;
    db.put(collection, &record)?;

    if json {
        print_json(&record)?;
    } else {
        println!("Saved {} in {collection}", record.key());
        if !record.is_synced() {
            println!("  Not synced yet. Run `coop sync` or let the server sync it when online.");
        }
    }
    Ok(())
}

pub(crate) fn cmd_records_list(
    db: &Database,
    collection: &str,
    filter: Option<&str>,
    unsynced: bool,
    json: bool,
) -> Result<()> {
    let collection = Collection::parse(collection)?;
    let mut records = match filter {
        Some(f) => {
            let (field, value) = parse_filter(f)?;
            db.get_by_index(collection, &field, &value)?
        }
        None => db.get_all(collection)?,
    };
    if unsynced {
        records.retain(|r| !r.is_synced());
    }

    if json {
        return print_json(&records);
    }
    if records.is_empty() {
        eprintln!("No records in {collection}.");
        return Ok(());
    }

    print_records_table(&records);
    let pending = db.count_unsynced(collection)?;
    let total = db.count(collection)?;
    println!("{total} record(s) in {collection}, {pending} waiting to sync");
    Ok(())
}

pub(crate) fn cmd_records_show(db: &Database, collection: &str, id: &str, json: bool) -> Result<()> {
    let collection = Collection::parse(collection)?;
    let Some(record) = db.get(collection, id)? else {
        if json {
            println!("{}", json_error(&format!("Record '{id}' not found in {collection}")));
            return Ok(());
        }
        bail!("Record '{id}' not found in {collection}");
    };

    if json {
        print_json(&record)?;
    } else {
        println!("{} ({collection})", record.key());
        for (field, value) in record.fields() {
            if field == RECORD_ID_FIELD {
                continue;
            }
            println!("  {field}: {value}");
        }
    }
    Ok(())
}

#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Synced")]
    synced: &'static str,
    #[tabled(rename = "Fields")]
    fields: String,
}

fn print_records_table(records: &[SyncRecord]) {
    let rows: Vec<RecordRow> = records
        .iter()
        .map(|r| RecordRow {
            id: truncate(r.key(), 36),
            synced: if r.is_synced() { "yes" } else { "no" },
            fields: truncate(&summarize_fields(r), 60),
        })
        .collect();

    let table = Table::new(&rows).with(Style::rounded()).to_string();
    println!("{table}");
}

/// `field=value` pairs for everything but the id and sync flag.
fn summarize_fields(record: &SyncRecord) -> String {
    record
        .fields()
        .iter()
        .filter(|(k, _)| k.as_str() != RECORD_ID_FIELD && k.as_str() != SYNCED_FIELD)
        .map(|(k, v)| match v {
            serde_json::Value::String(s) => format!("{k}={s}"),
            other => format!("{k}={other}"),
        })
        .collect::<Vec<_>>()
        .join(" ")
}
