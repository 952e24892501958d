use anyhow::{Context, Result, bail};
use serde::Serialize;
use serde_json::Value;

use coop_core::models::ensure_record_id;

/// Parse a record given on the command line. The record must be a JSON
/// object; it is given an `id` when it has none.
pub(crate) fn parse_record_json(data: &str) -> Result<Value> {
    let mut value: Value = serde_json::from_str(data)
        .with_context(|| format!("Invalid JSON record: '{}'", truncate(data, 40)))?;
    if !value.is_object() {
        bail!("Record must be a JSON object, e.g. '{{\"date\":\"2024-03-01\",\"mortality\":2}}'");
    }
    ensure_record_id(&mut value);
    Ok(value)
}

/// Parse a `field=value` filter for an indexed lookup.
pub(crate) fn parse_filter(s: &str) -> Result<(String, String)> {
    let Some((field, value)) = s.split_once('=') else {
        bail!("Invalid filter '{s}'. Use 'field=value' (e.g. 'cycleId=c1')");
    };
    let field = field.trim();
    if field.is_empty() {
        bail!("Filter field must not be empty");
    }
    Ok((field.to_string(), value.trim().to_string()))
}

pub(crate) fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub(crate) fn json_error(message: &str) -> String {
    #[derive(Serialize)]
    struct CliError<'a> {
        error: &'a str,
    }
    serde_json::to_string(&CliError { error: message })
        .unwrap_or_else(|_| format!("{{\"error\":\"{message}\"}}"))
}

#[allow(clippy::cast_precision_loss)]
pub(crate) fn format_bytes(bytes: i64) -> String {
    const KIB: f64 = 1024.0;
    let b = bytes as f64;
    if b < KIB {
        format!("{bytes} B")
    } else if b < KIB * KIB {
        format!("{:.1} KiB", b / KIB)
    } else {
        format!("{:.1} MiB", b / (KIB * KIB))
    }
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let end = s.char_indices().nth(max - 3).map_or(s.len(), |(i, _)| i);
        format!("{}...", &s[..end])
    }
}
