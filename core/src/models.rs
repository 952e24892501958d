use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field every record carries as its primary key.
pub const RECORD_ID_FIELD: &str = "id";

/// Field flipped to `true` once the remote side acknowledged the record.
pub const SYNCED_FIELD: &str = "synced";

/// A declared secondary index: the JSON field it reads and the SQL column it lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSpec {
    pub field: &'static str,
    pub column: &'static str,
}

/// The three record collections held by the embedded store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Collection {
    Cycles,
    DailyRecords,
    Inventory,
}

impl Collection {
    pub const ALL: [Collection; 3] = [
        Collection::Cycles,
        Collection::DailyRecords,
        Collection::Inventory,
    ];

    /// Name used on the wire and in config files.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Cycles => "cycles",
            Self::DailyRecords => "dailyRecords",
            Self::Inventory => "inventory",
        }
    }

    #[must_use]
    pub fn table(self) -> &'static str {
        match self {
            Self::Cycles => "cycles",
            Self::DailyRecords => "daily_records",
            Self::Inventory => "inventory",
        }
    }

    #[must_use]
    pub fn indexes(self) -> &'static [IndexSpec] {
        match self {
            Self::Cycles => &[IndexSpec {
                field: "status",
                column: "status",
            }],
            Self::DailyRecords => &[
                IndexSpec {
                    field: "date",
                    column: "date",
                },
                IndexSpec {
                    field: "cycleId",
                    column: "cycle_id",
                },
            ],
            Self::Inventory => &[IndexSpec {
                field: "type",
                column: "item_type",
            }],
        }
    }

    #[must_use]
    pub fn index(self, field: &str) -> Option<&'static IndexSpec> {
        self.indexes().iter().find(|index| index.field == field)
    }

    /// Accepts the wire name plus the kebab/snake spellings used on the command line.
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim() {
            "cycles" => Ok(Self::Cycles),
            "dailyRecords" | "daily-records" | "daily_records" => Ok(Self::DailyRecords),
            "inventory" => Ok(Self::Inventory),
            other => bail!(
                "Unknown collection '{other}'. Must be one of: {}",
                Self::ALL.map(Collection::name).join(", ")
            ),
        }
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A flat JSON record produced by the dashboard.
///
/// Only `id` and `synced` have meaning here; every other field is carried
/// through untouched so the remote endpoint receives exactly what the
/// dashboard wrote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct SyncRecord {
    key: String,
    fields: Map<String, Value>,
}

impl SyncRecord {
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(fields) = value else {
            bail!("Record must be a JSON object");
        };
        let key = match fields.get(RECORD_ID_FIELD) {
            Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(_) => bail!("Record '{RECORD_ID_FIELD}' must be a non-empty string or a number"),
            None => bail!("Record is missing '{RECORD_ID_FIELD}'"),
        };
        match fields.get(SYNCED_FIELD) {
            None | Some(Value::Bool(_)) => {}
            Some(_) => bail!("Record '{SYNCED_FIELD}' must be a boolean"),
        }
        Ok(Self { key, fields })
    }

    /// Primary key, normalized to a string (numeric ids keep their decimal form).
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn is_synced(&self) -> bool {
        matches!(self.fields.get(SYNCED_FIELD), Some(Value::Bool(true)))
    }

    pub fn mark_synced(&mut self) {
        self.fields
            .insert(SYNCED_FIELD.to_string(), Value::Bool(true));
    }

    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Value stored in an index column. Scalars only; objects and arrays are not indexed.
    #[must_use]
    pub fn index_value(&self, field: &str) -> Option<String> {
        match self.fields.get(field)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }

    #[must_use]
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }
}

impl TryFrom<Value> for SyncRecord {
    type Error = anyhow::Error;

    fn try_from(value: Value) -> Result<Self> {
        Self::from_value(value)
    }
}

impl From<SyncRecord> for Value {
    fn from(record: SyncRecord) -> Self {
        Value::Object(record.fields)
    }
}

/// Give a record an `id` when the producer did not assign one.
pub fn ensure_record_id(value: &mut Value) {
    if let Value::Object(fields) = value {
        fields
            .entry(RECORD_ID_FIELD)
            .or_insert_with(|| Value::String(uuid::Uuid::new_v4().to_string()));
    }
}

/// Snapshot of a response as stored in a cache bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    #[serde(skip)]
    pub body: Vec<u8>,
    #[serde(default)]
    pub cached_at: String,
}

impl CachedResponse {
    #[must_use]
    pub fn new(status: u16, headers: Vec<(String, String)>, body: Vec<u8>) -> Self {
        Self {
            status,
            headers,
            body,
            cached_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BucketSummary {
    pub name: String,
    pub entries: i64,
    pub bytes: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheEntrySummary {
    pub request_key: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub bytes: i64,
    pub cached_at: String,
}

/// Validate a cache bucket name: non-empty, no surrounding whitespace.
pub fn validate_bucket_name(name: &str) -> Result<()> {
    if name.is_empty() || name.trim() != name {
        bail!("Cache name '{name}' must be non-empty and must not start or end with whitespace");
    }
    Ok(())
}

/// Normalize a request key: must be an absolute path, optionally with a query.
pub fn normalize_request_key(key: &str) -> Result<String> {
    let key = key.trim();
    if !key.starts_with('/') {
        bail!("Request key '{key}' must start with '/'");
    }
    Ok(key.to_string())
}
