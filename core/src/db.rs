use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{Local, Utc};
use rusqlite::{
    Connection, OptionalExtension, Transaction, TransactionBehavior, params, params_from_iter,
};

use crate::models::{Collection, SyncRecord};

/// Current schema version, stored in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i64 = 2;

/// How long a writer waits on a lock held by another process.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Capability set the background sync queue needs from a record store.
///
/// Implementations are synchronous; the worker wraps them so every call runs
/// off the async executor.
pub trait KeyValueStore: Send {
    fn open(path: &Path) -> Result<Self>
    where
        Self: Sized;

    /// Every record in the collection, in insertion order.
    fn get_all(&self, collection: Collection) -> Result<Vec<SyncRecord>>;

    /// Insert or replace a record by its key. Replacing keeps the original position.
    fn put(&self, collection: Collection, record: &SyncRecord) -> Result<()>;

    /// Mark the stored copy of `sent` as synced, but only if it still equals
    /// `sent`. Returns false when the record changed (or vanished) meanwhile.
    fn mark_synced_if_unchanged(&self, collection: Collection, sent: &SyncRecord) -> Result<bool>;
}

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    /// Create the collections and their indexes on first open. Later opens
    /// find `user_version` already at [`SCHEMA_VERSION`] and touch nothing.
    fn migrate(&self) -> Result<()> {
        let version: i64 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;

        if version > SCHEMA_VERSION {
            bail!(
                "Database schema version {version} is newer than this build supports ({SCHEMA_VERSION})"
            );
        }

        if version < 1 {
            let tx = self.conn.unchecked_transaction()?;
            for collection in Collection::ALL {
                tx.execute_batch(&collection_schema(collection))?;
            }
            tx.execute_batch(
                "CREATE TABLE IF NOT EXISTS worker_state (
                    key TEXT PRIMARY KEY NOT NULL,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                PRAGMA user_version = 1;",
            )?;
            tx.commit()?;
        }

        if version < 2 {
            let tx = self.conn.unchecked_transaction()?;
            tx.execute_batch(
                "CREATE TABLE IF NOT EXISTS sync_leases (
                    name TEXT PRIMARY KEY NOT NULL,
                    holder TEXT NOT NULL,
                    expires_at INTEGER NOT NULL
                );

                PRAGMA user_version = 2;",
            )?;
            tx.commit()?;
        }

        Ok(())
    }

    pub fn schema_version(&self) -> Result<i64> {
        Ok(self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?)
    }

    // --- Records ---

    pub fn get_all(&self, collection: Collection) -> Result<Vec<SyncRecord>> {
        let sql = format!("SELECT data FROM {} ORDER BY seq", collection.table());
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut records = Vec::new();
        for row in rows {
            records.push(record_from_json(&row?)?);
        }
        Ok(records)
    }

    pub fn get(&self, collection: Collection, key: &str) -> Result<Option<SyncRecord>> {
        let sql = format!("SELECT data FROM {} WHERE key = ?1", collection.table());
        let data: Option<String> = self
            .conn
            .query_row(&sql, params![key], |row| row.get(0))
            .optional()?;
        data.as_deref().map(record_from_json).transpose()
    }

    pub fn put(&self, collection: Collection, record: &SyncRecord) -> Result<()> {
        let table = collection.table();
        let indexes = collection.indexes();

        let index_columns: String = indexes.iter().map(|i| format!(", {}", i.column)).collect();
        let index_placeholders: String = (0..indexes.len())
            .map(|n| format!(", ?{}", n + 5))
            .collect();
        let index_updates: String = indexes
            .iter()
            .map(|i| format!(", {0} = excluded.{0}", i.column))
            .collect();

        let sql = format!(
            "INSERT INTO {table} (key, seq, data, synced, updated_at{index_columns})
             VALUES (?1, (SELECT COALESCE(MAX(seq), 0) + 1 FROM {table}), ?2, ?3, ?4{index_placeholders})
             ON CONFLICT(key) DO UPDATE SET data = excluded.data, synced = excluded.synced,
             updated_at = excluded.updated_at{index_updates}"
        );

        let data = serde_json::to_string(record).context("failed to serialize record")?;
        let now = Local::now().to_rfc3339();
        let mut values: Vec<Option<String>> = vec![
            Some(record.key().to_string()),
            Some(data),
            Some(i64::from(record.is_synced()).to_string()),
            Some(now),
        ];
        values.extend(indexes.iter().map(|i| record.index_value(i.field)));

        self.conn
            .execute(&sql, params_from_iter(values.iter()))
            .with_context(|| format!("failed to store record '{}' in {collection}", record.key()))?;
        Ok(())
    }

    /// Compare-and-set on the synced flag. The read and the write share one
    /// immediate transaction, so an edit committed by any connection lands
    /// either before the comparison or after the flip.
    pub fn mark_synced_if_unchanged(
        &self,
        collection: Collection,
        sent: &SyncRecord,
    ) -> Result<bool> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let unchanged = self
            .get(collection, sent.key())?
            .is_some_and(|current| current == *sent);
        if unchanged {
            let mut synced = sent.clone();
            synced.mark_synced();
            self.put(collection, &synced)?;
        }
        tx.commit()?;
        Ok(unchanged)
    }

    /// Records whose declared index `field` equals `value`, in insertion order.
    pub fn get_by_index(
        &self,
        collection: Collection,
        field: &str,
        value: &str,
    ) -> Result<Vec<SyncRecord>> {
        let Some(index) = collection.index(field) else {
            bail!("Collection {collection} has no index on '{field}'");
        };
        let sql = format!(
            "SELECT data FROM {} WHERE {} = ?1 ORDER BY seq",
            collection.table(),
            index.column
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![value], |row| row.get::<_, String>(0))?;
        let mut records = Vec::new();
        for row in rows {
            records.push(record_from_json(&row?)?);
        }
        Ok(records)
    }

    pub fn count_unsynced(&self, collection: Collection) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {} WHERE synced = 0", collection.table());
        Ok(self.conn.query_row(&sql, [], |row| row.get(0))?)
    }

    pub fn count(&self, collection: Collection) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", collection.table());
        Ok(self.conn.query_row(&sql, [], |row| row.get(0))?)
    }

    // --- Worker state ---

    pub fn set_state(&self, key: &str, value: &str) -> Result<()> {
        let now = Local::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO worker_state (key, value, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now],
        )?;
        Ok(())
    }

    // --- Leases ---

    /// Take or renew the lease `name` for `holder`. Succeeds when nobody holds
    /// it, the previous lease expired, or `holder` already owns it.
    pub fn acquire_lease(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let changed = self.conn.execute(
            "INSERT INTO sync_leases (name, holder, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET holder = excluded.holder, expires_at = excluded.expires_at
             WHERE sync_leases.holder = excluded.holder OR sync_leases.expires_at <= ?4",
            params![name, holder, now.saturating_add(ttl_ms), now],
        )?;
        Ok(changed == 1)
    }

    /// Drop the lease if `holder` still owns it.
    pub fn release_lease(&self, name: &str, holder: &str) -> Result<bool> {
        let changed = self.conn.execute(
            "DELETE FROM sync_leases WHERE name = ?1 AND holder = ?2",
            params![name, holder],
        )?;
        Ok(changed == 1)
    }

    /// Current unexpired holder of `name`.
    pub fn lease_holder(&self, name: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT holder FROM sync_leases WHERE name = ?1 AND expires_at > ?2",
                params![name, Utc::now().timestamp_millis()],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn get_state(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM worker_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }
}

impl KeyValueStore for Database {
    fn open(path: &Path) -> Result<Self> {
        Database::open(path)
    }

    fn get_all(&self, collection: Collection) -> Result<Vec<SyncRecord>> {
        Database::get_all(self, collection)
    }

    fn put(&self, collection: Collection, record: &SyncRecord) -> Result<()> {
        Database::put(self, collection, record)
    }

    fn mark_synced_if_unchanged(&self, collection: Collection, sent: &SyncRecord) -> Result<bool> {
        Database::mark_synced_if_unchanged(self, collection, sent)
    }
}

fn collection_schema(collection: Collection) -> String {
    let table = collection.table();
    let mut sql = format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            key TEXT PRIMARY KEY NOT NULL,
            seq INTEGER NOT NULL,
            data TEXT NOT NULL,
            synced INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL"
    );
    for index in collection.indexes() {
        sql.push_str(&format!(",\n            {} TEXT", index.column));
    }
    sql.push_str("\n        );\n");
    sql.push_str(&format!(
        "CREATE INDEX IF NOT EXISTS idx_{table}_seq ON {table}(seq);\n"
    ));
    for index in collection.indexes() {
        sql.push_str(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_{col} ON {table}({col});\n",
            col = index.column
        ));
    }
    sql
}

fn record_from_json(data: &str) -> Result<SyncRecord> {
    let value: serde_json::Value =
        serde_json::from_str(data).context("stored record is not valid JSON")?;
    SyncRecord::from_value(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: serde_json::Value) -> SyncRecord {
        SyncRecord::from_value(value).unwrap()
    }

    fn daily(id: &str, date: &str, cycle: i64) -> SyncRecord {
        record(json!({
            "id": id,
            "date": date,
            "cycleId": cycle,
            "mortality": 1,
            "synced": false
        }))
    }

    fn index_names(db: &Database, table: &str) -> Vec<String> {
        let mut stmt = db
            .conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'index' AND tbl_name = ?1")
            .unwrap();
        stmt.query_map(params![table], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<String>, _>>()
            .unwrap()
    }

    #[test]
    fn test_open_creates_collections_and_indexes() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.schema_version().unwrap(), SCHEMA_VERSION);

        let cycles = index_names(&db, "cycles");
        assert!(cycles.contains(&"idx_cycles_status".to_string()));

        let daily = index_names(&db, "daily_records");
        assert!(daily.contains(&"idx_daily_records_date".to_string()));
        assert!(daily.contains(&"idx_daily_records_cycle_id".to_string()));

        let inventory = index_names(&db, "inventory");
        assert!(inventory.contains(&"idx_inventory_item_type".to_string()));
    }

    #[test]
    fn test_reopen_keeps_existing_records() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("coop.db");

        {
            let db = Database::open(&path).unwrap();
            db.put(Collection::DailyRecords, &daily("d1", "2024-03-01", 1))
                .unwrap();
        }

        let db = Database::open(&path).unwrap();
        assert_eq!(db.schema_version().unwrap(), SCHEMA_VERSION);
        let all = db.get_all(Collection::DailyRecords).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].key(), "d1");
    }

    #[test]
    fn test_refuses_newer_schema() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("coop.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch("PRAGMA user_version = 9;").unwrap();
        }
        assert!(Database::open(&path).is_err());
    }

    #[test]
    fn test_get_all_insertion_order() {
        let db = Database::open_in_memory().unwrap();
        for id in ["c", "a", "b"] {
            db.put(Collection::DailyRecords, &daily(id, "2024-03-01", 1))
                .unwrap();
        }
        let keys: Vec<String> = db
            .get_all(Collection::DailyRecords)
            .unwrap()
            .iter()
            .map(|r| r.key().to_string())
            .collect();
        assert_eq!(keys, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_put_upserts_in_place() {
        let db = Database::open_in_memory().unwrap();
        db.put(Collection::DailyRecords, &daily("a", "2024-03-01", 1))
            .unwrap();
        db.put(Collection::DailyRecords, &daily("b", "2024-03-02", 1))
            .unwrap();

        let mut a = daily("a", "2024-03-01", 1);
        a.mark_synced();
        db.put(Collection::DailyRecords, &a).unwrap();

        let all = db.get_all(Collection::DailyRecords).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].key(), "a");
        assert!(all[0].is_synced());
        assert!(!all[1].is_synced());
        assert_eq!(db.count_unsynced(Collection::DailyRecords).unwrap(), 1);
    }

    #[test]
    fn test_collections_are_isolated() {
        let db = Database::open_in_memory().unwrap();
        db.put(
            Collection::Cycles,
            &record(json!({"id": "same", "status": "active"})),
        )
        .unwrap();
        db.put(
            Collection::Inventory,
            &record(json!({"id": "same", "type": "feed"})),
        )
        .unwrap();

        assert_eq!(db.count(Collection::Cycles).unwrap(), 1);
        assert_eq!(db.count(Collection::Inventory).unwrap(), 1);
        assert_eq!(db.count(Collection::DailyRecords).unwrap(), 0);
        assert_eq!(
            db.get(Collection::Cycles, "same").unwrap().unwrap().get("status"),
            Some(&json!("active"))
        );
    }

    #[test]
    fn test_get_by_index() {
        let db = Database::open_in_memory().unwrap();
        db.put(Collection::DailyRecords, &daily("a", "2024-03-01", 1))
            .unwrap();
        db.put(Collection::DailyRecords, &daily("b", "2024-03-01", 2))
            .unwrap();
        db.put(Collection::DailyRecords, &daily("c", "2024-03-02", 2))
            .unwrap();

        let by_date = db
            .get_by_index(Collection::DailyRecords, "date", "2024-03-01")
            .unwrap();
        assert_eq!(by_date.len(), 2);

        let by_cycle = db
            .get_by_index(Collection::DailyRecords, "cycleId", "2")
            .unwrap();
        let keys: Vec<&str> = by_cycle.iter().map(SyncRecord::key).collect();
        assert_eq!(keys, vec!["b", "c"]);

        assert!(
            db.get_by_index(Collection::DailyRecords, "mortality", "1")
                .is_err()
        );
    }

    #[test]
    fn test_index_follows_updates() {
        let db = Database::open_in_memory().unwrap();
        db.put(
            Collection::Cycles,
            &record(json!({"id": "c1", "status": "active"})),
        )
        .unwrap();
        db.put(
            Collection::Cycles,
            &record(json!({"id": "c1", "status": "closed"})),
        )
        .unwrap();

        assert!(
            db.get_by_index(Collection::Cycles, "status", "active")
                .unwrap()
                .is_empty()
        );
        assert_eq!(
            db.get_by_index(Collection::Cycles, "status", "closed")
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_get_missing_record() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.get(Collection::Inventory, "nope").unwrap().is_none());
    }

    #[test]
    fn test_worker_state_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.get_state("active_cache").unwrap().is_none());
        db.set_state("active_cache", "coop-farm-v1").unwrap();
        db.set_state("active_cache", "coop-farm-v2").unwrap();
        assert_eq!(
            db.get_state("active_cache").unwrap().as_deref(),
            Some("coop-farm-v2")
        );
    }

    #[test]
    fn test_mark_synced_only_when_unchanged() {
        let db = Database::open_in_memory().unwrap();
        let sent = daily("a", "2024-03-01", 1);
        db.put(Collection::DailyRecords, &sent).unwrap();
        assert!(db.mark_synced_if_unchanged(Collection::DailyRecords, &sent).unwrap());
        assert!(db.get(Collection::DailyRecords, "a").unwrap().unwrap().is_synced());

        // An edit after the copy was taken survives and stays unsynced
        let sent = daily("b", "2024-03-01", 1);
        db.put(Collection::DailyRecords, &sent).unwrap();
        let edited = record(json!({
            "id": "b",
            "date": "2024-03-01",
            "cycleId": 1,
            "mortality": 5,
            "synced": false
        }));
        db.put(Collection::DailyRecords, &edited).unwrap();
        assert!(!db.mark_synced_if_unchanged(Collection::DailyRecords, &sent).unwrap());
        assert_eq!(db.get(Collection::DailyRecords, "b").unwrap().unwrap(), edited);

        let gone = daily("c", "2024-03-01", 1);
        assert!(!db.mark_synced_if_unchanged(Collection::DailyRecords, &gone).unwrap());
        assert!(db.get(Collection::DailyRecords, "c").unwrap().is_none());
    }

    #[test]
    fn test_lease_is_exclusive_until_released() {
        let db = Database::open_in_memory().unwrap();
        let ttl = Duration::from_secs(60);
        assert!(db.acquire_lease("sync:daily", "serve", ttl).unwrap());
        // Renewal by the holder succeeds, a second holder is refused
        assert!(db.acquire_lease("sync:daily", "serve", ttl).unwrap());
        assert!(!db.acquire_lease("sync:daily", "cli", ttl).unwrap());
        assert_eq!(db.lease_holder("sync:daily").unwrap().as_deref(), Some("serve"));

        assert!(!db.release_lease("sync:daily", "cli").unwrap());
        assert!(db.release_lease("sync:daily", "serve").unwrap());
        assert!(db.lease_holder("sync:daily").unwrap().is_none());
        assert!(db.acquire_lease("sync:daily", "cli", ttl).unwrap());
    }

    #[test]
    fn test_expired_lease_can_be_taken_over() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.acquire_lease("sync:daily", "crashed", Duration::ZERO).unwrap());
        assert!(db.lease_holder("sync:daily").unwrap().is_none());
        assert!(db.acquire_lease("sync:daily", "cli", Duration::from_secs(60)).unwrap());
        assert_eq!(db.lease_holder("sync:daily").unwrap().as_deref(), Some("cli"));
    }

    #[test]
    fn test_lease_seen_across_connections() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("coop.db");
        let serve = Database::open(&path).unwrap();
        let cli = Database::open(&path).unwrap();
        let ttl = Duration::from_secs(60);

        assert!(serve.acquire_lease("sync:daily", "serve", ttl).unwrap());
        assert!(!cli.acquire_lease("sync:daily", "cli", ttl).unwrap());
        serve.release_lease("sync:daily", "serve").unwrap();
        assert!(cli.acquire_lease("sync:daily", "cli", ttl).unwrap());
    }

    #[test]
    fn test_upgrades_version_one_database() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("coop.db");
        {
            let db = Database::open(&path).unwrap();
            db.put(Collection::DailyRecords, &daily("d1", "2024-03-01", 1))
                .unwrap();
            db.conn
                .execute_batch("DROP TABLE sync_leases; PRAGMA user_version = 1;")
                .unwrap();
        }

        let db = Database::open(&path).unwrap();
        assert_eq!(db.schema_version().unwrap(), 2);
        assert_eq!(db.count(Collection::DailyRecords).unwrap(), 1);
        assert!(db.acquire_lease("sync:daily", "serve", Duration::from_secs(60)).unwrap());
    }

    #[test]
    fn test_generic_store_usage() {
        fn unsynced<S: KeyValueStore>(store: &S) -> usize {
            store
                .get_all(Collection::DailyRecords)
                .unwrap()
                .iter()
                .filter(|r| !r.is_synced())
                .count()
        }

        let tmp = tempfile::TempDir::new().unwrap();
        let db = <Database as KeyValueStore>::open(&tmp.path().join("kv.db")).unwrap();
        KeyValueStore::put(&db, Collection::DailyRecords, &daily("a", "2024-03-01", 1)).unwrap();
        assert_eq!(unsynced(&db), 1);
    }
}
