//! Named, versioned cache buckets holding request/response snapshots.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::Local;
use rusqlite::{Connection, OptionalExtension, params};

use crate::models::{
    BucketSummary, CacheEntrySummary, CachedResponse, normalize_request_key, validate_bucket_name,
};

pub struct CacheStorage {
    conn: Connection,
}

impl CacheStorage {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open cache storage: {}", path.display()))?;
        let storage = CacheStorage { conn };
        storage.migrate()?;
        Ok(storage)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let storage = CacheStorage { conn };
        storage.migrate()?;
        Ok(storage)
    }

    fn migrate(&self) -> Result<()> {
        let version: i64 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;

        if version < 1 {
            self.conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS cache_buckets (
                    name TEXT PRIMARY KEY NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS cache_entries (
                    bucket TEXT NOT NULL,
                    request_key TEXT NOT NULL,
                    status INTEGER NOT NULL,
                    headers TEXT NOT NULL,
                    body BLOB NOT NULL,
                    cached_at TEXT NOT NULL,
                    PRIMARY KEY (bucket, request_key)
                );

                PRAGMA user_version = 1;",
            )?;
        }

        Ok(())
    }

    /// Open (or create) a bucket.
    pub fn open_bucket(&self, name: &str) -> Result<()> {
        validate_bucket_name(name)?;
        self.conn.execute(
            "INSERT OR IGNORE INTO cache_buckets (name, created_at) VALUES (?1, ?2)",
            params![name, Local::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn has_bucket(&self, name: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM cache_buckets WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Bucket names, oldest first.
    pub fn bucket_names(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM cache_buckets ORDER BY created_at, name")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    /// Delete a bucket and everything in it. Returns false if it did not exist.
    pub fn delete_bucket(&self, name: &str) -> Result<bool> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM cache_entries WHERE bucket = ?1", params![name])?;
        let removed = tx.execute("DELETE FROM cache_buckets WHERE name = ?1", params![name])?;
        tx.commit()?;
        Ok(removed > 0)
    }

    pub fn put(&self, bucket: &str, request_key: &str, response: &CachedResponse) -> Result<()> {
        self.write_entries(bucket, [(request_key, response)])
    }

    /// Store every entry or none of them.
    pub fn put_all(&self, bucket: &str, entries: &[(String, CachedResponse)]) -> Result<()> {
        self.write_entries(
            bucket,
            entries.iter().map(|(key, response)| (key.as_str(), response)),
        )
    }

    fn write_entries<'a, I>(&self, bucket: &str, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'a str, &'a CachedResponse)>,
    {
        validate_bucket_name(bucket)?;
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO cache_buckets (name, created_at) VALUES (?1, ?2)",
            params![bucket, Local::now().to_rfc3339()],
        )?;
        for (key, response) in entries {
            let key = normalize_request_key(key)?;
            let headers =
                serde_json::to_string(&response.headers).context("failed to encode headers")?;
            tx.execute(
                "INSERT INTO cache_entries (bucket, request_key, status, headers, body, cached_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(bucket, request_key) DO UPDATE SET status = excluded.status,
                 headers = excluded.headers, body = excluded.body, cached_at = excluded.cached_at",
                params![
                    bucket,
                    key,
                    response.status,
                    headers,
                    response.body,
                    response.cached_at
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Look up a request in a bucket.
    pub fn match_entry(&self, bucket: &str, request_key: &str) -> Result<Option<CachedResponse>> {
        let row: Option<(u16, String, Vec<u8>, String)> = self
            .conn
            .query_row(
                "SELECT status, headers, body, cached_at FROM cache_entries
                 WHERE bucket = ?1 AND request_key = ?2",
                params![bucket, request_key],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        match row {
            Some((status, headers, body, cached_at)) => {
                let headers: Vec<(String, String)> =
                    serde_json::from_str(&headers).context("cached headers are corrupt")?;
                Ok(Some(CachedResponse {
                    status,
                    headers,
                    body,
                    cached_at,
                }))
            }
            None => Ok(None),
        }
    }

    pub fn delete_entry(&self, bucket: &str, request_key: &str) -> Result<bool> {
        let removed = self.conn.execute(
            "DELETE FROM cache_entries WHERE bucket = ?1 AND request_key = ?2",
            params![bucket, request_key],
        )?;
        Ok(removed > 0)
    }

    pub fn keys(&self, bucket: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT request_key FROM cache_entries WHERE bucket = ?1 ORDER BY request_key",
        )?;
        let keys = stmt
            .query_map(params![bucket], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(keys)
    }

    pub fn list_buckets(&self) -> Result<Vec<BucketSummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT b.name, b.created_at, COUNT(e.request_key), COALESCE(SUM(LENGTH(e.body)), 0)
             FROM cache_buckets b
             LEFT JOIN cache_entries e ON e.bucket = b.name
             GROUP BY b.name
             ORDER BY b.created_at, b.name",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(BucketSummary {
                name: row.get(0)?,
                created_at: row.get(1)?,
                entries: row.get(2)?,
                bytes: row.get(3)?,
            })
        })?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn list_entries(&self, bucket: &str) -> Result<Vec<CacheEntrySummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT request_key, status, headers, LENGTH(body), cached_at
             FROM cache_entries WHERE bucket = ?1 ORDER BY request_key",
        )?;
        let rows = stmt.query_map(params![bucket], |row| {
            let headers: String = row.get(2)?;
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, u16>(1)?,
                headers,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        let mut results = Vec::new();
        for row in rows {
            let (request_key, status, headers, bytes, cached_at) = row?;
            let headers: Vec<(String, String)> =
                serde_json::from_str(&headers).context("cached headers are corrupt")?;
            let content_type = headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
                .map(|(_, v)| v.clone());
            results.push(CacheEntrySummary {
                request_key,
                status,
                content_type,
                bytes,
                cached_at,
            });
        }
        Ok(results)
    }
}
