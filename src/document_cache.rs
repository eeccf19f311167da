//! SQLite cache of fetched reference documents, so interrupted runs resume
//! without re-fetching pages that were already retrieved.

use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::PipelineError;

pub struct DocumentCache {
    conn: Connection,
    ttl: Duration,
}

impl DocumentCache {
    pub fn open(path: &Path, ttl: Duration) -> Result<Self, PipelineError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                // Connection::open reports the missing directory if this fails.
                let _ = std::fs::create_dir_all(parent);
            }
        }
        let conn = Connection::open(path)?;
        let cache = Self { conn, ttl };
        cache.initialize_schema()?;
        Ok(cache)
    }

    #[cfg(test)]
    pub fn open_in_memory(ttl: Duration) -> Result<Self, PipelineError> {
        let cache = Self {
            conn: Connection::open_in_memory()?,
            ttl,
        };
        cache.initialize_schema()?;
        Ok(cache)
    }

    fn initialize_schema(&self) -> Result<(), rusqlite::Error> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS documents (
                url TEXT PRIMARY KEY,
                body TEXT NOT NULL,
                fetched_at_ms INTEGER NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    fn now_unix_ms() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_millis() as i64)
            .unwrap_or(0)
    }

    fn oldest_fresh_ms(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.ttl.as_millis() as i64)
    }

    /// Returns the cached body for `url` if it is younger than the TTL.
    pub fn get(&self, url: &str) -> Result<Option<String>, PipelineError> {
        self.get_at(url, Self::now_unix_ms())
    }

    fn get_at(&self, url: &str, now_ms: i64) -> Result<Option<String>, PipelineError> {
        let body = self
            .conn
            .query_row(
                "SELECT body FROM documents WHERE url = ?1 AND fetched_at_ms >= ?2",
                params![url, self.oldest_fresh_ms(now_ms)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(body)
    }

    pub fn put(&self, url: &str, body: &str) -> Result<(), PipelineError> {
        self.put_at(url, body, Self::now_unix_ms())
    }

    fn put_at(&self, url: &str, body: &str, now_ms: i64) -> Result<(), PipelineError> {
        self.conn.execute(
            "INSERT INTO documents (url, body, fetched_at_ms) VALUES (?1, ?2, ?3)
             ON CONFLICT(url) DO UPDATE SET body = excluded.body, fetched_at_ms = excluded.fetched_at_ms",
            params![url, body, now_ms],
        )?;
        Ok(())
    }

    /// Deletes stale rows and returns how many were removed.
    pub fn prune_expired(&self) -> Result<usize, PipelineError> {
        self.prune_expired_at(Self::now_unix_ms())
    }

    fn prune_expired_at(&self, now_ms: i64) -> Result<usize, PipelineError> {
        let removed = self.conn.execute(
            "DELETE FROM documents WHERE fetched_at_ms < ?1",
            params![self.oldest_fresh_ms(now_ms)],
        )?;
        Ok(removed)
    }
}
