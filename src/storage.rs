//! Recent searches
//!
//! Bounded, most-recent-first list of tokens the user looked up. Recording an
//! address already in the list moves it to the front.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::collections::VecDeque;
use tracing::info;

use crate::models::RecentSearch;

pub const DEFAULT_RECENT_LIMIT: usize = 10;

pub trait RecentSearchStore: Send + Sync {
    /// Most recent first.
    fn load(&self) -> Result<Vec<RecentSearch>>;

    fn record(&self, search: RecentSearch) -> Result<()>;

    fn clear(&self) -> Result<()>;
}

/// SQLite-backed store. Opens a connection per call.
pub struct SqliteRecentSearches {
    db_path: String,
    limit: usize,
}

impl SqliteRecentSearches {
    pub fn new(db_path: &str, limit: usize) -> Result<Self> {
        let store = Self {
            db_path: db_path.to_string(),
            limit: limit.max(1),
        };
        store.init_db()?;
        info!(db_path, "recent searches store ready");
        Ok(store)
    }

    fn open(&self) -> Result<Connection> {
        Connection::open(&self.db_path)
            .with_context(|| format!("Failed to open recent searches db at {}", self.db_path))
    }

    fn init_db(&self) -> Result<()> {
        let conn = self.open()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS recent_searches (
                address TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                seq INTEGER NOT NULL
            )",
            [],
        )
        .context("Failed to create recent_searches table")?;
        Ok(())
    }
}

impl RecentSearchStore for SqliteRecentSearches {
    fn load(&self) -> Result<Vec<RecentSearch>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT address, name FROM recent_searches ORDER BY seq DESC LIMIT ?1",
        )?;

        let rows = stmt.query_map(params![self.limit as i64], |row| {
            Ok(RecentSearch {
                address: row.get(0)?,
                name: row.get(1)?,
            })
        })?;

        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read recent searches")
    }

    fn record(&self, search: RecentSearch) -> Result<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT OR REPLACE INTO recent_searches (address, name, seq)
             VALUES (?1, ?2, (SELECT COALESCE(MAX(seq), 0) + 1 FROM recent_searches))",
            params![search.address, search.name],
        )
        .context("Failed to record recent search")?;

        tx.execute(
            "DELETE FROM recent_searches WHERE address NOT IN (
                SELECT address FROM recent_searches ORDER BY seq DESC LIMIT ?1
            )",
            params![self.limit as i64],
        )
        .context("Failed to trim recent searches")?;

        tx.commit()?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let conn = self.open()?;
        conn.execute("DELETE FROM recent_searches", [])
            .context("Failed to clear recent searches")?;
        Ok(())
    }
}

/// In-process store for headless runs and tests.
pub struct MemoryRecentSearches {
    entries: Mutex<VecDeque<RecentSearch>>,
    limit: usize,
}

impl Default for MemoryRecentSearches {
    fn default() -> Self {
        Self::new(DEFAULT_RECENT_LIMIT)
    }
}

impl MemoryRecentSearches {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            limit: limit.max(1),
        }
    }
}

impl RecentSearchStore for MemoryRecentSearches {
    fn load(&self) -> Result<Vec<RecentSearch>> {
        Ok(self.entries.lock().iter().cloned().collect())
    }

    fn record(&self, search: RecentSearch) -> Result<()> {
        let mut entries = self.entries.lock();
        entries.retain(|s| s.address != search.address);
        entries.push_front(search);
        entries.truncate(self.limit);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.entries.lock().clear();
        Ok(())
    }
}
