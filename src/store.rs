//! SQLite-backed snapshot store.
//!
//! ## Layout
//!
//! One table, `market_snapshots`, keyed by `(item_id, platform, timestamp)`.
//! Timestamps are hour-truncated epoch seconds, so re-running a cycle within
//! the same hour collides on the primary key and `INSERT OR IGNORE` makes the
//! append a no-op. Rows are never updated after insert.
//!
//! ## Migrations
//!
//! Schema files live in a directory of numbered `.sql` scripts applied in
//! lexical order at open time. Scripts must stay re-runnable
//! (`CREATE TABLE IF NOT EXISTS` and friends).

use crate::error::Result;
use crate::types::{MarketSnapshot, Platform};
use log::{debug, info};
use rusqlite::{params, Connection};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Apply all `.sql` files from `schema_dir` in sorted order.
pub fn run_schema_migrations(conn: &Connection, schema_dir: &str) -> Result<()> {
    let mut scripts: Vec<_> = fs::read_dir(schema_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().map(|ext| ext == "sql").unwrap_or(false))
        .collect();
    scripts.sort();

    for script in &scripts {
        let sql = fs::read_to_string(script)?;
        conn.execute_batch(&sql)?;
        debug!("🔧 Applied schema script: {}", script.display());
    }

    info!("🔧 Schema up to date ({} scripts)", scripts.len());
    Ok(())
}

/// Handle to the snapshot database, cheaply cloneable across tasks.
#[derive(Clone)]
pub struct SnapshotStore {
    conn: Arc<Mutex<Connection>>,
}

impl SnapshotStore {
    /// Open (creating if needed) the database at `db_path` and bring the
    /// schema up to date from `schema_dir`.
    pub fn open(db_path: &str, schema_dir: &str) -> Result<Self> {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        run_schema_migrations(&conn, schema_dir)?;

        info!("📊 Snapshot store ready at {}", db_path);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Append a batch of snapshots, ignoring rows whose key already exists.
    ///
    /// Returns the number of rows actually inserted.
    pub fn append(&self, rows: &[MarketSnapshot]) -> Result<usize> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO market_snapshots
                 (item_id, platform, timestamp, sell_price, buy_price, volume)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for row in rows {
                inserted += stmt.execute(params![
                    row.item_id,
                    row.platform.code(),
                    row.timestamp,
                    row.sell_price,
                    row.buy_price,
                    row.volume,
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Fetch one item/platform series at and after `since`, oldest first.
    pub fn series(
        &self,
        item_id: i64,
        platform: Platform,
        since: i64,
    ) -> Result<Vec<MarketSnapshot>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT timestamp, sell_price, buy_price, volume
             FROM market_snapshots
             WHERE item_id = ?1 AND platform = ?2 AND timestamp >= ?3
             ORDER BY timestamp ASC",
        )?;
        let rows = stmt.query_map(params![item_id, platform.code(), since], |row| {
            Ok(MarketSnapshot {
                item_id,
                platform,
                timestamp: row.get(0)?,
                sell_price: row.get(1)?,
                buy_price: row.get(2)?,
                volume: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Most recent snapshot timestamp for one item/platform, if any.
    pub fn latest_timestamp(&self, item_id: i64, platform: Platform) -> Result<Option<i64>> {
        let conn = self.conn.lock().unwrap();
        let ts = conn.query_row(
            "SELECT MAX(timestamp) FROM market_snapshots
             WHERE item_id = ?1 AND platform = ?2",
            params![item_id, platform.code()],
            |row| row.get::<_, Option<i64>>(0),
        )?;
        Ok(ts)
    }

    /// Distinct item ids present in the store, ascending.
    pub fn item_ids(&self) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT DISTINCT item_id FROM market_snapshots ORDER BY item_id ASC")?;
        let ids = stmt.query_map([], |row| row.get(0))?;
        Ok(ids.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Delete snapshots strictly older than `cutoff`. Returns rows removed.
    pub fn prune_older_than(&self, cutoff: i64) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute(
            "DELETE FROM market_snapshots WHERE timestamp < ?1",
            params![cutoff],
        )?;
        if removed > 0 {
            info!("📊 Pruned {} snapshots older than {}", removed, cutoff);
        }
        Ok(removed)
    }
}
