use std::{path::Path, time::SystemTime};

use anyhow::{Context, Result};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection, OptionalExtension};

use super::{from_secs, to_secs};
use crate::item::{Delta, Flag, Stats};

/// One row of `items`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub id: i64,
    pub parent_id: Option<i64>,
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub usage: u64,
    pub mtime: SystemTime,
    pub item_count: u64,
    pub inode: u64,
    pub flag: Flag,
}

impl Row {
    pub fn stats(&self) -> Stats {
        Stats {
            items: self.item_count,
            size: self.size,
            usage: self.usage,
        }
    }

    fn from_sql(r: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let flag: String = r.get(9)?;
        Ok(Self {
            id: r.get(0)?,
            parent_id: r.get(1)?,
            name: r.get(2)?,
            is_dir: r.get(3)?,
            size: r.get::<_, i64>(4)? as u64,
            usage: r.get::<_, i64>(5)? as u64,
            mtime: from_secs(r.get(6)?),
            item_count: r.get::<_, i64>(7)? as u64,
            inode: r.get::<_, i64>(8)? as u64,
            flag: flag
                .chars()
                .next()
                .and_then(Flag::from_char)
                .unwrap_or_default(),
        })
    }
}

const COLUMNS: &str = "id, parent_id, name, is_dir, size, usage, mtime, item_count, inode, flag";

/// SQLite store: one connection guarded by a mutex.
pub struct SqlStore {
    conn: Mutex<Connection>,
}

impl SqlStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("open database {}", path.display()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA synchronous = OFF;
             PRAGMA journal_mode = MEMORY;
             PRAGMA foreign_keys = ON;",
        )?;
        conn.execute_batch(include_str!("schema.sql"))?;
        log::debug!("SQLite schema initialized");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    pub fn begin(&self) -> Result<()> {
        self.lock().execute_batch("BEGIN")?;
        Ok(())
    }

    pub fn commit(&self) -> Result<()> {
        self.lock().execute_batch("COMMIT")?;
        Ok(())
    }

    pub fn rollback(&self) -> Result<()> {
        self.lock().execute_batch("ROLLBACK")?;
        Ok(())
    }

    pub fn is_empty(&self) -> Result<bool> {
        let n: i64 = self
            .lock()
            .query_row("SELECT COUNT(*) FROM items", [], |r| r.get(0))?;
        Ok(n == 0)
    }

    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.lock().execute(
            "INSERT INTO metadata(key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn meta(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .lock()
            .query_row("SELECT value FROM metadata WHERE key = ?1", [key], |r| {
                r.get(0)
            })
            .optional()?)
    }

    pub fn row(&self, id: i64) -> Result<Option<Row>> {
        Ok(self
            .lock()
            .query_row(
                &format!("SELECT {COLUMNS} FROM items WHERE id = ?1"),
                [id],
                Row::from_sql,
            )
            .optional()?)
    }

    pub fn root(&self) -> Result<Option<Row>> {
        Ok(self
            .lock()
            .query_row(
                &format!("SELECT {COLUMNS} FROM items WHERE parent_id IS NULL ORDER BY id LIMIT 1"),
                [],
                Row::from_sql,
            )
            .optional()?)
    }

    pub fn children(&self, id: i64) -> Result<Vec<Row>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {COLUMNS} FROM items WHERE parent_id = ?1 ORDER BY name"
        ))?;
        let rows = stmt
            .query_map([id], Row::from_sql)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn child_by_name(&self, parent: i64, name: &str) -> Result<Option<Row>> {
        Ok(self
            .lock()
            .query_row(
                &format!("SELECT {COLUMNS} FROM items WHERE parent_id = ?1 AND name = ?2"),
                params![parent, name],
                Row::from_sql,
            )
            .optional()?)
    }

    /// Insert a row and return its id.
    pub fn insert(&self, row: &Row) -> Result<i64> {
        insert_row(&self.lock(), row)
    }

    /// Delete a row; descendants go with it.
    pub fn delete(&self, id: i64) -> Result<()> {
        self.lock().execute("DELETE FROM items WHERE id = ?1", [id])?;
        Ok(())
    }

    pub fn update_aggregates(&self, id: i64, stats: Stats, mtime: SystemTime, flag: Flag) -> Result<()> {
        update_row(&self.lock(), id, stats, mtime, flag)
    }

    pub fn set_flag(&self, id: i64, flag: Flag) -> Result<()> {
        self.lock().execute(
            "UPDATE items SET flag = ?2 WHERE id = ?1",
            params![id, flag.as_char().to_string()],
        )?;
        Ok(())
    }

    /// Add `delta` to the row `id` and every ancestor.
    pub fn apply_delta_upward(&self, id: i64, delta: Delta) -> Result<()> {
        let conn = self.lock();
        let mut cur = Some(id);
        while let Some(id) = cur {
            conn.execute(
                "UPDATE items SET item_count = MAX(item_count + ?2, 0),
                                  size = MAX(size + ?3, 0),
                                  usage = MAX(usage + ?4, 0)
                 WHERE id = ?1",
                params![id, delta.items, delta.size, delta.usage],
            )?;
            cur = conn
                .query_row("SELECT parent_id FROM items WHERE id = ?1", [id], |r| {
                    r.get::<_, Option<i64>>(0)
                })
                .optional()?
                .flatten();
        }
        Ok(())
    }
}

pub(crate) fn insert_row(conn: &Connection, row: &Row) -> Result<i64> {
    conn.prepare_cached(
        "INSERT INTO items(parent_id, name, is_dir, size, usage, mtime, item_count, inode, flag)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
    )?
    .execute(params![
        row.parent_id,
        row.name,
        row.is_dir,
        row.size as i64,
        row.usage as i64,
        to_secs(row.mtime),
        row.item_count as i64,
        row.inode as i64,
        row.flag.as_char().to_string(),
    ])?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn update_row(
    conn: &Connection,
    id: i64,
    stats: Stats,
    mtime: SystemTime,
    flag: Flag,
) -> Result<()> {
    conn.prepare_cached(
        "UPDATE items SET item_count = ?2, size = ?3, usage = ?4, mtime = ?5, flag = ?6
         WHERE id = ?1",
    )?
    .execute(params![
        id,
        stats.items as i64,
        stats.size as i64,
        stats.usage as i64,
        to_secs(mtime),
        flag.as_char().to_string(),
    ])?;
    Ok(())
}

/// True if a row for `inode` already exists.
pub(crate) fn inode_seen(conn: &Connection, inode: u64) -> Result<bool> {
    Ok(conn
        .prepare_cached("SELECT 1 FROM items WHERE inode = ?1 LIMIT 1")?
        .query_row([inode as i64], |_| Ok(()))
        .optional()?
        .is_some())
}
