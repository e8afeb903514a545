//! The relational half of the hybrid store: a single `manifest` table plus a
//! one-row `meta` table recording the [`StorageType`] the directory was created
//! with, so a later open with a mismatched type can be rejected instead of
//! silently corrupting the store.

use rusqlite::{params, Connection, OptionalExtension};

use crate::config::EVICTION_BATCH_SIZE;
use crate::error::{IndexError, IndexResult};
use crate::item::{Item, ItemInfo, StorageType};

pub(crate) struct SqliteIndex {
    conn: Connection,
}

/// A candidate for LRU eviction: just enough to delete the row and, if
/// external, the blob behind it.
pub(crate) struct EvictionCandidate {
    pub key: String,
    pub filename: Option<String>,
}

impl SqliteIndex {
    pub fn open(path: &std::path::Path, storage_type: StorageType) -> IndexResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS manifest (
                key TEXT PRIMARY KEY NOT NULL,
                filename TEXT,
                size INTEGER NOT NULL,
                inline_data BLOB,
                mod_time INTEGER NOT NULL,
                access_time INTEGER NOT NULL,
                extended_data BLOB
            );
            CREATE INDEX IF NOT EXISTS idx_manifest_access_time ON manifest(access_time);
            CREATE INDEX IF NOT EXISTS idx_manifest_size ON manifest(size);
            CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY NOT NULL, value TEXT NOT NULL);
            "#,
        )?;

        let index = Self { conn };
        index.reconcile_storage_type(storage_type)?;
        Ok(index)
    }

    fn reconcile_storage_type(&self, storage_type: StorageType) -> IndexResult<()> {
        let want = type_tag(storage_type);
        let existing: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'storage_type'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(got) if got != want => Err(IndexError::TypeMismatch),
            Some(_) => Ok(()),
            None => {
                self.conn.execute(
                    "INSERT INTO meta (key, value) VALUES ('storage_type', ?1)",
                    params![want],
                )?;
                Ok(())
            }
        }
    }

    pub fn upsert(&self, item: &Item) -> IndexResult<()> {
        self.conn.execute(
            r#"
            INSERT INTO manifest (key, filename, size, inline_data, mod_time, access_time, extended_data)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(key) DO UPDATE SET
                filename = excluded.filename,
                size = excluded.size,
                inline_data = excluded.inline_data,
                mod_time = excluded.mod_time,
                access_time = excluded.access_time,
                extended_data = excluded.extended_data
            "#,
            params![
                item.key,
                item.filename,
                item.size,
                if item.filename.is_none() { Some(item.value.as_slice()) } else { None },
                item.mod_time,
                item.access_time,
                item.extended_data.as_deref(),
            ],
        )?;
        Ok(())
    }

    /// Filename of the row previously stored under `key`, if the key already existed.
    pub fn filename_for(&self, key: &str) -> IndexResult<Option<Option<String>>> {
        self.conn
            .query_row(
                "SELECT filename FROM manifest WHERE key = ?1",
                params![key],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()
            .map_err(IndexError::from)
    }

    pub fn touch_access_time(&self, key: &str, now: i64) -> IndexResult<()> {
        self.conn.execute(
            "UPDATE manifest SET access_time = ?1 WHERE key = ?2",
            params![now, key],
        )?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> IndexResult<Option<Item>> {
        self.conn
            .query_row(
                "SELECT key, filename, size, inline_data, mod_time, access_time, extended_data
                 FROM manifest WHERE key = ?1",
                params![key],
                row_to_item,
            )
            .optional()
            .map_err(IndexError::from)
    }

    pub fn get_info(&self, key: &str) -> IndexResult<Option<ItemInfo>> {
        self.conn
            .query_row(
                "SELECT key, filename, size, mod_time, access_time FROM manifest WHERE key = ?1",
                params![key],
                row_to_item_info,
            )
            .optional()
            .map_err(IndexError::from)
    }

    pub fn exists(&self, key: &str) -> IndexResult<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM manifest WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn count(&self) -> IndexResult<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM manifest", [], |row| row.get(0))?)
    }

    pub fn total_size(&self) -> IndexResult<i64> {
        Ok(self.conn.query_row(
            "SELECT COALESCE(SUM(size), 0) FROM manifest",
            [],
            |row| row.get(0),
        )?)
    }

    pub fn remove(&self, key: &str) -> IndexResult<Option<String>> {
        let filename: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT filename FROM manifest WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        self.conn
            .execute("DELETE FROM manifest WHERE key = ?1", params![key])?;
        Ok(filename.flatten())
    }

    /// Filenames deleted by a `size > S` sweep, for the caller to unlink.
    pub fn remove_larger_than(&self, size: i64) -> IndexResult<Vec<String>> {
        let filenames = self.collect_filenames("SELECT filename FROM manifest WHERE size > ?1 AND filename IS NOT NULL", size)?;
        self.conn
            .execute("DELETE FROM manifest WHERE size > ?1", params![size])?;
        Ok(filenames)
    }

    pub fn remove_earlier_than(&self, time: i64) -> IndexResult<Vec<String>> {
        let filenames = self.collect_filenames(
            "SELECT filename FROM manifest WHERE access_time < ?1 AND filename IS NOT NULL",
            time,
        )?;
        self.conn
            .execute("DELETE FROM manifest WHERE access_time < ?1", params![time])?;
        Ok(filenames)
    }

    fn collect_filenames(&self, sql: &str, bound: i64) -> IndexResult<Vec<String>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params![bound], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// One eviction batch: the `EVICTION_BATCH_SIZE` oldest-by-`access_time` rows
    /// (ties broken by rowid, i.e. insertion order), deleted inside a single
    /// transaction. Returns the candidates so the caller can unlink blobs.
    pub fn evict_batch(&mut self) -> IndexResult<Vec<EvictionCandidate>> {
        let tx = self.conn.transaction()?;
        let victims = {
            let mut stmt = tx.prepare(
                "SELECT key, filename FROM manifest ORDER BY access_time ASC, rowid ASC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![EVICTION_BATCH_SIZE as i64], |row| {
                Ok(EvictionCandidate {
                    key: row.get(0)?,
                    filename: row.get(1)?,
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            out
        };

        {
            let mut stmt = tx.prepare("DELETE FROM manifest WHERE key = ?1")?;
            for victim in &victims {
                stmt.execute(params![victim.key])?;
            }
        }

        tx.commit()?;
        Ok(victims)
    }

    /// `(key, filename)` for every row with an external blob, for the
    /// startup orphan-row scan.
    pub fn external_rows(&self) -> IndexResult<Vec<(String, String)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, filename FROM manifest WHERE filename IS NOT NULL")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn all_filenames(&self) -> IndexResult<std::collections::HashSet<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT filename FROM manifest WHERE filename IS NOT NULL")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = std::collections::HashSet::new();
        for row in rows {
            out.insert(row?);
        }
        Ok(out)
    }

    pub fn remove_missing_blob_row(&self, key: &str) -> IndexResult<()> {
        self.conn
            .execute("DELETE FROM manifest WHERE key = ?1", params![key])?;
        Ok(())
    }

    pub fn all_keys(&self) -> IndexResult<Vec<String>> {
        let mut stmt = self.conn.prepare("SELECT key FROM manifest")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn remove_keys_batch(&mut self, keys: &[String]) -> IndexResult<Vec<Option<String>>> {
        let tx = self.conn.transaction()?;
        let mut filenames = Vec::with_capacity(keys.len());
        {
            let mut select = tx.prepare("SELECT filename FROM manifest WHERE key = ?1")?;
            let mut delete = tx.prepare("DELETE FROM manifest WHERE key = ?1")?;
            for key in keys {
                let filename: Option<Option<String>> =
                    select.query_row(params![key], |row| row.get(0)).optional()?;
                filenames.push(filename.flatten());
                delete.execute(params![key])?;
            }
        }
        tx.commit()?;
        Ok(filenames)
    }
}

fn type_tag(t: StorageType) -> &'static str {
    match t {
        StorageType::File => "file",
        StorageType::Sqlite => "sqlite",
        StorageType::Mixed => "mixed",
    }
}

fn row_to_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<Item> {
    let filename: Option<String> = row.get(1)?;
    let inline_data: Option<Vec<u8>> = row.get(3)?;
    Ok(Item {
        key: row.get(0)?,
        filename,
        size: row.get(2)?,
        value: inline_data.unwrap_or_default(),
        mod_time: row.get(4)?,
        access_time: row.get(5)?,
        extended_data: row.get(6)?,
    })
}

fn row_to_item_info(row: &rusqlite::Row<'_>) -> rusqlite::Result<ItemInfo> {
    Ok(ItemInfo {
        key: row.get(0)?,
        filename: row.get(1)?,
        size: row.get(2)?,
        mod_time: row.get(3)?,
        access_time: row.get(4)?,
    })
}
