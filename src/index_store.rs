//! Index Store — relational persistence of members, parent folders,
//! versions, archive stats, and compression seek tables.
//!
//! Backed by `rusqlite` with a bundled SQLite (no system library
//! dependency). During creation the connection runs with exclusive
//! locking and no journaling/synchronous durability — a crash mid-scan is
//! expected to leave an unloadable index, which [`crate::lifecycle`]
//! detects and recreates. Once finalized, the store is opened read-only
//! (`query_only=ON`).

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::Result;

pub const INDEX_VERSION_NAME: &str = "tarfs-index";
pub const INDEX_MAJOR: i64 = 1;
pub const INDEX_MINOR: i64 = 0;
pub const INDEX_PATCH: i64 = 0;

/// One row of the `files` table — see `spec.md` §3's Member record.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberRecord {
    pub path: String,
    pub name: String,
    pub offset_header: i64,
    pub offset_data: i64,
    pub size: i64,
    pub mtime: i64,
    pub mode: i64,
    pub type_: i64,
    pub linkname: String,
    pub uid: i64,
    pub gid: i64,
    pub is_tar: bool,
    pub is_sparse: bool,
}

fn member_from_row(row: &Row) -> rusqlite::Result<MemberRecord> {
    Ok(MemberRecord {
        path: row.get(0)?,
        name: row.get(1)?,
        offset_header: row.get(2)?,
        offset_data: row.get(3)?,
        size: row.get(4)?,
        mtime: row.get(5)?,
        mode: row.get(6)?,
        type_: row.get(7)?,
        linkname: row.get(8)?,
        uid: row.get(9)?,
        gid: row.get(10)?,
        is_tar: row.get::<_, i64>(11)? != 0,
        is_sparse: row.get::<_, i64>(12)? != 0,
    })
}

const MEMBER_COLUMNS: &str =
    "path, name, offset_header, offset_data, size, mtime, mode, type, linkname, uid, gid, is_tar, is_sparse";

/// Snapshot of the on-disk archive's size/mtime at index-creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveStats {
    pub st_size: i64,
    pub st_mtime: i64,
}

#[derive(Debug, Clone)]
pub struct VersionRecord {
    pub name: String,
    pub version: String,
    pub major: i64,
    pub minor: i64,
    pub patch: i64,
}

pub struct IndexStore {
    conn: Connection,
}

impl IndexStore {
    /// Opens (or creates) the database at `path` tuned for a fast bulk
    /// write phase. Callers must still call [`IndexStore::create_schema`]
    /// before inserting if this is a brand-new file.
    pub fn open_for_write(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "locking_mode", "EXCLUSIVE")?;
        conn.pragma_update(None, "journal_mode", "OFF")?;
        conn.pragma_update(None, "synchronous", "OFF")?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        Ok(Self { conn })
    }

    /// Opens an existing database for read-only serving.
    pub fn open_for_read(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "query_only", "ON")?;
        Ok(Self { conn })
    }

    pub fn table_exists(&self, name: &str) -> Result<bool> {
        let exists: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type='table' AND name=?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    /// Creates `files`, `files_tmp`, `parent_folders`, `versions`, and
    /// `metadata`. Callers must have already verified none of these exist
    /// with rows, per `spec.md` §4.4 step 1.
    pub fn create_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS files (
                path TEXT, name TEXT,
                offset_header INTEGER, offset_data INTEGER,
                size INTEGER, mtime INTEGER, mode INTEGER, type INTEGER,
                linkname TEXT, uid INTEGER, gid INTEGER,
                is_tar INTEGER, is_sparse INTEGER,
                PRIMARY KEY (path, name)
            );
            CREATE TABLE IF NOT EXISTS files_tmp (
                path TEXT, name TEXT,
                offset_header INTEGER, offset_data INTEGER,
                size INTEGER, mtime INTEGER, mode INTEGER, type INTEGER,
                linkname TEXT, uid INTEGER, gid INTEGER,
                is_tar INTEGER, is_sparse INTEGER
            );
            CREATE TABLE IF NOT EXISTS parent_folders (
                path TEXT, name TEXT,
                PRIMARY KEY (path, name)
            );
            CREATE TABLE IF NOT EXISTS versions (
                name TEXT, version TEXT, major INTEGER, minor INTEGER, patch INTEGER
            );
            CREATE TABLE IF NOT EXISTS metadata (
                key TEXT PRIMARY KEY, value TEXT
            );
            ",
        )?;
        Ok(())
    }

    pub fn insert_tmp(&self, m: &MemberRecord) -> Result<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO files_tmp ({MEMBER_COLUMNS}) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)"
            ),
            params![
                m.path, m.name, m.offset_header, m.offset_data, m.size, m.mtime, m.mode,
                m.type_, m.linkname, m.uid, m.gid, m.is_tar as i64, m.is_sparse as i64
            ],
        )?;
        Ok(())
    }

    pub fn insert_parent_folder(&self, path: &str, name: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO parent_folders (path, name) VALUES (?1, ?2)",
            params![path, name],
        )?;
        Ok(())
    }

    /// Step 4 of the indexing algorithm: bulk-copy `files_tmp` into `files`
    /// sorted by `(path, name, rowid)`, drop the temp table, then
    /// synthesize directory rows for any `parent_folders` entry with no
    /// explicit row in `files`.
    pub fn finalize_files(&self) -> Result<()> {
        self.conn.execute_batch(&format!(
            "
            INSERT OR REPLACE INTO files ({MEMBER_COLUMNS})
                SELECT {MEMBER_COLUMNS} FROM files_tmp ORDER BY path, name, rowid;
            DROP TABLE files_tmp;
            INSERT OR IGNORE INTO files (path, name, offset_header, offset_data, size, mtime, mode, type, linkname, uid, gid, is_tar, is_sparse)
                SELECT path, name, 0, 0, 0, 0, {synth_mode}, {dir_type}, '', 0, 0, 0, 0
                FROM parent_folders
                ORDER BY path, name;
            DROP TABLE parent_folders;
            ",
            synth_mode = 0o555 | 0o040000i64,
            dir_type = crate::tar_scanner::TYPE_DIR as i64,
        ))?;
        Ok(())
    }

    pub fn insert_version(&self, v: &VersionRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO versions (name, version, major, minor, patch) VALUES (?1,?2,?3,?4,?5)",
            params![v.name, v.version, v.major, v.minor, v.patch],
        )?;
        Ok(())
    }

    pub fn load_index_version(&self) -> Result<Option<VersionRecord>> {
        self.conn
            .query_row(
                "SELECT name, version, major, minor, patch FROM versions WHERE name = ?1",
                params![INDEX_VERSION_NAME],
                |row| {
                    Ok(VersionRecord {
                        name: row.get(0)?,
                        version: row.get(1)?,
                        major: row.get(2)?,
                        minor: row.get(3)?,
                        patch: row.get(4)?,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row("SELECT value FROM metadata WHERE key = ?1", params![key], |row| row.get(0))
            .optional()
            .map_err(Into::into)
    }

    pub fn store_archive_stats(&self, stats: ArchiveStats) -> Result<()> {
        self.set_metadata("tarstats_size", &stats.st_size.to_string())?;
        self.set_metadata("tarstats_mtime", &stats.st_mtime.to_string())?;
        Ok(())
    }

    pub fn load_archive_stats(&self) -> Result<Option<ArchiveStats>> {
        let size = self.get_metadata("tarstats_size")?;
        let mtime = self.get_metadata("tarstats_mtime")?;
        match (size, mtime) {
            (Some(s), Some(m)) => Ok(Some(ArchiveStats {
                st_size: s.parse().unwrap_or_default(),
                st_mtime: m.parse().unwrap_or_default(),
            })),
            _ => Ok(None),
        }
    }

    pub fn stat(&self, path: &str, name: &str) -> Result<Option<MemberRecord>> {
        self.conn
            .query_row(
                &format!("SELECT {MEMBER_COLUMNS} FROM files WHERE path = ?1 AND name = ?2"),
                params![path, name],
                member_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Looks up the most recently inserted `files_tmp` row for `(path,
    /// name)` — `files` is only populated once `finalize_files` runs, so a
    /// scan still in progress (recursing into nested archives) must read
    /// its own not-yet-finalized rows back through here instead of `stat`.
    pub fn stat_tmp(&self, path: &str, name: &str) -> Result<Option<MemberRecord>> {
        self.conn
            .query_row(
                &format!("SELECT {MEMBER_COLUMNS} FROM files_tmp WHERE path = ?1 AND name = ?2 ORDER BY rowid DESC LIMIT 1"),
                params![path, name],
                member_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn list_dir(&self, path: &str) -> Result<Vec<MemberRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {MEMBER_COLUMNS} FROM files WHERE path = ?1 ORDER BY name"))?;
        let rows = stmt
            .query_map(params![path], member_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Persists a bzip2 block-offset seek table.
    pub fn store_bzip2_table(&self, entries: &[(u64, u64)]) -> Result<()> {
        self.conn.execute_batch("CREATE TABLE IF NOT EXISTS bzip2blocks (block_offset INTEGER PRIMARY KEY, data_offset INTEGER)")?;
        for &(block_offset, data_offset) in entries {
            self.conn.execute(
                "INSERT OR REPLACE INTO bzip2blocks (block_offset, data_offset) VALUES (?1, ?2)",
                params![block_offset as i64, data_offset as i64],
            )?;
        }
        Ok(())
    }

    pub fn load_bzip2_table(&self) -> Result<Option<Vec<(u64, u64)>>> {
        if !self.table_exists("bzip2blocks")? {
            return Ok(None);
        }
        let mut stmt = self
            .conn
            .prepare("SELECT block_offset, data_offset FROM bzip2blocks ORDER BY block_offset")?;
        let rows = stmt
            .query_map([], |row| {
                let b: i64 = row.get(0)?;
                let d: i64 = row.get(1)?;
                Ok((b as u64, d as u64))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(Some(rows))
    }

    /// Persists an opaque gzip seek-table blob.
    pub fn store_gzip_index(&self, blob: &[u8]) -> Result<()> {
        self.conn
            .execute_batch("CREATE TABLE IF NOT EXISTS gzip_index (data BLOB)")?;
        self.conn.execute("DELETE FROM gzip_index", [])?;
        self.conn
            .execute("INSERT INTO gzip_index (data) VALUES (?1)", params![blob])?;
        Ok(())
    }

    pub fn load_gzip_index(&self) -> Result<Option<Vec<u8>>> {
        if !self.table_exists("gzip_index")? {
            return Ok(None);
        }
        self.conn
            .query_row("SELECT data FROM gzip_index LIMIT 1", [], |row| row.get(0))
            .optional()
            .map_err(Into::into)
    }

    pub fn close(self) -> Result<()> {
        self.conn
            .close()
            .map_err(|(_, e)| e.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn sample(path: &str, name: &str) -> MemberRecord {
        MemberRecord {
            path: path.to_string(),
            name: name.to_string(),
            offset_header: 0,
            offset_data: 512,
            size: 10,
            mtime: 0,
            mode: 0o100644,
            type_: b'0' as i64,
            linkname: String::new(),
            uid: 0,
            gid: 0,
            is_tar: false,
            is_sparse: false,
        }
    }

    #[test]
    fn insert_and_stat_round_trips() {
        let tmp = NamedTempFile::new().unwrap();
        let store = IndexStore::open_for_write(tmp.path()).unwrap();
        store.create_schema().unwrap();
        store.insert_tmp(&sample("", "a.txt")).unwrap();
        store.finalize_files().unwrap();

        let found = store.stat("", "a.txt").unwrap().unwrap();
        assert_eq!(found.size, 10);
    }

    #[test]
    fn parent_folders_synthesize_missing_directories() {
        let tmp = NamedTempFile::new().unwrap();
        let store = IndexStore::open_for_write(tmp.path()).unwrap();
        store.create_schema().unwrap();
        store.insert_tmp(&sample("/dir", "b.txt")).unwrap();
        store.insert_parent_folder("", "dir").unwrap();
        store.finalize_files().unwrap();

        let dir = store.stat("", "dir").unwrap().unwrap();
        assert_eq!(dir.mode, 0o555 | 0o040000);
    }

    #[test]
    fn list_dir_orders_by_name() {
        let tmp = NamedTempFile::new().unwrap();
        let store = IndexStore::open_for_write(tmp.path()).unwrap();
        store.create_schema().unwrap();
        store.insert_tmp(&sample("", "b.txt")).unwrap();
        store.insert_tmp(&sample("", "a.txt")).unwrap();
        store.finalize_files().unwrap();

        let names: Vec<String> = store.list_dir("").unwrap().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["a.txt".to_string(), "b.txt".to_string()]);
    }
}
