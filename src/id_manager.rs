//! Durable image id allocation and the per-terminal upload ledger.
//!
//! Ids live in SQLite: one table per id space (they are bit-pattern
//! disjoint, so a scan never has to filter by space) mapping
//! `id -> (description, atime)`, plus an `uploads` table keyed by
//! `(id, terminal)`. `get_id` makes allocation reproducible: the same
//! description in the same `(space, subspace)` keeps returning the same id
//! until it falls out under LRU pressure.
//!
//! Every public operation is a single transaction; cross-process safety is
//! the database's business.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, params};

use crate::errors::{Errors, Result};
use crate::id_space::{IDSpace, IDSubspace};

pub const DEFAULT_MAX_IDS_PER_SUBSPACE: u64 = 1024;

/// Random draws before falling back to ordered scanning with LRU eviction.
const RANDOM_ALLOCATION_ATTEMPTS: u32 = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IDInfo {
    pub id: u32,
    pub description: String,
    pub atime: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadInfo {
    pub id: u32,
    pub terminal: String,
    /// The id's description at the time of the upload. A later `set_id`
    /// leaves this behind, which is how stale uploads are detected.
    pub description: String,
    pub size: u64,
    pub upload_time: DateTime<Utc>,
    /// 1-based position among the terminal's uploads, newest first.
    pub uploads_ago: u64,
    /// Bytes uploaded to the terminal since this upload, inclusive.
    pub bytes_ago: u64,
}

pub struct IDManager {
    conn: Connection,
    max_ids_per_subspace: u64,
}

fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

fn from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or(DateTime::UNIX_EPOCH)
}

fn table_name(space: IDSpace) -> String {
    format!("ids_{}", space.name())
}

/// SQL condition selecting ids of `space` that lie in `subspace`.
fn subspace_condition(space: IDSpace, subspace: IDSubspace) -> String {
    let mask = i64::from(space.subspace_byte_mask());
    let (begin, end) = space.subspace_masked_range(subspace);
    format!("(id & {mask}) >= {begin} AND (id & {mask}) < {end}")
}

impl IDManager {
    /// Opens (creating if needed) the database at `path`. The `":memory:"`
    /// sentinel yields a process-local store, used by tests.
    pub fn open(path: &str) -> Result<IDManager> {
        IDManager::open_with_limit(path, DEFAULT_MAX_IDS_PER_SUBSPACE)
    }

    pub fn open_with_limit(path: &str, max_ids_per_subspace: u64) -> Result<IDManager> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(10))?;
        for space in IDSpace::all_values() {
            let table = table_name(space);
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                     id INTEGER PRIMARY KEY,
                     description TEXT NOT NULL,
                     atime INTEGER NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS {table}_description
                     ON {table} (description, atime DESC);"
            ))?;
        }
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS uploads (
                 id INTEGER NOT NULL,
                 terminal TEXT NOT NULL,
                 description TEXT NOT NULL,
                 size INTEGER NOT NULL,
                 upload_time INTEGER NOT NULL,
                 PRIMARY KEY (id, terminal)
             );
             CREATE INDEX IF NOT EXISTS uploads_terminal
                 ON uploads (terminal, upload_time DESC);",
        )?;
        Ok(IDManager {
            conn,
            max_ids_per_subspace,
        })
    }

    /// The id for `description` within `(space, subspace)`, allocating one
    /// if needed. Repeated calls return the same id (and refresh its
    /// access time) until it is evicted.
    pub fn get_id(
        &mut self,
        description: &str,
        space: IDSpace,
        subspace: IDSubspace,
    ) -> Result<u32> {
        let now = now_micros();
        let tx = self.conn.transaction()?;
        let table = table_name(space);
        let in_subspace = subspace_condition(space, subspace);

        let existing: Option<i64> = tx
            .query_row(
                &format!(
                    "SELECT id FROM {table} WHERE description = ?1 AND {in_subspace}
                     ORDER BY atime DESC LIMIT 1"
                ),
                params![description],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            tx.execute(
                &format!("UPDATE {table} SET atime = ?1 WHERE id = ?2"),
                params![now, id],
            )?;
            tx.commit()?;
            return Ok(id as u32);
        }

        let id = allocate(&tx, &table, space, subspace)?;
        tx.execute(
            &format!("INSERT OR REPLACE INTO {table} (id, description, atime) VALUES (?1, ?2, ?3)"),
            params![i64::from(id), description, now],
        )?;
        enforce_subspace_limit(&tx, &table, space, subspace, self.max_ids_per_subspace)?;
        tx.commit()?;
        Ok(id)
    }

    /// Looks an id up across all id spaces, refreshing its access time on a
    /// hit.
    pub fn get_info(&mut self, id: u32) -> Result<Option<IDInfo>> {
        let Ok(space) = IDSpace::from_id(id) else {
            return Ok(None);
        };
        let now = now_micros();
        let tx = self.conn.transaction()?;
        let table = table_name(space);
        let description: Option<String> = tx
            .query_row(
                &format!("SELECT description FROM {table} WHERE id = ?1"),
                params![i64::from(id)],
                |row| row.get(0),
            )
            .optional()?;
        let info = match description {
            Some(description) => {
                tx.execute(
                    &format!("UPDATE {table} SET atime = ?1 WHERE id = ?2"),
                    params![now, i64::from(id)],
                )?;
                Some(IDInfo {
                    id,
                    description,
                    atime: from_micros(now),
                })
            }
            None => None,
        };
        tx.commit()?;
        Ok(info)
    }

    /// Upserts a row at exactly `id`. Upload records are left alone; a
    /// changed description makes `needs_uploading` report `true`.
    pub fn set_id(&mut self, id: u32, description: &str) -> Result<()> {
        let space = IDSpace::from_id(id)?;
        let table = table_name(space);
        self.conn.execute(
            &format!("INSERT OR REPLACE INTO {table} (id, description, atime) VALUES (?1, ?2, ?3)"),
            params![i64::from(id), description, now_micros()],
        )?;
        Ok(())
    }

    /// Deletes the id and all its upload records.
    pub fn del_id(&mut self, id: u32) -> Result<()> {
        let space = IDSpace::from_id(id)?;
        let table = table_name(space);
        let tx = self.conn.transaction()?;
        delete_id(&tx, &table, i64::from(id))?;
        tx.commit()?;
        Ok(())
    }

    /// Every id stored for `(space, subspace)`, most recently used first.
    pub fn get_all(&self, space: IDSpace, subspace: IDSubspace) -> Result<Vec<IDInfo>> {
        let table = table_name(space);
        let in_subspace = subspace_condition(space, subspace);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT id, description, atime FROM {table} WHERE {in_subspace}
             ORDER BY atime DESC, rowid DESC"
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok(IDInfo {
                id: row.get::<_, i64>(0)? as u32,
                description: row.get(1)?,
                atime: from_micros(row.get(2)?),
            })
        })?;
        let mut infos = Vec::new();
        for info in rows {
            infos.push(info?);
        }
        Ok(infos)
    }

    /// Records an upload of `id` to `terminal`, capturing the id's current
    /// description. Fails for ids that were never allocated: the ledger
    /// must not outlive the ids it refers to.
    pub fn mark_uploaded(&mut self, id: u32, terminal: &str, size: u64) -> Result<()> {
        let space = IDSpace::from_id(id)?;
        let table = table_name(space);
        let now = now_micros();
        let tx = self.conn.transaction()?;
        let description: Option<String> = tx
            .query_row(
                &format!("SELECT description FROM {table} WHERE id = ?1"),
                params![i64::from(id)],
                |row| row.get(0),
            )
            .optional()?;
        let description = description.ok_or(Errors::UnknownId(id))?;
        // REPLACE assigns a fresh rowid, keeping (upload_time, rowid) a
        // total recency order even for same-instant uploads.
        tx.execute(
            "INSERT OR REPLACE INTO uploads (id, terminal, description, size, upload_time)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![i64::from(id), terminal, description, size as i64, now],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// The upload record for `(id, terminal)`, with `uploads_ago` and
    /// `bytes_ago` computed on demand from the stored rows.
    pub fn get_upload_info(&self, id: u32, terminal: &str) -> Result<Option<UploadInfo>> {
        let row: Option<(String, i64, i64, i64)> = self
            .conn
            .query_row(
                "SELECT description, size, upload_time, rowid FROM uploads
                 WHERE id = ?1 AND terminal = ?2",
                params![i64::from(id), terminal],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        let Some((description, size, upload_time, rowid)) = row else {
            return Ok(None);
        };
        let (uploads_ago, bytes_ago): (i64, i64) = self.conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(size), 0) FROM uploads
             WHERE terminal = ?1
               AND (upload_time > ?2 OR (upload_time = ?2 AND rowid >= ?3))",
            params![terminal, upload_time, rowid],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(Some(UploadInfo {
            id,
            terminal: terminal.to_string(),
            description,
            size: size as u64,
            upload_time: from_micros(upload_time),
            uploads_ago: uploads_ago as u64,
            bytes_ago: bytes_ago as u64,
        }))
    }

    /// Whether `id` must be (re)transmitted to `terminal`. `None` caps are
    /// unconstrained.
    pub fn needs_uploading(
        &self,
        id: u32,
        terminal: &str,
        max_uploads_ago: Option<u64>,
        max_bytes_ago: Option<u64>,
        max_time_ago: Option<Duration>,
    ) -> Result<bool> {
        let Ok(space) = IDSpace::from_id(id) else {
            return Ok(true);
        };
        let table = table_name(space);
        let description: Option<String> = self
            .conn
            .query_row(
                &format!("SELECT description FROM {table} WHERE id = ?1"),
                params![i64::from(id)],
                |row| row.get(0),
            )
            .optional()?;
        let Some(description) = description else {
            return Ok(true);
        };
        let Some(info) = self.get_upload_info(id, terminal)? else {
            return Ok(true);
        };
        if info.description != description {
            return Ok(true);
        }
        if max_uploads_ago.is_some_and(|max| info.uploads_ago > max) {
            return Ok(true);
        }
        if max_bytes_ago.is_some_and(|max| info.bytes_ago > max) {
            return Ok(true);
        }
        if let Some(max) = max_time_ago {
            let age = now_micros() - info.upload_time.timestamp_micros();
            if age > max.as_micros().min(i64::MAX as u128) as i64 {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Drops upload records that exceed any of the caps, per terminal.
    /// `None` caps are unconstrained.
    pub fn cleanup_uploads(
        &mut self,
        max_uploads: Option<u64>,
        max_bytes: Option<u64>,
        max_age: Option<Duration>,
    ) -> Result<()> {
        let now = now_micros();
        let max_age_micros = max_age.map(|max| max.as_micros().min(i64::MAX as u128) as i64);
        let tx = self.conn.transaction()?;
        let terminals: Vec<String> = {
            let mut stmt = tx.prepare("SELECT DISTINCT terminal FROM uploads")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        for terminal in terminals {
            let rows: Vec<(i64, i64, i64)> = {
                let mut stmt = tx.prepare(
                    "SELECT rowid, size, upload_time FROM uploads WHERE terminal = ?1
                     ORDER BY upload_time DESC, rowid DESC",
                )?;
                let rows = stmt.query_map(params![terminal], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?;
                rows.collect::<rusqlite::Result<_>>()?
            };
            let mut bytes: u64 = 0;
            let mut stale = Vec::new();
            for (pos, &(rowid, size, upload_time)) in rows.iter().enumerate() {
                bytes += size as u64;
                let too_many = max_uploads.is_some_and(|max| pos as u64 + 1 > max);
                let too_big = max_bytes.is_some_and(|max| bytes > max);
                let too_old = max_age_micros.is_some_and(|max| now - upload_time > max);
                if too_many || too_big || too_old {
                    stale.push(rowid);
                }
            }
            if !stale.is_empty() {
                log::debug!(
                    "dropping {} stale upload records for terminal {terminal}",
                    stale.len()
                );
                let list = stale
                    .iter()
                    .map(|rowid| rowid.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                tx.execute(&format!("DELETE FROM uploads WHERE rowid IN ({list})"), [])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

fn id_taken(tx: &Transaction, table: &str, id: u32) -> rusqlite::Result<bool> {
    tx.query_row(
        &format!("SELECT 1 FROM {table} WHERE id = ?1"),
        params![i64::from(id)],
        |_| Ok(()),
    )
    .optional()
    .map(|row| row.is_some())
}

fn delete_id(tx: &Transaction, table: &str, id: i64) -> rusqlite::Result<()> {
    tx.execute(&format!("DELETE FROM {table} WHERE id = ?1"), params![id])?;
    tx.execute("DELETE FROM uploads WHERE id = ?1", params![id])?;
    Ok(())
}

/// Picks a free id: random draws first, then an ordered scan, then LRU
/// eviction when the subspace is saturated.
fn allocate(tx: &Transaction, table: &str, space: IDSpace, subspace: IDSubspace) -> Result<u32> {
    let mut rng = rand::thread_rng();
    for _ in 0..RANDOM_ALLOCATION_ATTEMPTS {
        let candidate = space.gen_random_id(subspace, &mut rng);
        if !id_taken(tx, table, candidate)? {
            return Ok(candidate);
        }
    }

    let in_subspace = subspace_condition(space, subspace);
    let taken: HashSet<u32> = {
        let mut stmt = tx.prepare(&format!("SELECT id FROM {table} WHERE {in_subspace}"))?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
        let mut taken = HashSet::new();
        for id in rows {
            taken.insert(id? as u32);
        }
        taken
    };
    if (taken.len() as u64) < space.subspace_size(subspace) {
        // Bounded: the enumeration meets a free id after at most
        // `taken.len() + 1` steps when the taken ids form a prefix.
        for candidate in space.all_ids(subspace) {
            if !taken.contains(&candidate) {
                return Ok(candidate);
            }
        }
    }

    let victim: Option<i64> = tx
        .query_row(
            &format!(
                "SELECT id FROM {table} WHERE {in_subspace}
                 ORDER BY atime ASC, rowid ASC LIMIT 1"
            ),
            [],
            |row| row.get(0),
        )
        .optional()?;
    match victim {
        Some(id) => {
            log::debug!("evicting id {id:#010x} from {} {subspace}", space.name());
            delete_id(tx, table, id)?;
            Ok(id as u32)
        }
        None => Err(Errors::SubspaceExhausted {
            space: space.name(),
            subspace: subspace.to_string(),
        }),
    }
}

/// Keeps the row count of a dense subspace within the configured cap by
/// dropping the oldest rows. Only kicks in past 75% saturation, so small
/// subspaces recycle through eviction instead.
fn enforce_subspace_limit(
    tx: &Transaction,
    table: &str,
    space: IDSpace,
    subspace: IDSubspace,
    max_ids: u64,
) -> Result<()> {
    let in_subspace = subspace_condition(space, subspace);
    let count: i64 = tx.query_row(
        &format!("SELECT COUNT(*) FROM {table} WHERE {in_subspace}"),
        [],
        |row| row.get(0),
    )?;
    let count = count as u64;
    if count <= max_ids || count * 4 <= space.subspace_size(subspace) * 3 {
        return Ok(());
    }
    let excess = count - max_ids;
    let stale: Vec<i64> = {
        let mut stmt = tx.prepare(&format!(
            "SELECT id FROM {table} WHERE {in_subspace}
             ORDER BY atime ASC, rowid ASC LIMIT {excess}"
        ))?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<_>>()?
    };
    log::debug!(
        "dropping {} old ids from {} {subspace}",
        stale.len(),
        space.name()
    );
    for id in stale {
        delete_id(tx, table, id)?;
    }
    Ok(())
}
