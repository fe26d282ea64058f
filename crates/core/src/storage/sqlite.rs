use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::time::Duration;

use chrono::DateTime;
use parking_lot::{Mutex, MutexGuard};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info};

use crate::config::StorageConfig;
use crate::model::{empty_xcfg, ContentHash, DisassemblyReport};
use crate::storage::bands::{self, BandScheme};
use crate::storage::cache::{CacheData, MatchingCache};
use crate::storage::ingest::prepare_sample;
use crate::storage::models::{
    FamilyRecord, FunctionRecord, MinHash, PicHashMatch, SampleRecord, StorageStats,
};
use crate::storage::pichash;
use crate::storage::{Storage, StorageError, StorageResult};

/// Minimum schema version we know how to handle.
///
/// `0` means "no schema yet" (fresh DB).
const MIN_SUPPORTED_SCHEMA_VERSION: i32 = 0;

/// Latest schema version this crate knows about.
pub const CURRENT_SCHEMA_VERSION: i32 = 2;

/// How long a writer waits for another process's lock before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SAMPLE_COLUMNS: &str = "s.sample_id, s.family_id, f.family_name, s.sha256, s.filename, \
     s.is_library, s.version, s.bitness, s.base_addr, s.binweight, s.num_functions, s.timestamp";

const FUNCTION_COLUMNS: &str =
    "function_id, sample_id, address, function_name, num_instructions, binweight, pichash, xcfg";

/// SQLite-backed storage.
///
/// Any number of processes may open the same file. Id assignment and the
/// sha256 uniqueness check run inside one `IMMEDIATE` transaction, so
/// concurrent ingesters never share an id or a live content hash.
#[derive(Debug)]
pub struct SqliteStorage {
    conn: Mutex<Connection>,
    scheme: BandScheme,
    /// The band config as recorded in `meta`.
    layout: String,
    drop_disassembly: bool,
}

impl SqliteStorage {
    /// Open (or create) a storage database at the given path and ensure the schema exists.
    pub fn open(path: &Path, config: &StorageConfig) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        Self::from_connection(conn, config)
    }

    /// Private, non-persistent database; mostly useful in tests.
    pub fn open_in_memory(config: &StorageConfig) -> StorageResult<Self> {
        Self::from_connection(Connection::open_in_memory()?, config)
    }

    fn from_connection(mut conn: Connection, config: &StorageConfig) -> StorageResult<Self> {
        apply_migrations(&conn)?;
        let scheme = BandScheme::new(&config.bands);
        let layout = sync_band_layout(&mut conn, &scheme)?;
        Ok(Self {
            conn: Mutex::new(conn),
            scheme,
            layout,
            drop_disassembly: config.drop_disassembly,
        })
    }

    /// Lock and expose the underlying connection for advanced callers.
    /// For most code, prefer the [`Storage`] methods.
    pub fn connection(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    pub fn band_scheme(&self) -> &BandScheme {
        &self.scheme
    }
}

impl Storage for SqliteStorage {
    fn clear_storage(&self) -> StorageResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute_batch(
            r#"
            DELETE FROM band_buckets;
            DELETE FROM functions;
            DELETE FROM samples;
            DELETE FROM families;
            INSERT INTO families (family_id, family_name) VALUES (0, '');
            UPDATE counters SET value = 1 WHERE name = 'family_id';
            UPDATE counters SET value = 0 WHERE name IN ('sample_id', 'function_id');
            "#,
        )?;
        tx.commit()?;
        info!("cleared sqlite storage");
        Ok(())
    }

    fn add_family(&self, name: &str) -> StorageResult<u32> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let family_id = ensure_family(&tx, name)?;
        tx.commit()?;
        Ok(family_id)
    }

    fn get_family(&self, family_id: u32) -> StorageResult<Option<FamilyRecord>> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                "SELECT family_id, family_name FROM families WHERE family_id = ?1",
                params![family_id],
                |row| Ok(FamilyRecord { family_id: row.get(0)?, family_name: row.get(1)? }),
            )
            .optional()?;
        Ok(record)
    }

    fn get_family_id(&self, name: &str) -> StorageResult<Option<u32>> {
        let conn = self.conn.lock();
        Ok(family_id_for(&conn, name)?)
    }

    fn get_family_ids(&self) -> StorageResult<Vec<u32>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT family_id FROM families ORDER BY family_id")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn add_sample(
        &self,
        report: &dyn DisassemblyReport,
        family: &str,
    ) -> StorageResult<Option<SampleRecord>> {
        let prepared = prepare_sample(report, family, self.drop_disassembly);
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<u32> = tx
            .query_row(
                "SELECT sample_id FROM samples WHERE sha256 = ?1",
                params![prepared.sha256.to_hex()],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(existing) = existing {
            debug!(sha256 = %prepared.sha256, sample_id = existing, "sample already stored");
            return Ok(None);
        }

        let family_id = ensure_family(&tx, &prepared.family)?;
        let sample_id = reserve_ids(&tx, "sample_id", 1)? as u32;
        let first_function_id = reserve_ids(&tx, "function_id", prepared.num_functions() as i64)?;
        let rows = prepared.into_rows(sample_id, family_id, first_function_id as u64);

        let sample = &rows.sample;
        tx.execute(
            r#"
            INSERT INTO samples (sample_id, family_id, sha256, filename, is_library, version,
                                 bitness, base_addr, binweight, num_functions, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                sample.sample_id,
                sample.family_id,
                sample.sha256.to_hex(),
                sample.filename,
                sample.is_library,
                sample.version,
                sample.bitness,
                sample.base_addr as i64,
                sample.binweight as i64,
                sample.num_functions,
                sample.timestamp.timestamp_millis(),
            ],
        )?;

        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO functions (function_id, sample_id, address, function_name,
                                       num_instructions, binweight, pichash, xcfg)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
            )?;
            for f in &rows.functions {
                stmt.execute(params![
                    f.function_id as i64,
                    f.sample_id,
                    f.offset as i64,
                    f.function_name,
                    f.num_instructions,
                    f.binweight,
                    pichash::to_sql(f.pichash),
                    serde_json::to_string(&f.xcfg)?,
                ])?;
            }
        }

        if !rows.minhashes.is_empty() {
            check_band_layout(&tx, &self.layout)?;
        }
        for (function_id, signature) in &rows.minhashes {
            write_minhash(&tx, &self.scheme, *function_id, signature)?;
        }

        tx.commit()?;
        info!(
            sample_id,
            family_id,
            sha256 = %rows.sample.sha256,
            num_functions = rows.sample.num_functions,
            "added sample"
        );
        Ok(Some(rows.sample))
    }

    fn get_sample_ids(&self) -> StorageResult<Vec<u32>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT sample_id FROM samples ORDER BY sample_id")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn is_sample_id(&self, sample_id: u32) -> StorageResult<bool> {
        let conn = self.conn.lock();
        Ok(sample_exists(&conn, sample_id)?)
    }

    fn get_sample_by_id(&self, sample_id: u32) -> StorageResult<Option<SampleRecord>> {
        let conn = self.conn.lock();
        let samples = query_samples(&conn, "WHERE s.sample_id = ?1", params![sample_id])?;
        Ok(samples.into_iter().next())
    }

    fn get_sample_by_sha256(&self, sha256: &ContentHash) -> StorageResult<Option<SampleRecord>> {
        let conn = self.conn.lock();
        let samples = query_samples(&conn, "WHERE s.sha256 = ?1", params![sha256.to_hex()])?;
        Ok(samples.into_iter().next())
    }

    fn get_samples_by_family_id(
        &self,
        family_id: u32,
    ) -> StorageResult<Option<Vec<SampleRecord>>> {
        let conn = self.conn.lock();
        let known: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM families WHERE family_id = ?1)",
            params![family_id],
            |row| row.get(0),
        )?;
        if !known {
            return Ok(None);
        }
        Ok(Some(query_samples(&conn, "WHERE s.family_id = ?1", params![family_id])?))
    }

    fn delete_sample(&self, sample_id: u32) -> StorageResult<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if !sample_exists(&tx, sample_id)? {
            return Ok(false);
        }
        tx.execute(
            r#"
            DELETE FROM band_buckets
            WHERE function_id IN (SELECT function_id FROM functions WHERE sample_id = ?1)
            "#,
            params![sample_id],
        )?;
        let num_functions =
            tx.execute("DELETE FROM functions WHERE sample_id = ?1", params![sample_id])?;
        tx.execute("DELETE FROM samples WHERE sample_id = ?1", params![sample_id])?;
        tx.commit()?;
        info!(sample_id, num_functions, "deleted sample");
        Ok(true)
    }

    fn get_function_by_id(&self, function_id: u64) -> StorageResult<Option<FunctionRecord>> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                &format!("SELECT {FUNCTION_COLUMNS} FROM functions WHERE function_id = ?1"),
                params![function_id as i64],
                map_function,
            )
            .optional()?;
        Ok(record)
    }

    fn get_functions_by_sample_id(
        &self,
        sample_id: u32,
    ) -> StorageResult<Option<Vec<FunctionRecord>>> {
        let conn = self.conn.lock();
        if !sample_exists(&conn, sample_id)? {
            return Ok(None);
        }
        let mut stmt = conn.prepare(&format!(
            "SELECT {FUNCTION_COLUMNS} FROM functions WHERE sample_id = ?1 ORDER BY function_id"
        ))?;
        let rows = stmt.query_map(params![sample_id], map_function)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(Some(out))
    }

    fn get_function_ids_by_sample_id(&self, sample_id: u32) -> StorageResult<Option<Vec<u64>>> {
        let conn = self.conn.lock();
        if !sample_exists(&conn, sample_id)? {
            return Ok(None);
        }
        Ok(Some(function_ids_for(&conn, sample_id)?))
    }

    fn get_sample_id_by_function_id(&self, function_id: u64) -> StorageResult<Option<u32>> {
        let conn = self.conn.lock();
        let sample_id = conn
            .query_row(
                "SELECT sample_id FROM functions WHERE function_id = ?1",
                params![function_id as i64],
                |row| row.get(0),
            )
            .optional()?;
        Ok(sample_id)
    }

    fn is_function_id(&self, function_id: u64) -> StorageResult<bool> {
        let conn = self.conn.lock();
        Ok(function_exists(&conn, function_id)?)
    }

    fn delete_xcfg_for_sample_id(&self, sample_id: u32) -> StorageResult<()> {
        let conn = self.conn.lock();
        let purged = conn.execute(
            "UPDATE functions SET xcfg = ?2 WHERE sample_id = ?1",
            params![sample_id, empty_xcfg().to_string()],
        )?;
        debug!(sample_id, purged, "purged xcfg payloads");
        Ok(())
    }

    fn delete_xcfg_data(&self) -> StorageResult<()> {
        let conn = self.conn.lock();
        let purged =
            conn.execute("UPDATE functions SET xcfg = ?1", params![empty_xcfg().to_string()])?;
        debug!(purged, "purged all xcfg payloads");
        Ok(())
    }

    fn is_pichash(&self, pichash: u64) -> StorageResult<bool> {
        let conn = self.conn.lock();
        let found = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM functions WHERE pichash = ?1)",
            params![pichash::to_sql(pichash)],
            |row| row.get(0),
        )?;
        Ok(found)
    }

    fn get_matches_for_pichash(&self, pichash: u64) -> StorageResult<BTreeSet<PicHashMatch>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT sample_id, function_id FROM functions WHERE pichash = ?1",
        )?;
        let rows = stmt.query_map(params![pichash::to_sql(pichash)], |row| {
            Ok((row.get::<_, u32>(0)?, row.get::<_, i64>(1)? as u64))
        })?;
        let mut out = BTreeSet::new();
        for row in rows {
            out.insert(row?);
        }
        Ok(out)
    }

    fn add_minhash(&self, minhash: &MinHash) -> StorageResult<bool> {
        let Some(function_id) = minhash.function_id else {
            return Ok(false);
        };
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if !function_exists(&tx, function_id)? {
            return Ok(false);
        }
        check_band_layout(&tx, &self.layout)?;
        write_minhash(&tx, &self.scheme, function_id, &minhash.signature)?;
        tx.commit()?;
        Ok(true)
    }

    fn get_minhash_by_function_id(&self, function_id: u64) -> StorageResult<Option<Vec<u32>>> {
        let conn = self.conn.lock();
        let blob: Option<Option<Vec<u8>>> = conn
            .query_row(
                "SELECT minhash FROM functions WHERE function_id = ?1",
                params![function_id as i64],
                |row| row.get(0),
            )
            .optional()?;
        Ok(blob.flatten().map(|bytes| decode_signature(&bytes)))
    }

    fn get_candidates_for_minhash(&self, minhash: &MinHash) -> StorageResult<BTreeSet<u64>> {
        let conn = self.conn.lock();
        check_band_layout(&conn, &self.layout)?;
        let mut stmt = conn.prepare_cached(
            "SELECT function_id FROM band_buckets WHERE band_id = ?1 AND band_value = ?2",
        )?;
        let mut candidates = BTreeSet::new();
        for (band_id, value) in self.scheme.band_values(&minhash.signature) {
            let rows = stmt
                .query_map(params![band_id, bands::to_sql(value)], |row| row.get::<_, i64>(0))?;
            for row in rows {
                candidates.insert(row? as u64);
            }
        }
        Ok(candidates)
    }

    fn create_matching_cache(&self, sample_ids: &[u32]) -> StorageResult<MatchingCache> {
        let conn = self.conn.lock();
        let mut data = CacheData::default();
        let mut stmt = conn.prepare(
            "SELECT function_id, minhash FROM functions WHERE sample_id = ?1 ORDER BY function_id",
        )?;
        for &sample_id in sample_ids {
            if !sample_exists(&conn, sample_id)? {
                continue;
            }
            let rows = stmt.query_map(params![sample_id], |row| {
                Ok((row.get::<_, i64>(0)? as u64, row.get::<_, Option<Vec<u8>>>(1)?))
            })?;
            let mut function_ids = Vec::new();
            for row in rows {
                let (function_id, blob) = row?;
                data.func_id_to_sample_id.insert(function_id, sample_id);
                if let Some(bytes) = blob {
                    data.func_id_to_minhash.insert(function_id, decode_signature(&bytes));
                }
                function_ids.push(function_id);
            }
            data.sample_id_to_func_ids.insert(sample_id, function_ids);
        }
        debug!(samples = data.sample_id_to_func_ids.len(), "built matching cache");
        Ok(MatchingCache::new(data))
    }

    fn get_stats(&self) -> StorageResult<StorageStats> {
        let conn = self.conn.lock();
        let stats = conn.query_row(
            r#"
            SELECT
                (SELECT COUNT(*) FROM families),
                (SELECT COUNT(*) FROM samples),
                (SELECT COUNT(*) FROM functions),
                (SELECT COUNT(DISTINCT pichash) FROM functions),
                (SELECT COUNT(*) FROM functions WHERE minhash IS NOT NULL),
                (SELECT COUNT(*) FROM (SELECT DISTINCT band_id, band_value FROM band_buckets))
            "#,
            [],
            |row| {
                Ok(StorageStats {
                    num_families: row.get::<_, i64>(0)? as u64,
                    num_samples: row.get::<_, i64>(1)? as u64,
                    num_functions: row.get::<_, i64>(2)? as u64,
                    num_pichashes: row.get::<_, i64>(3)? as u64,
                    num_minhashes: row.get::<_, i64>(4)? as u64,
                    num_band_buckets: row.get::<_, i64>(5)? as u64,
                })
            },
        )?;
        Ok(stats)
    }
}

/// Advance a named counter by `count` and return the first reserved value.
fn reserve_ids(conn: &Connection, name: &str, count: i64) -> rusqlite::Result<i64> {
    conn.query_row(
        "UPDATE counters SET value = value + ?2 WHERE name = ?1 RETURNING value - ?2",
        params![name, count],
        |row| row.get(0),
    )
}

fn family_id_for(conn: &Connection, name: &str) -> rusqlite::Result<Option<u32>> {
    conn.query_row("SELECT family_id FROM families WHERE family_name = ?1", params![name], |row| {
        row.get(0)
    })
    .optional()
}

fn ensure_family(conn: &Connection, name: &str) -> rusqlite::Result<u32> {
    if let Some(id) = family_id_for(conn, name)? {
        return Ok(id);
    }
    let id = reserve_ids(conn, "family_id", 1)? as u32;
    conn.execute(
        "INSERT INTO families (family_id, family_name) VALUES (?1, ?2)",
        params![id, name],
    )?;
    debug!(family_id = id, family = name, "added family");
    Ok(id)
}

fn sample_exists(conn: &Connection, sample_id: u32) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM samples WHERE sample_id = ?1)",
        params![sample_id],
        |row| row.get(0),
    )
}

fn function_exists(conn: &Connection, function_id: u64) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM functions WHERE function_id = ?1)",
        params![function_id as i64],
        |row| row.get(0),
    )
}

fn function_ids_for(conn: &Connection, sample_id: u32) -> rusqlite::Result<Vec<u64>> {
    let mut stmt = conn.prepare_cached(
        "SELECT function_id FROM functions WHERE sample_id = ?1 ORDER BY function_id",
    )?;
    let rows = stmt.query_map(params![sample_id], |row| row.get::<_, i64>(0))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row? as u64);
    }
    Ok(out)
}

fn query_samples(
    conn: &Connection,
    filter: &str,
    params: impl rusqlite::Params,
) -> StorageResult<Vec<SampleRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SAMPLE_COLUMNS} FROM samples s JOIN families f ON f.family_id = s.family_id \
         {filter} ORDER BY s.sample_id"
    ))?;
    let rows = stmt.query_map(params, map_sample)?;
    let mut out = Vec::new();
    for row in rows {
        let mut sample = row?;
        sample.function_ids = function_ids_for(conn, sample.sample_id)?;
        out.push(sample);
    }
    Ok(out)
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn map_sample(row: &Row<'_>) -> rusqlite::Result<SampleRecord> {
    let sha256: String = row.get(3)?;
    let sha256 = sha256.parse::<ContentHash>().map_err(|err| conversion_error(3, err))?;
    let timestamp_ms: i64 = row.get(11)?;
    Ok(SampleRecord {
        sample_id: row.get(0)?,
        family_id: row.get(1)?,
        family: row.get(2)?,
        sha256,
        filename: row.get(4)?,
        is_library: row.get(5)?,
        version: row.get(6)?,
        bitness: row.get(7)?,
        base_addr: row.get::<_, i64>(8)? as u64,
        binweight: row.get::<_, i64>(9)? as u64,
        num_functions: row.get(10)?,
        function_ids: Vec::new(),
        timestamp: DateTime::from_timestamp_millis(timestamp_ms).unwrap_or_default(),
    })
}

fn map_function(row: &Row<'_>) -> rusqlite::Result<FunctionRecord> {
    let xcfg: String = row.get(7)?;
    let xcfg = serde_json::from_str(&xcfg).map_err(|err| conversion_error(7, err))?;
    Ok(FunctionRecord {
        function_id: row.get::<_, i64>(0)? as u64,
        sample_id: row.get(1)?,
        offset: row.get::<_, i64>(2)? as u64,
        function_name: row.get(3)?,
        num_instructions: row.get(4)?,
        binweight: row.get(5)?,
        pichash: pichash::from_sql(row.get(6)?),
        xcfg,
    })
}

fn encode_signature(signature: &[u32]) -> Vec<u8> {
    signature.iter().flat_map(|value| value.to_le_bytes()).collect()
}

fn decode_signature(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Store a signature and replace the function's band memberships.
fn write_minhash(
    conn: &Connection,
    scheme: &BandScheme,
    function_id: u64,
    signature: &[u32],
) -> rusqlite::Result<()> {
    let id = function_id as i64;
    conn.execute(
        "UPDATE functions SET minhash = ?2 WHERE function_id = ?1",
        params![id, encode_signature(signature)],
    )?;
    conn.execute("DELETE FROM band_buckets WHERE function_id = ?1", params![id])?;
    let mut stmt = conn.prepare_cached(
        "INSERT OR IGNORE INTO band_buckets (band_id, band_value, function_id) VALUES (?1, ?2, ?3)",
    )?;
    for (band_id, value) in scheme.band_values(signature) {
        stmt.execute(params![band_id, bands::to_sql(value), id])?;
    }
    Ok(())
}

fn stored_band_layout(conn: &Connection) -> StorageResult<Option<String>> {
    Ok(conn
        .query_row("SELECT value FROM meta WHERE key = 'band_config'", [], |row| row.get(0))
        .optional()?)
}

/// Fail if another handle has since rebuilt the buckets under another layout.
fn check_band_layout(conn: &Connection, layout: &str) -> StorageResult<()> {
    match stored_band_layout(conn)? {
        Some(stored) if stored == layout => Ok(()),
        _ => Err(StorageError::BandLayoutChanged),
    }
}

/// Rebuild every band bucket if the stored layout differs from `scheme`.
///
/// Returns the layout now recorded in `meta`.
fn sync_band_layout(conn: &mut Connection, scheme: &BandScheme) -> StorageResult<String> {
    let wanted = serde_json::to_string(scheme.config())?;
    if stored_band_layout(conn)?.as_deref() == Some(wanted.as_str()) {
        return Ok(wanted);
    }

    // Re-read under the write lock: a concurrent opener may have rebuilt already.
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let stored = stored_band_layout(&tx)?;
    if stored.as_deref() == Some(wanted.as_str()) {
        return Ok(wanted);
    }
    let signatures: HashMap<u64, Vec<u32>> = {
        let mut stmt =
            tx.prepare("SELECT function_id, minhash FROM functions WHERE minhash IS NOT NULL")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, i64>(0)? as u64, decode_signature(&row.get::<_, Vec<u8>>(1)?)))
        })?;
        rows.collect::<Result<_, _>>()?
    };
    tx.execute("DELETE FROM band_buckets", [])?;
    for (function_id, signature) in &signatures {
        write_minhash(&tx, scheme, *function_id, signature)?;
    }
    tx.execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES ('band_config', ?1)",
        params![wanted],
    )?;
    tx.commit()?;

    if stored.is_some() {
        info!(rebucketed = signatures.len(), "band layout changed; rebuilt band buckets");
    }
    Ok(wanted)
}

/// Apply schema migrations to bring the database to the latest version.
///
/// We use `PRAGMA user_version` as the schema version indicator.
///
/// Version map:
/// - 0: no schema
/// - 1: counters, families, samples, functions, band buckets
/// - 2: add meta table (records the band layout the buckets were built with)
fn apply_migrations(conn: &Connection) -> StorageResult<()> {
    let mut current_version = current_schema_version(conn)?;

    // Reject DBs created with a newer schema than we support.
    if current_version > CURRENT_SCHEMA_VERSION {
        return Err(StorageError::UnsupportedSchemaVersion {
            found: current_version,
            min_supported: MIN_SUPPORTED_SCHEMA_VERSION,
            max_supported: CURRENT_SCHEMA_VERSION,
        });
    }

    if current_version == 0 {
        conn.execute_batch(
            r#"
            BEGIN;
            CREATE TABLE IF NOT EXISTS counters (
                name  TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );
            INSERT OR IGNORE INTO counters (name, value)
            VALUES ('family_id', 1), ('sample_id', 0), ('function_id', 0);

            CREATE TABLE IF NOT EXISTS families (
                family_id   INTEGER PRIMARY KEY,
                family_name TEXT NOT NULL UNIQUE
            );
            INSERT OR IGNORE INTO families (family_id, family_name) VALUES (0, '');

            CREATE TABLE IF NOT EXISTS samples (
                sample_id     INTEGER PRIMARY KEY,
                family_id     INTEGER NOT NULL,
                sha256        TEXT NOT NULL UNIQUE,
                filename      TEXT NOT NULL,
                is_library    INTEGER NOT NULL,
                version       TEXT,
                bitness       INTEGER NOT NULL,
                base_addr     INTEGER NOT NULL,
                binweight     INTEGER NOT NULL,
                num_functions INTEGER NOT NULL,
                timestamp     INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS samples_by_family ON samples (family_id);

            CREATE TABLE IF NOT EXISTS functions (
                function_id      INTEGER PRIMARY KEY,
                sample_id        INTEGER NOT NULL,
                address          INTEGER NOT NULL,
                function_name    TEXT,
                num_instructions INTEGER NOT NULL,
                binweight        INTEGER NOT NULL,
                pichash          INTEGER NOT NULL,
                xcfg             TEXT NOT NULL,
                minhash          BLOB
            );
            CREATE INDEX IF NOT EXISTS functions_by_sample ON functions (sample_id);
            CREATE INDEX IF NOT EXISTS functions_by_pichash ON functions (pichash);

            CREATE TABLE IF NOT EXISTS band_buckets (
                band_id     INTEGER NOT NULL,
                band_value  INTEGER NOT NULL,
                function_id INTEGER NOT NULL,
                PRIMARY KEY (band_id, band_value, function_id)
            ) WITHOUT ROWID;
            CREATE INDEX IF NOT EXISTS band_buckets_by_function ON band_buckets (function_id);

            PRAGMA user_version = 1;
            COMMIT;
            "#,
        )?;
        current_version = 1;
    }

    if current_version < 2 {
        conn.execute_batch(
            r#"
            BEGIN;
            CREATE TABLE IF NOT EXISTS meta (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            PRAGMA user_version = 2;
            COMMIT;
            "#,
        )?;
    }

    Ok(())
}

/// Read the SQLite schema version from `PRAGMA user_version`.
fn current_schema_version(conn: &Connection) -> StorageResult<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BandConfig;

    #[test]
    fn signature_blob_round_trips() {
        let signature = vec![0, 1, u32::MAX, 0x3031_3233];
        assert_eq!(decode_signature(&encode_signature(&signature)), signature);
    }

    #[test]
    fn reserve_ids_hands_out_consecutive_blocks() {
        let storage = SqliteStorage::open_in_memory(&StorageConfig::memory()).expect("open");
        let conn = storage.connection();
        assert_eq!(reserve_ids(&conn, "function_id", 10).expect("reserve"), 0);
        assert_eq!(reserve_ids(&conn, "function_id", 3).expect("reserve"), 10);
        assert_eq!(reserve_ids(&conn, "function_id", 0).expect("reserve"), 13);
    }

    #[test]
    fn reopening_with_a_new_band_layout_rebuilds_buckets() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("store.db");
        let narrow = BandConfig::new([(2, 3)].into_iter().collect(), 1).with_signature_length(8);
        let wide = BandConfig::new([(4, 5)].into_iter().collect(), 1).with_signature_length(8);

        {
            let config = StorageConfig::sqlite(&path).with_bands(narrow);
            let storage = SqliteStorage::open(&path, &config).expect("open");
            let conn = storage.connection();
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM band_buckets", [], |r| r.get(0)).unwrap();
            assert_eq!(count, 0);
        }

        let config = StorageConfig::sqlite(&path).with_bands(wide.clone());
        let storage = SqliteStorage::open(&path, &config).expect("reopen");
        let conn = storage.connection();
        let stored: String = conn
            .query_row("SELECT value FROM meta WHERE key = 'band_config'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(stored, serde_json::to_string(&wide).unwrap());
    }
}
