use std::path::Path;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::checks::{self, CommitView};
use super::{
    Backend, BiosampleQuery, Expected, LocationQuery, Record, RecordKey, RecordKind, Write,
};
use crate::cache::PoolKey;
use crate::error::{Result, TrackError, ValidationKind};
use crate::model::{BarcodeSequence, Biosample, Location, SequenceCategory};

/// How long a statement waits for another connection's write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS biosample (
    id INTEGER PRIMARY KEY,
    sample_id TEXT NOT NULL,
    name TEXT,
    biotype INTEGER NOT NULL,
    parent INTEGER,
    location INTEGER,
    pos INTEGER NOT NULL,
    container_id TEXT,
    body TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_biosample_sample_id ON biosample (sample_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_biosample_sample_id_unique
    ON biosample (sample_id) WHERE sample_id <> '';
CREATE INDEX IF NOT EXISTS idx_biosample_parent ON biosample (parent);
CREATE INDEX IF NOT EXISTS idx_biosample_location ON biosample (location);
CREATE INDEX IF NOT EXISTS idx_biosample_container ON biosample (container_id);
CREATE INDEX IF NOT EXISTS idx_biosample_name ON biosample (biotype, name);

CREATE TABLE IF NOT EXISTS location (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    parent INTEGER,
    code TEXT,
    body TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_location_parent ON location (parent);

CREATE TABLE IF NOT EXISTS biotype (
    id INTEGER PRIMARY KEY,
    body TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS study (
    id INTEGER PRIMARY KEY,
    body TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS barcode_sequence (
    category TEXT NOT NULL,
    pattern TEXT NOT NULL,
    last_barcode TEXT NOT NULL,
    PRIMARY KEY (category, pattern)
);

CREATE TABLE IF NOT EXISTS record_counter (
    name TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);
INSERT OR IGNORE INTO record_counter (name, value) VALUES ('record', 0);
";

/// SQLite-backed store.
///
/// Records are kept as JSON bodies next to the columns the engine filters on.
/// The connection is shared behind a mutex that is held per statement, never
/// across a [`super::Transaction`]. Several backends, in one process or many,
/// may open the same file: every write runs under `BEGIN IMMEDIATE`.
///
/// Sample ids are unique per statement, so swapping the ids of two samples
/// needs two write-sets.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Opens (creating if needed) a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::with_connection(conn)
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        debug!("store.sqlite.schema_ready");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn query_bodies<T: DeserializeOwned>(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<T>> {
        query_bodies(&self.conn.lock(), sql, params)
    }

    fn query_strings(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn raw(id: u64) -> i64 {
    id as i64
}

fn query_bodies<T: DeserializeOwned>(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let bodies = stmt
        .query_map(params, |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    bodies
        .iter()
        .map(|body| serde_json::from_str(body).map_err(TrackError::from))
        .collect()
}

fn fetch_record(conn: &Connection, key: &RecordKey) -> Result<Option<Record>> {
    let body: Option<String> = match key {
        RecordKey::Biosample(id) => conn
            .query_row("SELECT body FROM biosample WHERE id = ?1", [raw(id.0)], |r| r.get(0))
            .optional()?,
        RecordKey::Location(id) => conn
            .query_row("SELECT body FROM location WHERE id = ?1", [raw(id.0)], |r| r.get(0))
            .optional()?,
        RecordKey::Biotype(id) => conn
            .query_row("SELECT body FROM biotype WHERE id = ?1", [raw(id.0)], |r| r.get(0))
            .optional()?,
        RecordKey::Study(id) => conn
            .query_row("SELECT body FROM study WHERE id = ?1", [raw(id.0)], |r| r.get(0))
            .optional()?,
        RecordKey::Sequence(pool) => {
            return Ok(last_barcode(conn, pool)?.map(|last_barcode| {
                Record::Sequence(BarcodeSequence {
                    category: pool.category,
                    pattern: pool.pattern.clone(),
                    last_barcode,
                })
            }));
        }
    };
    let Some(body) = body else {
        return Ok(None);
    };
    let record = match key {
        RecordKey::Biosample(_) => Record::Biosample(serde_json::from_str(&body)?),
        RecordKey::Location(_) => Record::Location(serde_json::from_str(&body)?),
        RecordKey::Biotype(_) => Record::Biotype(serde_json::from_str(&body)?),
        RecordKey::Study(_) => Record::Study(serde_json::from_str(&body)?),
        RecordKey::Sequence(_) => return Ok(None),
    };
    Ok(Some(record))
}

fn last_barcode(conn: &Connection, pool: &PoolKey) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT last_barcode FROM barcode_sequence WHERE category = ?1 AND pattern = ?2",
            params![pool.category.name(), pool.pattern],
            |r| r.get(0),
        )
        .optional()?)
}

fn query_biosamples(conn: &Connection, query: &BiosampleQuery) -> Result<Vec<Biosample>> {
    match query {
        BiosampleQuery::SampleId(sample_id) => query_bodies(
            conn,
            "SELECT body FROM biosample WHERE sample_id = ?1 ORDER BY id",
            [sample_id],
        ),
        BiosampleQuery::ChildrenOf(parent) => query_bodies(
            conn,
            "SELECT body FROM biosample WHERE parent = ?1 ORDER BY id",
            [raw(parent.0)],
        ),
        BiosampleQuery::InLocation(location) => query_bodies(
            conn,
            "SELECT body FROM biosample WHERE location = ?1 ORDER BY id",
            [raw(location.0)],
        ),
        BiosampleQuery::InContainer(container) => query_bodies(
            conn,
            "SELECT body FROM biosample WHERE container_id = ?1 ORDER BY id",
            [container],
        ),
        BiosampleQuery::Named { biotype, name } => query_bodies(
            conn,
            "SELECT body FROM biosample WHERE biotype = ?1 AND name = ?2 COLLATE NOCASE ORDER BY id",
            params![raw(biotype.0), name],
        ),
    }
}

/// Committed state plus the writes applied so far, inside an open SQLite
/// transaction.
struct TxView<'a>(&'a Connection);

impl CommitView for TxView<'_> {
    fn record(&self, key: &RecordKey) -> Result<Option<Record>> {
        fetch_record(self.0, key)
    }

    fn biosamples(&self, query: &BiosampleQuery) -> Result<Vec<Biosample>> {
        query_biosamples(self.0, query)
    }
}

/// Maps a violation of the unique sample id index to its validation outcome.
fn sample_id_clash(err: rusqlite::Error, sample: &Biosample) -> TrackError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, Some(message))
            if failure.code == ErrorCode::ConstraintViolation
                && message.contains("biosample.sample_id") =>
        {
            TrackError::validation(
                sample.label(),
                ValidationKind::DuplicateSampleId(sample.sample_id.clone()),
            )
        }
        _ => TrackError::from(err),
    }
}

fn write_record(tx: &rusqlite::Transaction<'_>, record: &Record, insert: bool) -> Result<()> {
    let changed = match record {
        Record::Biosample(b) => {
            let body = serde_json::to_string(b)?;
            let sql = if insert {
                "INSERT INTO biosample (id, sample_id, name, biotype, parent, location, pos, container_id, body)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
            } else {
                "UPDATE biosample SET sample_id = ?2, name = ?3, biotype = ?4, parent = ?5,
                 location = ?6, pos = ?7, container_id = ?8, body = ?9 WHERE id = ?1"
            };
            tx.execute(
                sql,
                params![
                    raw(b.id.0),
                    b.sample_id,
                    b.name,
                    raw(b.biotype.0),
                    b.parent.map(|p| raw(p.0)),
                    b.location.map(|l| raw(l.0)),
                    b.pos,
                    b.container_id(),
                    body
                ],
            )
            .map_err(|err| sample_id_clash(err, b))?
        }
        Record::Location(l) => {
            let body = serde_json::to_string(l)?;
            let sql = if insert {
                "INSERT INTO location (id, name, parent, code, body) VALUES (?1, ?2, ?3, ?4, ?5)"
            } else {
                "UPDATE location SET name = ?2, parent = ?3, code = ?4, body = ?5 WHERE id = ?1"
            };
            tx.execute(
                sql,
                params![raw(l.id.0), l.name, l.parent.map(|p| raw(p.0)), l.code, body],
            )?
        }
        Record::Biotype(t) => {
            let body = serde_json::to_string(t)?;
            let sql = if insert {
                "INSERT INTO biotype (id, body) VALUES (?1, ?2)"
            } else {
                "UPDATE biotype SET body = ?2 WHERE id = ?1"
            };
            tx.execute(sql, params![raw(t.id.0), body])?
        }
        Record::Study(s) => {
            let body = serde_json::to_string(s)?;
            let sql = if insert {
                "INSERT INTO study (id, body) VALUES (?1, ?2)"
            } else {
                "UPDATE study SET body = ?2 WHERE id = ?1"
            };
            tx.execute(sql, params![raw(s.id.0), body])?
        }
        Record::Sequence(seq) => {
            let sql = if insert {
                "INSERT INTO barcode_sequence (category, pattern, last_barcode) VALUES (?1, ?2, ?3)"
            } else {
                "UPDATE barcode_sequence SET last_barcode = ?3 WHERE category = ?1 AND pattern = ?2"
            };
            tx.execute(
                sql,
                params![seq.category.name(), seq.pattern, seq.last_barcode],
            )?
        }
    };
    if changed == 0 {
        return Err(TrackError::not_found("record", format!("{:?}", record.key())));
    }
    Ok(())
}

fn delete_record(tx: &rusqlite::Transaction<'_>, key: &RecordKey) -> Result<()> {
    match key {
        RecordKey::Biosample(id) => tx.execute("DELETE FROM biosample WHERE id = ?1", [raw(id.0)])?,
        RecordKey::Location(id) => tx.execute("DELETE FROM location WHERE id = ?1", [raw(id.0)])?,
        RecordKey::Biotype(id) => tx.execute("DELETE FROM biotype WHERE id = ?1", [raw(id.0)])?,
        RecordKey::Study(id) => tx.execute("DELETE FROM study WHERE id = ?1", [raw(id.0)])?,
        RecordKey::Sequence(key) => tx.execute(
            "DELETE FROM barcode_sequence WHERE category = ?1 AND pattern = ?2",
            params![key.category.name(), key.pattern],
        )?,
    };
    Ok(())
}

impl Backend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn fetch(&self, key: &RecordKey) -> Result<Option<Record>> {
        fetch_record(&self.conn.lock(), key)
    }

    fn query_biosamples(&self, query: &BiosampleQuery) -> Result<Vec<Biosample>> {
        query_biosamples(&self.conn.lock(), query)
    }

    fn query_locations(&self, query: &LocationQuery) -> Result<Vec<Location>> {
        match query {
            LocationQuery::ChildrenOf(parent) => self.query_bodies(
                "SELECT body FROM location WHERE parent IS ?1 ORDER BY id",
                [parent.map(|p| raw(p.0))],
            ),
            LocationQuery::Named { parent, name } => self.query_bodies(
                "SELECT body FROM location WHERE parent IS ?1 AND name = ?2 COLLATE NOCASE ORDER BY id",
                params![parent.map(|p| raw(p.0)), name],
            ),
        }
    }

    fn existing_identifiers(&self, category: SequenceCategory, head: &str) -> Result<Vec<String>> {
        let sql = match category {
            SequenceCategory::Sample => {
                "SELECT DISTINCT sample_id FROM biosample
                 WHERE sample_id <> '' AND substr(sample_id, 1, length(?1)) = ?1 ORDER BY 1"
            }
            SequenceCategory::Container => {
                "SELECT DISTINCT container_id FROM biosample
                 WHERE container_id IS NOT NULL AND substr(container_id, 1, length(?1)) = ?1 ORDER BY 1"
            }
            SequenceCategory::Location => {
                "SELECT DISTINCT code FROM location
                 WHERE code IS NOT NULL AND substr(code, 1, length(?1)) = ?1 ORDER BY 1"
            }
        };
        self.query_strings(sql, [head])
    }

    fn scan(&self, kind: RecordKind) -> Result<Vec<Record>> {
        let records = match kind {
            RecordKind::Biosample => self
                .query_bodies("SELECT body FROM biosample ORDER BY id", [])?
                .into_iter()
                .map(Record::Biosample)
                .collect(),
            RecordKind::Location => self
                .query_bodies("SELECT body FROM location ORDER BY id", [])?
                .into_iter()
                .map(Record::Location)
                .collect(),
            RecordKind::Biotype => self
                .query_bodies("SELECT body FROM biotype ORDER BY id", [])?
                .into_iter()
                .map(Record::Biotype)
                .collect(),
            RecordKind::Study => self
                .query_bodies("SELECT body FROM study ORDER BY id", [])?
                .into_iter()
                .map(Record::Study)
                .collect(),
            RecordKind::Sequence => {
                let conn = self.conn.lock();
                let mut stmt = conn.prepare(
                    "SELECT category, pattern, last_barcode FROM barcode_sequence ORDER BY category, pattern",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows.into_iter()
                    .filter_map(|(category, pattern, last_barcode)| {
                        SequenceCategory::from_name(&category).map(|category| {
                            Record::Sequence(BarcodeSequence {
                                category,
                                pattern,
                                last_barcode,
                            })
                        })
                    })
                    .collect()
            }
        };
        Ok(records)
    }

    fn next_record_id(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let value: i64 = conn.query_row(
            "UPDATE record_counter SET value = value + 1 WHERE name = 'record' RETURNING value",
            [],
            |row| row.get(0),
        )?;
        Ok(value as u64)
    }

    fn apply_guarded(&self, writes: &[Write], expected: &[Expected]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        checks::verify_expected(&TxView(&tx), expected)?;
        let mut max_id: i64 = 0;
        for write in writes {
            match write {
                Write::Insert(record) => write_record(&tx, record, true)?,
                Write::Update(record) => write_record(&tx, record, false)?,
                Write::Delete(key) => delete_record(&tx, key)?,
            }
            let id = match write.key() {
                RecordKey::Biosample(id) => raw(id.0),
                RecordKey::Location(id) => raw(id.0),
                RecordKey::Biotype(id) => raw(id.0),
                RecordKey::Study(id) => raw(id.0),
                RecordKey::Sequence(_) => 0,
            };
            max_id = max_id.max(id);
        }
        checks::verify_biosamples(&TxView(&tx), writes)?;
        tx.execute(
            "UPDATE record_counter SET value = max(value, ?1) WHERE name = 'record'",
            [max_id],
        )?;
        tx.commit()?;
        debug!(writes = writes.len(), "store.sqlite.apply");
        Ok(())
    }

    fn advance_sequence(
        &self,
        key: &PoolKey,
        advance: &mut dyn FnMut(Option<&str>) -> Result<String>,
    ) -> Result<String> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = last_barcode(&tx, key)?;
        let next = advance(current.as_deref())?;
        tx.execute(
            "INSERT INTO barcode_sequence (category, pattern, last_barcode) VALUES (?1, ?2, ?3)
             ON CONFLICT (category, pattern) DO UPDATE SET last_barcode = excluded.last_barcode",
            params![key.category.name(), key.pattern, next],
        )?;
        tx.commit()?;
        debug!(
            category = %key.category,
            pattern = %key.pattern,
            last = %next,
            "store.sqlite.advance_sequence"
        );
        Ok(next)
    }
}
