//! # SQL Schema for Eventide
//!
//! Table layout, identifier escaping and duplicate-key classification for the
//! SQL backend. All statement text is rendered once from [`TableNames`] when a
//! [`SqliteStore`](crate::store::SqliteStore) starts, so callers can rename or
//! prefix every table without touching query code.
//!
//! ## Table Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                              Schema Overview                             │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │                                                                          │
//! │  events                        projection_index                          │
//! │  ┌─────────────────────┐       ┌─────────────────────┐                   │
//! │  │ global_seq (PK)     │◄──────│ global_seq          │                   │
//! │  │ event_id (UNIQUE)   │       │ projection_id  ┐ PK │                   │
//! │  │ stream_hash ┐ UNIQ  │       │ projection_seq ┘    │                   │
//! │  │ stream_seq  ┘       │       └─────────────────────┘                   │
//! │  │ stream_id           │                                                 │
//! │  │ event_type          │       projection_checkpoints                    │
//! │  │ created_ms          │       ┌─────────────────────┐                   │
//! │  │ payload_format      │       │ projection_id (PK)  │                   │
//! │  │ metadata BLOB       │       │ global_seq          │                   │
//! │  │ payload  BLOB       │       └─────────────────────┘                   │
//! │  └─────────────────────┘                                                 │
//! │                                                                          │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Decisions
//!
//! ### Why `stream_hash` next to `stream_id`?
//!
//! Stream names are arbitrary strings. The unique `(stream_hash, stream_seq)`
//! index keys on the fixed 20-byte SHA-1 of the lowercased name, which keeps
//! the B-tree compact and makes the case-insensitive comparison free. The
//! original spelling is kept in `stream_id` for display.
//!
//! ### Why do unique constraints carry the duplicate checks?
//!
//! The database already has to enforce `event_id` uniqueness and per-stream
//! sequence uniqueness. Letting the constraint fire and classifying the error
//! (see [`SqlDialect::is_duplicate_key`]) means the check is atomic with the
//! insert, with no read-then-write window.

use rusqlite::Connection;

use crate::error::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Current schema version. No migrations: a mismatch is an error.
pub const SCHEMA_VERSION: i32 = 1;

/// Name of the metadata table holding the schema version.
const METADATA_TABLE: &str = "eventide_metadata";

// =============================================================================
// Table Names
// =============================================================================

/// Names of the three tables the SQL backend uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    /// The event log.
    pub events: String,
    /// Projection stream index entries.
    pub projection_index: String,
    /// Projection stream checkpoints.
    pub projection_checkpoints: String,
}

impl TableNames {
    /// Default names with a common prefix, e.g. `"tenant1_"`.
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            events: format!("{prefix}events"),
            projection_index: format!("{prefix}projection_index"),
            projection_checkpoints: format!("{prefix}projection_checkpoints"),
        }
    }
}

impl Default for TableNames {
    fn default() -> Self {
        Self::with_prefix("")
    }
}

// =============================================================================
// Dialect
// =============================================================================

/// Backend-specific pieces of SQL handling.
pub trait SqlDialect: Send + Sync + 'static {
    /// Quotes an identifier so it can be spliced into statement text.
    fn escape_identifier(&self, name: &str) -> String;

    /// Returns true if `err` is a unique or primary-key violation.
    fn is_duplicate_key(&self, err: &rusqlite::Error) -> bool;
}

/// The SQLite dialect.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl SqlDialect for SqliteDialect {
    fn escape_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn is_duplicate_key(&self, err: &rusqlite::Error) -> bool {
        match err {
            rusqlite::Error::SqliteFailure(e, _) => {
                e.code == rusqlite::ErrorCode::ConstraintViolation
                    && (e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                        || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
            }
            _ => false,
        }
    }
}

/// Maps a driver error to [`Error::Duplicate`] or [`Error::Sqlite`].
pub(crate) fn classify(dialect: &dyn SqlDialect, err: rusqlite::Error, what: impl FnOnce() -> String) -> Error {
    if dialect.is_duplicate_key(&err) {
        Error::Duplicate { what: what() }
    } else {
        Error::Sqlite(err)
    }
}

// =============================================================================
// Statements
// =============================================================================

/// Every statement the SQL backend runs, rendered from [`TableNames`].
#[derive(Debug, Clone)]
pub(crate) struct Statements {
    pub create: Vec<String>,
    pub max_global_seq: String,
    pub max_stream_seq: String,
    /// Prefix of a multi-row insert; `(?,?,?,?,?,?,?,?,?,?)` groups are appended.
    pub insert_events_prefix: String,
    pub select_events_from: String,
    pub select_stream_from: String,
    pub max_projection_entry: String,
    pub insert_index_prefix: String,
    pub select_index_from: String,
    pub upsert_checkpoint: String,
    pub select_checkpoint: String,
    pub delete_index: String,
    pub delete_checkpoint: String,
}

/// Number of bound parameters in one event row.
pub(crate) const EVENT_COLUMNS: usize = 10;

/// Number of bound parameters in one index row.
pub(crate) const INDEX_COLUMNS: usize = 3;

const EVENT_SELECT_LIST: &str = "global_seq, event_id, stream_id, stream_seq, event_type, \
     created_ms, payload_format, metadata, payload";

impl Statements {
    pub fn render(tables: &TableNames, dialect: &dyn SqlDialect) -> Self {
        let events = dialect.escape_identifier(&tables.events);
        let index = dialect.escape_identifier(&tables.projection_index);
        let checkpoints = dialect.escape_identifier(&tables.projection_checkpoints);
        let metadata = dialect.escape_identifier(METADATA_TABLE);
        let stream_seq_idx = dialect.escape_identifier(&format!("{}_stream_seq", tables.events));
        let index_global_idx =
            dialect.escape_identifier(&format!("{}_global_seq", tables.projection_index));

        let create = vec![
            format!(
                "CREATE TABLE IF NOT EXISTS {metadata} (
                    key   TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                )"
            ),
            // global_seq is assigned explicitly (max + 1) inside the append
            // transaction, so it is dense even after a rolled-back append.
            format!(
                "CREATE TABLE IF NOT EXISTS {events} (
                    global_seq     INTEGER PRIMARY KEY,
                    event_id       BLOB NOT NULL UNIQUE,
                    stream_hash    BLOB NOT NULL,
                    stream_id      TEXT NOT NULL,
                    stream_seq     INTEGER NOT NULL,
                    event_type     TEXT NOT NULL,
                    created_ms     INTEGER NOT NULL,
                    payload_format INTEGER NOT NULL,
                    metadata       BLOB,
                    payload        BLOB NOT NULL
                )"
            ),
            format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {stream_seq_idx}
                 ON {events}(stream_hash, stream_seq)"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {index} (
                    projection_id  TEXT NOT NULL,
                    projection_seq INTEGER NOT NULL,
                    global_seq     INTEGER NOT NULL,
                    PRIMARY KEY (projection_id, projection_seq)
                )"
            ),
            format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {index_global_idx}
                 ON {index}(projection_id, global_seq)"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {checkpoints} (
                    projection_id TEXT PRIMARY KEY,
                    global_seq    INTEGER NOT NULL
                )"
            ),
        ];

        Self {
            create,
            max_global_seq: format!("SELECT COALESCE(MAX(global_seq), 0) FROM {events}"),
            max_stream_seq: format!(
                "SELECT COALESCE(MAX(stream_seq), 0) FROM {events} WHERE stream_hash = ?1"
            ),
            insert_events_prefix: format!(
                "INSERT INTO {events} (global_seq, event_id, stream_hash, stream_id, stream_seq, \
                 event_type, created_ms, payload_format, metadata, payload) VALUES "
            ),
            select_events_from: format!(
                "SELECT {EVENT_SELECT_LIST} FROM {events}
                 WHERE global_seq >= ?1 ORDER BY global_seq LIMIT ?2"
            ),
            select_stream_from: format!(
                "SELECT {EVENT_SELECT_LIST} FROM {events}
                 WHERE stream_hash = ?1 AND stream_seq >= ?2 ORDER BY stream_seq LIMIT ?3"
            ),
            max_projection_entry: format!(
                "SELECT projection_seq, global_seq FROM {index}
                 WHERE projection_id = ?1 ORDER BY projection_seq DESC LIMIT 1"
            ),
            insert_index_prefix: format!(
                "INSERT INTO {index} (projection_id, projection_seq, global_seq) VALUES "
            ),
            select_index_from: format!(
                "SELECT projection_seq, global_seq FROM {index}
                 WHERE projection_id = ?1 AND projection_seq >= ?2
                 ORDER BY projection_seq LIMIT ?3"
            ),
            upsert_checkpoint: format!(
                "INSERT INTO {checkpoints} (projection_id, global_seq) VALUES (?1, ?2)
                 ON CONFLICT(projection_id) DO UPDATE SET global_seq = excluded.global_seq"
            ),
            select_checkpoint: format!(
                "SELECT global_seq FROM {checkpoints} WHERE projection_id = ?1"
            ),
            delete_index: format!("DELETE FROM {index} WHERE projection_id = ?1"),
            delete_checkpoint: format!("DELETE FROM {checkpoints} WHERE projection_id = ?1"),
        }
    }
}

/// Builds `prefix (?,?,?),(?,?,?)...` for `rows` rows of `columns` parameters.
pub(crate) fn multi_row_insert(prefix: &str, rows: usize, columns: usize) -> String {
    let group = format!("({})", vec!["?"; columns].join(","));
    let mut sql = String::with_capacity(prefix.len() + rows * (group.len() + 1));
    sql.push_str(prefix);
    for i in 0..rows {
        if i > 0 {
            sql.push(',');
        }
        sql.push_str(&group);
    }
    sql
}

// =============================================================================
// Initialization
// =============================================================================

/// Sets pragmas, creates tables idempotently and checks the schema version.
pub(crate) fn initialize(conn: &Connection, statements: &Statements) -> Result<()> {
    // WAL: readers see a consistent snapshot while the writer commits.
    conn.execute_batch("PRAGMA journal_mode = WAL")?;
    conn.execute_batch("PRAGMA synchronous = NORMAL")?;

    for ddl in &statements.create {
        conn.execute_batch(ddl)?;
    }

    verify_or_set_version(conn)
}

fn verify_or_set_version(conn: &Connection) -> Result<()> {
    let existing: Option<String> = conn
        .query_row(
            &format!("SELECT value FROM {METADATA_TABLE} WHERE key = 'schema_version'"),
            [],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;

    match existing {
        None => {
            conn.execute(
                &format!("INSERT INTO {METADATA_TABLE} (key, value) VALUES ('schema_version', ?1)"),
                [SCHEMA_VERSION.to_string()],
            )?;
        }
        Some(v) if v == SCHEMA_VERSION.to_string() => {}
        Some(v) => {
            return Err(Error::Schema(format!(
                "schema version mismatch: database has version {v}, but this build requires {SCHEMA_VERSION}"
            )));
        }
    }

    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> (Connection, Statements) {
        let conn = Connection::open_in_memory().expect("should open");
        let statements = Statements::render(&TableNames::default(), &SqliteDialect);
        initialize(&conn, &statements).expect("should initialize");
        (conn, statements)
    }

    #[test]
    fn test_tables_created() {
        let (conn, _) = open();
        let count: i32 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
                [],
                |row| row.get(0),
            )
            .expect("should query tables");

        // metadata, events, projection_index, projection_checkpoints
        assert_eq!(count, 4);
    }

    #[test]
    fn test_double_initialization() {
        let (conn, statements) = open();
        initialize(&conn, &statements).expect("second initialize should work");
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let (conn, statements) = open();
        conn.execute(
            "UPDATE eventide_metadata SET value = '99' WHERE key = 'schema_version'",
            [],
        )
        .unwrap();

        let err = initialize(&conn, &statements).unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }

    #[test]
    fn test_escape_identifier() {
        assert_eq!(SqliteDialect.escape_identifier("events"), "\"events\"");
        assert_eq!(SqliteDialect.escape_identifier("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_prefixed_tables_usable() {
        let conn = Connection::open_in_memory().unwrap();
        let statements = Statements::render(&TableNames::with_prefix("t1 "), &SqliteDialect);
        initialize(&conn, &statements).unwrap();
        let max: i64 = conn
            .query_row(&statements.max_global_seq, [], |row| row.get(0))
            .unwrap();
        assert_eq!(max, 0);
    }

    #[test]
    fn test_duplicate_key_classification() {
        let (conn, _) = open();
        conn.execute(
            "INSERT INTO projection_checkpoints (projection_id, global_seq) VALUES ('p', 1)",
            [],
        )
        .unwrap();
        let err = conn
            .execute(
                "INSERT INTO projection_checkpoints (projection_id, global_seq) VALUES ('p', 2)",
                [],
            )
            .unwrap_err();
        assert!(SqliteDialect.is_duplicate_key(&err));
        assert!(classify(&SqliteDialect, err, || "p".into()).is_duplicate());

        assert!(!SqliteDialect.is_duplicate_key(&rusqlite::Error::InvalidQuery));
    }

    #[test]
    fn test_multi_row_insert() {
        assert_eq!(multi_row_insert("INSERT INTO t VALUES ", 2, 3), "INSERT INTO t VALUES (?,?,?),(?,?,?)");
    }
}
