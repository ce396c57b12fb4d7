//! SQLite persistence for VidScribe.
//!
//! One database file holds everything: engine runs and their event logs,
//! transcript cache, versioned user runs, the slide-extraction lifecycle,
//! slides, feedback, per-slide analyses, and super-analyses. A single
//! writer connection behind a mutex keeps appends atomic; WAL mode keeps
//! readers cheap.

mod runs;
mod slides;
mod transcripts;
mod versions;

pub use runs::RunRow;
pub use versions::ClaimOutcome;

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::Connection;

use vs_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        Self::init(conn)
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "wal").ok();
        conn.pragma_update(None, "synchronous", "normal").ok();
        conn.pragma_update(None, "foreign_keys", "on").ok();
        conn.busy_timeout(std::time::Duration::from_millis(5_000))
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn with<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn).map_err(db_err)
    }
}

/// Storage failures surface as retriable errors; the step executor's
/// retry policy applies.
pub(crate) fn db_err(e: rusqlite::Error) -> Error {
    Error::Store(e.to_string())
}

/// Parse a stored RFC 3339 timestamp, falling back to now on corruption.
pub(crate) fn parse_ts(raw: &str) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .unwrap_or_else(|_| chrono::Utc::now())
}

pub(crate) fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Schema
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    run_id      TEXT PRIMARY KEY,
    workflow    TEXT NOT NULL,
    args_json   TEXT NOT NULL,
    args_digest TEXT NOT NULL,
    state       TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS events (
    run_id  TEXT NOT NULL,
    idx     INTEGER NOT NULL,
    kind    TEXT NOT NULL,
    payload TEXT NOT NULL,
    ts      TEXT NOT NULL,
    PRIMARY KEY (run_id, idx)
);

CREATE TABLE IF NOT EXISTS transcripts (
    video_id      TEXT PRIMARY KEY,
    title         TEXT NOT NULL,
    channel_name  TEXT NOT NULL,
    description   TEXT NOT NULL DEFAULT '',
    segments_json TEXT NOT NULL,
    created_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS versioned_runs (
    resource_id             TEXT NOT NULL,
    version                 INTEGER NOT NULL,
    status                  TEXT NOT NULL,
    workflow_run_id         TEXT,
    additional_instructions TEXT,
    result_json             TEXT,
    created_at              TEXT NOT NULL,
    updated_at              TEXT NOT NULL,
    PRIMARY KEY (resource_id, version)
);

CREATE UNIQUE INDEX IF NOT EXISTS versioned_runs_one_streaming
    ON versioned_runs (resource_id) WHERE status = 'streaming';

CREATE TABLE IF NOT EXISTS slide_extraction (
    video_id      TEXT PRIMARY KEY,
    status        TEXT NOT NULL,
    run_id        TEXT,
    total_slides  INTEGER,
    error_message TEXT,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS slides (
    video_id           TEXT NOT NULL,
    slide_number       INTEGER NOT NULL,
    start_seconds      REAL,
    end_seconds        REAL,
    first_image_url    TEXT,
    first_source_uri   TEXT,
    first_has_text     INTEGER NOT NULL DEFAULT 0,
    first_dup_of_slide INTEGER,
    first_dup_of_frame TEXT,
    first_error        TEXT,
    last_image_url     TEXT,
    last_source_uri    TEXT,
    last_has_text      INTEGER NOT NULL DEFAULT 0,
    last_dup_of_slide  INTEGER,
    last_dup_of_frame  TEXT,
    last_error         TEXT,
    PRIMARY KEY (video_id, slide_number)
);

CREATE TABLE IF NOT EXISTS slide_feedback (
    video_id        TEXT NOT NULL,
    slide_number    INTEGER NOT NULL,
    is_first_picked INTEGER NOT NULL DEFAULT 0,
    is_last_picked  INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (video_id, slide_number)
);

CREATE TABLE IF NOT EXISTS slide_analysis_results (
    video_id       TEXT NOT NULL,
    slide_number   INTEGER NOT NULL,
    frame_position TEXT NOT NULL,
    markdown       TEXT NOT NULL,
    created_at     TEXT NOT NULL,
    PRIMARY KEY (video_id, slide_number, frame_position)
);

CREATE TABLE IF NOT EXISTS super_analyses (
    video_id   TEXT PRIMARY KEY,
    markdown   TEXT NOT NULL,
    created_at TEXT NOT NULL
);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_in_memory_and_applies_schema() {
        let store = Store::open_in_memory().unwrap();
        // Schema application is idempotent; a second batch run must not fail.
        store.with(|c| c.execute_batch(SCHEMA)).unwrap();
    }

    #[test]
    fn opens_on_disk_creating_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/state/vidscribe.db");
        let store = Store::open(&path).unwrap();
        drop(store);
        assert!(path.exists());

        // Re-opening an existing database works.
        Store::open(&path).unwrap();
    }
}
