// =============================================================================
// SQLite schema and connection setup for the snapshot store
// =============================================================================
//
// A snapshot is stored flattened, one row per observation, keyed by
// (market, timestamp, pair). Tracks keep only their identity, flags and color;
// their endpoints are read back by joining `snapshots`, so a track whose
// endpoint snapshot is gone can never be returned.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;

pub type DbPool = Pool<SqliteConnectionManager>;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS snapshots (
    timestamp_ms INTEGER NOT NULL,
    exchange     TEXT    NOT NULL,
    market_type  TEXT    NOT NULL,
    quote        TEXT    NOT NULL,
    pair         TEXT    NOT NULL,
    price        REAL    NOT NULL,
    pct_change   REAL    NOT NULL,
    volume       REAL,
    rank         INTEGER NOT NULL,
    PRIMARY KEY (exchange, market_type, quote, timestamp_ms, pair)
);
CREATE INDEX IF NOT EXISTS idx_snapshots_ts ON snapshots (timestamp_ms);
CREATE INDEX IF NOT EXISTS idx_snapshots_pair ON snapshots (pair);

CREATE TABLE IF NOT EXISTS tracks (
    exchange    TEXT    NOT NULL,
    market_type TEXT    NOT NULL,
    quote       TEXT    NOT NULL,
    pair        TEXT    NOT NULL,
    t0          INTEGER NOT NULL,
    t1          INTEGER NOT NULL,
    is_manual   INTEGER NOT NULL,
    color       TEXT    NOT NULL,
    PRIMARY KEY (exchange, market_type, quote, pair, t0, t1)
);
CREATE INDEX IF NOT EXISTS idx_tracks_t1 ON tracks (t1);

CREATE TABLE IF NOT EXISTS colors (
    pair  TEXT PRIMARY KEY,
    color TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS manual_selection (
    pair TEXT PRIMARY KEY
);

CREATE TABLE IF NOT EXISTS meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Open the single writer connection and make sure the schema exists.
pub fn open_writer(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    // journal_mode answers with the resulting mode, so it needs the checked form.
    let _mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |r| r.get(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

/// Pool of reader connections. WAL lets them read committed data while the
/// writer holds a transaction.
pub fn open_reader_pool(path: &Path, max_size: u32) -> Result<DbPool, r2d2::Error> {
    let manager = SqliteConnectionManager::file(path).with_init(|c| c.busy_timeout(BUSY_TIMEOUT));
    Pool::builder().max_size(max_size).build(manager)
}
