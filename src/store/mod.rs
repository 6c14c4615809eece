// =============================================================================
// Snapshot Store — durable snapshots, tracks, colors and manual selection
// =============================================================================
//
// One writer connection behind a mutex serialises every write; readers come
// from a pool and, thanks to WAL, never wait for a write to commit. Each
// public write runs in a single transaction, so a snapshot (all of its
// observations) or a retention sweep (snapshots plus the tracks that lost an
// endpoint) is seen by readers either entirely or not at all.
//
// Visibility: queries never return data older than the configured retention
// horizon, even if the physical sweep has not run yet.
//
// All methods block; async callers go through `spawn_blocking`.
// =============================================================================

pub mod colors;
pub mod schema;

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::types::{Color, MarketKey, PairObservation, Snapshot, Track, TrackPoint};
use schema::DbPool;

const READER_POOL_SIZE: u32 = 4;
const MANUAL_SEEDED_KEY: &str = "manual_seeded";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("color palette exhausted")]
    PaletteExhausted,

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Inclusive time window; open ends are unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TimeRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn since(from: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            to: None,
        }
    }

    fn bounds_ms(&self, horizon: DateTime<Utc>) -> (i64, i64) {
        let from = self.from.map_or(horizon, |f| f.max(horizon));
        let to = self.to.map_or(i64::MAX, |t| t.timestamp_millis());
        (from.timestamp_millis(), to)
    }
}

/// Rows removed by one retention sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetentionOutcome {
    pub snapshots: usize,
    pub tracks: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StoreStats {
    pub snapshots: u64,
    pub tracks: u64,
    pub colors: u64,
}

pub struct SnapshotStore {
    writer: Mutex<Connection>,
    readers: DbPool,
    retention: RwLock<Duration>,
    color_cache: RwLock<HashMap<String, Color>>,
}

impl SnapshotStore {
    pub fn open(path: &Path, retention: Duration) -> Result<Self, StoreError> {
        let writer = schema::open_writer(path)?;
        let readers = schema::open_reader_pool(path, READER_POOL_SIZE)?;
        info!(path = %path.display(), "snapshot store opened");
        Ok(Self {
            writer: Mutex::new(writer),
            readers,
            retention: RwLock::new(retention),
            color_cache: RwLock::new(HashMap::new()),
        })
    }

    /// Change the visibility horizon used by queries.
    pub fn set_retention(&self, retention: Duration) {
        *self.retention.write() = retention;
    }

    fn horizon(&self) -> DateTime<Utc> {
        Utc::now() - *self.retention.read()
    }

    // -------------------------------------------------------------------------
    // Snapshots
    // -------------------------------------------------------------------------

    /// Persist a snapshot atomically.
    pub fn write_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        self.write_cycle(snapshot, &[])
    }

    /// Persist a snapshot together with the tracks that end at it, in one
    /// transaction: either the whole cycle result is stored or none of it.
    pub fn write_cycle(&self, snapshot: &Snapshot, tracks: &[Track]) -> Result<(), StoreError> {
        validate(snapshot)?;
        let ts = snapshot.timestamp.timestamp_millis();
        let m = &snapshot.market;

        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO snapshots
                 (timestamp_ms, exchange, market_type, quote, pair, price, pct_change, volume, rank)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for o in &snapshot.observations {
                stmt.execute(params![
                    ts,
                    m.exchange.as_str(),
                    m.market_type.as_str(),
                    m.quote_token(),
                    o.pair,
                    o.price,
                    o.change_pct,
                    o.volume,
                    o.rank,
                ])?;
            }
        }
        let inserted = insert_tracks(&tx, tracks)?;
        tx.commit()?;

        debug!(market = %m, pairs = snapshot.len(), tracks = inserted, "snapshot written");
        Ok(())
    }

    /// Visible snapshots of `market` within `range`, oldest first.
    pub fn query_snapshots(&self, market: &MarketKey, range: TimeRange) -> Result<Vec<Snapshot>, StoreError> {
        let (from, to) = range.bounds_ms(self.horizon());
        let conn = self.readers.get()?;
        let mut stmt = conn.prepare_cached(
            "SELECT timestamp_ms, pair, price, pct_change, volume, rank FROM snapshots
             WHERE exchange = ?1 AND market_type = ?2 AND quote = ?3
               AND timestamp_ms >= ?4 AND timestamp_ms <= ?5
             ORDER BY timestamp_ms, rank",
        )?;
        let rows = stmt.query_map(
            params![market.exchange.as_str(), market.market_type.as_str(), market.quote_token(), from, to],
            |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    PairObservation {
                        pair: r.get(1)?,
                        price: r.get(2)?,
                        change_pct: r.get(3)?,
                        volume: r.get(4)?,
                        rank: r.get(5)?,
                    },
                ))
            },
        )?;

        let mut out: Vec<Snapshot> = Vec::new();
        for row in rows {
            let (ms, obs) = row?;
            match out.last_mut() {
                Some(s) if s.timestamp.timestamp_millis() == ms => s.observations.push(obs),
                _ => out.push(Snapshot {
                    timestamp: from_ms(ms)?,
                    market: market.clone(),
                    observations: vec![obs],
                }),
            }
        }
        Ok(out)
    }

    /// Most recent visible snapshot of `market`.
    pub fn latest_snapshot(&self, market: &MarketKey) -> Result<Option<Snapshot>, StoreError> {
        let latest: Option<i64> = {
            let conn = self.readers.get()?;
            conn.query_row(
                "SELECT MAX(timestamp_ms) FROM snapshots
                 WHERE exchange = ?1 AND market_type = ?2 AND quote = ?3",
                params![market.exchange.as_str(), market.market_type.as_str(), market.quote_token()],
                |r| r.get(0),
            )?
        };
        let Some(ms) = latest else {
            return Ok(None);
        };
        let at = from_ms(ms)?;
        let range = TimeRange {
            from: Some(at),
            to: Some(at),
        };
        Ok(self.query_snapshots(market, range)?.pop())
    }

    // -------------------------------------------------------------------------
    // Tracks
    // -------------------------------------------------------------------------

    /// Append tracks. Tracks are immutable, so an existing identity is kept.
    pub fn write_tracks(&self, tracks: &[Track]) -> Result<usize, StoreError> {
        if tracks.is_empty() {
            return Ok(0);
        }
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;
        let inserted = insert_tracks(&tx, tracks)?;
        tx.commit()?;
        Ok(inserted)
    }

    /// Replace every stored track of `market` in one transaction.
    pub fn replace_tracks(&self, market: &MarketKey, tracks: &[Track]) -> Result<usize, StoreError> {
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM tracks WHERE exchange = ?1 AND market_type = ?2 AND quote = ?3",
            params![market.exchange.as_str(), market.market_type.as_str(), market.quote_token()],
        )?;
        let inserted = insert_tracks(&tx, tracks)?;
        tx.commit()?;
        info!(market = %market, tracks = inserted, "tracks replaced");
        Ok(inserted)
    }

    /// Visible tracks of `market` whose both endpoints lie within `range`,
    /// ordered by end time then pair.
    pub fn query_tracks(&self, market: &MarketKey, range: TimeRange) -> Result<Vec<Track>, StoreError> {
        let (from, to) = range.bounds_ms(self.horizon());
        let conn = self.readers.get()?;
        let mut stmt = conn.prepare_cached(
            "SELECT t.pair, t.t0, t.t1, t.is_manual, t.color,
                    a.rank, a.price, a.pct_change, a.volume,
                    b.rank, b.price, b.pct_change, b.volume
             FROM tracks t
             JOIN snapshots a ON a.exchange = t.exchange AND a.market_type = t.market_type
                AND a.quote = t.quote AND a.timestamp_ms = t.t0 AND a.pair = t.pair
             JOIN snapshots b ON b.exchange = t.exchange AND b.market_type = t.market_type
                AND b.quote = t.quote AND b.timestamp_ms = t.t1 AND b.pair = t.pair
             WHERE t.exchange = ?1 AND t.market_type = ?2 AND t.quote = ?3
               AND t.t0 >= ?4 AND t.t1 <= ?5
             ORDER BY t.t1, t.pair",
        )?;

        struct Row {
            pair: String,
            t0: i64,
            t1: i64,
            is_manual: bool,
            color: String,
            start: (u32, f64, f64, Option<f64>),
            end: (u32, f64, f64, Option<f64>),
        }

        let rows = stmt.query_map(
            params![market.exchange.as_str(), market.market_type.as_str(), market.quote_token(), from, to],
            |r| {
                Ok(Row {
                    pair: r.get(0)?,
                    t0: r.get(1)?,
                    t1: r.get(2)?,
                    is_manual: r.get(3)?,
                    color: r.get(4)?,
                    start: (r.get(5)?, r.get(6)?, r.get(7)?, r.get(8)?),
                    end: (r.get(9)?, r.get(10)?, r.get(11)?, r.get(12)?),
                })
            },
        )?;

        let point = |ms: i64, (rank, price, change_pct, volume): (u32, f64, f64, Option<f64>)| {
            Ok::<_, StoreError>(TrackPoint {
                timestamp: from_ms(ms)?,
                rank,
                price,
                change_pct,
                volume,
            })
        };

        let mut out = Vec::new();
        for row in rows {
            let row = row?;
            out.push(Track {
                pair: row.pair,
                market: market.clone(),
                start: point(row.t0, row.start)?,
                end: point(row.t1, row.end)?,
                is_manual: row.is_manual,
                color: row.color,
            });
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // Retention
    // -------------------------------------------------------------------------

    /// Delete snapshots older than `max_age` and every track that lost an
    /// endpoint, in one transaction.
    pub fn apply_retention(&self, max_age: Duration) -> Result<RetentionOutcome, StoreError> {
        let cutoff = (Utc::now() - max_age).timestamp_millis();
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;

        let snapshots: i64 = tx.query_row(
            "SELECT COUNT(*) FROM (SELECT DISTINCT exchange, market_type, quote, timestamp_ms
                                   FROM snapshots WHERE timestamp_ms < ?1)",
            params![cutoff],
            |r| r.get(0),
        )?;
        tx.execute("DELETE FROM snapshots WHERE timestamp_ms < ?1", params![cutoff])?;
        let tracks = tx.execute(
            "DELETE FROM tracks WHERE
                NOT EXISTS (SELECT 1 FROM snapshots s
                            WHERE s.exchange = tracks.exchange AND s.market_type = tracks.market_type
                              AND s.quote = tracks.quote AND s.timestamp_ms = tracks.t0
                              AND s.pair = tracks.pair)
             OR NOT EXISTS (SELECT 1 FROM snapshots s
                            WHERE s.exchange = tracks.exchange AND s.market_type = tracks.market_type
                              AND s.quote = tracks.quote AND s.timestamp_ms = tracks.t1
                              AND s.pair = tracks.pair)",
            [],
        )?;
        tx.commit()?;

        let outcome = RetentionOutcome {
            snapshots: snapshots as usize,
            tracks,
        };
        if outcome != RetentionOutcome::default() {
            info!(snapshots = outcome.snapshots, tracks = outcome.tracks, "retention sweep deleted rows");
        }
        Ok(outcome)
    }

    // -------------------------------------------------------------------------
    // Colors
    // -------------------------------------------------------------------------

    /// Stable color for `pair`, assigned on first request. No two pairs hold
    /// the same color; when the palette runs out, the color of a pair that no
    /// snapshot or track references any more is reclaimed.
    pub fn get_or_assign_color(&self, pair: &str) -> Result<Color, StoreError> {
        if let Some(c) = self.color_cache.read().get(pair) {
            return Ok(c.clone());
        }

        let conn = self.writer.lock();
        let existing: Option<String> = conn
            .query_row("SELECT color FROM colors WHERE pair = ?1", params![pair], |r| r.get(0))
            .optional()?;
        if let Some(color) = existing {
            self.color_cache.write().insert(pair.to_string(), color.clone());
            return Ok(color);
        }

        let taken: BTreeSet<String> = {
            let mut stmt = conn.prepare_cached("SELECT color FROM colors")?;
            let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
            rows.collect::<Result<_, _>>()?
        };

        let color = match colors::pick(pair, colors::palette(), |c| taken.contains(c)) {
            Some(c) => c,
            None => self.reclaim_color(&conn)?,
        };

        conn.execute(
            "INSERT INTO colors (pair, color) VALUES (?1, ?2)",
            params![pair, color],
        )?;
        self.color_cache.write().insert(pair.to_string(), color.clone());
        debug!(pair, color = %color, "color assigned");
        Ok(color)
    }

    /// All stored assignments.
    pub fn color_table(&self) -> Result<HashMap<String, Color>, StoreError> {
        let conn = self.readers.get()?;
        let mut stmt = conn.prepare_cached("SELECT pair, color FROM colors")?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn reclaim_color(&self, conn: &Connection) -> Result<Color, StoreError> {
        let orphan: Option<(String, String)> = conn
            .query_row(
                "SELECT c.pair, c.color FROM colors c
                 WHERE NOT EXISTS (SELECT 1 FROM snapshots s WHERE s.pair = c.pair)
                   AND NOT EXISTS (SELECT 1 FROM tracks t WHERE t.pair = c.pair)
                 ORDER BY c.pair LIMIT 1",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let (old_pair, color) = orphan.ok_or(StoreError::PaletteExhausted)?;
        conn.execute("DELETE FROM colors WHERE pair = ?1", params![old_pair])?;
        self.color_cache.write().remove(&old_pair);
        info!(from = %old_pair, color = %color, "reclaimed color from unreferenced pair");
        Ok(color)
    }

    // -------------------------------------------------------------------------
    // Manual selection
    // -------------------------------------------------------------------------

    pub fn get_manual_selection(&self) -> Result<BTreeSet<String>, StoreError> {
        let conn = self.readers.get()?;
        let mut stmt = conn.prepare_cached("SELECT pair FROM manual_selection ORDER BY pair")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Replace the manual selection.
    pub fn set_manual_selection(&self, pairs: &BTreeSet<String>) -> Result<(), StoreError> {
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM manual_selection", [])?;
        {
            let mut stmt = tx.prepare_cached("INSERT INTO manual_selection (pair) VALUES (?1)")?;
            for p in pairs {
                stmt.execute(params![p])?;
            }
        }
        tx.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, '1')",
            params![MANUAL_SEEDED_KEY],
        )?;
        tx.commit()?;
        info!(pairs = ?pairs, "manual selection updated");
        Ok(())
    }

    /// Seed the manual selection from configuration, once per store. Returns
    /// whether the seed was applied.
    pub fn seed_manual_selection(&self, pairs: &[String]) -> Result<bool, StoreError> {
        let seeded: Option<String> = {
            let conn = self.writer.lock();
            conn.query_row(
                "SELECT value FROM meta WHERE key = ?1",
                params![MANUAL_SEEDED_KEY],
                |r| r.get(0),
            )
            .optional()?
        };
        if seeded.is_some() {
            return Ok(false);
        }
        let set: BTreeSet<String> = pairs.iter().map(|p| p.trim().to_uppercase()).collect();
        self.set_manual_selection(&set)?;
        Ok(true)
    }

    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let conn = self.readers.get()?;
        let count = |sql: &str| conn.query_row(sql, [], |r| r.get::<_, i64>(0));
        Ok(StoreStats {
            snapshots: count(
                "SELECT COUNT(*) FROM (SELECT DISTINCT exchange, market_type, quote, timestamp_ms FROM snapshots)",
            )? as u64,
            tracks: count("SELECT COUNT(*) FROM tracks")? as u64,
            colors: count("SELECT COUNT(*) FROM colors")? as u64,
        })
    }
}

fn insert_tracks(tx: &rusqlite::Transaction<'_>, tracks: &[Track]) -> Result<usize, StoreError> {
    let mut stmt = tx.prepare_cached(
        "INSERT OR IGNORE INTO tracks
         (exchange, market_type, quote, pair, t0, t1, is_manual, color)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )?;
    let mut inserted = 0;
    for t in tracks {
        inserted += stmt.execute(params![
            t.market.exchange.as_str(),
            t.market.market_type.as_str(),
            t.market.quote_token(),
            t.pair,
            t.start.timestamp.timestamp_millis(),
            t.end.timestamp.timestamp_millis(),
            t.is_manual,
            t.color,
        ])?;
    }
    Ok(inserted)
}

fn validate(snapshot: &Snapshot) -> Result<(), StoreError> {
    let mut ranks = BTreeSet::new();
    let mut pairs = BTreeSet::new();
    for o in &snapshot.observations {
        if o.rank == 0 || !ranks.insert(o.rank) {
            return Err(StoreError::InvalidSnapshot(format!("bad or duplicate rank {} for {}", o.rank, o.pair)));
        }
        if !pairs.insert(o.pair.as_str()) {
            return Err(StoreError::InvalidSnapshot(format!("duplicate pair {}", o.pair)));
        }
        if !(o.price.is_finite() && o.price > 0.0) || !o.change_pct.is_finite() {
            return Err(StoreError::InvalidSnapshot(format!("non-finite values for {}", o.pair)));
        }
    }
    Ok(())
}

fn from_ms(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::<Utc>::from_timestamp_millis(ms).ok_or_else(|| StoreError::Corrupt(format!("timestamp {ms}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Exchange, MarketType};

    fn market() -> MarketKey {
        MarketKey::new(Exchange::Binance, MarketType::Spot, Some("USDT"))
    }

    fn snap(at: DateTime<Utc>, pairs: &[(&str, u32)]) -> Snapshot {
        Snapshot {
            timestamp: at,
            market: market(),
            observations: pairs
                .iter()
                .map(|(p, r)| PairObservation {
                    pair: p.to_string(),
                    price: 100.0 / *r as f64,
                    change_pct: 10.0 - *r as f64,
                    volume: Some(1_000.0),
                    rank: *r,
                })
                .collect(),
        }
    }

    fn track(older: &Snapshot, newer: &Snapshot, pair: &str) -> Track {
        Track {
            pair: pair.to_string(),
            market: market(),
            start: TrackPoint::from_observation(older.timestamp, older.get(pair).unwrap()),
            end: TrackPoint::from_observation(newer.timestamp, newer.get(pair).unwrap()),
            is_manual: false,
            color: "#123456".into(),
        }
    }

    fn open() -> (tempfile::TempDir, SnapshotStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(&dir.path().join("tracker.db"), Duration::hours(24)).unwrap();
        (dir, store)
    }

    /// Millisecond-aligned so values survive the round trip through storage.
    fn now_ms() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap()
    }

    #[test]
    fn snapshot_round_trips_in_rank_order() {
        let (_dir, store) = open();
        let s = snap(now_ms(), &[("ETHUSDT", 2), ("BTCUSDT", 1)]);
        store.write_snapshot(&s).unwrap();

        let got = store.query_snapshots(&market(), TimeRange::all()).unwrap();
        assert_eq!(got.len(), 1);
        let order: Vec<&str> = got[0].observations.iter().map(|o| o.pair.as_str()).collect();
        assert_eq!(order, vec!["BTCUSDT", "ETHUSDT"]);
        assert_eq!(got[0].timestamp, s.timestamp);
    }

    #[test]
    fn invalid_snapshot_is_rejected_whole() {
        let (_dir, store) = open();
        let s = snap(now_ms(), &[("BTCUSDT", 1), ("ETHUSDT", 1)]);
        assert!(matches!(store.write_snapshot(&s), Err(StoreError::InvalidSnapshot(_))));
        assert!(store.query_snapshots(&market(), TimeRange::all()).unwrap().is_empty());
    }

    #[test]
    fn duplicate_snapshot_write_leaves_nothing_partial() {
        let (_dir, store) = open();
        let at = now_ms();
        store.write_snapshot(&snap(at, &[("BTCUSDT", 1)])).unwrap();
        // Same key for BTCUSDT collides; ETHUSDT must not land either.
        let clash = snap(at, &[("ETHUSDT", 1), ("BTCUSDT", 2)]);
        assert!(store.write_snapshot(&clash).is_err());
        let got = store.query_snapshots(&market(), TimeRange::all()).unwrap();
        assert_eq!(got[0].len(), 1);
    }

    #[test]
    fn retention_deletes_old_snapshots_and_cascades_to_tracks() {
        let (_dir, store) = open();
        let now = now_ms();
        let old = snap(now - Duration::hours(30), &[("BTCUSDT", 1), ("ETHUSDT", 2)]);
        let mid = snap(now - Duration::hours(2), &[("BTCUSDT", 2), ("ETHUSDT", 1)]);
        let new = snap(now - Duration::hours(1), &[("BTCUSDT", 1), ("ETHUSDT", 2)]);
        for s in [&old, &mid, &new] {
            store.write_snapshot(s).unwrap();
        }
        store
            .write_tracks(&[track(&old, &mid, "BTCUSDT"), track(&mid, &new, "BTCUSDT")])
            .unwrap();

        let outcome = store.apply_retention(Duration::hours(24)).unwrap();
        assert_eq!(outcome, RetentionOutcome { snapshots: 1, tracks: 1 });

        let snaps = store.query_snapshots(&market(), TimeRange::all()).unwrap();
        let horizon = Utc::now() - Duration::hours(24);
        assert!(snaps.iter().all(|s| s.timestamp >= horizon));
        assert_eq!(snaps.len(), 2);

        let tracks = store.query_tracks(&market(), TimeRange::all()).unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].start.timestamp, mid.timestamp);
    }

    #[test]
    fn queries_hide_data_past_retention_before_the_sweep() {
        let (_dir, store) = open();
        let now = now_ms();
        store.write_snapshot(&snap(now - Duration::hours(3), &[("BTCUSDT", 1)])).unwrap();
        store.write_snapshot(&snap(now, &[("BTCUSDT", 1)])).unwrap();
        store.set_retention(Duration::hours(1));
        assert_eq!(store.query_snapshots(&market(), TimeRange::all()).unwrap().len(), 1);
    }

    #[test]
    fn tracks_read_back_endpoints_and_are_append_only() {
        let (_dir, store) = open();
        let now = now_ms();
        let a = snap(now - Duration::seconds(60), &[("BTCUSDT", 1), ("ETHUSDT", 2)]);
        let b = snap(now, &[("ETHUSDT", 1), ("BTCUSDT", 2)]);
        store.write_snapshot(&a).unwrap();
        store.write_snapshot(&b).unwrap();

        let t = track(&a, &b, "ETHUSDT");
        assert_eq!(store.write_tracks(&[t.clone()]).unwrap(), 1);
        assert_eq!(store.write_tracks(&[t.clone()]).unwrap(), 0);

        let got = store.query_tracks(&market(), TimeRange::all()).unwrap();
        assert_eq!(got, vec![t]);
    }

    #[test]
    fn latest_snapshot_returns_newest() {
        let (_dir, store) = open();
        let now = now_ms();
        assert!(store.latest_snapshot(&market()).unwrap().is_none());
        store.write_snapshot(&snap(now - Duration::seconds(60), &[("BTCUSDT", 1)])).unwrap();
        store.write_snapshot(&snap(now, &[("ETHUSDT", 1)])).unwrap();
        let latest = store.latest_snapshot(&market()).unwrap().unwrap();
        assert_eq!(latest.timestamp, now);
        assert_eq!(latest.observations[0].pair, "ETHUSDT");
    }

    #[test]
    fn colors_are_stable_and_unique() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracker.db");
        let (btc, eth) = {
            let store = SnapshotStore::open(&path, Duration::hours(24)).unwrap();
            let btc = store.get_or_assign_color("BTCUSDT").unwrap();
            assert_eq!(store.get_or_assign_color("BTCUSDT").unwrap(), btc);
            let eth = store.get_or_assign_color("ETHUSDT").unwrap();
            assert_ne!(btc, eth);
            (btc, eth)
        };
        // Survives a restart.
        let store = SnapshotStore::open(&path, Duration::hours(24)).unwrap();
        assert_eq!(store.get_or_assign_color("BTCUSDT").unwrap(), btc);
        assert_eq!(store.get_or_assign_color("ETHUSDT").unwrap(), eth);
        assert_eq!(store.color_table().unwrap().len(), 2);
    }

    #[test]
    fn many_pairs_never_share_a_color() {
        let (_dir, store) = open();
        let mut seen = BTreeSet::new();
        for i in 0..300 {
            let c = store.get_or_assign_color(&format!("P{i}USDT")).unwrap();
            assert!(seen.insert(c));
        }
    }

    #[test]
    fn manual_selection_replace_and_seed_once() {
        let (_dir, store) = open();
        assert!(store.seed_manual_selection(&["dogeusdt".into()]).unwrap());
        assert_eq!(store.get_manual_selection().unwrap(), BTreeSet::from(["DOGEUSDT".to_string()]));

        assert!(!store.seed_manual_selection(&["PEPEUSDT".into()]).unwrap());

        store.set_manual_selection(&BTreeSet::new()).unwrap();
        assert!(store.get_manual_selection().unwrap().is_empty());
        assert!(!store.seed_manual_selection(&["PEPEUSDT".into()]).unwrap());
    }
}
