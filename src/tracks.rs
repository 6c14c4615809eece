// =============================================================================
// Track Builder — two-point tracks from consecutive snapshots
// =============================================================================
//
// `build_tracks` is a pure, total function of (older, newer, manual
// selection, color table): it never fails and never persists. Relevance
// filtering (volume, rank movement) belongs to the renderer, so every pair
// observed in both snapshots gets a track.
//
// `rebuild_tracks` replays a whole snapshot history, chaining snapshots that
// sit roughly `target_interval` apart.
// =============================================================================

use std::collections::{HashMap, HashSet};

use chrono::Duration;
use tracing::debug;

use crate::types::{Color, Snapshot, Track, TrackPoint, FALLBACK_COLOR};

/// How far a candidate pairing may deviate from the target interval.
const INTERVAL_TOLERANCE_SECS: i64 = 30;

/// Snapshots examined ahead of the current one when pairing for a rebuild.
const LOOK_AHEAD: usize = 20;

/// One track per pair ranked in both snapshots, tagged `is_manual` when the
/// pair is in the manual selection. Snapshots of different markets or out of
/// time order produce nothing.
pub fn build_tracks(
    older: &Snapshot,
    newer: &Snapshot,
    manual: &HashSet<String>,
    colors: &HashMap<String, Color>,
) -> Vec<Track> {
    if older.market != newer.market || newer.timestamp <= older.timestamp {
        debug!(
            older = %older.timestamp,
            newer = %newer.timestamp,
            "snapshots not comparable, no tracks"
        );
        return Vec::new();
    }

    let by_pair: HashMap<&str, _> = older
        .observations
        .iter()
        .filter(|o| o.rank >= 1)
        .map(|o| (o.pair.as_str(), o))
        .collect();

    newer
        .observations
        .iter()
        .filter(|o| o.rank >= 1)
        .filter_map(|end| {
            let start = by_pair.get(end.pair.as_str())?;
            Some(Track {
                pair: end.pair.clone(),
                market: newer.market.clone(),
                start: TrackPoint::from_observation(older.timestamp, start),
                end: TrackPoint::from_observation(newer.timestamp, end),
                is_manual: manual.contains(&end.pair),
                color: colors
                    .get(&end.pair)
                    .cloned()
                    .unwrap_or_else(|| FALLBACK_COLOR.to_string()),
            })
        })
        .collect()
}

/// Index pairs (older, newer) chaining through `snapshots` (oldest first).
///
/// From each snapshot the next one is the first within the look-ahead window
/// whose distance is within tolerance of `target`, otherwise the closest one
/// in the window. The chain then continues from the chosen snapshot.
pub fn plan_rebuild(snapshots: &[Snapshot], target: Duration) -> Vec<(usize, usize)> {
    let target_secs = target.num_seconds();
    let mut plan = Vec::new();
    let mut i = 0;

    while i + 1 < snapshots.len() {
        let base = snapshots[i].timestamp;
        let window = (i + 1)..snapshots.len().min(i + 1 + LOOK_AHEAD);

        let mut best: Option<(usize, i64)> = None;
        for j in window {
            let diff = ((snapshots[j].timestamp - base).num_seconds() - target_secs).abs();
            if diff <= INTERVAL_TOLERANCE_SECS {
                best = Some((j, diff));
                break;
            }
            if best.map_or(true, |(_, d)| diff < d) {
                best = Some((j, diff));
            }
        }

        let Some((j, _)) = best else {
            break;
        };
        plan.push((i, j));
        i = j;
    }

    plan
}

/// Rebuild every track of a snapshot history.
pub fn rebuild_tracks(
    snapshots: &[Snapshot],
    target: Duration,
    manual: &HashSet<String>,
    colors: &HashMap<String, Color>,
) -> Vec<Track> {
    plan_rebuild(snapshots, target)
        .into_iter()
        .flat_map(|(i, j)| build_tracks(&snapshots[i], &snapshots[j], manual, colors))
        .collect()
}
