// =============================================================================
// Pre-render track filtering
// =============================================================================
//
// Applied to the track set before any coordinate mapping, so the transform
// never depends on business filters. Manual (pinned) tracks ignore the volume,
// rank-change and direction filters; the time window applies to all.
// =============================================================================

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Direction, Track};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    ManualOnly,
    RankedOnly,
    #[default]
    Both,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackFilter {
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
    /// Minimum 24h quote volume at the track's end point.
    #[serde(default)]
    pub min_volume: Option<f64>,
    /// Minimum |rank change| between the endpoints.
    #[serde(default)]
    pub min_rank_change: Option<u32>,
    #[serde(default)]
    pub kind: TrackKind,
    /// Allowed directions; empty allows all.
    #[serde(default)]
    pub directions: BTreeSet<Direction>,
}

impl TrackFilter {
    pub fn matches(&self, track: &Track) -> bool {
        if let Some(from) = self.from {
            if track.start.timestamp < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if track.end.timestamp > to {
                return false;
            }
        }

        match (self.kind, track.is_manual) {
            (TrackKind::ManualOnly, false) | (TrackKind::RankedOnly, true) => return false,
            _ => {}
        }
        if track.is_manual {
            return true;
        }

        if let Some(min) = self.min_volume {
            if !track.end.volume.is_some_and(|v| v >= min) {
                return false;
            }
        }
        if let Some(min) = self.min_rank_change {
            if track.rank_change() < min {
                return false;
            }
        }
        self.directions.is_empty() || self.directions.contains(&track.direction())
    }

    pub fn apply<'a>(&self, tracks: &'a [Track]) -> Vec<&'a Track> {
        tracks.iter().filter(|t| self.matches(t)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Exchange, MarketKey, MarketType, TrackPoint};
    use chrono::Duration;

    fn track(pair: &str, ranks: (u32, u32), volume: Option<f64>, manual: bool, end: DateTime<Utc>) -> Track {
        let point = |ts, rank| TrackPoint {
            timestamp: ts,
            rank,
            price: 1.0,
            change_pct: 0.0,
            volume,
        };
        Track {
            pair: pair.into(),
            market: MarketKey::new(Exchange::Binance, MarketType::Spot, Some("USDT")),
            start: point(end - Duration::seconds(60), ranks.0),
            end: point(end, ranks.1),
            is_manual: manual,
            color: "#336699".into(),
        }
    }

    #[test]
    fn manual_tracks_bypass_volume_and_rank_change() {
        let now = Utc::now();
        let tracks = vec![
            track("LOW", (5, 5), Some(10.0), false, now),
            track("PIN", (300, 300), None, true, now),
            track("BIG", (9, 2), Some(1e6), false, now),
        ];
        let f = TrackFilter {
            min_volume: Some(1_000.0),
            min_rank_change: Some(3),
            ..TrackFilter::default()
        };
        let kept: Vec<&str> = f.apply(&tracks).iter().map(|t| t.pair.as_str()).collect();
        assert_eq!(kept, vec!["PIN", "BIG"]);
    }

    #[test]
    fn kind_and_direction_selection() {
        let now = Utc::now();
        let tracks = vec![
            track("UP", (5, 1), Some(1.0), false, now),
            track("DOWN", (1, 5), Some(1.0), false, now),
            track("PIN", (1, 5), Some(1.0), true, now),
        ];

        let manual_only = TrackFilter {
            kind: TrackKind::ManualOnly,
            ..TrackFilter::default()
        };
        assert_eq!(manual_only.apply(&tracks).len(), 1);

        let ranked_up = TrackFilter {
            kind: TrackKind::RankedOnly,
            directions: BTreeSet::from([Direction::Up]),
            ..TrackFilter::default()
        };
        let kept: Vec<&str> = ranked_up.apply(&tracks).iter().map(|t| t.pair.as_str()).collect();
        assert_eq!(kept, vec!["UP"]);
    }

    #[test]
    fn time_window_applies_to_manual_too() {
        let now = Utc::now();
        let tracks = vec![
            track("OLD", (1, 2), None, true, now - Duration::hours(2)),
            track("NEW", (1, 2), None, true, now),
        ];
        let f = TrackFilter {
            from: Some(now - Duration::minutes(30)),
            ..TrackFilter::default()
        };
        let kept: Vec<&str> = f.apply(&tracks).iter().map(|t| t.pair.as_str()).collect();
        assert_eq!(kept, vec!["NEW"]);
    }
}
