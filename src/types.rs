// =============================================================================
// Shared types used across the rank tracker
// =============================================================================
//
// Snapshots and tracks are plain values. A Snapshot is immutable once built;
// a Track is identified by (pair, start timestamp, end timestamp) and never
// changes after both endpoints are known.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Market identity
// =============================================================================

/// Supported exchanges. Each variant has exactly one adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    Binance,
    Mexc,
    Bybit,
    Okx,
}

impl Default for Exchange {
    fn default() -> Self {
        Self::Binance
    }
}

impl Exchange {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Binance => "binance",
            Self::Mexc => "mexc",
            Self::Bybit => "bybit",
            Self::Okx => "okx",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "binance" => Some(Self::Binance),
            "mexc" => Some(Self::Mexc),
            "bybit" => Some(Self::Bybit),
            "okx" => Some(Self::Okx),
            _ => None,
        }
    }
}

impl std::fmt::Display for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Spot or perpetual-futures market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketType {
    Spot,
    Futures,
}

impl Default for MarketType {
    fn default() -> Self {
        Self::Spot
    }
}

impl MarketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spot => "spot",
            Self::Futures => "futures",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "spot" => Some(Self::Spot),
            "futures" => Some(Self::Futures),
            _ => None,
        }
    }
}

impl std::fmt::Display for MarketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The (exchange, market type, quote currency) triple a snapshot belongs to.
///
/// `quote = None` means "all pairs" and is stored as `"*"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MarketKey {
    pub exchange: Exchange,
    pub market_type: MarketType,
    pub quote: Option<String>,
}

/// Storage token for the "all pairs" quote filter.
pub const ALL_QUOTES: &str = "*";

impl MarketKey {
    pub fn new(exchange: Exchange, market_type: MarketType, quote: Option<&str>) -> Self {
        Self {
            exchange,
            market_type,
            quote: quote
                .map(|q| q.trim().to_uppercase())
                .filter(|q| !q.is_empty() && q != ALL_QUOTES),
        }
    }

    pub fn quote_token(&self) -> &str {
        self.quote.as_deref().unwrap_or(ALL_QUOTES)
    }

    pub fn from_tokens(exchange: &str, market_type: &str, quote: &str) -> Option<Self> {
        Some(Self::new(
            Exchange::parse(exchange)?,
            MarketType::parse(market_type)?,
            Some(quote),
        ))
    }
}

impl std::fmt::Display for MarketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.exchange, self.market_type, self.quote_token())
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// One ranked pair inside a snapshot. `rank` is 1-based, 1 = best gainer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairObservation {
    pub pair: String,
    pub price: f64,
    pub change_pct: f64,
    #[serde(default)]
    pub volume: Option<f64>,
    pub rank: u32,
}

/// A timestamped ranked list for one market. Observations are ordered by rank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub timestamp: DateTime<Utc>,
    pub market: MarketKey,
    pub observations: Vec<PairObservation>,
}

impl Snapshot {
    pub fn get(&self, pair: &str) -> Option<&PairObservation> {
        self.observations.iter().find(|o| o.pair == pair)
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }
}

// =============================================================================
// Tracks
// =============================================================================

/// A hex color string such as `#3fa0ff`.
pub type Color = String;

/// Fallback color when a pair has no assignment.
pub const FALLBACK_COLOR: &str = "#ff0000";

/// One endpoint of a track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackPoint {
    pub timestamp: DateTime<Utc>,
    pub rank: u32,
    pub price: f64,
    pub change_pct: f64,
    #[serde(default)]
    pub volume: Option<f64>,
}

impl TrackPoint {
    pub fn from_observation(timestamp: DateTime<Utc>, obs: &PairObservation) -> Self {
        Self {
            timestamp,
            rank: obs.rank,
            price: obs.price,
            change_pct: obs.change_pct,
            volume: obs.volume,
        }
    }
}

/// Rank movement between the two endpoints of a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Flat,
    Down,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Up => write!(f, "up"),
            Self::Flat => write!(f, "flat"),
            Self::Down => write!(f, "down"),
        }
    }
}

/// A two-point segment for a pair across two consecutive snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub pair: String,
    pub market: MarketKey,
    pub start: TrackPoint,
    pub end: TrackPoint,
    pub is_manual: bool,
    pub color: Color,
}

impl Track {
    /// Identity triple.
    pub fn id(&self) -> (&str, DateTime<Utc>, DateTime<Utc>) {
        (&self.pair, self.start.timestamp, self.end.timestamp)
    }

    /// A lower rank number is a better position, so a decreasing rank is "up".
    pub fn direction(&self) -> Direction {
        match self.end.rank.cmp(&self.start.rank) {
            std::cmp::Ordering::Less => Direction::Up,
            std::cmp::Ordering::Equal => Direction::Flat,
            std::cmp::Ordering::Greater => Direction::Down,
        }
    }

    pub fn rank_change(&self) -> u32 {
        self.start.rank.abs_diff(self.end.rank)
    }
}

// =============================================================================
// Collector status
// =============================================================================

/// Collector lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectorState {
    Stopped,
    Running,
}

impl Default for CollectorState {
    fn default() -> Self {
        Self::Stopped
    }
}

impl std::fmt::Display for CollectorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "Stopped"),
            Self::Running => write!(f, "Running"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(rank: u32) -> TrackPoint {
        TrackPoint {
            timestamp: Utc::now(),
            rank,
            price: 1.0,
            change_pct: 0.0,
            volume: None,
        }
    }

    #[test]
    fn market_key_normalises_quote() {
        let key = MarketKey::new(Exchange::Binance, MarketType::Spot, Some(" usdt "));
        assert_eq!(key.quote.as_deref(), Some("USDT"));
        assert_eq!(key.to_string(), "binance/spot/USDT");

        let all = MarketKey::new(Exchange::Okx, MarketType::Futures, Some("*"));
        assert_eq!(all.quote, None);
        assert_eq!(all.quote_token(), ALL_QUOTES);
    }

    #[test]
    fn market_key_round_trips_tokens() {
        let key = MarketKey::new(Exchange::Bybit, MarketType::Futures, None);
        let back = MarketKey::from_tokens("bybit", "futures", key.quote_token()).unwrap();
        assert_eq!(key, back);
    }

    #[test]
    fn track_direction_follows_rank() {
        let market = MarketKey::new(Exchange::Binance, MarketType::Spot, Some("USDT"));
        let mut track = Track {
            pair: "BTCUSDT".into(),
            market,
            start: point(5),
            end: point(2),
            is_manual: false,
            color: FALLBACK_COLOR.into(),
        };
        assert_eq!(track.direction(), Direction::Up);
        assert_eq!(track.rank_change(), 3);

        track.end.rank = 9;
        assert_eq!(track.direction(), Direction::Down);

        track.end.rank = 5;
        assert_eq!(track.direction(), Direction::Flat);
        assert_eq!(track.rank_change(), 0);
    }
}
