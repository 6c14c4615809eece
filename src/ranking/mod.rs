// =============================================================================
// Ranking Fetcher — concurrent fetch, screen and rank of one market
// =============================================================================
//
// One call produces one ranked `Snapshot`. Per-symbol failures are absorbed
// into a `PartialFailure` summary; only a cycle where nothing could be
// fetched at all (or nothing matched the market) is a failed cycle.
// =============================================================================

pub mod fetcher;
pub mod rank;
pub mod retry;

use std::collections::BTreeMap;

use thiserror::Error;

use crate::exchange::AdapterError;
use crate::types::Snapshot;

pub use fetcher::{fetch_snapshot, FetchParams, FetchRequest};
pub use retry::RetryPolicy;

/// Why a single symbol is missing from a snapshot.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PairError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error("abandoned at cycle deadline")]
    DeadlineExceeded,

    #[error("not started before stop")]
    Cancelled,

    #[error("ticker has no last price")]
    MissingPrice,

    #[error("ticker has no 24h change")]
    MissingChange,

    #[error("non-positive price {0}")]
    NonPositivePrice(f64),

    #[error("stale ticker ({age_minutes} min old)")]
    Stale { age_minutes: i64 },
}

impl PairError {
    /// Failures that say something about the exchange connection, as opposed
    /// to a ticker that arrived but was unusable.
    fn is_transport(&self) -> bool {
        matches!(self, Self::Adapter(_) | Self::DeadlineExceeded)
    }
}

/// Cycle-level failure of the fetcher.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("exchange unreachable: {0}")]
    ExchangeUnreachable(String),

    #[error("auth failed or rate limited: {0}")]
    AuthOrRateLimited(String),

    #[error("no symbols matched {0}")]
    EmptyMarket(String),

    /// Stop was requested mid-cycle; the partial result was discarded.
    #[error("cycle cancelled")]
    Cancelled,
}

/// Per-symbol errors of an otherwise successful cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialFailure {
    pub failures: BTreeMap<String, PairError>,
}

impl PartialFailure {
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Symbol -> error text, for logs and the status surface.
    pub fn summary(&self) -> BTreeMap<String, String> {
        self.failures
            .iter()
            .map(|(k, v)| (k.clone(), v.to_string()))
            .collect()
    }
}

/// Result of a successful fetch cycle.
#[derive(Debug, Clone)]
pub struct FetchReport {
    pub snapshot: Snapshot,
    pub partial: Option<PartialFailure>,
}

/// Classify a cycle in which no symbol produced a ticker.
fn all_failed(failures: &BTreeMap<String, PairError>) -> FetchError {
    let auth_or_limit = failures.values().find(|e| match e {
        PairError::Adapter(a) => a.is_auth_or_rate_limit(),
        _ => false,
    });
    if let Some(err) = auth_or_limit {
        return FetchError::AuthOrRateLimited(err.to_string());
    }
    let sample = failures
        .values()
        .next()
        .map(|e| e.to_string())
        .unwrap_or_else(|| "no response".to_string());
    FetchError::ExchangeUnreachable(format!("all {} symbols failed, e.g. {sample}", failures.len()))
}
