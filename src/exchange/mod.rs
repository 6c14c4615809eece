// =============================================================================
// Exchange Adapter Pool — one ticker interface over every supported exchange
// =============================================================================
//
// Each exchange speaks its own REST dialect. Adapters normalise whatever the
// exchange returns into `RawTicker`, leaving fields the exchange omitted as
// `None` instead of failing the whole call. The rest of the tracker only ever
// sees the `TickerSource` trait, selected by configuration through an
// `ExchangeRegistry`.
// =============================================================================

pub mod binance;
pub mod bybit;
pub mod http;
pub mod mexc;
pub mod okx;
pub mod rate_limit;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::types::{Exchange, MarketType};

pub use http::HttpClient;

// =============================================================================
// Errors
// =============================================================================

/// Failure of a single adapter call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AdapterError {
    /// Connection failure, timeout or exchange-side 5xx.
    #[error("exchange unreachable: {0}")]
    Unreachable(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Refused locally before sending: the request-weight budget is spent.
    #[error("throttled locally: {0}")]
    Throttled(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("invalid symbol: {0}")]
    InvalidSymbol(String),

    /// The exchange answered but the payload could not be understood.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl AdapterError {
    /// Only connection-level failures are worth retrying within a cycle.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }

    pub fn is_auth_or_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::Throttled(_) | Self::AuthFailed(_))
    }
}

impl From<serde_json::Error> for AdapterError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

// =============================================================================
// RawTicker
// =============================================================================

/// One exchange ticker as reported, before any sanity filtering.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawTicker {
    pub symbol: String,
    pub last_price: Option<f64>,
    /// 24h change in percent (5.0 = +5 %).
    pub change_pct: Option<f64>,
    /// 24h volume in quote currency.
    pub quote_volume: Option<f64>,
    /// Exchange-side timestamp of the ticker, when provided.
    pub exchange_time: Option<DateTime<Utc>>,
}

// =============================================================================
// TickerSource
// =============================================================================

/// Capability interface every exchange adapter implements.
#[async_trait]
pub trait TickerSource: Send + Sync {
    fn exchange(&self) -> Exchange;

    /// All tickers of `market` whose quote currency matches `quote`
    /// (`None` = every pair).
    async fn fetch_tickers(
        &self,
        market: MarketType,
        quote: Option<&str>,
    ) -> Result<Vec<RawTicker>, AdapterError>;

    /// A single ticker.
    async fn fetch_ticker(&self, market: MarketType, symbol: &str) -> Result<RawTicker, AdapterError>;

    /// Symbols of `market` matching `quote`. The default derives them from the
    /// bulk ticker listing.
    async fn list_symbols(
        &self,
        market: MarketType,
        quote: Option<&str>,
    ) -> Result<Vec<String>, AdapterError> {
        let tickers = self.fetch_tickers(market, quote).await?;
        let mut symbols: Vec<String> = tickers.into_iter().map(|t| t.symbol).collect();
        symbols.sort();
        symbols.dedup();
        Ok(symbols)
    }
}

/// Resolves the adapter for a configured exchange.
pub trait ExchangeRegistry: Send + Sync {
    fn source(&self, exchange: Exchange) -> Arc<dyn TickerSource>;
}

/// Production registry: one live adapter per exchange sharing an HTTP client.
pub struct LiveSources {
    binance: Arc<binance::BinanceSource>,
    mexc: Arc<mexc::MexcSource>,
    bybit: Arc<bybit::BybitSource>,
    okx: Arc<okx::OkxSource>,
}

impl LiveSources {
    pub fn new(http: HttpClient) -> Self {
        Self {
            binance: Arc::new(binance::BinanceSource::binance(http.clone())),
            mexc: Arc::new(mexc::MexcSource::new(http.clone())),
            bybit: Arc::new(bybit::BybitSource::new(http.clone())),
            okx: Arc::new(okx::OkxSource::new(http)),
        }
    }

    /// Current request weight spent on Binance for `market`.
    pub fn binance_weight(&self, market: MarketType) -> rate_limit::WeightSnapshot {
        self.binance.weight(market)
    }
}

impl ExchangeRegistry for LiveSources {
    fn source(&self, exchange: Exchange) -> Arc<dyn TickerSource> {
        match exchange {
            Exchange::Binance => self.binance.clone(),
            Exchange::Mexc => self.mexc.clone(),
            Exchange::Bybit => self.bybit.clone(),
            Exchange::Okx => self.okx.clone(),
        }
    }
}

// =============================================================================
// Shared parsing helpers
// =============================================================================

/// Parse a JSON value that may be either a string or a number into `f64`.
/// Empty strings and non-finite values count as absent.
pub(crate) fn num(val: &serde_json::Value) -> Option<f64> {
    let parsed = match val {
        serde_json::Value::String(s) if !s.trim().is_empty() => s.trim().parse::<f64>().ok(),
        serde_json::Value::Number(n) => n.as_f64(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

/// Interpret a JSON value (string or number) as unix milliseconds.
pub(crate) fn millis(val: &serde_json::Value) -> Option<DateTime<Utc>> {
    let ms = match val {
        serde_json::Value::String(s) => s.trim().parse::<i64>().ok(),
        serde_json::Value::Number(n) => n.as_i64(),
        _ => None,
    }?;
    DateTime::<Utc>::from_timestamp_millis(ms)
}

/// Whether `symbol`'s quote currency is `quote`.
///
/// With a `separator` the quote is the second segment (`BTC-USDT`,
/// `BTC-USDT-SWAP`, `BTC_USDT`); otherwise the symbol must end with it
/// (`BTCUSDT`).
pub(crate) fn quote_matches(symbol: &str, quote: Option<&str>, separator: Option<char>) -> bool {
    let Some(quote) = quote else {
        return true;
    };
    match separator {
        Some(sep) => symbol
            .split(sep)
            .nth(1)
            .is_some_and(|q| q.eq_ignore_ascii_case(quote)),
        None => {
            symbol.len() > quote.len()
                && symbol.to_ascii_uppercase().ends_with(&quote.to_ascii_uppercase())
        }
    }
}
