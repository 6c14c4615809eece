// =============================================================================
// Binance-dialect ticker source (Binance spot/futures, MEXC spot)
// =============================================================================
//
// Public market-data endpoints only; nothing here is signed.
//
//   spot     GET {spot}/api/v3/ticker/24hr[?symbol=]
//   futures  GET {futures}/fapi/v1/ticker/24hr[?symbol=]
//
// MEXC's spot API is a clone of Binance's v3 API, so the same source serves it
// with a different base URL and no futures endpoint.
// =============================================================================

use async_trait::async_trait;
use tracing::{debug, instrument};

use super::rate_limit::{
    WeightSnapshot, WeightTracker, BINANCE_FUTURES_LIMIT, BINANCE_SPOT_LIMIT, MEXC_SPOT_LIMIT,
};
use super::{millis, num, quote_matches, AdapterError, HttpClient, RawTicker, TickerSource};
use crate::types::{Exchange, MarketType};

const BINANCE_SPOT_URL: &str = "https://api.binance.com";
const BINANCE_FUTURES_URL: &str = "https://fapi.binance.com";
const MEXC_SPOT_URL: &str = "https://api.mexc.com";

/// Request weight of the bulk 24h ticker (spot, futures).
const BULK_WEIGHT: (u32, u32) = (80, 40);
/// Request weight of a single-symbol 24h ticker (spot, futures).
const SINGLE_WEIGHT: (u32, u32) = (2, 1);

/// Ticker source for exchanges speaking the Binance REST dialect.
pub struct BinanceSource {
    exchange: Exchange,
    spot_url: String,
    futures_url: Option<String>,
    http: HttpClient,
    spot_weight: WeightTracker,
    futures_weight: WeightTracker,
}

impl BinanceSource {
    pub fn binance(http: HttpClient) -> Self {
        Self {
            exchange: Exchange::Binance,
            spot_url: BINANCE_SPOT_URL.to_string(),
            futures_url: Some(BINANCE_FUTURES_URL.to_string()),
            http,
            spot_weight: WeightTracker::with_limit(BINANCE_SPOT_LIMIT),
            futures_weight: WeightTracker::with_limit(BINANCE_FUTURES_LIMIT),
        }
    }

    /// MEXC spot. Futures live on a different API, see `mexc.rs`.
    pub fn mexc_spot(http: HttpClient) -> Self {
        Self {
            exchange: Exchange::Mexc,
            spot_url: MEXC_SPOT_URL.to_string(),
            futures_url: None,
            http,
            spot_weight: WeightTracker::with_limit(MEXC_SPOT_LIMIT),
            // Never charged: there is no futures endpoint.
            futures_weight: WeightTracker::with_limit(0),
        }
    }

    fn tracker(&self, market: MarketType) -> &WeightTracker {
        match market {
            MarketType::Spot => &self.spot_weight,
            MarketType::Futures => &self.futures_weight,
        }
    }

    pub fn weight(&self, market: MarketType) -> WeightSnapshot {
        self.tracker(market).snapshot()
    }

    fn endpoint(&self, market: MarketType) -> Result<String, AdapterError> {
        match market {
            MarketType::Spot => Ok(format!("{}/api/v3/ticker/24hr", self.spot_url)),
            MarketType::Futures => self
                .futures_url
                .as_ref()
                .map(|base| format!("{base}/fapi/v1/ticker/24hr"))
                .ok_or_else(|| {
                    AdapterError::InvalidSymbol(format!("{} has no futures endpoint here", self.exchange))
                }),
        }
    }

    fn weights(market: MarketType) -> (u32, u32) {
        match market {
            MarketType::Spot => (BULK_WEIGHT.0, SINGLE_WEIGHT.0),
            MarketType::Futures => (BULK_WEIGHT.1, SINGLE_WEIGHT.1),
        }
    }
}

#[async_trait]
impl TickerSource for BinanceSource {
    fn exchange(&self) -> Exchange {
        self.exchange
    }

    #[instrument(skip(self), fields(exchange = %self.exchange), name = "binance::fetch_tickers")]
    async fn fetch_tickers(
        &self,
        market: MarketType,
        quote: Option<&str>,
    ) -> Result<Vec<RawTicker>, AdapterError> {
        let url = self.endpoint(market)?;
        let body = self
            .http
            .get_json(&url, Some((self.tracker(market), Self::weights(market).0)))
            .await?;

        let entries = body
            .as_array()
            .ok_or_else(|| AdapterError::Malformed("24hr ticker response is not an array".into()))?;

        let tickers: Vec<RawTicker> = entries
            .iter()
            .filter_map(|e| parse_ticker(e).ok())
            .filter(|t| quote_matches(&t.symbol, quote, None))
            .collect();

        debug!(count = tickers.len(), "bulk tickers fetched");
        Ok(tickers)
    }

    #[instrument(skip(self), fields(exchange = %self.exchange), name = "binance::fetch_ticker")]
    async fn fetch_ticker(&self, market: MarketType, symbol: &str) -> Result<RawTicker, AdapterError> {
        let url = format!("{}?symbol={}", self.endpoint(market)?, symbol);
        let body = self
            .http
            .get_json(&url, Some((self.tracker(market), Self::weights(market).1)))
            .await?;
        parse_ticker(&body)
    }
}

/// Parse one 24hr ticker object. Only `symbol` is mandatory.
pub(crate) fn parse_ticker(entry: &serde_json::Value) -> Result<RawTicker, AdapterError> {
    let symbol = entry["symbol"]
        .as_str()
        .ok_or_else(|| AdapterError::Malformed("ticker without symbol".into()))?;

    Ok(RawTicker {
        symbol: symbol.to_string(),
        last_price: num(&entry["lastPrice"]),
        change_pct: num(&entry["priceChangePercent"]),
        quote_volume: num(&entry["quoteVolume"]),
        exchange_time: millis(&entry["closeTime"]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_full_ticker() {
        let entry = json!({
            "symbol": "BTCUSDT",
            "lastPrice": "64000.10",
            "priceChangePercent": "-1.250",
            "quoteVolume": "123456789.5",
            "closeTime": 1_700_000_000_000_i64
        });
        let t = parse_ticker(&entry).unwrap();
        assert_eq!(t.symbol, "BTCUSDT");
        assert_eq!(t.last_price, Some(64000.10));
        assert_eq!(t.change_pct, Some(-1.25));
        assert_eq!(t.quote_volume, Some(123456789.5));
        assert!(t.exchange_time.is_some());
    }

    #[test]
    fn missing_fields_become_absent() {
        let t = parse_ticker(&json!({ "symbol": "NEWUSDT", "lastPrice": "0.5" })).unwrap();
        assert_eq!(t.last_price, Some(0.5));
        assert_eq!(t.change_pct, None);
        assert_eq!(t.quote_volume, None);
        assert_eq!(t.exchange_time, None);
    }

    #[test]
    fn ticker_without_symbol_is_malformed() {
        assert!(matches!(
            parse_ticker(&json!({ "lastPrice": "1" })),
            Err(AdapterError::Malformed(_))
        ));
    }

    #[test]
    fn mexc_spot_has_no_futures_endpoint() {
        let http = HttpClient::new(std::time::Duration::from_secs(1)).unwrap();
        let src = BinanceSource::mexc_spot(http);
        assert_eq!(src.exchange(), Exchange::Mexc);
        assert!(src.endpoint(MarketType::Futures).is_err());
        assert!(src.endpoint(MarketType::Spot).unwrap().starts_with(MEXC_SPOT_URL));
    }

    #[test]
    fn spot_and_futures_charge_separate_budgets() {
        let http = HttpClient::new(std::time::Duration::from_secs(1)).unwrap();
        let src = BinanceSource::binance(http);
        assert_eq!(src.weight(MarketType::Spot).hard_limit, BINANCE_SPOT_LIMIT);
        assert_eq!(src.weight(MarketType::Futures).hard_limit, BINANCE_FUTURES_LIMIT);

        assert!(src.tracker(MarketType::Futures).try_acquire(BINANCE_FUTURES_LIMIT));
        assert!(src.tracker(MarketType::Spot).try_acquire(BinanceSource::weights(MarketType::Spot).0));
    }
}
