// =============================================================================
// MEXC ticker source
// =============================================================================
//
// Spot goes through the Binance-compatible v3 API. Perpetual futures use the
// separate contract API:
//
//   GET https://contract.mexc.com/api/v1/contract/ticker[?symbol=BTC_USDT]
//   -> { "success": true, "code": 0, "data": [...] | {...} }
//
// `riseFallRate` is a fraction (0.05 = +5 %), `amount24` is quote volume.
// =============================================================================

use async_trait::async_trait;
use tracing::{debug, instrument};

use super::binance::BinanceSource;
use super::{millis, num, quote_matches, AdapterError, HttpClient, RawTicker, TickerSource};
use crate::types::{Exchange, MarketType};

const CONTRACT_URL: &str = "https://contract.mexc.com";

pub struct MexcSource {
    spot: BinanceSource,
    http: HttpClient,
}

impl MexcSource {
    pub fn new(http: HttpClient) -> Self {
        Self {
            spot: BinanceSource::mexc_spot(http.clone()),
            http,
        }
    }

    async fn contract_get(&self, query: &str) -> Result<serde_json::Value, AdapterError> {
        let url = format!("{CONTRACT_URL}/api/v1/contract/ticker{query}");
        let body = self.http.get_json(&url, None).await?;
        unwrap_envelope(body)
    }
}

#[async_trait]
impl TickerSource for MexcSource {
    fn exchange(&self) -> Exchange {
        Exchange::Mexc
    }

    #[instrument(skip(self), name = "mexc::fetch_tickers")]
    async fn fetch_tickers(
        &self,
        market: MarketType,
        quote: Option<&str>,
    ) -> Result<Vec<RawTicker>, AdapterError> {
        if market == MarketType::Spot {
            return self.spot.fetch_tickers(market, quote).await;
        }

        let data = self.contract_get("").await?;
        let entries = data
            .as_array()
            .ok_or_else(|| AdapterError::Malformed("contract ticker data is not an array".into()))?;

        let tickers: Vec<RawTicker> = entries
            .iter()
            .filter_map(|e| parse_contract_ticker(e).ok())
            .filter(|t| quote_matches(&t.symbol, quote, Some('_')))
            .collect();

        debug!(count = tickers.len(), "contract tickers fetched");
        Ok(tickers)
    }

    #[instrument(skip(self), name = "mexc::fetch_ticker")]
    async fn fetch_ticker(&self, market: MarketType, symbol: &str) -> Result<RawTicker, AdapterError> {
        if market == MarketType::Spot {
            return self.spot.fetch_ticker(market, symbol).await;
        }
        let data = self.contract_get(&format!("?symbol={symbol}")).await?;
        if data.is_null() {
            return Err(AdapterError::InvalidSymbol(symbol.to_string()));
        }
        parse_contract_ticker(&data)
    }
}

/// Strip the `{success, code, data}` envelope. Code 1001 is "contract does
/// not exist"; 510 is MEXC's rate-limit code.
fn unwrap_envelope(mut body: serde_json::Value) -> Result<serde_json::Value, AdapterError> {
    let success = body["success"].as_bool().unwrap_or(false);
    if success {
        return Ok(body["data"].take());
    }
    let code = body["code"].as_i64().unwrap_or(-1);
    let msg = body["message"].as_str().unwrap_or("unknown error").to_string();
    Err(match code {
        510 => AdapterError::RateLimited(msg),
        401 | 402 | 403 => AdapterError::AuthFailed(msg),
        1001 => AdapterError::InvalidSymbol(msg),
        _ => AdapterError::Malformed(format!("code {code}: {msg}")),
    })
}

fn parse_contract_ticker(entry: &serde_json::Value) -> Result<RawTicker, AdapterError> {
    let symbol = entry["symbol"]
        .as_str()
        .ok_or_else(|| AdapterError::Malformed("contract ticker without symbol".into()))?;

    Ok(RawTicker {
        symbol: symbol.to_string(),
        last_price: num(&entry["lastPrice"]),
        change_pct: num(&entry["riseFallRate"]).map(|r| r * 100.0),
        quote_volume: num(&entry["amount24"]),
        exchange_time: millis(&entry["timestamp"]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn contract_ticker_scales_rate_to_percent() {
        let t = parse_contract_ticker(&json!({
            "symbol": "DOGE_USDT",
            "lastPrice": 0.1612,
            "riseFallRate": 0.0534,
            "amount24": 98765.4,
            "timestamp": 1_700_000_000_000_i64
        }))
        .unwrap();
        assert_eq!(t.symbol, "DOGE_USDT");
        assert!((t.change_pct.unwrap() - 5.34).abs() < 1e-9);
        assert_eq!(t.quote_volume, Some(98765.4));
    }

    #[test]
    fn envelope_errors_are_classified() {
        let limited = unwrap_envelope(json!({ "success": false, "code": 510, "message": "too fast" }));
        assert!(matches!(limited, Err(AdapterError::RateLimited(_))));

        let missing = unwrap_envelope(json!({ "success": false, "code": 1001, "message": "no contract" }));
        assert!(matches!(missing, Err(AdapterError::InvalidSymbol(_))));

        let ok = unwrap_envelope(json!({ "success": true, "code": 0, "data": [1, 2] })).unwrap();
        assert_eq!(ok, json!([1, 2]));
    }
}
