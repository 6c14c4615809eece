// =============================================================================
// OKX v5 ticker source
// =============================================================================
//
//   GET https://www.okx.com/api/v5/market/tickers?instType=SPOT|SWAP
//   GET https://www.okx.com/api/v5/market/ticker?instId=BTC-USDT
//   -> { "code": "0", "msg": "", "data": [...] }
//
// OKX reports `open24h` rather than a change percentage, so the change is
// derived as (last - open24h) / open24h.
// =============================================================================

use async_trait::async_trait;
use tracing::{debug, instrument};

use super::{millis, num, quote_matches, AdapterError, HttpClient, RawTicker, TickerSource};
use crate::types::{Exchange, MarketType};

const BASE_URL: &str = "https://www.okx.com";

pub struct OkxSource {
    http: HttpClient,
}

impl OkxSource {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }

    fn inst_type(market: MarketType) -> &'static str {
        match market {
            MarketType::Spot => "SPOT",
            MarketType::Futures => "SWAP",
        }
    }
}

#[async_trait]
impl TickerSource for OkxSource {
    fn exchange(&self) -> Exchange {
        Exchange::Okx
    }

    #[instrument(skip(self), name = "okx::fetch_tickers")]
    async fn fetch_tickers(
        &self,
        market: MarketType,
        quote: Option<&str>,
    ) -> Result<Vec<RawTicker>, AdapterError> {
        let url = format!("{BASE_URL}/api/v5/market/tickers?instType={}", Self::inst_type(market));
        let body = self.http.get_json(&url, None).await?;
        let tickers: Vec<RawTicker> = parse_response(&body)?
            .into_iter()
            .filter(|t| quote_matches(&t.symbol, quote, Some('-')))
            .collect();
        debug!(count = tickers.len(), "bulk tickers fetched");
        Ok(tickers)
    }

    #[instrument(skip(self), name = "okx::fetch_ticker")]
    async fn fetch_ticker(&self, _market: MarketType, symbol: &str) -> Result<RawTicker, AdapterError> {
        let url = format!("{BASE_URL}/api/v5/market/ticker?instId={symbol}");
        let body = self.http.get_json(&url, None).await?;
        parse_response(&body)?
            .into_iter()
            .next()
            .ok_or_else(|| AdapterError::InvalidSymbol(symbol.to_string()))
    }
}

fn parse_response(body: &serde_json::Value) -> Result<Vec<RawTicker>, AdapterError> {
    let code = body["code"].as_str().unwrap_or("-1");
    if code != "0" {
        let msg = body["msg"].as_str().unwrap_or("unknown error").to_string();
        return Err(match code {
            "50011" => AdapterError::RateLimited(msg),
            "50100" | "50101" | "50102" | "50103" | "50104" | "50105" => AdapterError::AuthFailed(msg),
            "51001" => AdapterError::InvalidSymbol(msg),
            _ => AdapterError::Malformed(format!("code {code}: {msg}")),
        });
    }

    let data = body["data"]
        .as_array()
        .ok_or_else(|| AdapterError::Malformed("ticker response has no data array".into()))?;

    Ok(data
        .iter()
        .filter_map(|e| {
            let symbol = e["instId"].as_str()?;
            let last = num(&e["last"]);
            let open = num(&e["open24h"]);
            let change_pct = match (last, open) {
                (Some(l), Some(o)) if o > 0.0 => Some((l - o) / o * 100.0),
                _ => None,
            };
            Some(RawTicker {
                symbol: symbol.to_string(),
                last_price: last,
                change_pct,
                quote_volume: num(&e["volCcy24h"]),
                exchange_time: millis(&e["ts"]),
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn derives_change_from_open() {
        let body = json!({
            "code": "0",
            "msg": "",
            "data": [
                { "instId": "BTC-USDT", "last": "110", "open24h": "100", "volCcy24h": "5000", "ts": "1700000000000" },
                { "instId": "NEW-USDT", "last": "1", "open24h": "0" }
            ]
        });
        let tickers = parse_response(&body).unwrap();
        assert!((tickers[0].change_pct.unwrap() - 10.0).abs() < 1e-9);
        assert!(tickers[0].exchange_time.is_some());
        assert_eq!(tickers[1].change_pct, None);
    }

    #[test]
    fn unknown_instrument_is_invalid_symbol() {
        let body = json!({ "code": "51001", "msg": "Instrument ID does not exist", "data": [] });
        assert!(matches!(parse_response(&body), Err(AdapterError::InvalidSymbol(_))));
    }
}
