// =============================================================================
// Bybit v5 ticker source
// =============================================================================
//
//   GET https://api.bybit.com/v5/market/tickers?category=spot|linear[&symbol=]
//   -> { "retCode": 0, "retMsg": "OK", "result": { "list": [...] }, "time": ms }
//
// `price24hPcnt` is a fraction and `turnover24h` is the quote volume. Tickers
// carry no timestamp of their own, so the envelope `time` is used.
// =============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use super::{millis, num, quote_matches, AdapterError, HttpClient, RawTicker, TickerSource};
use crate::types::{Exchange, MarketType};

const BASE_URL: &str = "https://api.bybit.com";

pub struct BybitSource {
    http: HttpClient,
}

impl BybitSource {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }

    fn category(market: MarketType) -> &'static str {
        match market {
            MarketType::Spot => "spot",
            MarketType::Futures => "linear",
        }
    }

    async fn tickers(&self, market: MarketType, symbol: Option<&str>) -> Result<Vec<RawTicker>, AdapterError> {
        let mut url = format!("{BASE_URL}/v5/market/tickers?category={}", Self::category(market));
        if let Some(s) = symbol {
            url.push_str("&symbol=");
            url.push_str(s);
        }
        let body = self.http.get_json(&url, None).await?;
        parse_response(&body)
    }
}

#[async_trait]
impl TickerSource for BybitSource {
    fn exchange(&self) -> Exchange {
        Exchange::Bybit
    }

    #[instrument(skip(self), name = "bybit::fetch_tickers")]
    async fn fetch_tickers(
        &self,
        market: MarketType,
        quote: Option<&str>,
    ) -> Result<Vec<RawTicker>, AdapterError> {
        let tickers: Vec<RawTicker> = self
            .tickers(market, None)
            .await?
            .into_iter()
            .filter(|t| quote_matches(&t.symbol, quote, None))
            .collect();
        debug!(count = tickers.len(), "bulk tickers fetched");
        Ok(tickers)
    }

    #[instrument(skip(self), name = "bybit::fetch_ticker")]
    async fn fetch_ticker(&self, market: MarketType, symbol: &str) -> Result<RawTicker, AdapterError> {
        self.tickers(market, Some(symbol))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AdapterError::InvalidSymbol(symbol.to_string()))
    }
}

fn parse_response(body: &serde_json::Value) -> Result<Vec<RawTicker>, AdapterError> {
    let code = body["retCode"].as_i64().unwrap_or(-1);
    if code != 0 {
        let msg = body["retMsg"].as_str().unwrap_or("unknown error").to_string();
        return Err(match code {
            10006 | 10018 => AdapterError::RateLimited(msg),
            10003 | 10004 | 10005 => AdapterError::AuthFailed(msg),
            10001 => AdapterError::InvalidSymbol(msg),
            _ => AdapterError::Malformed(format!("retCode {code}: {msg}")),
        });
    }

    let time: Option<DateTime<Utc>> = millis(&body["time"]);
    let list = body["result"]["list"]
        .as_array()
        .ok_or_else(|| AdapterError::Malformed("tickers result has no list".into()))?;

    Ok(list
        .iter()
        .filter_map(|e| {
            let symbol = e["symbol"].as_str()?;
            Some(RawTicker {
                symbol: symbol.to_string(),
                last_price: num(&e["lastPrice"]),
                change_pct: num(&e["price24hPcnt"]).map(|r| r * 100.0),
                quote_volume: num(&e["turnover24h"]),
                exchange_time: time,
            })
        })
        .collect())
}
