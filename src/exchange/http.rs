// =============================================================================
// Shared HTTP plumbing for the exchange adapters
// =============================================================================
//
// Every adapter issues public GET requests and expects JSON back. This module
// owns the one `reqwest::Client` they share and maps transport failures and
// HTTP status codes into `AdapterError`, so the adapters only deal with their
// own payload shapes.
// =============================================================================

use std::time::Duration;

use reqwest::StatusCode;
use tracing::debug;

use super::rate_limit::WeightTracker;
use super::AdapterError;

/// Cloneable handle over a pooled `reqwest::Client`.
#[derive(Clone, Debug)]
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    /// Build a client with a transport-level timeout. Per-symbol deadlines are
    /// enforced separately by the fetcher.
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("rank-tracker/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    /// GET `url` and parse the body as JSON.
    ///
    /// When `weight` is given, the request is first reserved against the
    /// tracker and the response's weight header is fed back into it.
    pub async fn get_json(
        &self,
        url: &str,
        weight: Option<(&WeightTracker, u32)>,
    ) -> Result<serde_json::Value, AdapterError> {
        if let Some((tracker, cost)) = weight {
            if !tracker.try_acquire(cost) {
                return Err(AdapterError::Throttled(format!(
                    "request-weight budget exhausted ({cost} needed)"
                )));
            }
        }

        let resp = self.client.get(url).send().await.map_err(transport_error)?;

        if let Some((tracker, _)) = weight {
            tracker.update_from_headers(resp.headers());
        }

        let status = resp.status();
        let body = resp.text().await.map_err(transport_error)?;

        if !status.is_success() {
            debug!(%status, url, "exchange returned error status");
            return Err(classify_status(status, &body));
        }

        serde_json::from_str(&body).map_err(AdapterError::from)
    }
}

fn transport_error(err: reqwest::Error) -> AdapterError {
    if err.is_decode() {
        AdapterError::Malformed(err.to_string())
    } else {
        AdapterError::Unreachable(err.to_string())
    }
}

/// Map a non-success HTTP status to an adapter error.
pub(crate) fn classify_status(status: StatusCode, body: &str) -> AdapterError {
    let detail = format!("{status}: {}", truncate(body, 200));
    match status.as_u16() {
        429 | 418 => AdapterError::RateLimited(detail),
        401 | 403 => AdapterError::AuthFailed(detail),
        400 | 404 => AdapterError::InvalidSymbol(detail),
        s if s >= 500 => AdapterError::Unreachable(detail),
        _ => AdapterError::Malformed(detail),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            AdapterError::RateLimited(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::IM_A_TEAPOT, ""),
            AdapterError::RateLimited(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, ""),
            AdapterError::AuthFailed(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, r#"{"code":-1121,"msg":"Invalid symbol."}"#),
            AdapterError::InvalidSymbol(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, ""),
            AdapterError::Unreachable(_)
        ));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("abc", 10), "abc");
    }
}
