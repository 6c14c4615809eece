// =============================================================================
// Fetcher — bounded concurrent per-symbol fetch with a cycle deadline
// =============================================================================
//
// 1. Resolve the symbol universe (exchange listing ∩ allow-list ∪ manual).
//    In bulk mode the listing is the 24h ticker dump itself, so every listed
//    symbol already has its ticker and only the rest (manual pairs outside
//    the quote filter) is fetched one by one.
// 2. Fetch the remaining symbols concurrently, at most `max_concurrency` in
//    flight, manual pairs first, each attempt under its own timeout,
//    connection errors retried with backoff.
// 3. Join until the cycle deadline. At the deadline the cycle's child token
//    is cancelled: queued symbols never start, requests already on the wire
//    finish or time out in the background, and every unsettled symbol is
//    recorded as abandoned.
// 4. Retry failed manual pairs once, sequentially.
// 5. Screen, rank, apply the pair limit.
//
// Stop is honoured between steps: symbols that have not started are skipped,
// in-flight requests run to completion or their own timeout, and the cycle
// then reports `Cancelled` rather than a partial ranking.
// =============================================================================

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::rank::{apply_pair_limit, rank, screen};
use super::retry::RetryPolicy;
use super::{all_failed, FetchError, FetchReport, PairError, PartialFailure};
use crate::exchange::{AdapterError, RawTicker, TickerSource};
use crate::runtime_config::{FetchMode, RuntimeConfig};
use crate::types::{MarketKey, MarketType, Snapshot};

/// Tunables for one fetch cycle.
#[derive(Debug, Clone)]
pub struct FetchParams {
    pub mode: FetchMode,
    pub max_concurrency: usize,
    pub symbol_timeout: Duration,
    pub cycle_deadline: Duration,
    pub retry: RetryPolicy,
    pub max_ticker_age: chrono::Duration,
    pub pair_limit: Option<u32>,
}

impl FetchParams {
    pub fn from_config(cfg: &RuntimeConfig) -> Self {
        Self {
            mode: cfg.fetch_mode,
            max_concurrency: cfg.max_concurrency.max(1),
            symbol_timeout: Duration::from_millis(cfg.symbol_timeout_ms),
            cycle_deadline: Duration::from_secs(cfg.cycle_deadline_secs),
            retry: RetryPolicy::new(cfg.retry_attempts, Duration::from_millis(cfg.retry_base_delay_ms)),
            max_ticker_age: chrono::Duration::hours(cfg.max_ticker_age_hours as i64),
            pair_limit: cfg.pair_limit,
        }
    }
}

/// What to fetch.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub market: MarketKey,
    /// Restrict the universe to these symbols (manual pairs are always added).
    pub allow_list: Option<Vec<String>>,
    pub manual: HashSet<String>,
    pub params: FetchParams,
}

/// Run one fetch-and-rank cycle against `source`.
pub async fn fetch_snapshot(
    source: Arc<dyn TickerSource>,
    req: &FetchRequest,
    cancel: &CancellationToken,
) -> Result<FetchReport, FetchError> {
    let started = Instant::now();
    let timestamp = Utc::now();
    let market_type = req.market.market_type;
    let params = &req.params;

    let (universe, mut tickers, per_symbol) = match params.mode {
        FetchMode::Bulk => {
            let bulk = params
                .retry
                .run_until(cancel, || source.fetch_tickers(market_type, req.market.quote.as_deref()))
                .await
                .map_err(listing_error)?;
            let mut by_symbol: HashMap<String, RawTicker> =
                bulk.into_iter().map(|t| (t.symbol.clone(), t)).collect();
            let universe = select_universe(by_symbol.keys().cloned(), req);
            let mut tickers = Vec::with_capacity(universe.len());
            let mut missing = Vec::new();
            for symbol in &universe {
                match by_symbol.remove(symbol) {
                    Some(t) => tickers.push(t),
                    None => missing.push(symbol.clone()),
                }
            }
            (universe, tickers, missing)
        }
        FetchMode::PerSymbol => {
            let listed = params
                .retry
                .run_until(cancel, || source.list_symbols(market_type, req.market.quote.as_deref()))
                .await
                .map_err(listing_error)?;
            let universe = select_universe(listed, req);
            let all = universe.clone();
            (universe, Vec::new(), all)
        }
    };
    if universe.is_empty() {
        return Err(FetchError::EmptyMarket(req.market.to_string()));
    }
    debug!(
        market = %req.market,
        mode = ?params.mode,
        symbols = universe.len(),
        per_symbol = per_symbol.len(),
        "fetching symbol universe"
    );

    let mut failures = BTreeMap::new();
    if !per_symbol.is_empty() {
        let (fetched, failed) = fetch_concurrently(&source, market_type, &per_symbol, params, cancel).await;
        tickers.extend(fetched);
        failures = failed;
    }

    // Manual pairs get one more sequential attempt before being dropped.
    let retry_manual: Vec<String> = failures
        .iter()
        .filter(|(sym, err)| req.manual.contains(*sym) && err.is_transport())
        .map(|(sym, _)| sym.clone())
        .collect();
    for symbol in retry_manual {
        if cancel.is_cancelled() {
            break;
        }
        match fetch_one(&source, market_type, &symbol, params, cancel).await {
            Ok(t) => {
                debug!(symbol = %symbol, "manual pair recovered on retry");
                failures.remove(&symbol);
                tickers.push(t);
            }
            Err(err) => {
                warn!(symbol = %symbol, error = %err, "manual pair dropped after retry");
                failures.insert(symbol, err.into());
            }
        }
    }

    if cancel.is_cancelled() {
        info!(market = %req.market, "fetch cycle cancelled, discarding partial result");
        return Err(FetchError::Cancelled);
    }

    if tickers.is_empty() {
        return Err(all_failed(&failures));
    }

    let mut candidates = Vec::with_capacity(tickers.len());
    for raw in &tickers {
        match screen(raw, timestamp, params.max_ticker_age) {
            Ok(c) => candidates.push(c),
            Err(err) => {
                failures.insert(raw.symbol.clone(), err);
            }
        }
    }
    if candidates.is_empty() {
        return Err(FetchError::EmptyMarket(format!(
            "{} (no rankable tickers among {})",
            req.market,
            tickers.len()
        )));
    }

    let ranked = rank(candidates);
    let ranked_count = ranked.len();
    let observations = apply_pair_limit(ranked, params.pair_limit, &req.manual);

    let partial = (!failures.is_empty()).then(|| PartialFailure { failures });

    info!(
        market = %req.market,
        ranked = ranked_count,
        kept = observations.len(),
        failed = partial.as_ref().map_or(0, |p| p.len()),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "snapshot ranked"
    );

    Ok(FetchReport {
        snapshot: Snapshot {
            timestamp,
            market: req.market.clone(),
            observations,
        },
        partial,
    })
}

fn listing_error(err: AdapterError) -> FetchError {
    if err.is_auth_or_rate_limit() {
        FetchError::AuthOrRateLimited(err.to_string())
    } else {
        FetchError::ExchangeUnreachable(err.to_string())
    }
}

/// Listed symbols narrowed to the allow-list, plus every manual pair. Manual
/// pairs come first so they are first in line for permits and request weight.
fn select_universe(listed: impl IntoIterator<Item = String>, req: &FetchRequest) -> Vec<String> {
    let rest: BTreeSet<String> = match &req.allow_list {
        Some(allow) => {
            let allow: HashSet<&str> = allow.iter().map(String::as_str).collect();
            listed.into_iter().filter(|s| allow.contains(s.as_str())).collect()
        }
        None => listed.into_iter().collect(),
    };
    let manual: BTreeSet<&String> = req.manual.iter().collect();
    manual
        .iter()
        .map(|s| s.to_string())
        .chain(rest.into_iter().filter(|s| !req.manual.contains(s)))
        .collect()
}

async fn fetch_one(
    source: &Arc<dyn TickerSource>,
    market_type: MarketType,
    symbol: &str,
    params: &FetchParams,
    cancel: &CancellationToken,
) -> Result<RawTicker, AdapterError> {
    let timeout = params.symbol_timeout;
    params
        .retry
        .run_until(cancel, || async move {
            match tokio::time::timeout(timeout, source.fetch_ticker(market_type, symbol)).await {
                Ok(res) => res,
                Err(_) => Err(AdapterError::Unreachable(format!(
                    "timed out after {} ms",
                    timeout.as_millis()
                ))),
            }
        })
        .await
}

async fn fetch_concurrently(
    source: &Arc<dyn TickerSource>,
    market_type: MarketType,
    symbols: &[String],
    params: &FetchParams,
    cancel: &CancellationToken,
) -> (Vec<RawTicker>, BTreeMap<String, PairError>) {
    // Fires on Stop (parent) or at this cycle's deadline.
    let cycle = cancel.child_token();
    let semaphore = Arc::new(Semaphore::new(params.max_concurrency));
    let mut set: JoinSet<(String, Result<RawTicker, PairError>)> = JoinSet::new();
    let mut pending: HashSet<String> = HashSet::with_capacity(symbols.len());

    for symbol in symbols {
        pending.insert(symbol.clone());
        let source = source.clone();
        let semaphore = semaphore.clone();
        let cycle = cycle.clone();
        let params = params.clone();
        let symbol = symbol.clone();

        set.spawn(async move {
            let permit = tokio::select! {
                biased;
                _ = cycle.cancelled() => None,
                permit = semaphore.acquire_owned() => permit.ok(),
            };
            let Some(_permit) = permit else {
                return (symbol, Err(PairError::Cancelled));
            };
            if cycle.is_cancelled() {
                return (symbol, Err(PairError::Cancelled));
            }
            let res = fetch_one(&source, market_type, &symbol, &params, &cycle)
                .await
                .map_err(PairError::from);
            (symbol, res)
        });
    }

    let deadline = tokio::time::Instant::now() + params.cycle_deadline;
    let mut tickers = Vec::with_capacity(symbols.len());
    let mut failures = BTreeMap::new();

    loop {
        match tokio::time::timeout_at(deadline, set.join_next()).await {
            Ok(Some(Ok((symbol, result)))) => {
                pending.remove(&symbol);
                match result {
                    Ok(t) => tickers.push(t),
                    Err(err) => {
                        failures.insert(symbol, err);
                    }
                }
            }
            Ok(Some(Err(join_err))) => {
                warn!(error = %join_err, "symbol fetch task failed");
            }
            Ok(None) => break,
            Err(_) => {
                warn!(abandoned = pending.len(), "cycle deadline reached");
                // Queued tasks see the token and return without fetching;
                // requests already sent finish or time out on their own.
                cycle.cancel();
                set.detach_all();
                break;
            }
        }
    }

    // Anything still pending was abandoned at the deadline or lost to a
    // panicked task.
    for symbol in pending {
        failures.insert(symbol, PairError::DeadlineExceeded);
    }

    (tickers, failures)
}
