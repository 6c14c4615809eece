// =============================================================================
// Ranking — pure screening and ordering of tickers
// =============================================================================
//
// Nothing in here touches the network or the clock; the fetcher passes `now`
// in. The same candidate set (ties included) always produces the same ranks.
// =============================================================================

use std::cmp::Ordering;
use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};

use super::PairError;
use crate::exchange::RawTicker;
use crate::types::PairObservation;

/// A ticker that passed screening and can be ranked.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub pair: String,
    pub price: f64,
    pub change_pct: f64,
    pub volume: Option<f64>,
}

/// Reject tickers that cannot be ranked: no price, no 24h change, a
/// non-positive price, or an exchange timestamp older than `max_age`.
/// A ticker without a timestamp is accepted; missing volume stays absent.
pub fn screen(raw: &RawTicker, now: DateTime<Utc>, max_age: Duration) -> Result<Candidate, PairError> {
    let price = raw.last_price.ok_or(PairError::MissingPrice)?;
    let change_pct = raw.change_pct.ok_or(PairError::MissingChange)?;

    if !price.is_finite() || price <= 0.0 {
        return Err(PairError::NonPositivePrice(price));
    }
    if !change_pct.is_finite() {
        return Err(PairError::MissingChange);
    }
    if let Some(ts) = raw.exchange_time {
        let age = now - ts;
        if age > max_age {
            return Err(PairError::Stale {
                age_minutes: age.num_minutes(),
            });
        }
    }

    Ok(Candidate {
        pair: raw.symbol.clone(),
        price,
        change_pct,
        volume: raw.quote_volume.filter(|v| v.is_finite()),
    })
}

/// Order candidates by 24h change descending, ties by symbol ascending, and
/// assign ranks 1..=K.
pub fn rank(mut candidates: Vec<Candidate>) -> Vec<PairObservation> {
    candidates.sort_by(compare);
    candidates
        .into_iter()
        .enumerate()
        .map(|(i, c)| PairObservation {
            pair: c.pair,
            price: c.price,
            change_pct: c.change_pct,
            volume: c.volume,
            rank: i as u32 + 1,
        })
        .collect()
}

fn compare(a: &Candidate, b: &Candidate) -> Ordering {
    b.change_pct
        .total_cmp(&a.change_pct)
        .then_with(|| a.pair.cmp(&b.pair))
}

/// Keep ranks `1..=limit` plus every manual pair at its true rank.
pub fn apply_pair_limit(
    observations: Vec<PairObservation>,
    limit: Option<u32>,
    manual: &HashSet<String>,
) -> Vec<PairObservation> {
    let Some(limit) = limit else {
        return observations;
    };
    observations
        .into_iter()
        .filter(|o| o.rank <= limit || manual.contains(&o.pair))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(pair: &str, change: f64) -> Candidate {
        Candidate {
            pair: pair.to_string(),
            price: 1.0,
            change_pct: change,
            volume: None,
        }
    }

    fn raw(symbol: &str) -> RawTicker {
        RawTicker {
            symbol: symbol.to_string(),
            last_price: Some(2.0),
            change_pct: Some(1.0),
            quote_volume: None,
            exchange_time: None,
        }
    }

    #[test]
    fn ranks_are_a_permutation_with_best_first() {
        let ranked = rank(vec![cand("AUSDT", 1.0), cand("BUSDT", 9.5), cand("CUSDT", -3.0), cand("DUSDT", 4.0)]);
        let mut ranks: Vec<u32> = ranked.iter().map(|o| o.rank).collect();
        ranks.sort();
        assert_eq!(ranks, vec![1, 2, 3, 4]);
        assert_eq!(ranked[0].pair, "BUSDT");
        assert_eq!(ranked[0].rank, 1);
        let max = ranked.iter().map(|o| o.change_pct).fold(f64::MIN, f64::max);
        assert_eq!(ranked[0].change_pct, max);
    }

    #[test]
    fn ties_break_by_symbol_regardless_of_input_order() {
        let a = rank(vec![cand("ZEC", 2.0), cand("ADA", 2.0), cand("ETH", 5.0), cand("BNB", 2.0)]);
        let b = rank(vec![cand("BNB", 2.0), cand("ETH", 5.0), cand("ZEC", 2.0), cand("ADA", 2.0)]);
        assert_eq!(a, b);
        let order: Vec<&str> = a.iter().map(|o| o.pair.as_str()).collect();
        assert_eq!(order, vec!["ETH", "ADA", "BNB", "ZEC"]);
    }

    #[test]
    fn screening_rejects_unrankable_tickers() {
        let now = Utc::now();
        let max_age = Duration::hours(24);

        let mut t = raw("X");
        t.last_price = None;
        assert_eq!(screen(&t, now, max_age), Err(PairError::MissingPrice));

        let mut t = raw("X");
        t.change_pct = None;
        assert_eq!(screen(&t, now, max_age), Err(PairError::MissingChange));

        let mut t = raw("X");
        t.last_price = Some(0.0);
        assert!(matches!(screen(&t, now, max_age), Err(PairError::NonPositivePrice(_))));

        let mut t = raw("X");
        t.exchange_time = Some(now - Duration::hours(30));
        assert!(matches!(screen(&t, now, max_age), Err(PairError::Stale { .. })));

        let ok = screen(&raw("X"), now, max_age).unwrap();
        assert_eq!(ok.volume, None);
    }

    #[test]
    fn pair_limit_keeps_manual_pairs_at_true_rank() {
        let ranked = rank(vec![cand("A", 5.0), cand("B", 4.0), cand("C", 3.0), cand("DOGE", 1.0)]);
        let manual: HashSet<String> = ["DOGE".to_string()].into_iter().collect();
        let kept = apply_pair_limit(ranked, Some(2), &manual);
        let pairs: Vec<(&str, u32)> = kept.iter().map(|o| (o.pair.as_str(), o.rank)).collect();
        assert_eq!(pairs, vec![("A", 1), ("B", 2), ("DOGE", 4)]);
    }
}
