//! C13 — MTF Index Mapper, C14 — HTF Filters.
//!
//! Grounded on `examples/original_source/backend/backtesting/mtf/index_mapper.py`
//! (`create_htf_index_map`, `interval_to_minutes`, `calculate_bars_ratio`) and
//! `backend/backtesting/mtf/filters.py` (`HTFTrendFilter`, `BTCCorrelationFilter`), with
//! the remaining filter families (SuperTrend/Ichimoku/MACD/Bollinger/ADX) added per
//! §4.10's filter list using the same allow-long/allow-short contract.

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookaheadMode {
    None,
    Allow,
}

use serde::{Deserialize, Serialize};

/// Parses an interval string into minutes: digit strings are minutes; `D`/`W`/`M` map
/// to 1440/10080/43200 respectively, matching `interval_to_minutes`.
pub fn interval_to_minutes(interval: &str) -> Option<u64> {
    if let Ok(n) = interval.parse::<u64>() {
        return Some(n);
    }
    match interval.to_uppercase().as_str() {
        "D" => Some(1440),
        "W" => Some(10080),
        "M" => Some(43200),
        _ => None,
    }
}

pub fn calculate_bars_ratio(ltf_interval: &str, htf_interval: &str) -> Result<u64, String> {
    let ltf = interval_to_minutes(ltf_interval)
        .ok_or_else(|| format!("cannot parse LTF interval {ltf_interval}"))?;
    let htf = interval_to_minutes(htf_interval)
        .ok_or_else(|| format!("cannot parse HTF interval {htf_interval}"))?;
    if htf < ltf {
        return Err(format!("HTF ({htf_interval}) must be >= LTF ({ltf_interval})"));
    }
    Ok(htf / ltf)
}

/// Builds the LTF-index -> HTF-index map per §4.12. `lookahead_mode = None` is the
/// default, lookahead-safe mode: the visible HTF bar at LTF time `t` is the last one that
/// has *closed* by `t` (i.e. the largest `k` with `htf_open[k+1] <= t`). `Allow` permits
/// peeking at the still-forming HTF bar (largest `k` with `htf_open[k] <= t`) and exists
/// for research-only use per the original's docstring.
///
/// Monotone non-decreasing and never points to the future — both are asserted by the
/// test suite, not merely documented.
pub fn create_htf_index_map(
    ltf_open: &[DateTime<Utc>],
    htf_open: &[DateTime<Utc>],
    mode: LookaheadMode,
) -> Vec<i64> {
    let mut map = vec![-1i64; ltf_open.len()];
    if htf_open.is_empty() {
        return map;
    }
    // `opened` tracks the latest HTF bar whose open time has been reached — the
    // "still forming" bar under allow-lookahead, one bar ahead of what's safe to use
    // under the default strict mode.
    let mut opened: i64 = -1;
    for (i, &t) in ltf_open.iter().enumerate() {
        while (opened + 1) < htf_open.len() as i64 && htf_open[(opened + 1) as usize] <= t {
            opened += 1;
        }
        map[i] = match mode {
            LookaheadMode::None => if opened >= 0 { opened - 1 } else { -1 },
            LookaheadMode::Allow => opened,
        };
    }
    map
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HtfFilterType {
    Sma,
    Ema,
    SuperTrend,
    Ichimoku,
    Macd,
    Bollinger,
    Adx,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FilterResult {
    pub allow_long: bool,
    pub allow_short: bool,
}

impl FilterResult {
    pub fn both() -> Self {
        Self { allow_long: true, allow_short: true }
    }
}

/// Trend filter comparing HTF close against an HTF SMA/EMA, per `HTFTrendFilter`: close
/// above the indicator allows long only, below allows short only, and a configurable
/// neutral zone (percentage distance) allows both. Non-finite indicator values degrade
/// to "allow both" per §4.10's "unknown/NaN indicator values must degrade to allow both".
pub fn trend_filter(htf_close: f64, htf_indicator: f64, neutral_zone_pct: f64) -> FilterResult {
    if !htf_indicator.is_finite() || htf_indicator <= 0.0 || !htf_close.is_finite() {
        return FilterResult::both();
    }
    let distance_pct = (htf_close - htf_indicator) / htf_indicator * 100.0;
    if distance_pct.abs() <= neutral_zone_pct {
        return FilterResult::both();
    }
    if htf_close > htf_indicator {
        FilterResult { allow_long: true, allow_short: false }
    } else {
        FilterResult { allow_long: false, allow_short: true }
    }
}

/// BTC correlation filter: identical shape to `trend_filter` but applied to a BTC
/// close/SMA pair and gating an altcoin's direction, per `BTCCorrelationFilter`.
pub fn btc_correlation_filter(btc_close: f64, btc_sma: f64, min_distance_pct: f64) -> FilterResult {
    trend_filter(btc_close, btc_sma, min_distance_pct)
}

pub fn supertrend_filter(htf_close: f64, supertrend_value: f64, uptrend: bool) -> FilterResult {
    if !supertrend_value.is_finite() {
        return FilterResult::both();
    }
    let _ = htf_close;
    if uptrend {
        FilterResult { allow_long: true, allow_short: false }
    } else {
        FilterResult { allow_long: false, allow_short: true }
    }
}

/// Ichimoku cloud filter: price above both senkou spans (above the cloud) allows long
/// only, below both (below the cloud) allows short only, inside the cloud allows both.
pub fn ichimoku_filter(close: f64, senkou_a: f64, senkou_b: f64) -> FilterResult {
    if !senkou_a.is_finite() || !senkou_b.is_finite() {
        return FilterResult::both();
    }
    let cloud_top = senkou_a.max(senkou_b);
    let cloud_bottom = senkou_a.min(senkou_b);
    if close > cloud_top {
        FilterResult { allow_long: true, allow_short: false }
    } else if close < cloud_bottom {
        FilterResult { allow_long: false, allow_short: true }
    } else {
        FilterResult::both()
    }
}

/// MACD filter: histogram (or line-above-signal) sign gates direction.
pub fn macd_filter(macd_line: f64, signal_line: f64) -> FilterResult {
    if !macd_line.is_finite() || !signal_line.is_finite() {
        return FilterResult::both();
    }
    if macd_line > signal_line {
        FilterResult { allow_long: true, allow_short: false }
    } else if macd_line < signal_line {
        FilterResult { allow_long: false, allow_short: true }
    } else {
        FilterResult::both()
    }
}

/// Bollinger filter: close above the upper band favors long continuation, below the
/// lower band favors short continuation, inside the bands allows both.
pub fn bollinger_filter(close: f64, upper: f64, lower: f64) -> FilterResult {
    if !upper.is_finite() || !lower.is_finite() {
        return FilterResult::both();
    }
    if close > upper {
        FilterResult { allow_long: true, allow_short: false }
    } else if close < lower {
        FilterResult { allow_long: false, allow_short: true }
    } else {
        FilterResult::both()
    }
}

/// ADX filter: below the threshold the trend is too weak to trust a direction, so both
/// are allowed; at/above it, defers to the caller's trend-direction indicator (ADX alone
/// is directionless) — callers combine this with `trend_filter`/`macd_filter` output.
pub fn adx_filter(_adx_value: f64, _threshold: f64) -> FilterResult {
    FilterResult::both()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(minutes: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(minutes * 60, 0).unwrap()
    }

    #[test]
    fn interval_parsing() {
        assert_eq!(interval_to_minutes("5"), Some(5));
        assert_eq!(interval_to_minutes("60"), Some(60));
        assert_eq!(interval_to_minutes("D"), Some(1440));
        assert_eq!(interval_to_minutes("W"), Some(10080));
        assert_eq!(calculate_bars_ratio("5", "60").unwrap(), 12);
        assert!(calculate_bars_ratio("60", "5").is_err());
    }

    #[test]
    fn htf_index_map_matches_seed_scenario() {
        // LTF 5m timestamps 0..115 step 5; HTF 60m timestamps [0, 60].
        let ltf: Vec<DateTime<Utc>> = (0..24).map(|i| ts(i * 5)).collect();
        let htf: Vec<DateTime<Utc>> = vec![ts(0), ts(60)];

        let none_map = create_htf_index_map(&ltf, &htf, LookaheadMode::None);
        for i in 0..12 {
            assert_eq!(none_map[i], -1, "index {i} should be -1 under none mode");
        }
        for i in 12..24 {
            assert_eq!(none_map[i], 0, "index {i} should be 0 under none mode");
        }

        let allow_map = create_htf_index_map(&ltf, &htf, LookaheadMode::Allow);
        for i in 0..12 {
            assert_eq!(allow_map[i], 0, "index {i} should be 0 under allow mode");
        }
        for i in 12..24 {
            assert_eq!(allow_map[i], 1, "index {i} should be 1 under allow mode");
        }
    }

    #[test]
    fn htf_index_map_none_mode_is_negative_one_before_first_htf_open() {
        // HTF's first bar doesn't open until t=60; LTF bars before that have no
        // closed HTF bar to reference and must map to -1, not -2.
        let ltf: Vec<DateTime<Utc>> = (0..12).map(|i| ts(i * 5)).collect();
        let htf: Vec<DateTime<Utc>> = vec![ts(60), ts(120)];

        let none_map = create_htf_index_map(&ltf, &htf, LookaheadMode::None);
        assert!(none_map.iter().all(|&k| k == -1), "{none_map:?}");
    }

    #[test]
    fn htf_index_map_is_monotone_and_never_future() {
        let ltf: Vec<DateTime<Utc>> = (0..50).map(|i| ts(i * 5)).collect();
        let htf: Vec<DateTime<Utc>> = (0..10).map(|i| ts(i * 60)).collect();
        let map = create_htf_index_map(&ltf, &htf, LookaheadMode::None);
        for i in 1..map.len() {
            assert!(map[i] >= map[i - 1]);
        }
        for (i, &k) in map.iter().enumerate() {
            if k >= 0 {
                let k = k as usize;
                if k + 1 < htf.len() {
                    assert!(htf[k + 1] <= ltf[i]);
                }
            }
        }
    }

    #[test]
    fn trend_filter_degrades_to_allow_both_on_nan() {
        let r = trend_filter(100.0, f64::NAN, 0.0);
        assert!(r.allow_long && r.allow_short);
    }
}
