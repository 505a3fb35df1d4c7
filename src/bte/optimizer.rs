//! C17 — MTF Grid Optimizer.
//!
//! Cartesian-product parameter sweep over RSI period/overbought/oversold, stop-loss/
//! take-profit and HTF filter type/period, grounded on `examples/original_source/
//! backend/backtesting/mtf_optimizer.py::MTFOptimizer.optimize`. HTF indicators are
//! precomputed once per `(filter_type, period)` pair (mirroring `_precompute_htf_
//! indicators`) rather than recomputed per combination, and the grid itself runs on
//! `rayon`'s global pool instead of the Python version's single-threaded loop.

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::engine::BacktestEngine;
use super::indicators;
use super::mtf::{self, HtfFilterType, LookaheadMode};
use super::types::{BacktestConfig, BacktestMetrics, Candle};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamGrid {
    pub rsi_periods: Vec<usize>,
    pub rsi_overbought: Vec<f64>,
    pub rsi_oversold: Vec<f64>,
    pub stop_losses: Vec<f64>,
    pub take_profits: Vec<f64>,
    pub htf_filter_types: Vec<HtfFilterType>,
    pub htf_filter_periods: Vec<usize>,
}

impl Default for ParamGrid {
    fn default() -> Self {
        Self {
            rsi_periods: vec![14],
            rsi_overbought: vec![70.0],
            rsi_oversold: vec![30.0],
            stop_losses: vec![0.02],
            take_profits: vec![0.03],
            htf_filter_types: vec![HtfFilterType::Sma],
            htf_filter_periods: vec![200],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamPoint {
    pub rsi_period: usize,
    pub rsi_overbought: f64,
    pub rsi_oversold: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub htf_filter_type: HtfFilterType,
    pub htf_filter_period: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationPoint {
    pub params: ParamPoint,
    pub score: f64,
    pub metrics: BacktestMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationSummary {
    pub total_combinations: usize,
    pub tested_combinations: usize,
    pub execution_time_ms: f64,
    pub top_results: Vec<OptimizationPoint>,
}

impl OptimizationSummary {
    pub fn best(&self) -> Option<&OptimizationPoint> {
        self.top_results.first()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizeMetric {
    SharpeRatio,
    TotalReturn,
    ProfitFactor,
    NetProfit,
}

fn score_of(metrics: &BacktestMetrics, which: OptimizeMetric) -> f64 {
    let raw = match which {
        OptimizeMetric::SharpeRatio => metrics.sharpe_ratio,
        OptimizeMetric::TotalReturn => metrics.total_return_pct,
        OptimizeMetric::ProfitFactor => metrics.profit_factor,
        OptimizeMetric::NetProfit => metrics.net_profit,
    };
    if raw.is_nan() || raw.is_infinite() {
        -999.0
    } else {
        raw
    }
}

/// Precomputed HTF filter-decision series: `allow_long[i]`/`allow_short[i]` per HTF bar,
/// already keyed by `(filter_type, period)` so the grid sweep never recomputes an
/// indicator twice.
struct HtfFilterSeries {
    allow_long: Vec<bool>,
    allow_short: Vec<bool>,
}

fn precompute_htf_filter(htf_candles: &[Candle], filter_type: HtfFilterType, period: usize) -> HtfFilterSeries {
    let closes: Vec<f64> = htf_candles.iter().map(|c| c.close).collect();
    let n = closes.len();
    let mut allow_long = vec![true; n];
    let mut allow_short = vec![true; n];

    match filter_type {
        HtfFilterType::Sma => {
            let ind = indicators::sma(&closes, period);
            for i in 0..n {
                let r = mtf::trend_filter(closes[i], ind[i], 0.0);
                allow_long[i] = r.allow_long;
                allow_short[i] = r.allow_short;
            }
        }
        HtfFilterType::Ema => {
            let ind = indicators::ema(&closes, period);
            for i in 0..n {
                let r = mtf::trend_filter(closes[i], ind[i], 0.0);
                allow_long[i] = r.allow_long;
                allow_short[i] = r.allow_short;
            }
        }
        HtfFilterType::SuperTrend => {
            let st = indicators::supertrend(htf_candles, period, 3.0);
            for i in 0..n {
                let r = mtf::supertrend_filter(closes[i], st.value[i], st.uptrend[i]);
                allow_long[i] = r.allow_long;
                allow_short[i] = r.allow_short;
            }
        }
        HtfFilterType::Ichimoku => {
            let ich = indicators::ichimoku(htf_candles, 9, period, period * 2);
            for i in 0..n {
                let r = mtf::ichimoku_filter(closes[i], ich.senkou_span_a[i], ich.senkou_span_b[i]);
                allow_long[i] = r.allow_long;
                allow_short[i] = r.allow_short;
            }
        }
        HtfFilterType::Macd => {
            let fast = (period / 2).max(5);
            let signal = (period / 3).max(3);
            let m = indicators::macd(&closes, fast, period, signal);
            for i in 0..n {
                let r = mtf::macd_filter(m.macd_line[i], m.signal_line[i]);
                allow_long[i] = r.allow_long;
                allow_short[i] = r.allow_short;
            }
        }
        HtfFilterType::Bollinger => {
            let b = indicators::bollinger(&closes, period, 2.0);
            for i in 0..n {
                let r = mtf::bollinger_filter(closes[i], b.upper[i], b.lower[i]);
                allow_long[i] = r.allow_long;
                allow_short[i] = r.allow_short;
            }
        }
        HtfFilterType::Adx => {
            let adx = indicators::adx(htf_candles, period);
            for i in 0..n {
                let r = mtf::adx_filter(adx[i], 25.0);
                allow_long[i] = r.allow_long;
                allow_short[i] = r.allow_short;
            }
        }
    }
    HtfFilterSeries { allow_long, allow_short }
}

fn project_htf_to_ltf(htf_idx_map: &[i64], series: &HtfFilterSeries) -> (Vec<bool>, Vec<bool>) {
    let mut allow_long = Vec::with_capacity(htf_idx_map.len());
    let mut allow_short = Vec::with_capacity(htf_idx_map.len());
    for &k in htf_idx_map {
        if k < 0 || k as usize >= series.allow_long.len() {
            allow_long.push(true);
            allow_short.push(true);
        } else {
            allow_long.push(series.allow_long[k as usize]);
            allow_short.push(series.allow_short[k as usize]);
        }
    }
    (allow_long, allow_short)
}

/// RSI-threshold entry/exit signal generator used by the grid sweep itself, grounded on
/// `mtf/signals.py::generate_mtf_rsi_signals`'s RSI-crossing-threshold core (the MTF
/// filter gating happens downstream in the engine via `mtf_allow`, not inside signal
/// generation, keeping this function engine-agnostic).
fn rsi_signals(closes: &[f64], period: usize, overbought: f64, oversold: f64) -> (Vec<bool>, Vec<bool>, Vec<bool>, Vec<bool>) {
    let rsi = indicators::rsi(closes, period);
    let n = closes.len();
    let mut long_entries = vec![false; n];
    let mut long_exits = vec![false; n];
    let mut short_entries = vec![false; n];
    let mut short_exits = vec![false; n];
    for i in 1..n {
        if !rsi[i].is_finite() || !rsi[i - 1].is_finite() {
            continue;
        }
        long_entries[i] = rsi[i - 1] <= oversold && rsi[i] > oversold;
        long_exits[i] = rsi[i - 1] < overbought && rsi[i] >= overbought;
        short_entries[i] = rsi[i - 1] >= overbought && rsi[i] < overbought;
        short_exits[i] = rsi[i - 1] > oversold && rsi[i] <= oversold;
    }
    (long_entries, long_exits, short_entries, short_exits)
}

pub struct MtfOptimizer {
    pub optimize_metric: OptimizeMetric,
    pub top_k: usize,
}

impl Default for MtfOptimizer {
    fn default() -> Self {
        Self { optimize_metric: OptimizeMetric::SharpeRatio, top_k: 20 }
    }
}

impl MtfOptimizer {
    pub fn new(optimize_metric: OptimizeMetric, top_k: usize) -> Self {
        Self { optimize_metric, top_k }
    }

    pub fn optimize(
        &self,
        ltf_candles: &[Candle],
        htf_candles: &[Candle],
        base_config: &BacktestConfig,
        grid: &ParamGrid,
    ) -> OptimizationSummary {
        let start = std::time::Instant::now();
        let ltf_open: Vec<DateTime<Utc>> = ltf_candles.iter().map(|c| c.open_time).collect();
        let htf_open: Vec<DateTime<Utc>> = htf_candles.iter().map(|c| c.open_time).collect();
        let htf_idx_map = mtf::create_htf_index_map(&ltf_open, &htf_open, LookaheadMode::None);
        let closes: Vec<f64> = ltf_candles.iter().map(|c| c.close).collect();

        // `total_combinations` is the full Cartesian product size, counted before the
        // `overbought <= oversold` skip per §4.13 — `combos` holds only the surviving,
        // actually-runnable points.
        let total_combinations = grid.htf_filter_types.len()
            * grid.htf_filter_periods.len()
            * grid.rsi_periods.len()
            * grid.rsi_overbought.len()
            * grid.rsi_oversold.len()
            * grid.stop_losses.len()
            * grid.take_profits.len();

        let mut combos: Vec<ParamPoint> = Vec::new();
        for &filter_type in &grid.htf_filter_types {
            for &period in &grid.htf_filter_periods {
                for &rsi_period in &grid.rsi_periods {
                    for &ob in &grid.rsi_overbought {
                        for &os in &grid.rsi_oversold {
                            if ob <= os {
                                continue;
                            }
                            for &sl in &grid.stop_losses {
                                for &tp in &grid.take_profits {
                                    combos.push(ParamPoint {
                                        rsi_period,
                                        rsi_overbought: ob,
                                        rsi_oversold: os,
                                        stop_loss: sl,
                                        take_profit: tp,
                                        htf_filter_type: filter_type,
                                        htf_filter_period: period,
                                    });
                                }
                            }
                        }
                    }
                }
            }
        }

        let mut filter_cache: std::collections::HashMap<(HtfFilterType, usize), (Vec<bool>, Vec<bool>)> =
            std::collections::HashMap::new();
        for &filter_type in &grid.htf_filter_types {
            for &period in &grid.htf_filter_periods {
                let series = precompute_htf_filter(htf_candles, filter_type, period);
                filter_cache.insert((filter_type, period), project_htf_to_ltf(&htf_idx_map, &series));
            }
        }

        let mut results: Vec<OptimizationPoint> = combos
            .par_iter()
            .filter_map(|point| {
                let (long_entries, long_exits, short_entries, short_exits) =
                    rsi_signals(&closes, point.rsi_period, point.rsi_overbought, point.rsi_oversold);
                let mut cfg = base_config.clone();
                cfg.stop_loss = point.stop_loss;
                cfg.take_profit = point.take_profit;

                let mtf_allow = filter_cache.get(&(point.htf_filter_type, point.htf_filter_period)).cloned();
                let engine = BacktestEngine::new(cfg);
                let output = engine.run_with_mtf(ltf_candles, &long_entries, &long_exits, &short_entries, &short_exits, mtf_allow);
                if !output.is_valid {
                    return None;
                }
                let score = score_of(&output.metrics, self.optimize_metric);
                Some(OptimizationPoint { params: point.clone(), score, metrics: output.metrics })
            })
            .collect();

        let tested_combinations = results.len();
        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(self.top_k);

        OptimizationSummary {
            total_combinations,
            tested_combinations,
            execution_time_ms: start.elapsed().as_secs_f64() * 1000.0,
            top_results: results,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn candles(n: usize, step_minutes: i64) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let base = 100.0 + (i as f64 * 0.37).sin() * 5.0;
                Candle {
                    open_time: Utc.timestamp_opt(i as i64 * step_minutes * 60, 0).unwrap(),
                    open: base,
                    high: base + 1.0,
                    low: base - 1.0,
                    close: base + 0.2,
                    volume: 1000.0,
                }
            })
            .collect()
    }

    #[test]
    fn invalid_rsi_combos_are_skipped() {
        let grid = ParamGrid {
            rsi_periods: vec![14],
            rsi_overbought: vec![30.0],
            rsi_oversold: vec![70.0],
            stop_losses: vec![0.02],
            take_profits: vec![0.03],
            htf_filter_types: vec![HtfFilterType::Sma],
            htf_filter_periods: vec![50],
        };
        let ltf = candles(200, 5);
        let htf = candles(20, 60);
        let optimizer = MtfOptimizer::default();
        let summary = optimizer.optimize(&ltf, &htf, &BacktestConfig::default(), &grid);
        assert_eq!(summary.total_combinations, 1);
        assert_eq!(summary.tested_combinations, 0);
    }

    #[test]
    fn grid_sweep_produces_ranked_results() {
        let grid = ParamGrid {
            rsi_periods: vec![7, 14],
            rsi_overbought: vec![70.0],
            rsi_oversold: vec![30.0],
            stop_losses: vec![0.02],
            take_profits: vec![0.03, 0.05],
            htf_filter_types: vec![HtfFilterType::Sma],
            htf_filter_periods: vec![10],
        };
        let ltf = candles(300, 5);
        let htf = candles(30, 60);
        let optimizer = MtfOptimizer::new(OptimizeMetric::SharpeRatio, 5);
        let summary = optimizer.optimize(&ltf, &htf, &BacktestConfig::default(), &grid);
        assert_eq!(summary.total_combinations, 4);
        assert!(summary.tested_combinations <= 4);
        for window in summary.top_results.windows(2) {
            assert!(window[0].score >= window[1].score);
        }
    }
}
