//! C19 — Monte Carlo robustness analysis.
//!
//! Grounded on `examples/original_source/backend/services/monte_carlo.py`'s
//! `MonteCarloSimulator`/`MonteCarloResult`: resample a completed backtest's trade
//! sequence thousands of times (permutation, bootstrap, or block bootstrap) and
//! summarize the resulting return/Sharpe/drawdown distributions. The HTTP-facing router
//! that served this over the post-processing API is out of scope (§1 Non-goals); the
//! resampling and statistics kept here are the in-scope service logic.
//!
//! Reproducibility uses a seeded `rand_chacha::ChaCha8Rng` rather than the original's
//! process-global `numpy`/`random` seeding, since a shared `Runtime` may run several
//! analyses concurrently.

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use super::types::TradeRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonteCarloMethod {
    Permutation,
    Bootstrap,
    BlockBootstrap,
}

impl std::fmt::Display for MonteCarloMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MonteCarloMethod::Permutation => "permutation",
            MonteCarloMethod::Bootstrap => "bootstrap",
            MonteCarloMethod::BlockBootstrap => "block_bootstrap",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone)]
pub struct MonteCarloConfig {
    pub n_simulations: usize,
    pub block_size: usize,
    pub seed: Option<u64>,
}

impl Default for MonteCarloConfig {
    fn default() -> Self {
        Self { n_simulations: 10_000, block_size: 10, seed: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonteCarloResult {
    pub n_simulations: usize,
    pub method: MonteCarloMethod,
    pub simulation_time_ms: f64,

    pub original_return: f64,
    pub original_sharpe: f64,
    pub original_max_drawdown: f64,

    #[serde(skip)]
    pub simulated_returns: Vec<f64>,
    #[serde(skip)]
    pub simulated_sharpes: Vec<f64>,
    #[serde(skip)]
    pub simulated_max_drawdowns: Vec<f64>,
    #[serde(skip)]
    pub simulated_final_capitals: Vec<f64>,

    pub mean_return: f64,
    pub std_return: f64,
    pub median_return: f64,
    pub mean_sharpe: f64,
    pub mean_max_drawdown: f64,

    pub var_95: f64,
    pub var_99: f64,
    pub cvar_95: f64,

    pub prob_positive_return: f64,
    pub prob_beat_benchmark: f64,

    pub return_ci_95: (f64, f64),
    pub drawdown_ci_95: (f64, f64),

    pub worst_case_return: f64,
    pub best_case_return: f64,
    pub worst_case_drawdown: f64,
}

impl MonteCarloResult {
    /// Fraction of simulations whose return was at least `target_return`.
    pub fn probability_of_return(&self, target_return: f64) -> f64 {
        fraction_ge(&self.simulated_returns, target_return)
    }

    /// Fraction of simulations whose |max drawdown| stayed under `max_dd`.
    pub fn probability_of_drawdown_less_than(&self, max_dd: f64) -> f64 {
        if self.simulated_max_drawdowns.is_empty() {
            return 0.0;
        }
        let threshold = max_dd.abs();
        let hits = self.simulated_max_drawdowns.iter().filter(|d| d.abs() <= threshold).count();
        hits as f64 / self.simulated_max_drawdowns.len() as f64
    }

    pub fn return_percentile(&self, percentile: f64) -> f64 {
        percentile_of(&self.simulated_returns, percentile)
    }

    pub fn drawdown_percentile(&self, percentile: f64) -> f64 {
        let abs: Vec<f64> = self.simulated_max_drawdowns.iter().map(|d| d.abs()).collect();
        percentile_of(&abs, percentile)
    }
}

fn fraction_ge(values: &[f64], threshold: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().filter(|v| **v >= threshold).count() as f64 / values.len() as f64
}

/// Linear-interpolation percentile matching `numpy.percentile`'s default (`'linear'`)
/// method. `percentile` is in `[0, 100]`.
fn percentile_of(values: &[f64], percentile: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<f64> = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }
    let rank = (percentile / 100.0) * (n - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        return sorted[lo];
    }
    let frac = rank - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}

/// Annualized Sharpe assuming the input series is one return per trade, sqrt(252)
/// annualization kept for consistency with `BacktestMetrics::sharpe_ratio` in `engine.rs`.
fn trade_sharpe(pnl_pct: &[f64]) -> f64 {
    let std = std_dev(pnl_pct);
    if pnl_pct.is_empty() || std <= 1e-12 {
        return 0.0;
    }
    mean(pnl_pct) / std * 252.0_f64.sqrt()
}

/// Max drawdown (negative fraction) of the equity path built by walking
/// `initial_capital + cumsum(pnl)`.
fn max_drawdown_from_pnl(pnl: &[f64], initial_capital: f64) -> f64 {
    let mut equity = initial_capital;
    let mut peak = initial_capital;
    let mut worst = 0.0_f64;
    for &p in pnl {
        equity += p;
        if equity > peak {
            peak = equity;
        }
        if peak > 0.0 {
            let dd = (equity - peak) / peak;
            if dd < worst {
                worst = dd;
            }
        }
    }
    worst
}

pub struct MonteCarloSimulator {
    config: MonteCarloConfig,
}

impl MonteCarloSimulator {
    pub fn new(config: MonteCarloConfig) -> Self {
        Self { config }
    }

    fn rng(&self) -> ChaCha8Rng {
        match self.config.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        }
    }

    /// Block bootstrap: sample contiguous blocks of `block_size` (wrapping at the series
    /// boundary is not needed — blocks are drawn from `0..=n-block_size`) with
    /// replacement until `n` elements are assembled, then truncate to `n`. Preserves
    /// local trade-to-trade structure that a full permutation/i.i.d. bootstrap destroys.
    fn block_bootstrap(&self, pnl: &[f64], pnl_pct: &[f64], rng: &mut ChaCha8Rng) -> (Vec<f64>, Vec<f64>) {
        let n = pnl.len();
        let block_size = self.config.block_size.min(n).max(1);
        let n_blocks = n.div_ceil(block_size);
        let mut sim_pnl = Vec::with_capacity(n + block_size);
        let mut sim_pct = Vec::with_capacity(n + block_size);
        let max_start = n.saturating_sub(block_size);
        for _ in 0..n_blocks {
            let start = rng.gen_range(0..=max_start);
            let end = (start + block_size).min(n);
            sim_pnl.extend_from_slice(&pnl[start..end]);
            sim_pct.extend_from_slice(&pnl_pct[start..end]);
        }
        sim_pnl.truncate(n);
        sim_pct.truncate(n);
        (sim_pnl, sim_pct)
    }

    /// Resamples `backtest_results`'s trades `n_simulations` times under `method` and
    /// summarizes the resulting return/Sharpe/drawdown distributions against
    /// `initial_capital` and `benchmark_return`.
    pub fn analyze_trades(
        &self,
        trades: &[TradeRecord],
        initial_capital: f64,
        benchmark_return: f64,
        method: MonteCarloMethod,
    ) -> MonteCarloResult {
        let start = std::time::Instant::now();
        let pnl: Vec<f64> = trades.iter().map(|t| t.pnl).collect();
        let pnl_pct: Vec<f64> = trades.iter().map(|t| t.pnl_pct).collect();

        let original_return = if initial_capital > 0.0 { pnl.iter().sum::<f64>() / initial_capital } else { 0.0 };
        let original_sharpe = trade_sharpe(&pnl_pct);
        let original_max_drawdown = max_drawdown_from_pnl(&pnl, initial_capital);

        let n = self.config.n_simulations;
        let mut simulated_returns = Vec::with_capacity(n);
        let mut simulated_sharpes = Vec::with_capacity(n);
        let mut simulated_max_drawdowns = Vec::with_capacity(n);
        let mut simulated_final_capitals = Vec::with_capacity(n);

        let mut rng = self.rng();
        for _ in 0..n {
            let (sim_pnl, sim_pct) = match method {
                MonteCarloMethod::Permutation => {
                    let mut idx: Vec<usize> = (0..pnl.len()).collect();
                    idx.shuffle(&mut rng);
                    (idx.iter().map(|&i| pnl[i]).collect::<Vec<_>>(), idx.iter().map(|&i| pnl_pct[i]).collect::<Vec<_>>())
                }
                MonteCarloMethod::Bootstrap => {
                    let idx: Vec<usize> = (0..pnl.len()).map(|_| rng.gen_range(0..pnl.len().max(1))).collect();
                    (idx.iter().map(|&i| pnl[i]).collect::<Vec<_>>(), idx.iter().map(|&i| pnl_pct[i]).collect::<Vec<_>>())
                }
                MonteCarloMethod::BlockBootstrap => self.block_bootstrap(&pnl, &pnl_pct, &mut rng),
            };

            let sim_return = if initial_capital > 0.0 { sim_pnl.iter().sum::<f64>() / initial_capital } else { 0.0 };
            simulated_returns.push(sim_return);
            simulated_final_capitals.push(initial_capital + sim_pnl.iter().sum::<f64>());
            simulated_sharpes.push(trade_sharpe(&sim_pct));
            simulated_max_drawdowns.push(max_drawdown_from_pnl(&sim_pnl, initial_capital));
        }

        let var_95 = percentile_of(&simulated_returns, 5.0);
        let below_var_95: Vec<f64> = simulated_returns.iter().copied().filter(|r| *r <= var_95).collect();
        let cvar_95 = if below_var_95.is_empty() { 0.0 } else { mean(&below_var_95) };

        MonteCarloResult {
            n_simulations: n,
            method,
            simulation_time_ms: start.elapsed().as_secs_f64() * 1000.0,
            original_return,
            original_sharpe,
            original_max_drawdown,
            mean_return: mean(&simulated_returns),
            std_return: std_dev(&simulated_returns),
            median_return: percentile_of(&simulated_returns, 50.0),
            mean_sharpe: mean(&simulated_sharpes),
            mean_max_drawdown: mean(&simulated_max_drawdowns),
            var_95,
            var_99: percentile_of(&simulated_returns, 1.0),
            cvar_95,
            prob_positive_return: fraction_ge(&simulated_returns, f64::EPSILON),
            prob_beat_benchmark: fraction_ge(&simulated_returns, benchmark_return),
            return_ci_95: (percentile_of(&simulated_returns, 2.5), percentile_of(&simulated_returns, 97.5)),
            drawdown_ci_95: (
                percentile_of(&simulated_max_drawdowns.iter().map(|d| d.abs()).collect::<Vec<_>>(), 2.5),
                percentile_of(&simulated_max_drawdowns.iter().map(|d| d.abs()).collect::<Vec<_>>(), 97.5),
            ),
            worst_case_return: simulated_returns.iter().copied().fold(f64::INFINITY, f64::min),
            best_case_return: simulated_returns.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            worst_case_drawdown: simulated_max_drawdowns.iter().map(|d| d.abs()).fold(0.0, f64::max),
            simulated_returns,
            simulated_sharpes,
            simulated_max_drawdowns,
            simulated_final_capitals,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bte::types::{Direction, ExitReason};
    use chrono::{TimeZone, Utc};

    fn trade(pnl: f64) -> TradeRecord {
        TradeRecord {
            entry_time: Utc.timestamp_opt(0, 0).unwrap(),
            exit_time: Utc.timestamp_opt(60, 0).unwrap(),
            direction: Direction::Long,
            entry_price: 100.0,
            exit_price: 100.0 + pnl,
            size: 1.0,
            pnl,
            pnl_pct: pnl / 1000.0,
            fees: 0.0,
            exit_reason: ExitReason::TakeProfit,
            duration_bars: 1,
            mfe: 0.0,
            mae: 0.0,
        }
    }

    /// Seed scenario: 100 trades summing to a fixed total PnL, permuted 1000 times.
    /// Permutation preserves the multiset of PnLs, so the simulated mean return must
    /// equal the original return to near machine precision, and VaR95 <= median <=
    /// the 97.5th percentile.
    #[test]
    fn permutation_preserves_total_return_distribution() {
        let trades: Vec<TradeRecord> = (0..100).map(|i| trade(if i % 3 == 0 { -5.0 } else { 8.0 })).collect();
        let total: f64 = trades.iter().map(|t| t.pnl).sum();
        let initial_capital = 10_000.0;

        let sim = MonteCarloSimulator::new(MonteCarloConfig { n_simulations: 1000, block_size: 10, seed: Some(42) });
        let result = sim.analyze_trades(&trades, initial_capital, 0.0, MonteCarloMethod::Permutation);

        assert_eq!(result.n_simulations, 1000);
        assert!((result.mean_return - total / initial_capital).abs() < 1e-9);
        assert!(result.var_95 <= result.median_return + 1e-9);
        assert!(result.median_return <= result.return_ci_95.1 + 1e-9);
        assert!(result.return_ci_95.0 <= result.return_ci_95.1);
    }

    #[test]
    fn bootstrap_is_reproducible_with_fixed_seed() {
        let trades: Vec<TradeRecord> = (0..30).map(|i| trade((i as f64 - 15.0) * 2.0)).collect();
        let cfg = MonteCarloConfig { n_simulations: 200, block_size: 5, seed: Some(7) };
        let a = MonteCarloSimulator::new(cfg.clone()).analyze_trades(&trades, 5_000.0, 0.0, MonteCarloMethod::Bootstrap);
        let b = MonteCarloSimulator::new(cfg).analyze_trades(&trades, 5_000.0, 0.0, MonteCarloMethod::Bootstrap);
        assert_eq!(a.simulated_returns, b.simulated_returns);
    }

    #[test]
    fn block_bootstrap_preserves_series_length() {
        let trades: Vec<TradeRecord> = (0..47).map(|i| trade((i % 7) as f64 - 3.0)).collect();
        let sim = MonteCarloSimulator::new(MonteCarloConfig { n_simulations: 50, block_size: 6, seed: Some(1) });
        let result = sim.analyze_trades(&trades, 2_000.0, 0.0, MonteCarloMethod::BlockBootstrap);
        assert_eq!(result.simulated_returns.len(), 50);
        assert!(result.worst_case_drawdown >= 0.0);
    }

    #[test]
    fn probability_queries_are_bounded() {
        let trades: Vec<TradeRecord> = (0..20).map(|i| trade(if i % 2 == 0 { 10.0 } else { -4.0 })).collect();
        let sim = MonteCarloSimulator::new(MonteCarloConfig { n_simulations: 300, block_size: 4, seed: Some(99) });
        let result = sim.analyze_trades(&trades, 1_000.0, 0.0, MonteCarloMethod::Permutation);
        let p = result.probability_of_return(0.0);
        assert!((0.0..=1.0).contains(&p));
        let dd_p50 = result.drawdown_percentile(50.0);
        assert!(dd_p50 >= 0.0);
    }
}
