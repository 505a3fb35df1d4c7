//! Core B — vectorized backtesting engine.
//!
//! One module per component (C12–C19): indicators, MTF index mapping and HTF filters,
//! the pyramiding/DCA position book, the single-pass bar-walking engine, the parallel
//! grid optimizer, the walk-forward harness and the Monte Carlo post-processing step.
//! `types` holds the shared candle/trade/config/output data model every other module
//! builds on.

pub mod engine;
pub mod indicators;
pub mod monte_carlo;
pub mod mtf;
pub mod optimizer;
pub mod position;
pub mod types;
pub mod walk_forward;

pub use engine::BacktestEngine;
pub use monte_carlo::{MonteCarloConfig, MonteCarloMethod, MonteCarloResult, MonteCarloSimulator};
pub use mtf::{create_htf_index_map, HtfFilterType, LookaheadMode};
pub use optimizer::{MtfOptimizer, OptimizeMetric, OptimizationSummary, ParamGrid};
pub use types::{BacktestConfig, BacktestMetrics, BacktestOutput, Candle, Direction, TradeRecord};
pub use walk_forward::{WalkForwardAnalyzer, WalkForwardConfig, WalkForwardSummary};
