//! Core B data model — candles, trades, configuration and output shapes shared across
//! `engine`, `optimizer`, `walk_forward` and `monte_carlo`. Grounded on
//! `examples/original_source/backend/backtesting/engines/fallback_engine_v4.py` and
//! `backend/backtesting/engines/base_engine.py`'s `BacktestResult`/`Trade` dataclasses,
//! re-expressed as plain Rust structs instead of Python dataclasses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn sign(self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }

    pub fn opposite(self) -> Direction {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectionMode {
    Long,
    Short,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Signal,
    StopLoss,
    TakeProfit,
    TrailingStop,
    TimeExit,
    SessionClose,
    WeekendClose,
    EndOfData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TpMode {
    Fixed,
    Atr,
    Multi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlMode {
    Fixed,
    Atr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSizingMode {
    Fixed,
    Risk,
    Kelly,
    Volatility,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlippageModel {
    Fixed,
    Volume,
    Volatility,
    Combined,
    Advanced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryOrderType {
    Market,
    Limit,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakevenMode {
    Average,
    Tp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CloseEntriesRule {
    All,
    Fifo,
    Lifo,
}

/// A single OHLCV bar. `open_time` orders the series; invariants
/// (`low <= min(open,close) <= max(open,close) <= high`) are checked by
/// [`Candle::validate`], not enforced at construction — upstream data loaders are out of
/// scope (§1 Non-goals) so malformed candles are a validation-time concern.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn validate(&self) -> bool {
        let body_lo = self.open.min(self.close);
        let body_hi = self.open.max(self.close);
        self.low <= body_lo && body_hi <= self.high
    }
}

/// Index into a finer-grained (e.g. 1-minute) candle series for intra-bar fill
/// refinement. Per §9/SPEC_FULL §A.4 the engine accepts this but does not use it to
/// refine fill prices — the reference source's intent here is ambiguous and we do not
/// guess at it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BarMagnifierIndex {
    pub bar_to_1m_range: Vec<(usize, usize)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub direction: Direction,
    pub entry_price: f64,
    pub exit_price: f64,
    pub size: f64,
    pub pnl: f64,
    pub pnl_pct: f64,
    pub fees: f64,
    pub exit_reason: ExitReason,
    pub duration_bars: u64,
    pub mfe: f64,
    pub mae: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BacktestMetrics {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub gross_profit: f64,
    pub gross_loss: f64,
    pub net_profit: f64,
    pub total_return_pct: f64,
    pub max_drawdown_pct: f64,
    pub sharpe_ratio: f64,
    pub profit_factor: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestOutput {
    pub trades: Vec<TradeRecord>,
    pub equity_curve: Vec<f64>,
    pub metrics: BacktestMetrics,
    pub bars_processed: usize,
    pub execution_time_ms: f64,
    pub engine_name: String,
    pub is_valid: bool,
    pub validation_errors: Vec<String>,
}

impl BacktestOutput {
    pub fn invalid(errors: Vec<String>, engine_name: &str) -> Self {
        Self {
            trades: Vec::new(),
            equity_curve: Vec::new(),
            metrics: BacktestMetrics::default(),
            bars_processed: 0,
            execution_time_ms: 0.0,
            engine_name: engine_name.to_string(),
            is_valid: false,
            validation_errors: errors,
        }
    }
}

/// Scale-in / safety-order grid level: price offset (fraction) and capital portion.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GridLevel {
    pub deviation: f64,
    pub portion: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestConfig {
    pub initial_capital: f64,
    pub position_size: f64,
    pub use_fixed_amount: bool,
    pub fixed_amount: f64,
    pub leverage: f64,

    pub direction: DirectionMode,
    pub hedge_mode: bool,

    pub pyramiding: usize,
    pub close_entries_rule: CloseEntriesRule,

    pub tp_mode: TpMode,
    pub sl_mode: SlMode,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub tp_levels: Vec<f64>,
    pub tp_portions: Vec<f64>,

    pub atr_period: usize,
    pub atr_tp_multiplier: f64,
    pub atr_sl_multiplier: f64,
    pub sl_max_limit_enabled: bool,
    pub adaptive_atr_enabled: bool,
    pub adaptive_atr_lookback: usize,

    pub trailing_stop_enabled: bool,
    pub trailing_stop_activation: f64,
    pub trailing_stop_distance: f64,

    pub breakeven_enabled: bool,
    pub breakeven_mode: BreakevenMode,
    pub breakeven_offset: f64,

    pub dca_enabled: bool,
    pub dca_count: usize,
    pub dca_deviation: f64,
    pub dca_step_scale: f64,
    pub dca_volume_ratio: f64,
    pub dca_volume_scale: f64,

    pub max_bars_in_trade: Option<u64>,
    pub exit_on_session_close: bool,
    pub session_start_hour: u32,
    pub session_end_hour: u32,
    pub no_trade_days: Vec<u32>,
    pub no_trade_hours: Vec<u32>,
    pub exit_end_of_week: bool,
    pub exit_before_weekend: bool,
    pub timezone_offset_hours: i32,

    pub position_sizing_mode: PositionSizingMode,
    pub risk_per_trade: f64,
    pub kelly_fraction: f64,
    pub volatility_target: f64,
    pub min_position_size: f64,
    pub max_position_size: f64,

    pub allow_re_entry: bool,
    pub re_entry_delay_bars: u64,
    pub max_trades_per_day: Option<usize>,
    pub max_trades_per_week: Option<usize>,
    pub max_consecutive_losses: Option<usize>,
    pub cooldown_after_loss_bars: u64,

    pub entry_order_type: EntryOrderType,
    pub limit_entry_offset: f64,
    pub limit_entry_timeout_bars: u64,
    pub stop_entry_offset: f64,

    pub scale_in_enabled: bool,
    pub scale_in_levels: Vec<GridLevel>,

    pub slippage_model: SlippageModel,
    pub slippage: f64,
    pub slippage_volume_impact: f64,
    pub slippage_volatility_mult: f64,

    pub include_funding: bool,
    pub funding_rate: f64,
    pub funding_interval_hours: u64,

    pub taker_fee: f64,
    pub maker_fee: f64,

    pub mtf_enabled: bool,
    pub mtf_neutral_zone_pct: f64,

    pub bar_magnifier: Option<BarMagnifierIndex>,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            initial_capital: 10_000.0,
            position_size: 0.1,
            use_fixed_amount: false,
            fixed_amount: 1_000.0,
            leverage: 1.0,

            direction: DirectionMode::Both,
            hedge_mode: false,

            pyramiding: 1,
            close_entries_rule: CloseEntriesRule::Fifo,

            tp_mode: TpMode::Fixed,
            sl_mode: SlMode::Fixed,
            stop_loss: 0.02,
            take_profit: 0.04,
            tp_levels: Vec::new(),
            tp_portions: Vec::new(),

            atr_period: 14,
            atr_tp_multiplier: 2.0,
            atr_sl_multiplier: 1.5,
            sl_max_limit_enabled: false,
            adaptive_atr_enabled: false,
            adaptive_atr_lookback: 100,

            trailing_stop_enabled: false,
            trailing_stop_activation: 0.01,
            trailing_stop_distance: 0.005,

            breakeven_enabled: false,
            breakeven_mode: BreakevenMode::Average,
            breakeven_offset: 0.0,

            dca_enabled: false,
            dca_count: 0,
            dca_deviation: 0.02,
            dca_step_scale: 1.0,
            dca_volume_ratio: 1.0,
            dca_volume_scale: 1.0,

            max_bars_in_trade: None,
            exit_on_session_close: false,
            session_start_hour: 0,
            session_end_hour: 23,
            no_trade_days: Vec::new(),
            no_trade_hours: Vec::new(),
            exit_end_of_week: false,
            exit_before_weekend: false,
            timezone_offset_hours: 0,

            position_sizing_mode: PositionSizingMode::Fixed,
            risk_per_trade: 0.01,
            kelly_fraction: 0.5,
            volatility_target: 0.01,
            min_position_size: 0.01,
            max_position_size: 1.0,

            allow_re_entry: true,
            re_entry_delay_bars: 0,
            max_trades_per_day: None,
            max_trades_per_week: None,
            max_consecutive_losses: None,
            cooldown_after_loss_bars: 0,

            entry_order_type: EntryOrderType::Market,
            limit_entry_offset: 0.001,
            limit_entry_timeout_bars: 5,
            stop_entry_offset: 0.001,

            scale_in_enabled: false,
            scale_in_levels: Vec::new(),

            slippage_model: SlippageModel::Fixed,
            slippage: 0.0005,
            slippage_volume_impact: 0.1,
            slippage_volatility_mult: 0.5,

            include_funding: false,
            funding_rate: 0.0001,
            funding_interval_hours: 8,

            taker_fee: 0.0007,
            maker_fee: 0.0002,

            mtf_enabled: false,
            mtf_neutral_zone_pct: 0.0,

            bar_magnifier: None,
        }
    }
}

impl BacktestConfig {
    /// Validates invariants that §7 requires to surface as a non-valid result rather
    /// than panicking: portions summing to 1.0, `overbought > oversold`-style ordering
    /// is a mtf-layer concern, HTF >= LTF is a mtf-layer concern (see `mtf::validate_intervals`).
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let sum_close = |tag: &str, portions: &[f64], errors: &mut Vec<String>| {
            if !portions.is_empty() {
                let sum: f64 = portions.iter().sum();
                if (sum - 1.0).abs() > 1e-3 {
                    errors.push(format!("{tag} portions sum to {sum}, expected 1.0"));
                }
            }
        };
        if self.tp_mode == TpMode::Multi {
            sum_close("tp_portions", &self.tp_portions, &mut errors);
            if self.tp_levels.len() != self.tp_portions.len() {
                errors.push("tp_levels and tp_portions length mismatch".to_string());
            }
        }
        if self.scale_in_enabled {
            let portions: Vec<f64> = self.scale_in_levels.iter().map(|l| l.portion).collect();
            sum_close("scale_in_levels", &portions, &mut errors);
        }
        if self.pyramiding == 0 {
            errors.push("pyramiding must be >= 1".to_string());
        }
        if self.initial_capital <= 0.0 {
            errors.push("initial_capital must be positive".to_string());
        }
        errors
    }

    pub fn warmup_bars(&self) -> usize {
        let mut lookback = 1usize;
        if self.sl_mode == SlMode::Atr || self.tp_mode == TpMode::Atr {
            lookback = lookback.max(self.atr_period + 1);
        }
        if self.adaptive_atr_enabled {
            lookback = lookback.max(self.adaptive_atr_lookback);
        }
        lookback
    }
}
