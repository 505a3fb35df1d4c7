//! C16 — Backtest Engine.
//!
//! The single-pass vectorized bar walker. Grounded on `examples/original_source/backend/
//! backtesting/engines/fallback_engine_v4.py::FallbackEngineV4.run` (and its
//! `MultiTPState`/`TrailingStopState`/`BreakevenState`/`AdaptiveATRMultiplier` helper
//! classes, reborn here as plain structs instead of Python dataclasses) plus
//! `backend/backtesting/engines/base_engine.py` for the aggregate-metrics shape. The
//! thirteen per-bar steps in §4.10 are implemented in the order the spec lists them;
//! each later step observes state changes made by earlier steps on the same bar.

use chrono::{DateTime, Datelike, Timelike, Utc};

use super::indicators;
use super::position::{build_trade_record, ClosedSlice, Entry, PositionBook};
use super::types::{
    BacktestConfig, BacktestMetrics, BacktestOutput, BreakevenMode, Candle, CloseEntriesRule,
    Direction, DirectionMode, EntryOrderType, ExitReason, PositionSizingMode, SlMode,
    SlippageModel, TpMode, TradeRecord,
};

#[derive(Debug, Clone, Copy)]
struct PendingExit {
    direction: Direction,
    price: f64,
    reason: ExitReason,
    /// portion of the *current* position to close; 1.0 for a full close.
    portion: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OrderKind {
    Entry,
    ScaleIn,
    Dca,
}

#[derive(Debug, Clone, Copy)]
struct PendingOrder {
    kind: OrderKind,
    direction: Direction,
    is_stop: bool,
    price: f64,
    portion_or_ratio: f64,
    placed_bar: usize,
    timeout_bar: Option<usize>,
}

#[derive(Debug, Clone, Default)]
struct MultiTpState {
    tp_hit: Vec<bool>,
    tp_prices: Vec<f64>,
    tp_portions: Vec<f64>,
}

impl MultiTpState {
    fn set(&mut self, prices: Vec<f64>, portions: Vec<f64>) {
        self.tp_hit = vec![false; prices.len()];
        self.tp_prices = prices;
        self.tp_portions = portions;
    }

    fn next_unhit(&self) -> Option<usize> {
        self.tp_hit.iter().position(|hit| !hit)
    }

    fn all_hit(&self) -> bool {
        !self.tp_hit.is_empty() && self.tp_hit.iter().all(|h| *h)
    }

    fn reset(&mut self) {
        self.tp_hit.clear();
        self.tp_prices.clear();
        self.tp_portions.clear();
    }
}

#[derive(Debug, Clone, Default)]
struct TrailingState {
    activated: bool,
    best_price: f64,
    stop_price: f64,
}

impl TrailingState {
    fn reset(&mut self) {
        *self = TrailingState::default();
    }

    fn update(&mut self, direction: Direction, bar_extreme: f64, entry: f64, activation: f64, distance: f64) -> Option<f64> {
        let profit_pct = direction.sign() * (bar_extreme - entry) / entry;
        if profit_pct >= activation {
            self.activated = true;
        }
        if !self.activated {
            return None;
        }
        let improved = if direction == Direction::Long {
            self.best_price == 0.0 || bar_extreme > self.best_price
        } else {
            self.best_price == 0.0 || bar_extreme < self.best_price
        };
        if improved {
            self.best_price = bar_extreme;
            self.stop_price = self.best_price * (1.0 - direction.sign() * distance);
        }
        Some(self.stop_price)
    }
}

#[derive(Debug, Clone, Default)]
struct BreakevenState {
    enabled: bool,
    sl_price: f64,
    last_tp_price: f64,
    tp_count: u32,
}

impl BreakevenState {
    fn reset(&mut self) {
        *self = BreakevenState::default();
    }

    fn activate_on_tp(&mut self, direction: Direction, avg_entry: f64, tp_price: f64, mode: BreakevenMode, offset: f64) {
        self.tp_count += 1;
        if self.tp_count == 1 {
            self.enabled = true;
            self.sl_price = avg_entry * (1.0 + direction.sign() * offset);
        } else if mode == BreakevenMode::Tp && self.last_tp_price > 0.0 {
            self.sl_price = self.last_tp_price;
        }
        self.last_tp_price = tp_price;
    }

    fn sl(&self) -> Option<f64> {
        if self.enabled && self.sl_price > 0.0 {
            Some(self.sl_price)
        } else {
            None
        }
    }
}

/// Volatility-regime-scaled ATR multiplier, per `AdaptiveATRMultiplier`: a rolling
/// percentile of recent ATR values widens the multiplier in low-vol regimes (more room)
/// and tightens it in high-vol regimes (faster stop-out).
#[derive(Debug, Clone)]
struct AdaptiveAtr {
    history: Vec<f64>,
    lookback: usize,
}

impl AdaptiveAtr {
    fn new(lookback: usize) -> Self {
        Self { history: Vec::new(), lookback }
    }

    fn update(&mut self, atr_value: f64) {
        if atr_value.is_finite() && atr_value > 0.0 {
            self.history.push(atr_value);
            if self.history.len() > self.lookback {
                self.history.remove(0);
            }
        }
    }

    fn multiplier(&self, base: f64) -> f64 {
        if self.history.len() < self.lookback / 2 {
            return base;
        }
        let current = *self.history.last().unwrap();
        let below = self.history.iter().filter(|v| **v < current).count();
        let percentile = below as f64 / self.history.len() as f64 * 100.0;
        if percentile < 25.0 {
            base * 1.5
        } else if percentile > 75.0 {
            base * 0.7
        } else {
            base
        }
    }
}

/// Per-direction mutable state the bar loop advances; kept out of `BacktestEngine`
/// itself so `[State::default(); 2]`-style indexing by `Direction` stays simple.
#[derive(Default)]
struct DirectionState {
    multi_tp: MultiTpState,
    trailing: TrailingState,
    breakeven: BreakevenState,
    dca_filled: usize,
    mfe: f64,
    mae: f64,
    last_exit_bar: Option<usize>,
}

impl DirectionState {
    fn reset_on_close(&mut self) {
        self.multi_tp.reset();
        self.trailing.reset();
        self.breakeven.reset();
        self.dca_filled = 0;
        self.mfe = 0.0;
        self.mae = 0.0;
    }
}

fn dir_index(d: Direction) -> usize {
    match d {
        Direction::Long => 0,
        Direction::Short => 1,
    }
}

pub struct BacktestEngine {
    config: BacktestConfig,
}

impl BacktestEngine {
    pub fn new(config: BacktestConfig) -> Self {
        Self { config }
    }

    pub fn run(
        &self,
        candles: &[Candle],
        long_entries: &[bool],
        long_exits: &[bool],
        short_entries: &[bool],
        short_exits: &[bool],
    ) -> BacktestOutput {
        self.run_with_mtf(candles, long_entries, long_exits, short_entries, short_exits, None)
    }

    /// `mtf_allow` is `(allow_long[i], allow_short[i])` per bar, precomputed by the
    /// caller from `mtf::create_htf_index_map` + the appropriate HTF filter function
    /// (§4.10: "before entry, look up the HTF bar visible at this LTF bar ... and
    /// consult the configured HTF filter"). `None` means MTF gating is disabled.
    pub fn run_with_mtf(
        &self,
        candles: &[Candle],
        long_entries: &[bool],
        long_exits: &[bool],
        short_entries: &[bool],
        short_exits: &[bool],
        mtf_allow: Option<(Vec<bool>, Vec<bool>)>,
    ) -> BacktestOutput {
        let start = std::time::Instant::now();
        let cfg = &self.config;
        let mut errors = cfg.validate();
        if candles.is_empty() {
            errors.push("candle series is empty".to_string());
        }
        let lengths_ok = long_entries.len() == candles.len()
            && long_exits.len() == candles.len()
            && short_entries.len() == candles.len()
            && short_exits.len() == candles.len();
        if !candles.is_empty() && !lengths_ok {
            errors.push("signal arrays must match candle series length".to_string());
        }
        if !errors.is_empty() {
            return BacktestOutput::invalid(errors, "bte::engine::BacktestEngine");
        }

        let n = candles.len();
        let warmup = cfg.warmup_bars().min(n);
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let atr_series = indicators::atr(candles, cfg.atr_period.max(1));

        let mut cash = cfg.initial_capital;
        let mut book = PositionBook::default();
        let mut state = [DirectionState::default(), DirectionState::default()];
        let mut pending_exit: [Option<PendingExit>; 2] = [None, None];
        let mut pending_orders: Vec<PendingOrder> = Vec::new();
        let mut adaptive_atr_sl = AdaptiveAtr::new(cfg.adaptive_atr_lookback);
        let mut adaptive_atr_tp = AdaptiveAtr::new(cfg.adaptive_atr_lookback);

        let mut trades: Vec<TradeRecord> = Vec::with_capacity(64);
        let mut equity_curve: Vec<f64> = Vec::with_capacity(n + 1);
        let mut last_funding_time: Option<DateTime<Utc>> = None;
        let mut consecutive_losses = 0usize;
        let mut cooldown_until_bar: Option<usize> = None;
        let mut trades_today: (Option<(i32, u32, u32)>, usize) = (None, 0);
        let mut trades_this_week: (Option<i32>, usize) = (None, 0);

        // Opening equity value (before bar 0 is walked) plus one entry per bar gives
        // the `n + 1`-length curve §3/§8 require.
        equity_curve.push(cash);
        for i in 0..warmup {
            let _ = i;
            equity_curve.push(cash);
        }

        for i in warmup..n {
            let bar = &candles[i];

            // Step 1: mark-to-market MFE/MAE for open positions.
            for &dir in &[Direction::Long, Direction::Short] {
                if book.side(dir).is_open() {
                    let avg = book.side(dir).avg_entry_price();
                    let favorable = match dir {
                        Direction::Long => (bar.high - avg) / avg,
                        Direction::Short => (avg - bar.low) / avg,
                    };
                    let adverse = match dir {
                        Direction::Long => (avg - bar.low) / avg,
                        Direction::Short => (bar.high - avg) / avg,
                    };
                    let s = &mut state[dir_index(dir)];
                    s.mfe = s.mfe.max(favorable);
                    s.mae = s.mae.max(adverse);
                }
            }

            // Step 2: flush pending exits scheduled on the previous bar.
            for &dir in &[Direction::Long, Direction::Short] {
                if let Some(pe) = pending_exit[dir_index(dir)].take() {
                    self.flush_exit(
                        &mut book, &mut state, &mut cash, &mut trades, dir, pe, bar.open_time, i,
                    );
                    if !book.side(dir).is_open() {
                        state[dir_index(dir)].last_exit_bar = Some(i);
                        if let Some(last) = trades.last() {
                            if last.pnl < 0.0 {
                                consecutive_losses += 1;
                                if cfg.cooldown_after_loss_bars > 0 {
                                    cooldown_until_bar = Some(i + cfg.cooldown_after_loss_bars as usize);
                                }
                            } else {
                                consecutive_losses = 0;
                            }
                        }
                    }
                }
            }

            // Step 3: pending limit/stop/scale-in fills.
            self.process_pending_orders(&mut pending_orders, &mut book, &mut cash, bar, i);

            // Step 4 + 5: multi-TP staircase and breakeven / base SL (MULTI mode).
            if cfg.tp_mode == TpMode::Multi {
                for &dir in &[Direction::Long, Direction::Short] {
                    self.advance_multi_tp(
                        &mut book, &mut state, &mut pending_exit, dir, bar, i,
                    );
                }
            }

            let adaptive_atr_val = atr_series[i];
            adaptive_atr_sl.update(adaptive_atr_val);
            adaptive_atr_tp.update(adaptive_atr_val);

            // Step 6: trailing stop.
            if cfg.trailing_stop_enabled {
                for &dir in &[Direction::Long, Direction::Short] {
                    if !book.side(dir).is_open() || pending_exit[dir_index(dir)].is_some() {
                        continue;
                    }
                    let avg = book.side(dir).avg_entry_price();
                    let extreme = match dir {
                        Direction::Long => bar.high,
                        Direction::Short => bar.low,
                    };
                    let stop = state[dir_index(dir)].trailing.update(
                        dir, extreme, avg, cfg.trailing_stop_activation, cfg.trailing_stop_distance,
                    );
                    if let Some(stop_price) = stop {
                        let pierced = match dir {
                            Direction::Long => bar.low <= stop_price,
                            Direction::Short => bar.high >= stop_price,
                        };
                        if pierced {
                            pending_exit[dir_index(dir)] = Some(PendingExit {
                                direction: dir,
                                price: stop_price,
                                reason: ExitReason::TrailingStop,
                                portion: 1.0,
                            });
                        }
                    }
                }
            }

            // Step 7: standard SL/TP for non-MULTI modes.
            if cfg.tp_mode != TpMode::Multi {
                for &dir in &[Direction::Long, Direction::Short] {
                    if !book.side(dir).is_open() || pending_exit[dir_index(dir)].is_some() {
                        continue;
                    }
                    let (sl_price, tp_price) = self.standard_sl_tp(&book, dir, atr_series[i], &adaptive_atr_sl, &adaptive_atr_tp);
                    let sl_hit = match dir {
                        Direction::Long => bar.low <= sl_price,
                        Direction::Short => bar.high >= sl_price,
                    };
                    let tp_hit = match dir {
                        Direction::Long => bar.high >= tp_price,
                        Direction::Short => bar.low <= tp_price,
                    };
                    if sl_hit {
                        pending_exit[dir_index(dir)] = Some(PendingExit { direction: dir, price: sl_price, reason: ExitReason::StopLoss, portion: 1.0 });
                    } else if tp_hit {
                        pending_exit[dir_index(dir)] = Some(PendingExit { direction: dir, price: tp_price, reason: ExitReason::TakeProfit, portion: 1.0 });
                    }
                }
            }

            // Step 8: signal exits.
            let slip = self.slippage(bar, atr_series[i], closes.get(i.wrapping_sub(1)).copied().unwrap_or(bar.close));
            if book.long.is_open() && long_exits[i] && pending_exit[0].is_none() {
                pending_exit[0] = Some(PendingExit {
                    direction: Direction::Long,
                    price: bar.close * (1.0 - slip),
                    reason: ExitReason::Signal,
                    portion: 1.0,
                });
            }
            if book.short.is_open() && short_exits[i] && pending_exit[1].is_none() {
                pending_exit[1] = Some(PendingExit {
                    direction: Direction::Short,
                    price: bar.close * (1.0 + slip),
                    reason: ExitReason::Signal,
                    portion: 1.0,
                });
            }

            // Step 9: DCA safety orders.
            if cfg.dca_enabled {
                for &dir in &[Direction::Long, Direction::Short] {
                    self.process_dca(&mut book, &mut state, &mut cash, dir, bar, i);
                }
            }

            // Step 10: time / regime / MTF filters.
            let time_allows = self.time_allows_entry(bar.open_time, cfg);
            let (mtf_allow_long, mtf_allow_short) = match &mtf_allow {
                Some((l, s)) => (l.get(i).copied().unwrap_or(true), s.get(i).copied().unwrap_or(true)),
                None => (true, true),
            };
            if let Some(max_bars) = cfg.max_bars_in_trade {
                for &dir in &[Direction::Long, Direction::Short] {
                    if pending_exit[dir_index(dir)].is_some() || !book.side(dir).is_open() {
                        continue;
                    }
                    if let Some(first) = book.side(dir).first_entry_bar {
                        if (i - first) as u64 >= max_bars {
                            pending_exit[dir_index(dir)] = Some(PendingExit {
                                direction: dir,
                                price: bar.close,
                                reason: ExitReason::TimeExit,
                                portion: 1.0,
                            });
                        }
                    }
                }
            }
            if cfg.exit_on_session_close && self.is_session_close(bar.open_time, cfg) {
                for &dir in &[Direction::Long, Direction::Short] {
                    if book.side(dir).is_open() && pending_exit[dir_index(dir)].is_none() {
                        pending_exit[dir_index(dir)] = Some(PendingExit { direction: dir, price: bar.close, reason: ExitReason::SessionClose, portion: 1.0 });
                    }
                }
            }
            if cfg.exit_end_of_week && bar.open_time.weekday() == chrono::Weekday::Fri {
                for &dir in &[Direction::Long, Direction::Short] {
                    if book.side(dir).is_open() && pending_exit[dir_index(dir)].is_none() {
                        pending_exit[dir_index(dir)] = Some(PendingExit { direction: dir, price: bar.close, reason: ExitReason::WeekendClose, portion: 1.0 });
                    }
                }
            }

            let reentry_allowed = |dir: Direction| -> bool {
                if !cfg.allow_re_entry {
                    return !state[dir_index(dir)].last_exit_bar.is_some();
                }
                if let Some(last) = state[dir_index(dir)].last_exit_bar {
                    if (i - last) as u64 < cfg.re_entry_delay_bars {
                        return false;
                    }
                }
                if let Some(until) = cooldown_until_bar {
                    if i < until {
                        return false;
                    }
                }
                if let Some(max_losses) = cfg.max_consecutive_losses {
                    if consecutive_losses >= max_losses {
                        return false;
                    }
                }
                true
            };

            let day_key = (bar.open_time.year(), bar.open_time.month(), bar.open_time.day());
            if trades_today.0 != Some(day_key) {
                trades_today = (Some(day_key), 0);
            }
            let week_key = bar.open_time.iso_week().year();
            if trades_this_week.0 != Some(week_key) {
                trades_this_week = (Some(week_key), 0);
            }
            let daily_quota_ok = cfg.max_trades_per_day.map(|max| trades_today.1 < max).unwrap_or(true);
            let weekly_quota_ok = cfg.max_trades_per_week.map(|max| trades_this_week.1 < max).unwrap_or(true);

            // Step 11: entries.
            let direction_allowed = |dir: Direction| -> bool {
                match cfg.direction {
                    DirectionMode::Long => dir == Direction::Long,
                    DirectionMode::Short => dir == Direction::Short,
                    DirectionMode::Both => true,
                }
            };
            let hedge_ok = |dir: Direction| -> bool { cfg.hedge_mode || !book.side(dir.opposite()).is_open() };

            for (dir, signal) in [(Direction::Long, long_entries[i]), (Direction::Short, short_entries[i])] {
                if !signal
                    || !direction_allowed(dir)
                    || !hedge_ok(dir)
                    || !time_allows
                    || !daily_quota_ok
                    || !weekly_quota_ok
                    || !reentry_allowed(dir)
                    || pending_exit[dir_index(dir)].is_some()
                    || !book.can_add_entry(dir, cfg.pyramiding)
                {
                    continue;
                }
                let mtf_ok = match dir {
                    Direction::Long => mtf_allow_long,
                    Direction::Short => mtf_allow_short,
                };
                if cfg.mtf_enabled && !mtf_ok {
                    continue;
                }

                let slip = self.slippage(bar, atr_series[i], bar.close);
                let (fill_price, filled_now) = match cfg.entry_order_type {
                    EntryOrderType::Market => (bar.close * (1.0 + dir.sign() * slip), true),
                    EntryOrderType::Limit => {
                        let limit_price = bar.close * (1.0 - dir.sign() * cfg.limit_entry_offset);
                        pending_orders.push(PendingOrder {
                            kind: OrderKind::Entry,
                            direction: dir,
                            is_stop: false,
                            price: limit_price,
                            portion_or_ratio: 1.0,
                            placed_bar: i,
                            timeout_bar: Some(i + cfg.limit_entry_timeout_bars as usize),
                        });
                        (limit_price, false)
                    }
                    EntryOrderType::Stop => {
                        let stop_price = bar.close * (1.0 + dir.sign() * cfg.stop_entry_offset);
                        pending_orders.push(PendingOrder {
                            kind: OrderKind::Entry,
                            direction: dir,
                            is_stop: true,
                            price: stop_price,
                            portion_or_ratio: 1.0,
                            placed_bar: i,
                            timeout_bar: Some(i + cfg.limit_entry_timeout_bars as usize),
                        });
                        (stop_price, false)
                    }
                };

                if filled_now {
                    let capital = self.order_capital(cfg, cash, atr_series[i], fill_price, &trades);
                    if capital <= 0.0 || capital > cash {
                        continue;
                    }
                    self.open_entry(&mut book, &mut state, &mut cash, dir, fill_price, capital, bar.open_time, i);
                    trades_today.1 += 1;
                    trades_this_week.1 += 1;

                    if cfg.scale_in_enabled && !cfg.scale_in_levels.is_empty() {
                        let remaining_portion: f64 = cfg.scale_in_levels.iter().map(|l| l.portion).sum();
                        let total_capital = capital / (1.0 - remaining_portion).max(1e-6);
                        for level in &cfg.scale_in_levels {
                            pending_orders.push(PendingOrder {
                                kind: OrderKind::ScaleIn,
                                direction: dir,
                                is_stop: false,
                                price: fill_price * (1.0 - dir.sign() * level.deviation),
                                portion_or_ratio: total_capital * level.portion,
                                placed_bar: i,
                                timeout_bar: None,
                            });
                        }
                    }
                }
            }

            // Step 12: funding accrual.
            if cfg.include_funding && cfg.funding_interval_hours > 0 {
                let due = match last_funding_time {
                    None => true,
                    Some(prev) => (bar.open_time - prev).num_hours() >= cfg.funding_interval_hours as i64,
                };
                if due {
                    last_funding_time = Some(bar.open_time);
                    let long_notional = book.long.total_size() * book.long.avg_entry_price();
                    let short_notional = book.short.total_size() * book.short.avg_entry_price();
                    cash -= long_notional * cfg.funding_rate;
                    cash += short_notional * cfg.funding_rate;
                }
            }

            // Step 13: equity update.
            let unrealized = self.unrealized_pnl(&book, bar);
            let equity = cash + book.long.total_capital() + book.short.total_capital() + unrealized;
            equity_curve.push(equity);
        }

        // End of data: force-close remaining positions at last close.
        if let Some(last) = candles.last() {
            for &dir in &[Direction::Long, Direction::Short] {
                if book.side(dir).is_open() {
                    let slices = book.close_position(dir);
                    for slice in slices {
                        let duration = (n - 1).saturating_sub(slice.entry_bar_idx) as u64;
                        let s = &state[dir_index(dir)];
                        let trade = build_trade_record(
                            &slice, dir, last.close, last.open_time, ExitReason::EndOfData,
                            cfg.taker_fee, duration, s.mfe, s.mae,
                        );
                        cash += slice.capital + trade.pnl;
                        trades.push(trade);
                    }
                }
            }
            if let Some(v) = equity_curve.last_mut() {
                *v = cash;
            } else {
                equity_curve.push(cash);
            }
        }

        let metrics = self.aggregate_metrics(&trades, &equity_curve, cfg.initial_capital);
        BacktestOutput {
            trades,
            equity_curve,
            metrics,
            bars_processed: n,
            execution_time_ms: start.elapsed().as_secs_f64() * 1000.0,
            engine_name: "bte::engine::BacktestEngine".to_string(),
            is_valid: true,
            validation_errors: Vec::new(),
        }
    }

    fn flush_exit(
        &self,
        book: &mut PositionBook,
        state: &mut [DirectionState; 2],
        cash: &mut f64,
        trades: &mut Vec<TradeRecord>,
        dir: Direction,
        pe: PendingExit,
        exit_time: DateTime<Utc>,
        bar_idx: usize,
    ) {
        if !book.side(dir).is_open() {
            return;
        }
        let rule = self.config.close_entries_rule;
        let slices: Vec<ClosedSlice> = if pe.portion >= 1.0 - 1e-9 {
            book.close_position(dir)
        } else {
            book.close_partial(dir, pe.portion, rule)
        };
        let fully_closed = !book.side(dir).is_open();
        let s = &state[dir_index(dir)];
        for slice in &slices {
            let duration = bar_idx.saturating_sub(slice.entry_bar_idx) as u64;
            let trade = build_trade_record(
                slice, dir, pe.price, exit_time, pe.reason, self.config.taker_fee, duration, s.mfe, s.mae,
            );
            *cash += slice.capital + trade.pnl;
            trades.push(trade);
        }
        if fully_closed {
            state[dir_index(dir)].reset_on_close();
        }
    }

    fn advance_multi_tp(
        &self,
        book: &mut PositionBook,
        state: &mut [DirectionState; 2],
        pending_exit: &mut [Option<PendingExit>; 2],
        dir: Direction,
        bar: &Candle,
        _bar_idx: usize,
    ) {
        if !book.side(dir).is_open() || pending_exit[dir_index(dir)].is_some() {
            return;
        }
        let idx = dir_index(dir);
        let cfg = &self.config;
        if state[idx].multi_tp.tp_prices.is_empty() {
            let prices = book.get_multi_tp_prices(dir, &cfg.tp_levels);
            state[idx].multi_tp.set(prices, cfg.tp_portions.clone());
        }
        if let Some(level) = state[idx].multi_tp.next_unhit() {
            let tp_price = state[idx].multi_tp.tp_prices[level];
            let touched = match dir {
                Direction::Long => bar.high >= tp_price,
                Direction::Short => bar.low <= tp_price,
            };
            if touched {
                let portion = state[idx].multi_tp.tp_portions.get(level).copied().unwrap_or(0.0);
                state[idx].multi_tp.tp_hit[level] = true;
                if cfg.breakeven_enabled {
                    let avg = book.side(dir).avg_entry_price();
                    state[idx].breakeven.activate_on_tp(dir, avg, tp_price, cfg.breakeven_mode, cfg.breakeven_offset);
                }
                if state[idx].multi_tp.all_hit() {
                    pending_exit[idx] = Some(PendingExit { direction: dir, price: tp_price, reason: ExitReason::TakeProfit, portion: 1.0 });
                } else {
                    pending_exit[idx] = Some(PendingExit { direction: dir, price: tp_price, reason: ExitReason::TakeProfit, portion });
                }
            }
        }
        // Step 5: breakeven / base SL check for MULTI mode.
        if pending_exit[idx].is_none() {
            let sl_price = state[idx].breakeven.sl().unwrap_or_else(|| {
                let avg = book.side(dir).avg_entry_price();
                avg * (1.0 - dir.sign() * cfg.stop_loss)
            });
            let sl_hit = match dir {
                Direction::Long => bar.low <= sl_price,
                Direction::Short => bar.high >= sl_price,
            };
            if sl_hit {
                let reason = if state[idx].breakeven.enabled { ExitReason::StopLoss } else { ExitReason::StopLoss };
                pending_exit[idx] = Some(PendingExit { direction: dir, price: sl_price, reason, portion: 1.0 });
            }
        }
    }

    fn standard_sl_tp(
        &self,
        book: &PositionBook,
        dir: Direction,
        atr_value: f64,
        adaptive_sl: &AdaptiveAtr,
        adaptive_tp: &AdaptiveAtr,
    ) -> (f64, f64) {
        let cfg = &self.config;
        let sl_mult = if cfg.adaptive_atr_enabled { adaptive_sl.multiplier(cfg.atr_sl_multiplier) } else { cfg.atr_sl_multiplier };
        let tp_mult = if cfg.adaptive_atr_enabled { adaptive_tp.multiplier(cfg.atr_tp_multiplier) } else { cfg.atr_tp_multiplier };

        let sl_price = match cfg.sl_mode {
            SlMode::Fixed => book.get_sl_price(dir, cfg.stop_loss),
            SlMode::Atr => {
                if atr_value.is_finite() {
                    let atr_sl = book.get_atr_sl_price(dir, atr_value, sl_mult);
                    if cfg.sl_max_limit_enabled {
                        let fixed_sl = book.get_sl_price(dir, cfg.stop_loss);
                        match dir {
                            Direction::Long => atr_sl.max(fixed_sl),
                            Direction::Short => atr_sl.min(fixed_sl),
                        }
                    } else {
                        atr_sl
                    }
                } else {
                    book.get_sl_price(dir, cfg.stop_loss)
                }
            }
        };
        let tp_price = match cfg.tp_mode {
            TpMode::Fixed | TpMode::Multi => book.get_tp_price(dir, cfg.take_profit),
            TpMode::Atr => {
                if atr_value.is_finite() {
                    book.get_atr_tp_price(dir, atr_value, tp_mult)
                } else {
                    book.get_tp_price(dir, cfg.take_profit)
                }
            }
        };
        (sl_price, tp_price)
    }

    fn slippage(&self, bar: &Candle, atr_value: f64, avg_volume: f64) -> f64 {
        let cfg = &self.config;
        let base = cfg.slippage;
        match cfg.slippage_model {
            SlippageModel::Fixed => base,
            SlippageModel::Volume => {
                let vol_ratio = if avg_volume > 0.0 { bar.volume / avg_volume - 1.0 } else { 0.0 };
                base * (1.0 + cfg.slippage_volume_impact * vol_ratio)
            }
            SlippageModel::Volatility => {
                let atr_pct = if atr_value.is_finite() && bar.close > 0.0 { atr_value / bar.close } else { 0.0 };
                base + cfg.slippage_volatility_mult * atr_pct
            }
            SlippageModel::Combined => {
                let vol_ratio = if avg_volume > 0.0 { bar.volume / avg_volume - 1.0 } else { 0.0 };
                let atr_pct = if atr_value.is_finite() && bar.close > 0.0 { atr_value / bar.close } else { 0.0 };
                base * (1.0 + cfg.slippage_volume_impact * vol_ratio) + cfg.slippage_volatility_mult * atr_pct
            }
            SlippageModel::Advanced => {
                let atr_pct = if atr_value.is_finite() && bar.close > 0.0 { atr_value / bar.close } else { 0.01 };
                let vol_factor = (atr_pct / 0.01).clamp(0.5, 2.0);
                let liquidity_factor = if bar.volume > 0.0 { (avg_volume / bar.volume).clamp(0.5, 2.0) } else { 1.0 };
                base * vol_factor * liquidity_factor
            }
        }
    }

    fn order_capital(&self, cfg: &BacktestConfig, cash: f64, atr_value: f64, price: f64, trades: &[TradeRecord]) -> f64 {
        match cfg.position_sizing_mode {
            PositionSizingMode::Fixed => {
                if cfg.use_fixed_amount {
                    cfg.fixed_amount.min(cash)
                } else {
                    cash * cfg.position_size
                }
            }
            PositionSizingMode::Risk => {
                let raw = (cash * cfg.risk_per_trade) / (cfg.stop_loss * cfg.leverage).max(1e-9);
                raw.clamp(cfg.min_position_size * cash, cfg.max_position_size * cash)
            }
            PositionSizingMode::Kelly => {
                // §4.10 step 11: requires >=10 trades of history; win_rate/avg_win/avg_loss
                // computed on the last 20. Fewer than 10 trades -> insufficient data, fall
                // back to the fixed-size formula per §7's "skip, never abort" policy.
                if trades.len() < 10 {
                    return cash * cfg.position_size;
                }
                let window = &trades[trades.len().saturating_sub(20)..];
                let wins: Vec<f64> = window.iter().filter(|t| t.pnl > 0.0).map(|t| t.pnl).collect();
                let losses: Vec<f64> = window.iter().filter(|t| t.pnl <= 0.0).map(|t| -t.pnl).collect();
                let win_rate = wins.len() as f64 / window.len() as f64;
                if wins.is_empty() || losses.is_empty() {
                    return cash * cfg.position_size;
                }
                let avg_win = wins.iter().sum::<f64>() / wins.len() as f64;
                let avg_loss = losses.iter().sum::<f64>() / losses.len() as f64;
                let ratio = avg_win / avg_loss.max(1e-9);
                let kelly = win_rate - (1.0 - win_rate) / ratio.max(1e-9);
                (kelly * cfg.kelly_fraction).clamp(0.0, cfg.max_position_size) * cash
            }
            PositionSizingMode::Volatility => {
                let atr_pct = if atr_value.is_finite() && price > 0.0 { atr_value / price } else { return cash * cfg.position_size; };
                (cash * cfg.position_size * cfg.volatility_target / atr_pct.max(1e-9))
                    .clamp(cfg.min_position_size * cash, cfg.max_position_size * cash)
            }
        }
    }

    fn open_entry(
        &self,
        book: &mut PositionBook,
        state: &mut [DirectionState; 2],
        cash: &mut f64,
        dir: Direction,
        price: f64,
        capital: f64,
        time: DateTime<Utc>,
        bar_idx: usize,
    ) {
        let size = capital * self.config.leverage / price;
        *cash -= capital;
        book.add_entry(dir, Entry { price, size, capital, bar_idx, time });
        state[dir_index(dir)].dca_filled = 0;
    }

    fn process_pending_orders(
        &self,
        pending_orders: &mut Vec<PendingOrder>,
        book: &mut PositionBook,
        cash: &mut f64,
        bar: &Candle,
        bar_idx: usize,
    ) {
        let mut remaining = Vec::with_capacity(pending_orders.len());
        for order in pending_orders.drain(..) {
            if let Some(timeout) = order.timeout_bar {
                if bar_idx > timeout {
                    continue;
                }
            }
            let fills = match (order.direction, order.is_stop) {
                (Direction::Long, false) => bar.low <= order.price,
                (Direction::Long, true) => bar.high >= order.price,
                (Direction::Short, false) => bar.high >= order.price,
                (Direction::Short, true) => bar.low <= order.price,
            };
            if !fills {
                remaining.push(order);
                continue;
            }
            match order.kind {
                OrderKind::Entry => {
                    let capital = (*cash * self.config.position_size).min(*cash);
                    if capital > 0.0 {
                        let size = capital * self.config.leverage / order.price;
                        *cash -= capital;
                        book.add_entry(order.direction, Entry { price: order.price, size, capital, bar_idx, time: bar.open_time });
                    }
                }
                OrderKind::ScaleIn | OrderKind::Dca => {
                    let capital = order.portion_or_ratio.min(*cash).max(0.0);
                    if capital > 0.0 {
                        let size = capital * self.config.leverage / order.price;
                        *cash -= capital;
                        book.add_entry(order.direction, Entry { price: order.price, size, capital, bar_idx, time: bar.open_time });
                    }
                }
            }
        }
        *pending_orders = remaining;
    }

    fn process_dca(
        &self,
        book: &mut PositionBook,
        state: &mut [DirectionState; 2],
        cash: &mut f64,
        dir: Direction,
        bar: &Candle,
        bar_idx: usize,
    ) {
        let cfg = &self.config;
        if !book.side(dir).is_open() || cfg.dca_count == 0 {
            return;
        }
        let idx = dir_index(dir);
        let base_price = book.side(dir).entries[0].price;
        let filled = state[idx].dca_filled;
        if filled >= cfg.dca_count {
            return;
        }
        // Deviation grows geometrically with each safety order per `dca_step_scale`,
        // e.g. 2%, then 2%*scale, then 2%*scale^2 ... matching the martingale-style
        // grid `fallback_engine_v4.py`'s DCA block builds.
        let step_scale = cfg.dca_step_scale.max(1e-9);
        let mut deviation = 0.0;
        let mut step = cfg.dca_deviation;
        for _ in 0..=filled {
            deviation += step;
            step *= step_scale;
        }
        let trigger_price = base_price * (1.0 - dir.sign() * deviation);
        let fills = match dir {
            Direction::Long => bar.low <= trigger_price,
            Direction::Short => bar.high >= trigger_price,
        };
        if !fills {
            return;
        }
        let ratio = cfg.dca_volume_ratio * cfg.dca_volume_scale.powi(filled as i32);
        let capital = (*cash * cfg.position_size * ratio).min(*cash).max(0.0);
        if capital <= 0.0 {
            return;
        }
        let size = capital * cfg.leverage / trigger_price;
        *cash -= capital;
        book.add_entry(dir, Entry { price: trigger_price, size, capital, bar_idx, time: bar.open_time });
        state[idx].dca_filled += 1;
        if cfg.tp_mode == TpMode::Multi {
            let prices = book.get_multi_tp_prices(dir, &cfg.tp_levels);
            state[idx].multi_tp.set(prices, cfg.tp_portions.clone());
        }
    }

    fn time_allows_entry(&self, time: DateTime<Utc>, cfg: &BacktestConfig) -> bool {
        let local = crate::clock::to_offset(time, cfg.timezone_offset_hours);
        if cfg.no_trade_days.contains(&local.weekday().num_days_from_monday()) {
            return false;
        }
        if cfg.no_trade_hours.contains(&local.hour()) {
            return false;
        }
        if cfg.exit_on_session_close && (local.hour() < cfg.session_start_hour || local.hour() > cfg.session_end_hour) {
            return false;
        }
        true
    }

    fn is_session_close(&self, time: DateTime<Utc>, cfg: &BacktestConfig) -> bool {
        let local = crate::clock::to_offset(time, cfg.timezone_offset_hours);
        local.hour() == cfg.session_end_hour
    }

    fn unrealized_pnl(&self, book: &PositionBook, bar: &Candle) -> f64 {
        let mut pnl = 0.0;
        for &dir in &[Direction::Long, Direction::Short] {
            let side = book.side(dir);
            if side.is_open() {
                let avg = side.avg_entry_price();
                pnl += dir.sign() * (bar.close - avg) * side.total_size();
            }
        }
        pnl
    }

    fn aggregate_metrics(&self, trades: &[TradeRecord], equity: &[f64], initial_capital: f64) -> BacktestMetrics {
        let total_trades = trades.len();
        let winning: Vec<&TradeRecord> = trades.iter().filter(|t| t.pnl > 0.0).collect();
        let losing: Vec<&TradeRecord> = trades.iter().filter(|t| t.pnl <= 0.0).collect();
        let gross_profit: f64 = winning.iter().map(|t| t.pnl).sum();
        let gross_loss: f64 = losing.iter().map(|t| t.pnl).sum();
        let net_profit: f64 = trades.iter().map(|t| t.pnl).sum();
        let win_rate = if total_trades > 0 { winning.len() as f64 / total_trades as f64 } else { 0.0 };
        let avg_win = if !winning.is_empty() { gross_profit / winning.len() as f64 } else { 0.0 };
        let avg_loss = if !losing.is_empty() { gross_loss / losing.len() as f64 } else { 0.0 };
        let profit_factor = if gross_loss.abs() > 1e-9 { gross_profit / gross_loss.abs() } else if gross_profit > 0.0 { f64::INFINITY } else { 0.0 };

        let mut peak = initial_capital;
        let mut max_dd = 0.0;
        for &e in equity {
            if e > peak {
                peak = e;
            }
            if peak > 0.0 {
                let dd = (peak - e) / peak;
                if dd > max_dd {
                    max_dd = dd;
                }
            }
        }

        let returns: Vec<f64> = equity.windows(2).map(|w| if w[0].abs() > 1e-9 { (w[1] - w[0]) / w[0] } else { 0.0 }).collect();
        let sharpe = if returns.len() > 1 {
            let mean = returns.iter().sum::<f64>() / returns.len() as f64;
            let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
            let std = var.sqrt();
            if std > 1e-12 { mean / std * (252.0_f64).sqrt() } else { 0.0 }
        } else {
            0.0
        };

        let total_return_pct = if initial_capital > 0.0 {
            equity.last().map(|e| (e - initial_capital) / initial_capital * 100.0).unwrap_or(0.0)
        } else {
            0.0
        };

        BacktestMetrics {
            total_trades,
            winning_trades: winning.len(),
            losing_trades: losing.len(),
            win_rate,
            gross_profit,
            gross_loss,
            net_profit,
            total_return_pct,
            max_drawdown_pct: max_dd * 100.0,
            sharpe_ratio: sharpe,
            profit_factor,
            avg_win,
            avg_loss,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use crate::bte::types::{BreakevenMode, DirectionMode};

    fn candle(i: i64, o: f64, h: f64, l: f64, c: f64) -> Candle {
        Candle {
            open_time: Utc.timestamp_opt(i * 3600, 0).unwrap(),
            open: o,
            high: h,
            low: l,
            close: c,
            volume: 1000.0,
        }
    }

    #[test]
    fn empty_candles_are_invalid_without_panicking() {
        let engine = BacktestEngine::new(BacktestConfig::default());
        let out = engine.run(&[], &[], &[], &[], &[]);
        assert!(!out.is_valid);
        assert!(!out.validation_errors.is_empty());
    }

    #[test]
    fn warmup_exceeding_series_yields_zero_trades_and_flat_equity() {
        let mut cfg = BacktestConfig::default();
        cfg.sl_mode = SlMode::Atr;
        cfg.atr_period = 50;
        let candles: Vec<Candle> = (0..10).map(|i| candle(i, 100.0, 101.0, 99.0, 100.0)).collect();
        let n = candles.len();
        let engine = BacktestEngine::new(cfg.clone());
        let out = engine.run(&candles, &vec![false; n], &vec![false; n], &vec![false; n], &vec![false; n]);
        assert!(out.is_valid);
        assert_eq!(out.metrics.total_trades, 0);
        assert_eq!(out.equity_curve.len(), n + 1);
        assert!(out.equity_curve.iter().all(|e| (*e - cfg.initial_capital).abs() < 1e-6));
    }

    #[test]
    fn multi_tp_staircase_with_breakeven_produces_three_trades() {
        let mut cfg = BacktestConfig::default();
        cfg.direction = DirectionMode::Long;
        cfg.tp_mode = TpMode::Multi;
        cfg.tp_levels = vec![0.01, 0.02, 0.03];
        cfg.tp_portions = vec![0.4, 0.3, 0.3];
        cfg.stop_loss = 0.02;
        cfg.breakeven_enabled = true;
        cfg.breakeven_mode = BreakevenMode::Average;
        cfg.breakeven_offset = 0.0;
        cfg.taker_fee = 0.0;
        cfg.slippage = 0.0;
        cfg.pyramiding = 1;

        // Bar 0 is pure warm-up (`warmup_bars() == 1` for a non-ATR fixed/multi config —
        // see §4.10's "bar loop starts at warmup_bars" and `BacktestConfig::warmup_bars`):
        // entry and exit signals on bar 0 are never consulted, so the scenario's action
        // starts at bar 1. Bar 1 is the entry, bar 2 touches TP1 (101), bar 3 touches TP2
        // (102) without reaching TP3 (103), bar 4 pierces the break-even stop (100) and
        // schedules the close of what remains, which flushes on bar 5.
        let candles = vec![
            candle(0, 100.0, 100.0, 100.0, 100.0),
            candle(1, 100.0, 100.0, 100.0, 100.0),
            candle(2, 100.0, 101.0, 100.0, 101.0),
            candle(3, 101.0, 102.0, 100.5, 102.0),
            candle(4, 102.0, 102.5, 99.0, 99.5),
            candle(5, 99.5, 100.0, 99.0, 99.8),
        ];
        let n = candles.len();
        let mut long_entries = vec![false; n];
        long_entries[1] = true;
        let long_exits = vec![false; n];
        let short_entries = vec![false; n];
        let short_exits = vec![false; n];

        let engine = BacktestEngine::new(cfg);
        let out = engine.run(&candles, &long_entries, &long_exits, &short_entries, &short_exits);
        assert!(out.is_valid, "{:?}", out.validation_errors);
        assert_eq!(out.metrics.total_trades, 3, "{:#?}", out.trades);
        assert!(out.metrics.net_profit > 0.0, "{:#?}", out.trades);
        assert_eq!(out.trades[2].exit_reason, ExitReason::StopLoss);
        assert!((out.trades[2].exit_price - 100.0).abs() < 1e-6);
    }

    fn fake_trade(pnl: f64) -> TradeRecord {
        TradeRecord {
            entry_time: Utc.timestamp_opt(0, 0).unwrap(),
            exit_time: Utc.timestamp_opt(1, 0).unwrap(),
            direction: Direction::Long,
            entry_price: 100.0,
            exit_price: 100.0 + pnl,
            size: 1.0,
            pnl,
            pnl_pct: pnl / 100.0,
            fees: 0.0,
            exit_reason: ExitReason::Signal,
            duration_bars: 1,
            mfe: 0.0,
            mae: 0.0,
        }
    }

    #[test]
    fn kelly_sizing_falls_back_below_ten_trades_then_uses_win_rate() {
        let mut cfg = BacktestConfig::default();
        cfg.position_sizing_mode = PositionSizingMode::Kelly;
        cfg.kelly_fraction = 0.5;
        cfg.max_position_size = 1.0;
        let engine = BacktestEngine::new(cfg.clone());

        let few_trades: Vec<TradeRecord> = (0..9).map(|_| fake_trade(1.0)).collect();
        let fallback = engine.order_capital(&cfg, 1000.0, f64::NAN, 100.0, &few_trades);
        assert!((fallback - 1000.0 * cfg.position_size).abs() < 1e-9);

        // 14 wins of +10, 6 losses of -5 => win_rate=0.7, ratio=2.0, kelly = 0.7 - 0.3/2.0 = 0.55.
        let mut trades: Vec<TradeRecord> = (0..14).map(|_| fake_trade(10.0)).collect();
        trades.extend((0..6).map(|_| fake_trade(-5.0)));
        let capital = engine.order_capital(&cfg, 1000.0, f64::NAN, 100.0, &trades);
        let expected = (0.55_f64 * cfg.kelly_fraction).clamp(0.0, cfg.max_position_size) * 1000.0;
        assert!((capital - expected).abs() < 1e-6, "capital={capital} expected={expected}");
    }
}
