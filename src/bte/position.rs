//! C15 — Pyramiding / DCA Manager.
//!
//! Maintains a per-direction stack of stacked entries with a weighted-average entry
//! price, grounded on `examples/original_source/backend/backtesting/engines/
//! fallback_engine_v4.py`'s `DirectionHandler` (per-direction entry/position state) and
//! the DCA safety-order grid it drives from `dca_*` config. `close_entries_rule`
//! (ALL/FIFO/LIFO) controls which entries a partial close consumes first; FIFO is the
//! default per §9(iii) and SPEC_FULL §A.4.

use chrono::{DateTime, Utc};

use super::types::{CloseEntriesRule, Direction, ExitReason, TradeRecord};

#[derive(Debug, Clone, Copy)]
pub struct Entry {
    pub price: f64,
    pub size: f64,
    pub capital: f64,
    pub bar_idx: usize,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct DirectionPosition {
    pub entries: Vec<Entry>,
    pub first_entry_bar: Option<usize>,
}

impl DirectionPosition {
    pub fn is_open(&self) -> bool {
        !self.entries.is_empty()
    }

    pub fn total_size(&self) -> f64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    pub fn total_capital(&self) -> f64 {
        self.entries.iter().map(|e| e.capital).sum()
    }

    /// Weighted-average entry price: `sum(price*size) / sum(size)`.
    pub fn avg_entry_price(&self) -> f64 {
        let size = self.total_size();
        if size <= 0.0 {
            return 0.0;
        }
        self.entries.iter().map(|e| e.price * e.size).sum::<f64>() / size
    }

    pub fn earliest_entry_time(&self) -> Option<DateTime<Utc>> {
        self.entries.first().map(|e| e.time)
    }
}

/// A fully or partially closed trade slice produced by `close_partial`/`close_position`.
pub struct ClosedSlice {
    pub entry_time: DateTime<Utc>,
    pub entry_bar_idx: usize,
    pub entry_price: f64,
    pub size: f64,
    pub capital: f64,
}

/// Per-direction pyramiding/DCA book. One instance covers both long and short stacks so
/// `hedge_mode` callers can inspect both sides at once.
#[derive(Debug, Clone, Default)]
pub struct PositionBook {
    pub long: DirectionPosition,
    pub short: DirectionPosition,
}

impl PositionBook {
    pub fn side(&self, direction: Direction) -> &DirectionPosition {
        match direction {
            Direction::Long => &self.long,
            Direction::Short => &self.short,
        }
    }

    pub fn side_mut(&mut self, direction: Direction) -> &mut DirectionPosition {
        match direction {
            Direction::Long => &mut self.long,
            Direction::Short => &mut self.short,
        }
    }

    pub fn can_add_entry(&self, direction: Direction, pyramiding: usize) -> bool {
        self.side(direction).entries.len() < pyramiding
    }

    pub fn add_entry(&mut self, direction: Direction, entry: Entry) {
        let side = self.side_mut(direction);
        if side.first_entry_bar.is_none() {
            side.first_entry_bar = Some(entry.bar_idx);
        }
        side.entries.push(entry);
    }

    /// Closes `portion` (0.0..=1.0) of each open entry on `direction`, ordered by
    /// `rule`, returning one slice per consumed entry (partial or full) so the caller
    /// can emit one trade record per slice, matching §4.10 step 4's "record the partial
    /// trade" requirement.
    pub fn close_partial(
        &mut self,
        direction: Direction,
        portion: f64,
        rule: CloseEntriesRule,
    ) -> Vec<ClosedSlice> {
        let portion = portion.clamp(0.0, 1.0);
        let side = self.side_mut(direction);
        let order: Vec<usize> = match rule {
            CloseEntriesRule::Fifo | CloseEntriesRule::All => (0..side.entries.len()).collect(),
            CloseEntriesRule::Lifo => (0..side.entries.len()).rev().collect(),
        };

        let mut slices = Vec::new();
        let mut remaining_indices = Vec::new();
        let mut consumed_target = side.total_size() * portion;

        let mut keep = vec![true; side.entries.len()];
        for idx in order {
            if consumed_target <= 1e-12 {
                break;
            }
            let entry = side.entries[idx];
            let take = entry.size.min(consumed_target);
            let frac = if entry.size > 0.0 { take / entry.size } else { 0.0 };
            slices.push(ClosedSlice {
                entry_time: entry.time,
                entry_bar_idx: entry.bar_idx,
                entry_price: entry.price,
                size: take,
                capital: entry.capital * frac,
            });
            consumed_target -= take;
            if take >= entry.size - 1e-12 {
                keep[idx] = false;
            } else {
                side.entries[idx].size -= take;
                side.entries[idx].capital *= 1.0 - frac;
            }
        }
        for (idx, k) in keep.into_iter().enumerate() {
            if k {
                remaining_indices.push(idx);
            }
        }
        side.entries = remaining_indices.into_iter().map(|i| side.entries[i]).collect();
        if side.entries.is_empty() {
            side.first_entry_bar = None;
        }
        slices
    }

    /// Closes everything on `direction`, returning one slice per entry.
    pub fn close_position(&mut self, direction: Direction) -> Vec<ClosedSlice> {
        let side = self.side_mut(direction);
        let slices = side
            .entries
            .iter()
            .map(|e| ClosedSlice {
                entry_time: e.time,
                entry_bar_idx: e.bar_idx,
                entry_price: e.price,
                size: e.size,
                capital: e.capital,
            })
            .collect();
        side.entries.clear();
        side.first_entry_bar = None;
        slices
    }

    pub fn get_tp_price(&self, direction: Direction, tp_pct: f64) -> f64 {
        let avg = self.side(direction).avg_entry_price();
        avg * (1.0 + direction.sign() * tp_pct)
    }

    pub fn get_sl_price(&self, direction: Direction, sl_pct: f64) -> f64 {
        let avg = self.side(direction).avg_entry_price();
        avg * (1.0 - direction.sign() * sl_pct)
    }

    pub fn get_atr_tp_price(&self, direction: Direction, atr_value: f64, multiplier: f64) -> f64 {
        let avg = self.side(direction).avg_entry_price();
        avg + direction.sign() * atr_value * multiplier
    }

    pub fn get_atr_sl_price(&self, direction: Direction, atr_value: f64, multiplier: f64) -> f64 {
        let avg = self.side(direction).avg_entry_price();
        avg - direction.sign() * atr_value * multiplier
    }

    /// `avg * (1 ± level_i)` for each staircase level, used by the multi-TP engine
    /// (§4.10 step 4) and DCA safety-order grid (§4.10 step 9).
    pub fn get_multi_tp_prices(&self, direction: Direction, levels: &[f64]) -> Vec<f64> {
        let avg = self.side(direction).avg_entry_price();
        levels.iter().map(|lvl| avg * (1.0 + direction.sign() * lvl)).collect()
    }
}

/// Builds a `TradeRecord` for a closed slice; shared by the engine's signal/SL/TP/
/// trailing/time-exit/end-of-data paths so fee/MFE/MAE bookkeeping stays identical
/// across exit reasons.
#[allow(clippy::too_many_arguments)]
pub fn build_trade_record(
    slice: &ClosedSlice,
    direction: Direction,
    exit_price: f64,
    exit_time: DateTime<Utc>,
    exit_reason: ExitReason,
    fee_rate: f64,
    duration_bars: u64,
    mfe: f64,
    mae: f64,
) -> TradeRecord {
    let fees = (slice.entry_price * slice.size + exit_price * slice.size) * fee_rate;
    let raw_pnl = direction.sign() * (exit_price - slice.entry_price) * slice.size;
    let pnl = raw_pnl - fees;
    let notional = slice.entry_price * slice.size;
    let pnl_pct = if notional > 0.0 { pnl / notional } else { 0.0 };
    TradeRecord {
        entry_time: slice.entry_time,
        exit_time,
        direction,
        entry_price: slice.entry_price,
        exit_price,
        size: slice.size,
        pnl,
        pnl_pct,
        fees,
        exit_reason,
        duration_bars,
        mfe,
        mae,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(i: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(i, 0).unwrap()
    }

    #[test]
    fn weighted_average_entry_price() {
        let mut book = PositionBook::default();
        book.add_entry(Direction::Long, Entry { price: 100.0, size: 1.0, capital: 100.0, bar_idx: 0, time: t(0) });
        book.add_entry(Direction::Long, Entry { price: 110.0, size: 1.0, capital: 110.0, bar_idx: 1, time: t(1) });
        assert!((book.long.avg_entry_price() - 105.0).abs() < 1e-9);
    }

    #[test]
    fn fifo_close_partial_consumes_oldest_first() {
        let mut book = PositionBook::default();
        book.add_entry(Direction::Long, Entry { price: 100.0, size: 2.0, capital: 200.0, bar_idx: 0, time: t(0) });
        book.add_entry(Direction::Long, Entry { price: 120.0, size: 2.0, capital: 240.0, bar_idx: 1, time: t(1) });
        let slices = book.close_partial(Direction::Long, 0.5, CloseEntriesRule::Fifo);
        assert_eq!(slices.len(), 1);
        assert!((slices[0].entry_price - 100.0).abs() < 1e-9);
        assert!((book.long.total_size() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn closing_last_entry_removes_position() {
        let mut book = PositionBook::default();
        book.add_entry(Direction::Short, Entry { price: 100.0, size: 1.0, capital: 100.0, bar_idx: 0, time: t(0) });
        book.close_position(Direction::Short);
        assert!(!book.short.is_open());
    }
}
