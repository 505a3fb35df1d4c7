//! C12 — Indicators.
//!
//! SMA, EMA, RSI, ATR, MACD, Bollinger Bands, SuperTrend, Ichimoku and ADX, each
//! returning a `Vec<f64>` the same length as the input with `f64::NAN` for bars inside
//! the warm-up window — the convention `examples/original_source/backend/backtesting/
//! atr_calculator.py::calculate_atr` already uses (its first `period` entries are
//! unusable and callers are expected to skip them). Re-expressed here without numpy:
//! each function is a single pass (or two, for indicators needing a prior smoothing
//! stage) over plain slices.

use super::types::Candle;

pub fn sma(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    let mut out = vec![f64::NAN; n];
    if period == 0 || n < period {
        return out;
    }
    let mut window_sum: f64 = values[..period].iter().sum();
    out[period - 1] = window_sum / period as f64;
    for i in period..n {
        window_sum += values[i] - values[i - period];
        out[i] = window_sum / period as f64;
    }
    out
}

pub fn ema(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    let mut out = vec![f64::NAN; n];
    if period == 0 || n < period {
        return out;
    }
    let k = 2.0 / (period as f64 + 1.0);
    let seed: f64 = values[..period].iter().sum::<f64>() / period as f64;
    out[period - 1] = seed;
    let mut prev = seed;
    for i in period..n {
        let v = values[i] * k + prev * (1.0 - k);
        out[i] = v;
        prev = v;
    }
    out
}

/// Wilder's RSI, smoothing gains/losses the same way `backend.core.indicators` does
/// (exponential smoothing seeded by the first simple average of `period` changes).
pub fn rsi(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    let mut out = vec![f64::NAN; n];
    if period == 0 || n <= period {
        return out;
    }
    let mut gains = 0.0;
    let mut losses = 0.0;
    for i in 1..=period {
        let change = values[i] - values[i - 1];
        if change >= 0.0 {
            gains += change;
        } else {
            losses -= change;
        }
    }
    let mut avg_gain = gains / period as f64;
    let mut avg_loss = losses / period as f64;
    out[period] = rsi_from_avgs(avg_gain, avg_loss);

    for i in (period + 1)..n {
        let change = values[i] - values[i - 1];
        let (gain, loss) = if change >= 0.0 { (change, 0.0) } else { (0.0, -change) };
        avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
        out[i] = rsi_from_avgs(avg_gain, avg_loss);
    }
    out
}

fn rsi_from_avgs(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - (100.0 / (1.0 + rs))
}

/// Wilder's ATR over true range, matching `atr_calculator.py::calculate_atr`'s default
/// (Wilder smoothing, not a plain SMA of true range).
pub fn atr(candles: &[Candle], period: usize) -> Vec<f64> {
    let n = candles.len();
    let mut out = vec![f64::NAN; n];
    if period == 0 || n <= period {
        return out;
    }
    let tr = |i: usize| -> f64 {
        if i == 0 {
            candles[i].high - candles[i].low
        } else {
            let hl = candles[i].high - candles[i].low;
            let hc = (candles[i].high - candles[i - 1].close).abs();
            let lc = (candles[i].low - candles[i - 1].close).abs();
            hl.max(hc).max(lc)
        }
    };
    let mut sum_tr = 0.0;
    for i in 0..period {
        sum_tr += tr(i);
    }
    let mut prev_atr = sum_tr / period as f64;
    out[period - 1] = prev_atr;
    for i in period..n {
        prev_atr = (prev_atr * (period as f64 - 1.0) + tr(i)) / period as f64;
        out[i] = prev_atr;
    }
    out
}

pub struct Macd {
    pub macd_line: Vec<f64>,
    pub signal_line: Vec<f64>,
    pub histogram: Vec<f64>,
}

pub fn macd(values: &[f64], fast: usize, slow: usize, signal: usize) -> Macd {
    let fast_ema = ema(values, fast);
    let slow_ema = ema(values, slow);
    let n = values.len();
    let mut macd_line = vec![f64::NAN; n];
    for i in 0..n {
        if fast_ema[i].is_finite() && slow_ema[i].is_finite() {
            macd_line[i] = fast_ema[i] - slow_ema[i];
        }
    }
    let finite_macd: Vec<f64> = macd_line.iter().map(|v| if v.is_finite() { *v } else { 0.0 }).collect();
    let first_finite = macd_line.iter().position(|v| v.is_finite()).unwrap_or(n);
    let signal_line_raw = ema(&finite_macd[first_finite.min(n)..], signal);
    let mut signal_line = vec![f64::NAN; n];
    for (offset, v) in signal_line_raw.into_iter().enumerate() {
        signal_line[first_finite + offset] = v;
    }
    let mut histogram = vec![f64::NAN; n];
    for i in 0..n {
        if macd_line[i].is_finite() && signal_line[i].is_finite() {
            histogram[i] = macd_line[i] - signal_line[i];
        }
    }
    Macd { macd_line, signal_line, histogram }
}

pub struct Bollinger {
    pub upper: Vec<f64>,
    pub middle: Vec<f64>,
    pub lower: Vec<f64>,
}

pub fn bollinger(values: &[f64], period: usize, std_mult: f64) -> Bollinger {
    let n = values.len();
    let middle = sma(values, period);
    let mut upper = vec![f64::NAN; n];
    let mut lower = vec![f64::NAN; n];
    for i in 0..n {
        if middle[i].is_finite() {
            let window = &values[(i + 1 - period)..=i];
            let mean = middle[i];
            let variance = window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / period as f64;
            let std = variance.sqrt();
            upper[i] = mean + std_mult * std;
            lower[i] = mean - std_mult * std;
        }
    }
    Bollinger { upper, middle, lower }
}

pub struct SuperTrend {
    pub value: Vec<f64>,
    /// true when price is above the band (uptrend / bullish).
    pub uptrend: Vec<bool>,
}

pub fn supertrend(candles: &[Candle], period: usize, multiplier: f64) -> SuperTrend {
    let n = candles.len();
    let atr_vals = atr(candles, period);
    let mut upper_band = vec![f64::NAN; n];
    let mut lower_band = vec![f64::NAN; n];
    let mut value = vec![f64::NAN; n];
    let mut uptrend = vec![true; n];

    for i in 0..n {
        if !atr_vals[i].is_finite() {
            continue;
        }
        let hl2 = (candles[i].high + candles[i].low) / 2.0;
        let basic_upper = hl2 + multiplier * atr_vals[i];
        let basic_lower = hl2 - multiplier * atr_vals[i];

        let prev_upper = if i > 0 { upper_band[i - 1] } else { f64::NAN };
        let prev_lower = if i > 0 { lower_band[i - 1] } else { f64::NAN };

        upper_band[i] = if prev_upper.is_finite() && candles[i.saturating_sub(1)].close <= prev_upper {
            basic_upper.min(prev_upper)
        } else {
            basic_upper
        };
        lower_band[i] = if prev_lower.is_finite() && candles[i.saturating_sub(1)].close >= prev_lower {
            basic_lower.max(prev_lower)
        } else {
            basic_lower
        };

        let prev_trend = if i > 0 { uptrend[i - 1] } else { true };
        let trend = if prev_trend {
            candles[i].close >= lower_band[i]
        } else {
            candles[i].close > upper_band[i]
        };
        uptrend[i] = trend;
        value[i] = if trend { lower_band[i] } else { upper_band[i] };
    }
    SuperTrend { value, uptrend }
}

pub struct Ichimoku {
    pub tenkan_sen: Vec<f64>,
    pub kijun_sen: Vec<f64>,
    pub senkou_span_a: Vec<f64>,
    pub senkou_span_b: Vec<f64>,
}

fn donchian_mid(candles: &[Candle], i: usize, period: usize) -> f64 {
    if i + 1 < period {
        return f64::NAN;
    }
    let window = &candles[(i + 1 - period)..=i];
    let hi = window.iter().fold(f64::NEG_INFINITY, |m, c| m.max(c.high));
    let lo = window.iter().fold(f64::INFINITY, |m, c| m.min(c.low));
    (hi + lo) / 2.0
}

pub fn ichimoku(candles: &[Candle], tenkan: usize, kijun: usize, senkou_b: usize) -> Ichimoku {
    let n = candles.len();
    let mut tenkan_sen = vec![f64::NAN; n];
    let mut kijun_sen = vec![f64::NAN; n];
    let mut senkou_span_a = vec![f64::NAN; n];
    let mut senkou_span_b = vec![f64::NAN; n];
    for i in 0..n {
        tenkan_sen[i] = donchian_mid(candles, i, tenkan);
        kijun_sen[i] = donchian_mid(candles, i, kijun);
        if tenkan_sen[i].is_finite() && kijun_sen[i].is_finite() {
            senkou_span_a[i] = (tenkan_sen[i] + kijun_sen[i]) / 2.0;
        }
        senkou_span_b[i] = donchian_mid(candles, i, senkou_b);
    }
    Ichimoku { tenkan_sen, kijun_sen, senkou_span_a, senkou_span_b }
}

/// Wilder's ADX (trend strength, directionless). Returns NaN until `2*period` bars of
/// warm-up have accumulated (DI smoothing, then ADX smoothing over DX).
pub fn adx(candles: &[Candle], period: usize) -> Vec<f64> {
    let n = candles.len();
    let mut out = vec![f64::NAN; n];
    if n <= period * 2 || period == 0 {
        return out;
    }
    let atr_vals = atr(candles, period);

    let mut plus_dm = vec![0.0; n];
    let mut minus_dm = vec![0.0; n];
    for i in 1..n {
        let up_move = candles[i].high - candles[i - 1].high;
        let down_move = candles[i - 1].low - candles[i].low;
        plus_dm[i] = if up_move > down_move && up_move > 0.0 { up_move } else { 0.0 };
        minus_dm[i] = if down_move > up_move && down_move > 0.0 { down_move } else { 0.0 };
    }

    let smoothed_plus = wilder_smooth(&plus_dm, period);
    let smoothed_minus = wilder_smooth(&minus_dm, period);

    let mut dx = vec![f64::NAN; n];
    for i in 0..n {
        if atr_vals[i].is_finite() && atr_vals[i] > 0.0 && smoothed_plus[i].is_finite() {
            let plus_di = 100.0 * smoothed_plus[i] / atr_vals[i];
            let minus_di = 100.0 * smoothed_minus[i] / atr_vals[i];
            let sum = plus_di + minus_di;
            if sum > 0.0 {
                dx[i] = 100.0 * (plus_di - minus_di).abs() / sum;
            }
        }
    }

    let first_dx = dx.iter().position(|v| v.is_finite());
    if let Some(start) = first_dx {
        if n - start >= period {
            let finite_dx: Vec<f64> = dx[start..].iter().map(|v| if v.is_finite() { *v } else { 0.0 }).collect();
            let adx_vals = sma(&finite_dx, period);
            for (offset, v) in adx_vals.into_iter().enumerate() {
                if v.is_finite() {
                    out[start + offset] = v;
                }
            }
        }
    }
    out
}

fn wilder_smooth(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    let mut out = vec![f64::NAN; n];
    if n <= period {
        return out;
    }
    let sum: f64 = values[1..=period].iter().sum();
    out[period] = sum / period as f64;
    let mut prev = out[period];
    for i in (period + 1)..n {
        prev = (prev * (period as f64 - 1.0) + values[i]) / period as f64;
        out[i] = prev;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn candle(i: i64, o: f64, h: f64, l: f64, c: f64) -> Candle {
        Candle {
            open_time: Utc.timestamp_opt(i * 60, 0).unwrap(),
            open: o,
            high: h,
            low: l,
            close: c,
            volume: 100.0,
        }
    }

    #[test]
    fn sma_matches_hand_computation() {
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let out = sma(&values, 3);
        assert!(out[0].is_nan());
        assert!(out[1].is_nan());
        assert!((out[2] - 2.0).abs() < 1e-9);
        assert!((out[3] - 3.0).abs() < 1e-9);
        assert!((out[4] - 4.0).abs() < 1e-9);
    }

    #[test]
    fn ema_converges_toward_constant_series() {
        let values = vec![10.0; 50];
        let out = ema(&values, 10);
        assert!((out[49] - 10.0).abs() < 1e-6);
    }

    #[test]
    fn rsi_is_100_for_monotonically_rising_series() {
        let values: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        let out = rsi(&values, 14);
        assert!((out[29] - 100.0).abs() < 1e-6);
    }

    #[test]
    fn atr_is_nonnegative_and_defined_after_warmup() {
        let candles: Vec<Candle> = (0..20)
            .map(|i| candle(i, 100.0, 101.0 + i as f64 * 0.1, 99.0, 100.5))
            .collect();
        let out = atr(&candles, 14);
        assert!(out[13].is_finite());
        assert!(out[13] >= 0.0);
    }
}
