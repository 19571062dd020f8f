//! Technical analyzer: one indicator bundle per evaluation tick.
//!
//! Everything except SuperTrend is standard textbook math (Wilder
//! smoothing throughout) computed in-house; SuperTrend is the one
//! stateful, order-sensitive algorithm and its asymmetric band ratchet is
//! reproduced exactly: the final upper band only falls (or resets when the
//! prior close breaks above it), the final lower band only rises (mirror
//! rule), and the trend seeds bullish at index 0.

use serde::{Deserialize, Serialize};
use varaha_models::PriceSeries;

/// Minimum usable bars. Below this the analyzer returns a zeroed bundle:
/// degraded, not failed, so strategies tolerate cold starts.
pub const MIN_SAMPLES: usize = 20;

/// Indicator periods.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TechConfig {
    pub ema_periods: [usize; 4],
    pub rsi_period: usize,
    pub adx_period: usize,
    pub atr_period: usize,
    pub boll_period: usize,
    pub boll_mult: f64,
    pub supertrend_period: usize,
    pub supertrend_mult: f64,
}

impl Default for TechConfig {
    fn default() -> Self {
        Self {
            ema_periods: [10, 20, 50, 200],
            rsi_period: 14,
            adx_period: 14,
            atr_period: 14,
            boll_period: 20,
            boll_mult: 2.0,
            supertrend_period: 10,
            supertrend_mult: 3.0,
        }
    }
}

/// Latest-point values of every indicator, reused by all rules in a tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TechSnapshot {
    pub ema_fast: f64,
    pub ema_mid: f64,
    pub ema_slow: f64,
    pub ema_long: f64,
    pub rsi: f64,
    pub adx: f64,
    pub atr: f64,
    pub boll_upper: f64,
    pub boll_mid: f64,
    pub boll_lower: f64,
    pub supertrend: f64,
    /// Discrete trend state: +1 bullish, -1 bearish.
    pub supertrend_dir: i8,
}

/// Compute the full bundle from aligned series.
pub fn analyze(series: &PriceSeries, cfg: &TechConfig) -> TechSnapshot {
    if series.len() < MIN_SAMPLES {
        return TechSnapshot::default();
    }

    let close = &series.close;
    let (boll_upper, boll_mid, boll_lower) = bollinger(close, cfg.boll_period, cfg.boll_mult);
    let st = supertrend(
        &series.high,
        &series.low,
        close,
        cfg.supertrend_period,
        cfg.supertrend_mult,
    );

    TechSnapshot {
        ema_fast: last(&ema_series(close, cfg.ema_periods[0])),
        ema_mid: last(&ema_series(close, cfg.ema_periods[1])),
        ema_slow: last(&ema_series(close, cfg.ema_periods[2])),
        ema_long: last(&ema_series(close, cfg.ema_periods[3])),
        rsi: rsi(close, cfg.rsi_period),
        adx: adx(&series.high, &series.low, close, cfg.adx_period),
        atr: last(&atr_series(&series.high, &series.low, close, cfg.atr_period)),
        boll_upper,
        boll_mid,
        boll_lower,
        supertrend: last(&st.line),
        supertrend_dir: st.direction.last().copied().unwrap_or(0),
    }
}

fn last(values: &[f64]) -> f64 {
    values.last().copied().unwrap_or(0.0)
}

/// EMA over the full series. The first `period` entries carry the running
/// mean seed, so the output stays aligned with the input.
pub fn ema_series(values: &[f64], period: usize) -> Vec<f64> {
    if values.is_empty() || period == 0 {
        return Vec::new();
    }
    let alpha = 2.0 / (period as f64 + 1.0);
    let mut out = Vec::with_capacity(values.len());
    let mut seed_sum = 0.0;
    for (i, &v) in values.iter().enumerate() {
        if i < period {
            seed_sum += v;
            out.push(seed_sum / (i + 1) as f64);
        } else {
            let prev = out[i - 1];
            out.push(prev + alpha * (v - prev));
        }
    }
    out
}

/// Wilder RSI, latest value. All-gain windows read 100, all-loss 0,
/// flat 50.
pub fn rsi(close: &[f64], period: usize) -> f64 {
    if close.len() <= period {
        return 50.0;
    }
    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;
    for i in 1..=period {
        let delta = close[i] - close[i - 1];
        if delta >= 0.0 {
            avg_gain += delta;
        } else {
            avg_loss -= delta;
        }
    }
    avg_gain /= period as f64;
    avg_loss /= period as f64;
    for i in (period + 1)..close.len() {
        let delta = close[i] - close[i - 1];
        let (gain, loss) = if delta >= 0.0 { (delta, 0.0) } else { (0.0, -delta) };
        avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
    }
    if avg_loss == 0.0 && avg_gain == 0.0 {
        return 50.0;
    }
    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - 100.0 / (1.0 + rs)
}

/// True range series.
fn true_range(high: &[f64], low: &[f64], close: &[f64]) -> Vec<f64> {
    let mut tr = Vec::with_capacity(high.len());
    for i in 0..high.len() {
        if i == 0 {
            tr.push(high[0] - low[0]);
        } else {
            let hl = high[i] - low[i];
            let hc = (high[i] - close[i - 1]).abs();
            let lc = (low[i] - close[i - 1]).abs();
            tr.push(hl.max(hc).max(lc));
        }
    }
    tr
}

/// Wilder-smoothed ATR over the full series.
pub fn atr_series(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<f64> {
    let tr = true_range(high, low, close);
    if tr.is_empty() || period == 0 {
        return Vec::new();
    }
    let p = period as f64;
    let mut out = Vec::with_capacity(tr.len());
    out.push(tr[0]);
    for i in 1..tr.len() {
        out.push((out[i - 1] * (p - 1.0) + tr[i]) / p);
    }
    out
}

/// Wilder ADX, latest value.
pub fn adx(high: &[f64], low: &[f64], close: &[f64], period: usize) -> f64 {
    let n = high.len();
    if n <= 2 * period {
        return 0.0;
    }
    let p = period as f64;
    let tr = true_range(high, low, close);

    let mut smooth_tr = tr[1];
    let mut smooth_plus = 0.0;
    let mut smooth_minus = 0.0;
    let mut adx_val = 0.0;
    let mut dx_count = 0usize;

    for i in 1..n {
        let up = high[i] - high[i - 1];
        let down = low[i - 1] - low[i];
        let plus_dm = if up > down && up > 0.0 { up } else { 0.0 };
        let minus_dm = if down > up && down > 0.0 { down } else { 0.0 };

        if i == 1 {
            smooth_plus = plus_dm;
            smooth_minus = minus_dm;
            continue;
        }
        smooth_tr = smooth_tr - smooth_tr / p + tr[i];
        smooth_plus = smooth_plus - smooth_plus / p + plus_dm;
        smooth_minus = smooth_minus - smooth_minus / p + minus_dm;

        if smooth_tr == 0.0 {
            continue;
        }
        let di_plus = 100.0 * smooth_plus / smooth_tr;
        let di_minus = 100.0 * smooth_minus / smooth_tr;
        let di_sum = di_plus + di_minus;
        if di_sum == 0.0 {
            continue;
        }
        let dx = 100.0 * (di_plus - di_minus).abs() / di_sum;
        dx_count += 1;
        if dx_count <= period {
            // Seed phase: running mean of the first `period` DX values.
            adx_val += (dx - adx_val) / dx_count as f64;
        } else {
            adx_val = (adx_val * (p - 1.0) + dx) / p;
        }
    }
    adx_val
}

/// Bollinger bands from the trailing window: (upper, mid, lower).
pub fn bollinger(close: &[f64], period: usize, mult: f64) -> (f64, f64, f64) {
    if close.len() < period || period == 0 {
        return (0.0, 0.0, 0.0);
    }
    let window = &close[close.len() - period..];
    let mid = window.iter().sum::<f64>() / period as f64;
    let variance = window.iter().map(|v| (v - mid).powi(2)).sum::<f64>() / period as f64;
    let sd = variance.sqrt();
    (mid + mult * sd, mid, mid - mult * sd)
}

/// Full SuperTrend output: the band-derived line and the discrete trend
/// per bar.
#[derive(Debug, Clone, Default)]
pub struct SuperTrendSeries {
    pub line: Vec<f64>,
    pub direction: Vec<i8>,
}

/// Iterative SuperTrend band construction.
///
/// Basic bands are HL2 +/- mult*ATR. The final upper band may only
/// decrease, unless the previous close broke above it; the final lower
/// band may only increase, unless the previous close broke below it.
/// The trend flips bearish on the bar whose close crosses below the
/// running lower line, bullish on the mirror cross. Index 0 seeds "up".
pub fn supertrend(
    high: &[f64],
    low: &[f64],
    close: &[f64],
    period: usize,
    mult: f64,
) -> SuperTrendSeries {
    let n = close.len();
    if n == 0 {
        return SuperTrendSeries::default();
    }
    let atr = atr_series(high, low, close, period);

    let mut final_upper = vec![0.0; n];
    let mut final_lower = vec![0.0; n];
    let mut direction = vec![0i8; n];
    let mut line = vec![0.0; n];

    for i in 0..n {
        let hl2 = (high[i] + low[i]) / 2.0;
        let basic_upper = hl2 + mult * atr[i];
        let basic_lower = hl2 - mult * atr[i];

        if i == 0 {
            final_upper[0] = basic_upper;
            final_lower[0] = basic_lower;
            direction[0] = 1;
            line[0] = basic_lower;
            continue;
        }

        final_upper[i] = if basic_upper < final_upper[i - 1] || close[i - 1] > final_upper[i - 1] {
            basic_upper
        } else {
            final_upper[i - 1]
        };
        final_lower[i] = if basic_lower > final_lower[i - 1] || close[i - 1] < final_lower[i - 1] {
            basic_lower
        } else {
            final_lower[i - 1]
        };

        direction[i] = if direction[i - 1] == 1 {
            if close[i] < final_lower[i] {
                -1
            } else {
                1
            }
        } else if close[i] > final_upper[i] {
            1
        } else {
            -1
        };

        line[i] = if direction[i] == 1 {
            final_lower[i]
        } else {
            final_upper[i]
        };
    }

    SuperTrendSeries { line, direction }
}
