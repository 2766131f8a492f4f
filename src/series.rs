//! Indicator math over one item/platform snapshot series.
//!
//! ## Approach
//!
//! Everything here is pure: callers pass the windowed rows (oldest first)
//! plus the moving-average window lengths, and get back a bundle of
//! `Option<f64>` indicators. An indicator is `None` whenever the series is
//! too short or a price guard fails, and the scoring layer treats `None`
//! as "filter fails", never as zero.
//!
//! Mid price per row is `(sell + buy) / 2` when a positive buy quote
//! exists, otherwise the sell price alone. Rolling means require a full
//! window before producing a value.
//!
//! `technical_indicators` builds a second bundle over the same mid-price
//! series (exponential averages, relative strength, Bollinger band
//! position, smoothed absolute change) for the add/reduce probability
//! estimate in the scoring layer.

use crate::types::MarketSnapshot;

/// Rows between `ma_mid` samples when estimating its slope.
const MID_SLOPE_LOOKBACK: usize = 5;

/// Hours in the trailing liquidity baseline.
const LIQUIDITY_BASELINE_HOURS: usize = 24;

/// Exponential average spans over the mid price, in hours.
const EMA_FAST_SPAN: usize = 6;
const EMA_MID_SPAN: usize = 24;
const EMA_LONG_SPAN: usize = 72;

/// Hourly moves in one relative-strength window.
const RSI_PERIOD: usize = 14;

/// Bollinger window length and band width in standard deviations.
const BOLLINGER_WINDOW: usize = 20;
const BOLLINGER_WIDTH: f64 = 2.0;

/// Smoothing span for the absolute hourly change.
const ATR_SPAN: usize = 14;

/// Indicator bundle computed from one snapshot series.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeriesIndicators {
    /// Number of hourly rows that backed the computation.
    pub coverage_hours: usize,
    pub last_sell: Option<f64>,
    pub last_buy: Option<f64>,
    /// Relative bid/ask gap at the latest row, `(sell - buy) / mid`.
    pub spread: Option<f64>,
    /// Last value of each moving average, present once its window fills.
    pub ma_fast: Option<f64>,
    pub ma_mid: Option<f64>,
    pub ma_long: Option<f64>,
    /// Fast average over mid average, minus one.
    pub momentum_short: Option<f64>,
    /// Slope of the mid average over the last few hours.
    pub momentum_mid: Option<f64>,
    /// Mid average over long average, minus one.
    pub momentum_long: Option<f64>,
    pub liquidity_today: Option<f64>,
    /// Latest volume over the trailing 24h mean volume.
    pub liquidity_ratio_24h: Option<f64>,
}

/// Rolling mean that yields `None` until the window is full.
pub fn rolling_mean(values: &[f64], window: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if window == 0 || values.len() < window {
        return out;
    }

    let mut sum: f64 = values[..window].iter().sum();
    out[window - 1] = Some(sum / window as f64);
    for i in window..values.len() {
        sum += values[i] - values[i - window];
        out[i] = Some(sum / window as f64);
    }
    out
}

fn mid_price(row: &MarketSnapshot) -> f64 {
    if row.buy_price > 0.0 {
        (row.sell_price + row.buy_price) / 2.0
    } else {
        row.sell_price
    }
}

fn ratio_minus_one(numer: Option<f64>, denom: Option<f64>) -> Option<f64> {
    match (numer, denom) {
        (Some(n), Some(d)) if d > 0.0 => Some(n / d - 1.0),
        _ => None,
    }
}

fn mean_tail(values: &[f64], n: usize) -> Option<f64> {
    if n == 0 || values.len() < n {
        return None;
    }
    let tail = &values[values.len() - n..];
    Some(tail.iter().sum::<f64>() / n as f64)
}

/// Compute the full indicator bundle for one series.
///
/// Arguments:
/// - `rows`: hourly snapshots, oldest first
/// - `fast`, `mid`, `long`: moving-average window lengths in hours
pub fn analyze_series(
    rows: &[MarketSnapshot],
    fast: usize,
    mid: usize,
    long: usize,
) -> SeriesIndicators {
    if rows.is_empty() {
        return SeriesIndicators::default();
    }

    let mids: Vec<f64> = rows.iter().map(mid_price).collect();
    let volumes: Vec<f64> = rows.iter().map(|r| r.volume).collect();

    let ma_fast = rolling_mean(&mids, fast);
    let ma_mid = rolling_mean(&mids, mid);
    let ma_long = rolling_mean(&mids, long);

    let fast_last = ma_fast.last().copied().flatten();
    let mid_last = ma_mid.last().copied().flatten();
    let long_last = ma_long.last().copied().flatten();

    let momentum_mid = if ma_mid.len() > MID_SLOPE_LOOKBACK {
        ratio_minus_one(mid_last, ma_mid[ma_mid.len() - 1 - MID_SLOPE_LOOKBACK])
    } else {
        None
    };

    let last = &rows[rows.len() - 1];
    let last_sell = (last.sell_price > 0.0).then_some(last.sell_price);
    let last_buy = (last.buy_price > 0.0).then_some(last.buy_price);
    let spread = match (last_sell, last_buy) {
        (Some(sell), Some(buy)) => {
            let mid = (sell + buy) / 2.0;
            (mid > 0.0).then(|| (sell - buy) / mid)
        }
        _ => None,
    };

    let liquidity_today = Some(last.volume);
    let baseline = mean_tail(&volumes, LIQUIDITY_BASELINE_HOURS);
    let liquidity_ratio_24h = match baseline {
        Some(mean) if mean > 0.0 => Some(last.volume / mean),
        _ => None,
    };

    SeriesIndicators {
        coverage_hours: rows.len(),
        last_sell,
        last_buy,
        spread,
        ma_fast: fast_last,
        ma_mid: mid_last,
        ma_long: long_last,
        momentum_short: ratio_minus_one(fast_last, mid_last),
        momentum_mid,
        momentum_long: ratio_minus_one(mid_last, long_last),
        liquidity_today,
        liquidity_ratio_24h,
    }
}

/// Technical bundle over the mid-price series.
///
/// Every value is `None` when the series is shorter than the indicator's
/// window, or when the window carries no price movement at all.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TechnicalIndicators {
    pub ema_fast: Option<f64>,
    pub ema_mid: Option<f64>,
    pub ema_long: Option<f64>,
    /// Relative strength over the last 14 hourly moves, 0 to 100.
    pub rsi14: Option<f64>,
    /// Position inside the Bollinger band, 0 at the lower edge, 1 at the upper.
    pub bb_pctb: Option<f64>,
    /// Smoothed absolute hourly mid-price change.
    pub atr: Option<f64>,
}

/// Compute the technical bundle for one series.
pub fn technical_indicators(rows: &[MarketSnapshot]) -> TechnicalIndicators {
    if rows.is_empty() {
        return TechnicalIndicators::default();
    }
    let mids: Vec<f64> = rows.iter().map(mid_price).collect();
    TechnicalIndicators {
        ema_fast: ema(&mids, EMA_FAST_SPAN),
        ema_mid: ema(&mids, EMA_MID_SPAN),
        ema_long: ema(&mids, EMA_LONG_SPAN),
        rsi14: rsi(&mids, RSI_PERIOD),
        bb_pctb: bollinger_pctb(&mids, BOLLINGER_WINDOW, BOLLINGER_WIDTH),
        atr: smoothed_abs_change(&mids, ATR_SPAN),
    }
}

/// Exponential moving average, seeded from the first value. Requires at
/// least `span` samples before reporting.
fn ema(values: &[f64], span: usize) -> Option<f64> {
    if span == 0 || values.len() < span {
        return None;
    }
    let alpha = 2.0 / (span as f64 + 1.0);
    let mut y = values[0];
    for &x in &values[1..] {
        y += alpha * (x - y);
    }
    Some(y)
}

/// Relative-strength index with simple-mean gain and loss.
///
/// A window with no movement has no defined strength; the scan steps back
/// to the newest window that moved. One-sided windows saturate at 100
/// (all gains) or 0 (all losses).
fn rsi(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period + 1 {
        return None;
    }
    let deltas: Vec<f64> = values.windows(2).map(|w| w[1] - w[0]).collect();
    for end in (period..=deltas.len()).rev() {
        let window = &deltas[end - period..end];
        let gain = window.iter().filter(|d| **d > 0.0).sum::<f64>() / period as f64;
        let loss = -window.iter().filter(|d| **d < 0.0).sum::<f64>() / period as f64;
        if gain == 0.0 && loss == 0.0 {
            continue;
        }
        return Some(100.0 - 100.0 / (1.0 + gain / loss));
    }
    None
}

/// Position of the latest price inside its Bollinger band.
///
/// Uses the sample standard deviation. A zero-deviation window has no
/// band; the scan steps back to the newest window with one. Values may
/// leave `[0, 1]` when the price pierces a band edge.
fn bollinger_pctb(values: &[f64], window: usize, width: f64) -> Option<f64> {
    if window < 2 || values.len() < window {
        return None;
    }
    for end in (window..=values.len()).rev() {
        let slice = &values[end - window..end];
        let mean = slice.iter().sum::<f64>() / window as f64;
        let var =
            slice.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (window as f64 - 1.0);
        let sd = var.sqrt();
        if sd == 0.0 {
            continue;
        }
        let lower = mean - width * sd;
        return Some((values[end - 1] - lower) / (2.0 * width * sd));
    }
    None
}

/// Exponentially smoothed absolute hourly change, a volatility proxy in
/// price units. Valid from the second sample on.
fn smoothed_abs_change(values: &[f64], span: usize) -> Option<f64> {
    let mut changes = values.windows(2).map(|w| (w[1] - w[0]).abs());
    let mut y = changes.next()?;
    let alpha = 2.0 / (span as f64 + 1.0);
    for x in changes {
        y += alpha * (x - y);
    }
    Some(y)
}
