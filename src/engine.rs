//! Signal engine: scoring, ranking, and position assessment.
//!
//! ## Cycle shape
//!
//! `analyze` reads every tracked item/platform series from the snapshot
//! store, computes the indicator bundle, and splits the universe three
//! ways: items passing the mode's hard entry filters become buy
//! candidates (ranked, capped), items passing only the relaxed filters
//! land on the watchlist, and everything else is dropped. Scored pairs
//! additionally carry rule-scored add/reduce probabilities, computed from
//! fixed thresholds rather than the mode presets. Open positions are
//! assessed independently of candidate rank: locked ones are listed as
//! such, unlocked ones are checked against the sell triggers.
//!
//! ## Modes
//!
//! All thresholds and weights come from one of three presets selected by
//! `Mode`. The numbers are tunables, not laws; the invariant that matters
//! is monotonicity (more momentum or liquidity never lowers a score).

use crate::error::Result;
use crate::ledger::{Position, PositionLedger, MIN_HOLDING_PERIOD_SECS};
use crate::series::{analyze_series, technical_indicators, SeriesIndicators, TechnicalIndicators};
use crate::store::SnapshotStore;
use crate::types::{
    AnalysisResult, ItemSpec, LockedPosition, Mode, Platform, ScoredItem, SellAdvice,
};
use log::debug;
use std::cmp::Ordering;
use std::collections::HashMap;

/// Spread at which the score penalty saturates.
const SPREAD_PENALTY_SCALE: f64 = 0.10;

/// Half-width of the cross-platform neutrality bonus band.
const CROSS_NEUTRAL_BAND: f64 = 0.3;

/// Sell trigger: spread beyond this multiple of the mode's entry ceiling.
const SPREAD_BLOWOUT_FACTOR: f64 = 1.5;

/// Sell trigger: 24h liquidity ratio below this floor.
const LIQUIDITY_COLLAPSE_FLOOR: f64 = 0.6;

/// Threshold/weight preset for one risk profile.
#[derive(Debug, Clone, PartialEq)]
pub struct ModeParams {
    /// Minimum hourly coverage before an item is scored at all.
    pub min_hours: u32,
    pub ma_fast: usize,
    pub ma_mid: usize,
    pub ma_long: usize,
    /// Entry ceiling on the relative bid/ask spread.
    pub max_spread: f64,
    /// Accepted BUFF/YYYP sell-price ratio band.
    pub cross_low: f64,
    pub cross_high: f64,
    pub min_liq_ratio: f64,
    pub min_fast_over_mid: f64,
    pub min_mid_over_long: f64,
    /// Require a rising mid average for entry.
    pub need_mid_slope_pos: bool,
    pub w_fast_mom: f64,
    pub w_long_trend: f64,
    pub w_liq_ratio: f64,
    pub w_cross_neutral: f64,
    pub w_spread_penalty: f64,
    /// Filter widening factor for the watchlist pass.
    pub watch_relax: f64,
    pub take_profit: f64,
    pub stop_loss: f64,
    /// Trailing stop arms once peak return reaches this level...
    pub trail_trigger: f64,
    /// ...and fires after giving back this share of the peak.
    pub trail_giveback: f64,
    /// Per-cycle ceiling on buy candidates, on top of topk.
    pub max_candidates: usize,
}

static CONSERVATIVE: ModeParams = ModeParams {
    min_hours: 168,
    ma_fast: 6,
    ma_mid: 24,
    ma_long: 168,
    max_spread: 0.06,
    cross_low: 0.92,
    cross_high: 1.08,
    min_liq_ratio: 1.2,
    min_fast_over_mid: 0.004,
    min_mid_over_long: 0.010,
    need_mid_slope_pos: true,
    w_fast_mom: 1.2,
    w_long_trend: 1.4,
    w_liq_ratio: 1.0,
    w_cross_neutral: 1.0,
    w_spread_penalty: 1.6,
    watch_relax: 1.15,
    take_profit: 0.05,
    stop_loss: 0.03,
    trail_trigger: 0.05,
    trail_giveback: 0.5,
    max_candidates: 5,
};

static MODERATE: ModeParams = ModeParams {
    min_hours: 168,
    ma_fast: 6,
    ma_mid: 24,
    ma_long: 168,
    max_spread: 0.08,
    cross_low: 0.90,
    cross_high: 1.12,
    min_liq_ratio: 1.0,
    min_fast_over_mid: 0.0,
    min_mid_over_long: 0.002,
    need_mid_slope_pos: false,
    w_fast_mom: 1.1,
    w_long_trend: 1.2,
    w_liq_ratio: 0.9,
    w_cross_neutral: 0.8,
    w_spread_penalty: 1.2,
    watch_relax: 1.20,
    take_profit: 0.06,
    stop_loss: 0.04,
    trail_trigger: 0.06,
    trail_giveback: 0.55,
    max_candidates: 8,
};

static AGGRESSIVE: ModeParams = ModeParams {
    min_hours: 24,
    ma_fast: 4,
    ma_mid: 12,
    ma_long: 72,
    max_spread: 0.10,
    cross_low: 0.85,
    cross_high: 1.15,
    min_liq_ratio: 0.8,
    min_fast_over_mid: -0.002,
    min_mid_over_long: -0.005,
    need_mid_slope_pos: false,
    w_fast_mom: 1.2,
    w_long_trend: 0.8,
    w_liq_ratio: 0.8,
    w_cross_neutral: 0.6,
    w_spread_penalty: 0.8,
    watch_relax: 1.30,
    take_profit: 0.08,
    stop_loss: 0.05,
    trail_trigger: 0.07,
    trail_giveback: 0.6,
    max_candidates: 12,
};

impl ModeParams {
    pub fn for_mode(mode: Mode) -> &'static ModeParams {
        match mode {
            Mode::Conservative => &CONSERVATIVE,
            Mode::Moderate => &MODERATE,
            Mode::Aggressive => &AGGRESSIVE,
        }
    }
}

/// Platform fee rates as (sell_side, buy_side) fractions.
pub fn platform_fees(platform: Platform) -> (f64, f64) {
    match platform {
        Platform::Buff => (0.02, 0.0),
        Platform::Yyyp => (0.02, 0.0),
        Platform::Steam => (0.0, 0.0),
    }
}

/// Net-of-fees return of selling at `sell` a lot bought at `buy`.
pub fn net_return(sell: f64, buy: f64, platform: Platform) -> f64 {
    let (fee_sell, fee_buy) = platform_fees(platform);
    let net_buy = buy * (1.0 + fee_buy);
    if net_buy <= 0.0 {
        return 0.0;
    }
    sell * (1.0 - fee_sell) / net_buy - 1.0
}

/// Signal engine bound to one store, universe, and mode for its lifetime.
pub struct Engine {
    store: SnapshotStore,
    items: Vec<ItemSpec>,
    platforms: Vec<Platform>,
    mode: Mode,
    params: &'static ModeParams,
    topk: usize,
    lookback_hours: u32,
    min_required_hours: u32,
}

impl Engine {
    /// Arguments:
    /// - `store`: snapshot store handle
    /// - `items`: tracked universe
    /// - `mode`: risk preset
    /// - `topk`: per-list entry ceiling
    /// - `lookback_hours`: series window pulled per item
    /// - `min_required_override`: replaces the mode's coverage minimum
    pub fn new(
        store: SnapshotStore,
        items: Vec<ItemSpec>,
        mode: Mode,
        topk: usize,
        lookback_hours: u32,
        min_required_override: Option<u32>,
    ) -> Self {
        let params = ModeParams::for_mode(mode);
        Self {
            store,
            items,
            platforms: Platform::default_universe(),
            mode,
            params,
            topk,
            lookback_hours,
            min_required_hours: min_required_override.unwrap_or(params.min_hours),
        }
    }

    /// Run one full analysis pass as of `as_of` (epoch seconds).
    ///
    /// Reads the snapshot store and the ledger; the only write is the
    /// monotonic peak-return refresh on positions that have a live quote.
    pub fn analyze(&self, as_of: i64, ledger: &PositionLedger) -> Result<AnalysisResult> {
        let p = self.params;
        let since = as_of - self.lookback_hours as i64 * 3_600;

        let mut indicators: HashMap<(i64, Platform), (SeriesIndicators, TechnicalIndicators)> =
            HashMap::new();
        let mut insufficient = Vec::new();

        for item in &self.items {
            for &platform in &self.platforms {
                let rows = self.store.series(item.item_id, platform, since)?;
                let ind = analyze_series(&rows, p.ma_fast, p.ma_mid, p.ma_long);
                if (ind.coverage_hours as u32) < self.min_required_hours {
                    insufficient.push(format!(
                        "{} [{}]: {}h of {}h",
                        item.item_name, platform, ind.coverage_hours, self.min_required_hours
                    ));
                }
                indicators.insert((item.item_id, platform), (ind, technical_indicators(&rows)));
            }
        }

        // BUFF sell over YYYP sell, per item, when both sides have a quote.
        let mut cross_ratios: HashMap<i64, f64> = HashMap::new();
        for item in &self.items {
            let buff = indicators
                .get(&(item.item_id, Platform::Buff))
                .and_then(|(i, _)| i.last_sell);
            let yyyp = indicators
                .get(&(item.item_id, Platform::Yyyp))
                .and_then(|(i, _)| i.last_sell);
            if let (Some(b), Some(y)) = (buff, yyyp) {
                if y > 0.0 {
                    cross_ratios.insert(item.item_id, b / y);
                }
            }
        }

        let mut strict_pool = Vec::new();
        let mut relaxed_pool = Vec::new();
        for item in &self.items {
            for &platform in &self.platforms {
                let (ind, tech) = &indicators[&(item.item_id, platform)];
                if (ind.coverage_hours as u32) < self.min_required_hours {
                    continue;
                }
                let Some(price_sell) = ind.last_sell else {
                    debug!("No sell quote for {} [{}], skipped", item.item_name, platform);
                    continue;
                };
                let cross_ratio = cross_ratios.get(&item.item_id).copied();

                let strict = self.passes_entry_filters(ind, cross_ratio, 1.0);
                if !strict && !self.passes_entry_filters(ind, cross_ratio, p.watch_relax) {
                    continue;
                }

                let est = estimate_add_reduce(ind, tech, cross_ratio);
                let scored = ScoredItem {
                    item_id: item.item_id,
                    item_name: item.item_name.clone(),
                    platform,
                    price_sell,
                    price_buy: ind.last_buy,
                    spread: ind.spread,
                    liquidity_ratio_24h: ind.liquidity_ratio_24h.unwrap_or(0.0),
                    momentum_short: ind.momentum_short,
                    momentum_mid: ind.momentum_mid,
                    momentum_long: ind.momentum_long,
                    cross_ratio,
                    composite_score: self.composite_score(ind, cross_ratio),
                    reason: describe_signals(ind),
                    add_prob: Some(est.add_prob),
                    reduce_prob: Some(est.reduce_prob),
                    add_signals: est.add_signals,
                    reduce_signals: est.reduce_signals,
                };
                if strict {
                    strict_pool.push(scored);
                } else {
                    relaxed_pool.push(scored);
                }
            }
        }

        rank(&mut strict_pool);
        let cap = self.topk.min(p.max_candidates);
        let overflow = strict_pool.split_off(cap.min(strict_pool.len()));

        let mut buy_candidates = strict_pool;
        for candidate in &mut buy_candidates {
            candidate.reason = format!("entry ok: {}", candidate.reason);
        }

        let mut watchlist = relaxed_pool;
        for item in &mut watchlist {
            item.reason = format!("relaxed entry: {}", item.reason);
        }
        for mut item in overflow {
            item.reason = format!("over cycle cap: {}", item.reason);
            watchlist.push(item);
        }
        rank(&mut watchlist);
        watchlist.truncate(self.topk);
        if let Some(weakest) = buy_candidates.last() {
            watchlist.retain(|w| outranks(weakest, w));
        }

        let mut sell_advice = Vec::new();
        let mut locked_positions = Vec::new();
        let mut notes = Vec::new();

        for position in ledger.list() {
            let ind = indicators
                .get(&(position.item_id, position.platform))
                .map(|(i, _)| i);
            let quote = ind.and_then(|i| i.last_sell);
            let current_return =
                quote.map(|q| net_return(q, position.buy_price, position.platform));

            if let Some(ret) = current_return {
                ledger.update_peak_return(
                    position.item_id,
                    position.platform,
                    position.buy_time,
                    ret,
                )?;
            }
            let effective_peak = current_return
                .map(|r| position.peak_return.max(r))
                .unwrap_or(position.peak_return);

            if position.is_locked(as_of) {
                let remaining =
                    (MIN_HOLDING_PERIOD_SECS - (as_of - position.buy_time)) as f64 / 86_400.0;
                let mut note = format!("T+7 lock, {:.1} days remaining", remaining);
                if quote.is_none() {
                    note.push_str(", no current quote");
                }
                locked_positions.push(LockedPosition {
                    knife_type: position.knife_type.clone(),
                    item_id: position.item_id,
                    item_name: position.item_name.clone(),
                    platform: position.platform,
                    quantity: position.quantity,
                    buy_price: position.buy_price,
                    mark_price: quote.unwrap_or(position.buy_price),
                    current_return: current_return.unwrap_or(0.0),
                    peak_return: effective_peak,
                    holding_days: position.holding_days(as_of),
                    note,
                });
                continue;
            }

            let (Some(mark_price), Some(ret)) = (quote, current_return) else {
                notes.push(format!(
                    "{} [{}]: no current quote, position held",
                    position.item_name, position.platform
                ));
                continue;
            };

            let reasons = self.sell_reasons(&position, ind, ret, effective_peak);
            if !reasons.is_empty() {
                sell_advice.push(SellAdvice {
                    knife_type: position.knife_type.clone(),
                    item_id: position.item_id,
                    item_name: position.item_name.clone(),
                    platform: position.platform,
                    quantity: position.quantity,
                    buy_price: position.buy_price,
                    mark_price,
                    current_return: ret,
                    peak_return: effective_peak,
                    holding_days: position.holding_days(as_of),
                    reasons,
                });
            }
        }

        Ok(AnalysisResult {
            as_of,
            mode: self.mode,
            lookback_hours: self.lookback_hours,
            min_required_hours: self.min_required_hours,
            buy_candidates,
            watchlist,
            sell_advice,
            locked_positions,
            insufficient_series: insufficient,
            notes,
        })
    }

    /// Hard entry filters. `relax` widens every threshold (1.0 = strict).
    fn passes_entry_filters(
        &self,
        ind: &SeriesIndicators,
        cross_ratio: Option<f64>,
        relax: f64,
    ) -> bool {
        let p = self.params;

        match ind.spread {
            Some(spread) if spread <= p.max_spread * relax => {}
            _ => return false,
        }
        if let Some(cr) = cross_ratio {
            if cr < p.cross_low / relax || cr > p.cross_high * relax {
                return false;
            }
        }
        match ind.liquidity_ratio_24h {
            Some(liq) if liq >= p.min_liq_ratio / relax => {}
            _ => return false,
        }
        match ind.momentum_short {
            Some(m) if m >= p.min_fast_over_mid / relax => {}
            _ => return false,
        }
        match ind.momentum_long {
            Some(m) if m >= p.min_mid_over_long / relax => {}
            _ => return false,
        }
        if p.need_mid_slope_pos && !matches!(ind.momentum_mid, Some(s) if s > 0.0) {
            return false;
        }
        true
    }

    fn composite_score(&self, ind: &SeriesIndicators, cross_ratio: Option<f64>) -> f64 {
        let p = self.params;
        let fast = ind.momentum_short.unwrap_or(0.0).max(0.0);
        let long = ind.momentum_long.unwrap_or(0.0).max(0.0);
        let liq = ind.liquidity_ratio_24h.unwrap_or(0.0);
        let cross_neutral = match cross_ratio {
            Some(cr) if cr > 0.0 => 1.0 - (cr - 1.0).abs().min(CROSS_NEUTRAL_BAND) / CROSS_NEUTRAL_BAND,
            _ => 0.0,
        };
        let spread_penalty = match ind.spread {
            Some(s) if s > 0.0 => (s / SPREAD_PENALTY_SCALE).min(1.0),
            _ => 0.0,
        };

        p.w_fast_mom * fast + p.w_long_trend * long + p.w_liq_ratio * liq
            + p.w_cross_neutral * cross_neutral
            - p.w_spread_penalty * spread_penalty
    }

    fn sell_reasons(
        &self,
        position: &Position,
        ind: Option<&SeriesIndicators>,
        current_return: f64,
        effective_peak: f64,
    ) -> Vec<String> {
        let p = self.params;
        let mut reasons = Vec::new();

        if current_return >= p.take_profit {
            reasons.push(format!(
                "take profit: {:+.1}% >= {:.1}%",
                current_return * 100.0,
                p.take_profit * 100.0
            ));
        }
        if current_return <= -p.stop_loss {
            reasons.push(format!(
                "stop loss: {:+.1}% <= -{:.1}%",
                current_return * 100.0,
                p.stop_loss * 100.0
            ));
        }
        if effective_peak >= p.trail_trigger
            && (effective_peak - current_return) >= p.trail_giveback * effective_peak
        {
            reasons.push(format!(
                "trailing stop: peak {:+.1}%, now {:+.1}%",
                effective_peak * 100.0,
                current_return * 100.0
            ));
        }

        if let Some(ind) = ind {
            if matches!(ind.momentum_short, Some(m) if m < 0.0) {
                reasons.push("fast average under mid".to_string());
            }
            if matches!(ind.momentum_mid, Some(s) if s < 0.0) {
                reasons.push("mid trend turning down".to_string());
            }
            if let Some(spread) = ind.spread {
                let ceiling = SPREAD_BLOWOUT_FACTOR * p.max_spread;
                if spread > ceiling {
                    reasons.push(format!(
                        "spread blown out: {:.1}% over {:.1}%",
                        spread * 100.0,
                        ceiling * 100.0
                    ));
                }
            }
            if let Some(liq) = ind.liquidity_ratio_24h {
                if liq < LIQUIDITY_COLLAPSE_FLOOR {
                    reasons.push(format!("liquidity collapsed: {:.2}x", liq));
                }
            }
        }

        if !reasons.is_empty() {
            debug!(
                "Sell triggers for {} [{}]: {}",
                position.item_name,
                position.platform,
                reasons.join("; ")
            );
        }
        reasons
    }
}

/// Evidence-weighted case for adding to or trimming exposure on one pair.
struct AddReduceEstimate {
    add_prob: f64,
    reduce_prob: f64,
    add_signals: Vec<String>,
    reduce_signals: Vec<String>,
}

/// Score the add/reduce rule families into two probabilities.
///
/// Each side's raw score is squashed through a sigmoid with half the
/// opposing score subtracted: one-sided evidence saturates toward 1 while
/// mixed evidence hovers near 0.5. Thresholds here are fixed, not mode
/// presets. Only the qualitative rules push a signal string; the graded
/// momentum votes stay silent.
fn estimate_add_reduce(
    ind: &SeriesIndicators,
    tech: &TechnicalIndicators,
    cross_ratio: Option<f64>,
) -> AddReduceEstimate {
    let mut add = 0.0_f64;
    let mut reduce = 0.0_f64;
    let mut add_signals = Vec::new();
    let mut reduce_signals = Vec::new();

    // Moving-average alignment. Full equality reads as both.
    if let (Some(fast), Some(mid), Some(long)) = (ind.ma_fast, ind.ma_mid, ind.ma_long) {
        if fast >= mid && mid >= long {
            add += 1.2;
            add_signals.push("averages stacked bullish".to_string());
        }
        if fast <= mid && mid <= long {
            reduce += 1.0;
            reduce_signals.push("averages stacked bearish".to_string());
        }
    }

    // Graded momentum votes, capped at one point each.
    if let Some(m) = ind.momentum_short {
        if m > 0.0 {
            add += (m * 20.0).min(1.0);
        } else {
            reduce += (m.abs() * 16.0).min(1.0);
        }
    }
    if let Some(m) = ind.momentum_long {
        if m > 0.0 {
            add += (m * 10.0).min(1.0);
        } else {
            reduce += (m.abs() * 10.0).min(1.0);
        }
    }

    // Oscillator extremes.
    if let Some(rsi) = tech.rsi14 {
        if rsi < 32.0 {
            add += 0.8;
            add_signals.push(format!("rsi oversold ({:.1})", rsi));
        } else if rsi > 68.0 {
            reduce += 0.8;
            reduce_signals.push(format!("rsi overbought ({:.1})", rsi));
        }
    }
    if let Some(pctb) = tech.bb_pctb {
        if pctb <= 0.1 {
            add += 0.6;
            add_signals.push("near lower band".to_string());
        } else if pctb >= 0.9 {
            reduce += 0.6;
            reduce_signals.push("near upper band".to_string());
        }
    }

    // Market quality at the latest row.
    if let Some(spread) = ind.spread {
        if spread <= 0.04 {
            add += 0.3;
        } else if spread >= 0.10 {
            reduce += 0.5;
            reduce_signals.push(format!("wide spread: {:.1}%", spread * 100.0));
        }
    }
    if let Some(liq) = ind.liquidity_ratio_24h {
        if liq >= 1.2 {
            add += 0.3;
        } else if liq < 0.8 {
            reduce += 0.4;
            reduce_signals.push("liquidity fading".to_string());
        }
    }

    // Cross-platform agreement.
    if let Some(cr) = cross_ratio {
        let gap = (cr - 1.0).abs();
        if gap <= 0.02 {
            add += 0.3;
        } else if gap >= 0.08 {
            reduce += 0.4;
            reduce_signals.push(format!("cross-platform divergence: {:.3}", cr));
        }
    }

    AddReduceEstimate {
        add_prob: sigmoid(add - 0.5 * reduce),
        reduce_prob: sigmoid(reduce - 0.5 * add),
        add_signals,
        reduce_signals,
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Compressed indicator readout used as the reason tail.
fn describe_signals(ind: &SeriesIndicators) -> String {
    format!(
        "fast/mid {:+.2}%, mid/long {:+.2}%, liq {:.2}x, spread {:.2}%",
        ind.momentum_short.unwrap_or(0.0) * 100.0,
        ind.momentum_long.unwrap_or(0.0) * 100.0,
        ind.liquidity_ratio_24h.unwrap_or(0.0),
        ind.spread.unwrap_or(0.0) * 100.0,
    )
}

/// Sort by score, then liquidity, then item id, then platform code.
fn rank(pool: &mut [ScoredItem]) {
    pool.sort_by(|a, b| {
        b.composite_score
            .total_cmp(&a.composite_score)
            .then_with(|| b.liquidity_ratio_24h.total_cmp(&a.liquidity_ratio_24h))
            .then_with(|| a.item_id.cmp(&b.item_id))
            .then_with(|| a.platform.code().cmp(&b.platform.code()))
    });
}

/// Whether `a` ranks strictly above `b` under (score, liquidity, item_id).
fn outranks(a: &ScoredItem, b: &ScoredItem) -> bool {
    match a.composite_score.total_cmp(&b.composite_score) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => match a.liquidity_ratio_24h.total_cmp(&b.liquidity_ratio_24h) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => a.item_id < b.item_id,
        },
    }
}
