//! Core data types shared across the pipeline.
//!
//! Timestamps are unix seconds (UTC) throughout. Result payloads mirror
//! the JSON shape the query layer serves, so everything here derives
//! `Serialize`/`Deserialize`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Marketplace a price was observed on.
///
/// Wire codes follow the upstream convention: 1=BUFF, 2=YYYP, 3=Steam.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Platform {
    Buff,
    Yyyp,
    Steam,
}

impl Platform {
    /// Numeric platform code used by the upstream API.
    pub fn code(&self) -> i64 {
        match self {
            Platform::Buff => 1,
            Platform::Yyyp => 2,
            Platform::Steam => 3,
        }
    }

    pub fn from_code(code: i64) -> Option<Platform> {
        match code {
            1 => Some(Platform::Buff),
            2 => Some(Platform::Yyyp),
            3 => Some(Platform::Steam),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Buff => "BUFF",
            Platform::Yyyp => "YYYP",
            Platform::Steam => "STEAM",
        }
    }

    /// Platforms fetched and scored by default. Steam quotes are too far
    /// off the two CN marketplaces to share one cross-platform band.
    pub fn default_universe() -> Vec<Platform> {
        vec![Platform::Buff, Platform::Yyyp]
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Risk profile selecting a weight/threshold preset for scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Conservative,
    Moderate,
    Aggressive,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Conservative => "conservative",
            Mode::Moderate => "moderate",
            Mode::Aggressive => "aggressive",
        }
    }

    pub fn from_str(s: &str) -> Option<Mode> {
        match s.to_ascii_lowercase().as_str() {
            "conservative" => Some(Mode::Conservative),
            "moderate" => Some(Mode::Moderate),
            "aggressive" => Some(Mode::Aggressive),
            _ => None,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// K-line resolution accepted by the upstream chart endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KlinePeriod {
    Hour1,
    Day1,
    Week1,
    Month1,
}

impl KlinePeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            KlinePeriod::Hour1 => "1hour",
            KlinePeriod::Day1 => "1day",
            KlinePeriod::Week1 => "1week",
            KlinePeriod::Month1 => "1month",
        }
    }
}

/// How the scheduler loop is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Single cycle, then exit.
    Once,
    /// One cycle now, then the interval loop.
    Immediate,
    /// Pure interval loop; first cycle after one full interval.
    Daemon,
}

impl RunMode {
    pub fn from_str(s: &str) -> Option<RunMode> {
        match s.to_ascii_lowercase().as_str() {
            "once" => Some(RunMode::Once),
            "immediate" => Some(RunMode::Immediate),
            "daemon" => Some(RunMode::Daemon),
            _ => None,
        }
    }
}

/// One tracked item of the fetch universe, loaded from the items file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemSpec {
    pub item_id: i64,
    pub market_hash_name: String,
    pub item_name: String,
    /// Category label carried through to positions (e.g. knife family).
    #[serde(default)]
    pub knife_type: String,
}

/// One timestamped price/volume observation for an item on a platform.
///
/// Immutable once recorded. `volume` is the combined sell-listing and
/// buy-order count for the hour; the upstream reports the two counts
/// separately and ingestion sums them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub item_id: i64,
    pub platform: Platform,
    pub timestamp: i64,
    pub sell_price: f64,
    pub buy_price: f64,
    pub volume: f64,
}

/// One scored item inside an `AnalysisResult`. Recomputed every cycle,
/// never persisted on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredItem {
    pub item_id: i64,
    pub item_name: String,
    pub platform: Platform,
    pub price_sell: f64,
    pub price_buy: Option<f64>,
    pub spread: Option<f64>,
    pub liquidity_ratio_24h: f64,
    /// Fast moving average over the mid average, minus one.
    pub momentum_short: Option<f64>,
    /// Slope of the mid average over the trailing six hours.
    pub momentum_mid: Option<f64>,
    /// Mid moving average over the long average, minus one.
    pub momentum_long: Option<f64>,
    pub cross_ratio: Option<f64>,
    pub composite_score: f64,
    pub reason: String,
    /// Rule-scored probability that adding to the position pays off.
    pub add_prob: Option<f64>,
    /// Rule-scored probability that trimming the position pays off.
    pub reduce_prob: Option<f64>,
    /// Signals behind each probability, strongest rules first.
    #[serde(default)]
    pub add_signals: Vec<String>,
    #[serde(default)]
    pub reduce_signals: Vec<String>,
}

/// Sell recommendation for one open position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SellAdvice {
    pub knife_type: String,
    pub item_id: i64,
    pub item_name: String,
    pub platform: Platform,
    pub quantity: u32,
    pub buy_price: f64,
    /// Latest sell quote used to mark the position.
    pub mark_price: f64,
    /// Net-of-fees return at the mark price.
    pub current_return: f64,
    pub peak_return: f64,
    pub holding_days: i64,
    pub reasons: Vec<String>,
}

/// An open position still inside its minimum holding period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockedPosition {
    pub knife_type: String,
    pub item_id: i64,
    pub item_name: String,
    pub platform: Platform,
    pub quantity: u32,
    pub buy_price: f64,
    pub mark_price: f64,
    pub current_return: f64,
    pub peak_return: f64,
    pub holding_days: i64,
    pub note: String,
}

/// Output of one analysis cycle. Created atomically per scheduler tick;
/// previous results live on as append-only history files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub as_of: i64,
    pub mode: Mode,
    pub lookback_hours: u32,
    pub min_required_hours: u32,
    pub buy_candidates: Vec<ScoredItem>,
    pub watchlist: Vec<ScoredItem>,
    pub sell_advice: Vec<SellAdvice>,
    pub locked_positions: Vec<LockedPosition>,
    /// Item/platform series that lacked enough history this cycle.
    pub insufficient_series: Vec<String>,
    pub notes: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_codes_round_trip() {
        for platform in [Platform::Buff, Platform::Yyyp, Platform::Steam] {
            assert_eq!(Platform::from_code(platform.code()), Some(platform));
        }
        assert_eq!(Platform::from_code(0), None);
        assert_eq!(Platform::from_code(4), None);
    }

    #[test]
    fn test_platform_serializes_uppercase() {
        let json = serde_json::to_string(&Platform::Buff).unwrap();
        assert_eq!(json, "\"BUFF\"");
        let back: Platform = serde_json::from_str("\"YYYP\"").unwrap();
        assert_eq!(back, Platform::Yyyp);
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!(Mode::from_str("Conservative"), Some(Mode::Conservative));
        assert_eq!(Mode::from_str("MODERATE"), Some(Mode::Moderate));
        assert_eq!(Mode::from_str("aggressive"), Some(Mode::Aggressive));
        assert_eq!(Mode::from_str("yolo"), None);
    }

    #[test]
    fn test_kline_period_wire_names() {
        assert_eq!(KlinePeriod::Hour1.as_str(), "1hour");
        assert_eq!(KlinePeriod::Day1.as_str(), "1day");
        assert_eq!(KlinePeriod::Week1.as_str(), "1week");
        assert_eq!(KlinePeriod::Month1.as_str(), "1month");
    }

    #[test]
    fn test_run_mode_from_str() {
        assert_eq!(RunMode::from_str("once"), Some(RunMode::Once));
        assert_eq!(RunMode::from_str("immediate"), Some(RunMode::Immediate));
        assert_eq!(RunMode::from_str("daemon"), Some(RunMode::Daemon));
        assert_eq!(RunMode::from_str(""), None);
    }

    #[test]
    fn test_item_spec_tolerates_missing_knife_type() {
        let json = r#"{"item_id": 14896, "market_hash_name": "★ Butterfly Knife | Doppler (Factory New)", "item_name": "Butterfly Doppler FN"}"#;
        let spec: ItemSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.item_id, 14896);
        assert!(spec.knife_type.is_empty());
    }
}
