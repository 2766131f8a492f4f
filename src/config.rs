//! Process configuration from environment variables plus the tracked-items
//! file.
//!
//! Everything has a sensible default except the upstream token; a missing
//! token is allowed at startup (so offline analysis of stored data still
//! works) and surfaces as an auth failure on the first fetch.

use crate::error::Result;
use crate::types::{ItemSpec, Mode, RunMode};
use std::env;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct Config {
    /// CSQAQ API token, sent as the `ApiToken` header.
    pub api_token: String,
    pub base_url: String,
    /// Global request budget in queries per second, shared by all endpoints.
    pub qps: f64,
    pub http_timeout_secs: u64,
    /// Risk profile selecting the scoring preset.
    pub mode: Mode,
    /// Maximum entries per recommendation list.
    pub topk: usize,
    pub lookback_hours: u32,
    /// Override for the mode's minimum coverage requirement.
    pub min_required_hours: Option<u32>,
    pub cycle_interval_secs: u64,
    pub run_mode: RunMode,
    pub db_path: String,
    pub schema_dir: String,
    pub items_path: String,
    pub positions_path: String,
    pub history_dir: String,
    pub latest_result_path: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `CSQAQ_TOKEN` (default: empty, fetches will fail with an auth error)
    /// - `CSQAQ_BASE_URL` (default: https://api.csqaq.com/api/v1)
    /// - `QPS_LIMIT` (default: 0.5, one call every two seconds)
    /// - `HTTP_TIMEOUT_SECS` (default: 10)
    /// - `SIGNAL_MODE` (conservative|moderate|aggressive, default: moderate)
    /// - `TOPK` (default: 8)
    /// - `LOOKBACK_HOURS` (default: 336, fourteen days)
    /// - `MIN_REQUIRED_HOURS` (default: the mode preset's minimum)
    /// - `CYCLE_INTERVAL_SECS` (default: 3600)
    /// - `RUN_MODE` (once|immediate|daemon, default: daemon)
    /// - `SKINFLOW_DB_PATH` (default: data/skinflow.db)
    /// - `SKINFLOW_SCHEMA_DIR` (default: sql)
    /// - `ITEMS_PATH` (default: data/items.json)
    /// - `POSITIONS_PATH` (default: data/positions.json)
    /// - `HISTORY_DIR` (default: data/history)
    /// - `LATEST_RESULT_PATH` (default: data/realtime_reco.json)
    pub fn from_env() -> Self {
        Self {
            api_token: env::var("CSQAQ_TOKEN").unwrap_or_default(),

            base_url: env::var("CSQAQ_BASE_URL")
                .unwrap_or_else(|_| "https://api.csqaq.com/api/v1".to_string()),

            qps: env::var("QPS_LIMIT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.5),

            http_timeout_secs: env::var("HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),

            mode: env::var("SIGNAL_MODE")
                .ok()
                .and_then(|s| Mode::from_str(&s))
                .unwrap_or(Mode::Moderate),

            topk: env::var("TOPK")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(8),

            lookback_hours: env::var("LOOKBACK_HOURS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(336),

            min_required_hours: env::var("MIN_REQUIRED_HOURS")
                .ok()
                .and_then(|s| s.parse().ok()),

            cycle_interval_secs: env::var("CYCLE_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3_600),

            run_mode: env::var("RUN_MODE")
                .ok()
                .and_then(|s| RunMode::from_str(&s))
                .unwrap_or(RunMode::Daemon),

            db_path: env::var("SKINFLOW_DB_PATH")
                .unwrap_or_else(|_| "data/skinflow.db".to_string()),

            schema_dir: env::var("SKINFLOW_SCHEMA_DIR").unwrap_or_else(|_| "sql".to_string()),

            items_path: env::var("ITEMS_PATH").unwrap_or_else(|_| "data/items.json".to_string()),

            positions_path: env::var("POSITIONS_PATH")
                .unwrap_or_else(|_| "data/positions.json".to_string()),

            history_dir: env::var("HISTORY_DIR").unwrap_or_else(|_| "data/history".to_string()),

            latest_result_path: env::var("LATEST_RESULT_PATH")
                .unwrap_or_else(|_| "data/realtime_reco.json".to_string()),
        }
    }
}

/// Load the tracked-items universe from a JSON file.
///
/// The file is a plain array of item specs; see `data/items.json` for the
/// expected shape.
pub fn load_items(path: &str) -> Result<Vec<ItemSpec>> {
    let raw = fs::read_to_string(Path::new(path))?;
    let items: Vec<ItemSpec> = serde_json::from_str(&raw)?;
    Ok(items)
}
