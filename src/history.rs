//! On-disk history of analysis results.
//!
//! Each successful cycle writes an immutable `reco_YYYYmmdd_HHMMSS.json`
//! snapshot into the history directory and rewrites `realtime_reco.json`,
//! the latest-result pointer the query layer reads. Snapshots older than
//! the retention window are deleted after each write.

use crate::error::Result;
use crate::types::AnalysisResult;
use chrono::{NaiveDateTime, TimeZone, Utc};
use log::{debug, info};
use std::fs;
use std::path::{Path, PathBuf};

/// History files older than this many days are deleted.
pub const HISTORY_RETENTION_DAYS: i64 = 30;

fn snapshot_file_name(as_of: i64) -> String {
    Utc.timestamp_opt(as_of, 0)
        .single()
        .map(|dt| dt.format("reco_%Y%m%d_%H%M%S.json").to_string())
        .unwrap_or_else(|| format!("reco_{as_of}.json"))
}

/// Persist one result: immutable history snapshot plus the latest pointer.
///
/// Returns the history file path.
pub fn save_result(
    history_dir: &str,
    latest_path: &str,
    result: &AnalysisResult,
) -> Result<PathBuf> {
    fs::create_dir_all(history_dir)?;
    let json = serde_json::to_string_pretty(result)?;

    let snapshot_path = Path::new(history_dir).join(snapshot_file_name(result.as_of));
    fs::write(&snapshot_path, &json)?;

    if let Some(parent) = Path::new(latest_path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(latest_path, &json)?;

    info!("📊 Saved analysis snapshot {}", snapshot_path.display());
    Ok(snapshot_path)
}

/// Load the latest published result, if one has ever been written.
pub fn load_latest(latest_path: &str) -> Result<Option<AnalysisResult>> {
    let path = Path::new(latest_path);
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&raw)?))
}

/// Delete history snapshots older than the retention window.
///
/// File age comes from the timestamp embedded in the name; files that do
/// not match the snapshot pattern are left alone.
pub fn prune_history(history_dir: &str, now: i64) -> Result<usize> {
    let dir = Path::new(history_dir);
    if !dir.exists() {
        return Ok(0);
    }

    let cutoff = now - HISTORY_RETENTION_DAYS * 86_400;
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(stamp) = name
            .strip_prefix("reco_")
            .and_then(|s| s.strip_suffix(".json"))
        else {
            continue;
        };
        let Ok(naive) = NaiveDateTime::parse_from_str(stamp, "%Y%m%d_%H%M%S") else {
            debug!("Unparseable history file name {}, skipped", name);
            continue;
        };
        if naive.and_utc().timestamp() < cutoff {
            fs::remove_file(entry.path())?;
            removed += 1;
        }
    }

    if removed > 0 {
        info!("📊 Pruned {} history snapshots past retention", removed);
    }
    Ok(removed)
}
