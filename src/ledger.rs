//! Durable book of open positions.
//!
//! ## Storage
//!
//! The whole book lives in one pretty-printed JSON file. It is loaded at
//! startup (a missing file means an empty book) and rewritten after every
//! mutation, so a crash loses at most the in-flight change.
//!
//! ## Lock rule
//!
//! A position cannot be advised for sale before `buy_time + 7 days`. The
//! lock is derived from `buy_time` and the clock on every check; nothing is
//! cached, so the boundary flips exactly at T+7.

use crate::error::{Result, SkinflowError};
use crate::types::Platform;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Minimum holding period before a position becomes sellable (T+7).
pub const MIN_HOLDING_PERIOD_SECS: i64 = 7 * 24 * 3_600;

/// One open position, keyed by (item_id, platform, buy_time).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    #[serde(default)]
    pub knife_type: String,
    pub item_id: i64,
    pub item_name: String,
    pub platform: Platform,
    pub quantity: u32,
    pub buy_price: f64,
    /// Purchase time as epoch seconds. Immutable once recorded.
    pub buy_time: i64,
    /// Best net return seen since purchase. Only ever raised.
    #[serde(default)]
    pub peak_return: f64,
}

impl Position {
    pub fn is_locked(&self, now: i64) -> bool {
        now - self.buy_time < MIN_HOLDING_PERIOD_SECS
    }

    pub fn holding_days(&self, now: i64) -> i64 {
        (now - self.buy_time) / 86_400
    }

    fn matches(&self, item_id: i64, platform: Platform, buy_time: i64) -> bool {
        self.item_id == item_id && self.platform == platform && self.buy_time == buy_time
    }
}

/// Thread-safe handle to the position book.
pub struct PositionLedger {
    path: PathBuf,
    positions: Mutex<Vec<Position>>,
}

impl PositionLedger {
    /// Load the book from `path`; a missing file yields an empty book.
    pub fn load(path: &str) -> Result<Self> {
        let path = PathBuf::from(path);
        let positions = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            serde_json::from_str(&raw)?
        } else {
            Vec::new()
        };

        Ok(Self {
            path,
            positions: Mutex::new(positions),
        })
    }

    /// Record a new purchase.
    ///
    /// Fails with `DuplicateKey` when an open position with the same
    /// (item_id, platform, buy_time) already exists.
    pub fn add(&self, position: Position) -> Result<()> {
        if position.quantity == 0 {
            return Err(SkinflowError::InvalidPosition {
                detail: format!("quantity must be positive for {}", position.item_name),
            });
        }
        if position.buy_price <= 0.0 {
            return Err(SkinflowError::InvalidPosition {
                detail: format!("buy price must be positive for {}", position.item_name),
            });
        }

        let mut positions = self.positions.lock().unwrap();
        if positions
            .iter()
            .any(|p| p.matches(position.item_id, position.platform, position.buy_time))
        {
            return Err(SkinflowError::DuplicateKey {
                item_id: position.item_id,
                platform: position.platform,
                buy_time: position.buy_time,
            });
        }

        positions.push(position);
        self.save(&positions)
    }

    /// Close a position, returning it. Fails with `NotFound` if absent.
    pub fn remove(&self, item_id: i64, platform: Platform, buy_time: i64) -> Result<Position> {
        let mut positions = self.positions.lock().unwrap();
        let index = positions
            .iter()
            .position(|p| p.matches(item_id, platform, buy_time))
            .ok_or(SkinflowError::NotFound {
                item_id,
                platform,
                buy_time,
            })?;

        let removed = positions.remove(index);
        self.save(&positions)?;
        Ok(removed)
    }

    /// Snapshot copy of the book, safe to iterate during analysis.
    pub fn list(&self) -> Vec<Position> {
        self.positions.lock().unwrap().clone()
    }

    /// Raise a position's peak return to `value` if it is an improvement.
    ///
    /// Returns whether the peak moved. A key that no longer exists is a
    /// no-op: the position may have been closed between listing and update.
    pub fn update_peak_return(
        &self,
        item_id: i64,
        platform: Platform,
        buy_time: i64,
        value: f64,
    ) -> Result<bool> {
        let mut positions = self.positions.lock().unwrap();
        let Some(position) = positions
            .iter_mut()
            .find(|p| p.matches(item_id, platform, buy_time))
        else {
            debug!(
                "Peak update for missing position {} on {:?}, skipped",
                item_id, platform
            );
            return Ok(false);
        };

        if value <= position.peak_return {
            return Ok(false);
        }
        position.peak_return = value;
        self.save(&positions)?;
        Ok(true)
    }

    fn save(&self, positions: &[Position]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !Path::new(parent).exists() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(positions)?;
        fs::write(&self.path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_position(item_id: i64, buy_time: i64) -> Position {
        Position {
            knife_type: "karambit".to_string(),
            item_id,
            item_name: format!("Item {item_id}"),
            platform: Platform::Buff,
            quantity: 1,
            buy_price: 1_000.0,
            buy_time,
            peak_return: 0.0,
        }
    }

    fn make_ledger(dir: &tempfile::TempDir) -> PositionLedger {
        let path = dir.path().join("positions.json");
        PositionLedger::load(path.to_str().unwrap()).unwrap()
    }

    #[test]
    fn test_missing_file_is_empty_book() {
        let dir = tempdir().unwrap();
        let ledger = make_ledger(&dir);
        assert!(ledger.list().is_empty());
    }

    #[test]
    fn test_add_persists_across_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("positions.json");

        let ledger = PositionLedger::load(path.to_str().unwrap()).unwrap();
        ledger.add(make_position(1, 1_000)).unwrap();
        ledger.add(make_position(2, 2_000)).unwrap();

        let reloaded = PositionLedger::load(path.to_str().unwrap()).unwrap();
        assert_eq!(reloaded.list(), ledger.list());
        assert_eq!(reloaded.list().len(), 2);
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let dir = tempdir().unwrap();
        let ledger = make_ledger(&dir);
        ledger.add(make_position(1, 1_000)).unwrap();

        let err = ledger.add(make_position(1, 1_000)).unwrap_err();
        assert!(matches!(err, SkinflowError::DuplicateKey { .. }));
        assert_eq!(ledger.list().len(), 1);
    }

    #[test]
    fn test_invalid_position_rejected() {
        let dir = tempdir().unwrap();
        let ledger = make_ledger(&dir);

        let mut zero_qty = make_position(1, 1_000);
        zero_qty.quantity = 0;
        assert!(matches!(
            ledger.add(zero_qty).unwrap_err(),
            SkinflowError::InvalidPosition { .. }
        ));

        let mut free_buy = make_position(1, 1_000);
        free_buy.buy_price = 0.0;
        assert!(matches!(
            ledger.add(free_buy).unwrap_err(),
            SkinflowError::InvalidPosition { .. }
        ));
    }

    #[test]
    fn test_remove_returns_position() {
        let dir = tempdir().unwrap();
        let ledger = make_ledger(&dir);
        ledger.add(make_position(1, 1_000)).unwrap();

        let removed = ledger.remove(1, Platform::Buff, 1_000).unwrap();
        assert_eq!(removed.item_id, 1);
        assert!(ledger.list().is_empty());

        let err = ledger.remove(1, Platform::Buff, 1_000).unwrap_err();
        assert!(matches!(err, SkinflowError::NotFound { .. }));
    }

    #[test]
    fn test_peak_return_is_monotonic() {
        let dir = tempdir().unwrap();
        let ledger = make_ledger(&dir);
        ledger.add(make_position(1, 1_000)).unwrap();

        assert!(ledger
            .update_peak_return(1, Platform::Buff, 1_000, 0.08)
            .unwrap());
        assert!(!ledger
            .update_peak_return(1, Platform::Buff, 1_000, 0.05)
            .unwrap());
        assert_eq!(ledger.list()[0].peak_return, 0.08);

        // Unknown key is a silent no-op.
        assert!(!ledger
            .update_peak_return(99, Platform::Buff, 1_000, 0.5)
            .unwrap());
    }

    #[test]
    fn test_lock_boundary_is_exact() {
        let position = make_position(1, 1_000_000);
        let unlock_at = 1_000_000 + MIN_HOLDING_PERIOD_SECS;

        assert!(position.is_locked(unlock_at - 1));
        assert!(!position.is_locked(unlock_at));
        assert!(!position.is_locked(unlock_at + 1));
        assert_eq!(position.holding_days(unlock_at), 7);
    }
}
