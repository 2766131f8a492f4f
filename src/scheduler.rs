//! Cycle scheduler - periodic ingestion and analysis driver
//!
//! ## Cycle shape
//!
//! One cycle fetches current quotes for every tracked item, appends them
//! to the snapshot store, runs the signal engine, calls out strong
//! add/reduce odds, persists the result, and publishes it to the shared
//! latest-result handle. Cycles run
//! strictly one at a time: the tick loop awaits the cycle inline, and an
//! overrunning cycle makes the ticker skip missed ticks instead of
//! bursting them.
//!
//! ## Failure containment
//!
//! A failed fetch for one item becomes a note on the cycle's result, not
//! a failed cycle. When every item fails the cycle degrades: the previous
//! result is republished with a staleness note and no history snapshot is
//! written. Shutdown is honored between per-item fetches, never mid-call.

use crate::client::{ChartSeries, MarketDataSource, PairPrice};
use crate::config::Config;
use crate::engine::Engine;
use crate::error::Result;
use crate::history;
use crate::ledger::PositionLedger;
use crate::store::SnapshotStore;
use crate::types::{AnalysisResult, ItemSpec, MarketSnapshot, Platform, RunMode};
use chrono::Utc;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Add/reduce probability at which a scored pair is called out in the log.
const ALERT_PROBABILITY: f64 = 0.80;

/// Drives the hourly ingestion+analysis loop for one item universe.
pub struct Scheduler<M: MarketDataSource> {
    source: M,
    store: SnapshotStore,
    engine: Engine,
    ledger: Arc<PositionLedger>,
    items: Vec<ItemSpec>,
    platforms: Vec<Platform>,
    run_mode: RunMode,
    cycle_interval: Duration,
    lookback_hours: u32,
    history_dir: String,
    latest_result_path: String,
    latest: Arc<RwLock<Option<AnalysisResult>>>,
}

impl<M: MarketDataSource> Scheduler<M> {
    /// Arguments:
    /// - `source`: upstream market data client
    /// - `store`: snapshot store shared with the engine
    /// - `engine`: scoring engine over the same item universe
    /// - `ledger`: open positions, read each cycle
    /// - `items`: tracked items, fetched in order every cycle
    /// - `config`: run mode, interval, lookback, output paths
    pub fn new(
        source: M,
        store: SnapshotStore,
        engine: Engine,
        ledger: Arc<PositionLedger>,
        items: Vec<ItemSpec>,
        config: &Config,
    ) -> Self {
        // A previously published result lets the first degraded cycle
        // after a restart still serve something.
        let previous = match history::load_latest(&config.latest_result_path) {
            Ok(Some(result)) => {
                info!(
                    "📊 Loaded previous analysis from {} (as of {})",
                    config.latest_result_path, result.as_of
                );
                Some(result)
            }
            Ok(None) => None,
            Err(err) => {
                warn!("⚠️ Could not load previous analysis: {}", err);
                None
            }
        };

        Self {
            source,
            store,
            engine,
            ledger,
            items,
            platforms: Platform::default_universe(),
            run_mode: config.run_mode,
            cycle_interval: Duration::from_secs(config.cycle_interval_secs.max(1)),
            lookback_hours: config.lookback_hours,
            history_dir: config.history_dir.clone(),
            latest_result_path: config.latest_result_path.clone(),
            latest: Arc::new(RwLock::new(previous)),
        }
    }

    /// Shared handle to the most recently published result. Readers see
    /// either the previous or the new result, never a partial one.
    pub fn latest(&self) -> Arc<RwLock<Option<AnalysisResult>>> {
        self.latest.clone()
    }

    /// Run the configured mode to completion.
    ///
    /// - `once`: one cycle, then return
    /// - `immediate`: one cycle now, then the interval loop
    /// - `daemon`: first cycle after one full interval
    ///
    /// The loop exits when `shutdown` flips to true. A failed cycle is
    /// logged and the loop waits for the next tick.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        if self.items.is_empty() {
            warn!("⚠️ No items configured, cycles will produce empty results");
        }

        match self.run_mode {
            RunMode::Once => {
                self.run_cycle(&shutdown).await?;
                return Ok(());
            }
            RunMode::Immediate => {
                if let Err(err) = self.run_cycle(&shutdown).await {
                    error!("❌ Cycle failed: {}", err);
                }
            }
            RunMode::Daemon => {
                info!(
                    "⏰ First cycle in {}s",
                    self.cycle_interval.as_secs()
                );
            }
        }

        let mut ticker = interval_at(Instant::now() + self.cycle_interval, self.cycle_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    if let Err(err) = self.run_cycle(&shutdown).await {
                        error!("❌ Cycle failed: {}", err);
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = shutdown.changed() => {
                    break;
                }
            }
        }

        info!("✅ Scheduler stopped");
        Ok(())
    }

    /// One full ingestion+analysis cycle.
    pub async fn run_cycle(&self, shutdown: &watch::Receiver<bool>) -> Result<()> {
        let started = std::time::Instant::now();
        let now = Utc::now().timestamp();
        let stamp = now - now % 3600;
        let floor = stamp - i64::from(self.lookback_hours) * 3600;
        info!("🔄 Cycle starting ({} items, hour {})", self.items.len(), stamp);

        let mut fetch_failures = 0usize;
        let mut cycle_notes = Vec::new();
        let mut appended = 0usize;

        for (done, item) in self.items.iter().enumerate() {
            if *shutdown.borrow() {
                warn!(
                    "⚠️ Cycle aborted by shutdown after {}/{} items",
                    done,
                    self.items.len()
                );
                return Ok(());
            }

            self.backfill_if_empty(item, floor).await;

            match self.source.fetch_pair_price(item).await {
                Ok(Some(price)) => {
                    let rows = snapshots_from_pair(item, &price, stamp);
                    if rows.is_empty() {
                        debug!("{} quote carried no usable sell price", item.item_name);
                    }
                    appended += self.store.append(&rows)?;
                }
                Ok(None) => {
                    cycle_notes.push(format!("{}: upstream has no quote", item.item_name));
                }
                Err(err) => {
                    warn!("⚠️ Fetch failed for {}: {}", item.item_name, err);
                    fetch_failures += 1;
                    cycle_notes.push(format!("{}: fetch failed ({})", item.item_name, err));
                }
            }
        }

        if !self.items.is_empty() && fetch_failures == self.items.len() {
            self.republish_previous(now).await;
            return Ok(());
        }

        debug!("Appended {} new snapshot rows", appended);

        let mut result = self.engine.analyze(now, self.ledger.as_ref())?;
        result.notes.extend(cycle_notes);

        let mut alerts = 0usize;
        for scored in result.buy_candidates.iter().chain(result.watchlist.iter()) {
            if let Some(p) = scored.add_prob.filter(|p| *p >= ALERT_PROBABILITY) {
                alerts += 1;
                info!(
                    "⚡ Add signal {} [{}]: {:.0}% ({})",
                    scored.item_name,
                    scored.platform,
                    p * 100.0,
                    alert_context(&scored.add_signals)
                );
            }
            if let Some(p) = scored.reduce_prob.filter(|p| *p >= ALERT_PROBABILITY) {
                alerts += 1;
                warn!(
                    "⚠️ Reduce signal {} [{}]: {:.0}% ({})",
                    scored.item_name,
                    scored.platform,
                    p * 100.0,
                    alert_context(&scored.reduce_signals)
                );
            }
        }

        history::save_result(&self.history_dir, &self.latest_result_path, &result)?;
        if let Err(err) = history::prune_history(&self.history_dir, now) {
            warn!("⚠️ History prune failed: {}", err);
        }
        self.store.prune_older_than(floor)?;

        info!(
            "📊 Cycle complete: {} candidates, {} watchlist, {} sell advice, {} alerts, {} locked, {} insufficient in {:.1}s",
            result.buy_candidates.len(),
            result.watchlist.len(),
            result.sell_advice.len(),
            alerts,
            result.locked_positions.len(),
            result.insufficient_series.len(),
            started.elapsed().as_secs_f64()
        );

        *self.latest.write().await = Some(result);
        Ok(())
    }

    /// Total-outage fallback: keep serving the previous result, marked
    /// stale. No history snapshot is written for a degraded cycle.
    async fn republish_previous(&self, now: i64) {
        let mut guard = self.latest.write().await;
        match guard.take() {
            Some(mut previous) => {
                // Keep a single staleness marker, freshest wins.
                previous.notes.retain(|note| !note.starts_with("stale:"));
                previous.notes.push(format!(
                    "stale: upstream unreachable at {}, data as of {}",
                    now, previous.as_of
                ));
                warn!(
                    "⚠️ Upstream unreachable for every item, republishing analysis from {}",
                    previous.as_of
                );
                *guard = Some(previous);
            }
            None => {
                error!("❌ Upstream unreachable and no previous analysis to fall back on");
            }
        }
    }

    /// Seed hourly history for pairs the store has never seen, so a
    /// fresh deployment does not wait out a full warm-up window.
    /// Best-effort: failures are logged and the cycle continues.
    async fn backfill_if_empty(&self, item: &ItemSpec, floor: i64) {
        for &platform in &self.platforms {
            let known = match self.store.latest_timestamp(item.item_id, platform) {
                Ok(ts) => ts.is_some(),
                Err(err) => {
                    warn!("⚠️ Store lookup failed for {}: {}", item.item_name, err);
                    continue;
                }
            };
            if known {
                continue;
            }

            match self.source.fetch_hourly_sell_history(item, platform).await {
                Ok(series) => {
                    let rows = seed_rows(item.item_id, platform, &series, floor);
                    if rows.is_empty() {
                        debug!(
                            "No seedable history for {} [{}]",
                            item.item_name,
                            platform.as_str()
                        );
                        continue;
                    }
                    match self.store.append(&rows) {
                        Ok(count) => info!(
                            "⏳ Seeded {} hourly rows for {} [{}]",
                            count,
                            item.item_name,
                            platform.as_str()
                        ),
                        Err(err) => {
                            warn!("⚠️ Seeding append failed for {}: {}", item.item_name, err)
                        }
                    }
                }
                Err(err) => {
                    warn!(
                        "⚠️ History fetch failed for {} [{}]: {}",
                        item.item_name,
                        platform.as_str(),
                        err
                    );
                }
            }
        }
    }
}

/// Current-quote rows for the two quoted platforms. A platform without a
/// positive sell price contributes nothing.
fn snapshots_from_pair(item: &ItemSpec, price: &PairPrice, timestamp: i64) -> Vec<MarketSnapshot> {
    let quoted = [
        (
            Platform::Buff,
            price.buff_sell_price,
            price.buff_buy_price,
            price.buff_sell_num,
            price.buff_buy_num,
        ),
        (
            Platform::Yyyp,
            price.yyyp_sell_price,
            price.yyyp_buy_price,
            price.yyyp_sell_num,
            price.yyyp_buy_num,
        ),
    ];

    let mut rows = Vec::new();
    for (platform, sell, buy, sell_num, buy_num) in quoted {
        let sell = match sell {
            Some(v) if v > 0.0 => v,
            _ => continue,
        };
        rows.push(MarketSnapshot {
            item_id: item.item_id,
            platform,
            timestamp,
            sell_price: sell,
            // Depth on both sides counts toward traded volume.
            buy_price: buy.unwrap_or(0.0),
            volume: sell_num.unwrap_or(0.0) + buy_num.unwrap_or(0.0),
        });
    }
    rows
}

/// Sell-only seed rows from a chart series. Chart timestamps arrive in
/// epoch milliseconds and are truncated to the hour; rows older than
/// `floor` are dropped since the store would prune them anyway.
fn seed_rows(
    item_id: i64,
    platform: Platform,
    series: &ChartSeries,
    floor: i64,
) -> Vec<MarketSnapshot> {
    let mut rows = Vec::new();
    for (ts_ms, value) in series.timestamp.iter().zip(series.main_data.iter()) {
        let sell = match value {
            Some(v) if *v > 0.0 => *v,
            _ => continue,
        };
        let ts = ts_ms / 1000;
        let hour = ts - ts % 3600;
        if hour < floor {
            continue;
        }
        rows.push(MarketSnapshot {
            item_id,
            platform,
            timestamp: hour,
            sell_price: sell,
            buy_price: 0.0,
            volume: 0.0,
        });
    }
    rows
}

/// First three signals behind an alert. A high probability can come from
/// the graded momentum rules alone, which leave no signal strings.
fn alert_context(signals: &[String]) -> String {
    if signals.is_empty() {
        return "graded rules only".to_string();
    }
    signals
        .iter()
        .take(3)
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join("; ")
}
