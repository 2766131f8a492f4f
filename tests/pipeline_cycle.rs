//! Integration tests for the full ingestion+analysis cycle
//!
//! Tests drive `Scheduler::run_cycle` against a scripted market data
//! source and real on-disk state (SQLite store, JSON ledger, history
//! directory), verifying:
//! - Seeding, quote ingestion, scoring, and persistence in one cycle
//! - Per-item fetch failures degrade to notes, not failed cycles
//! - Total upstream outage republishes the previous result as stale
//! - Shutdown is honored before any per-item fetch
//! - Re-running a cycle in the same hour stays idempotent

#[cfg(test)]
mod pipeline_cycle_tests {
    use async_trait::async_trait;
    use skinflow::client::{ChartSeries, MarketDataSource, PairPrice};
    use skinflow::config::Config;
    use skinflow::engine::Engine;
    use skinflow::error::{Result, SkinflowError};
    use skinflow::ledger::{Position, PositionLedger};
    use skinflow::scheduler::Scheduler;
    use skinflow::store::SnapshotStore;
    use skinflow::types::{ItemSpec, Mode, Platform, RunMode};
    use std::collections::{HashMap, HashSet};
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::watch;

    /// Scripted upstream: fixed quotes and chart history per item, with
    /// switchable failure behavior and call counters.
    struct MockSource {
        quotes: HashMap<String, PairPrice>,
        history: HashMap<(i64, i64), ChartSeries>,
        fail_names: HashSet<String>,
        fail_all: AtomicBool,
        price_calls: AtomicUsize,
        history_calls: AtomicUsize,
    }

    impl MockSource {
        fn new(
            quotes: HashMap<String, PairPrice>,
            history: HashMap<(i64, i64), ChartSeries>,
        ) -> Arc<Self> {
            Arc::new(Self {
                quotes,
                history,
                fail_names: HashSet::new(),
                fail_all: AtomicBool::new(false),
                price_calls: AtomicUsize::new(0),
                history_calls: AtomicUsize::new(0),
            })
        }

        fn outage(&self) -> SkinflowError {
            SkinflowError::TransientFetch {
                endpoint: "batch_price".to_string(),
                attempts: 5,
                message: "mock outage".to_string(),
            }
        }
    }

    #[async_trait]
    impl MarketDataSource for MockSource {
        async fn fetch_pair_price(&self, item: &ItemSpec) -> Result<Option<PairPrice>> {
            self.price_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_all.load(Ordering::SeqCst)
                || self.fail_names.contains(&item.market_hash_name)
            {
                return Err(self.outage());
            }
            Ok(self.quotes.get(&item.market_hash_name).cloned())
        }

        async fn fetch_hourly_sell_history(
            &self,
            item: &ItemSpec,
            platform: Platform,
        ) -> Result<ChartSeries> {
            self.history_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_all.load(Ordering::SeqCst) {
                return Err(self.outage());
            }
            Ok(self
                .history
                .get(&(item.item_id, platform.code()))
                .cloned()
                .unwrap_or_default())
        }
    }

    /// Shared handle the scheduler can own: the orphan rule forbids
    /// implementing the foreign `MarketDataSource` trait on `Arc<MockSource>`
    /// directly, so this local newtype forwards to the inner mock.
    struct SharedSource(Arc<MockSource>);

    #[async_trait]
    impl MarketDataSource for SharedSource {
        async fn fetch_pair_price(&self, item: &ItemSpec) -> Result<Option<PairPrice>> {
            self.0.fetch_pair_price(item).await
        }

        async fn fetch_hourly_sell_history(
            &self,
            item: &ItemSpec,
            platform: Platform,
        ) -> Result<ChartSeries> {
            self.0.fetch_hourly_sell_history(item, platform).await
        }
    }

    fn make_config(root: &Path) -> Config {
        Config {
            api_token: String::new(),
            base_url: "http://localhost".to_string(),
            qps: 1000.0,
            http_timeout_secs: 10,
            mode: Mode::Aggressive,
            topk: 8,
            lookback_hours: 336,
            min_required_hours: None,
            cycle_interval_secs: 3600,
            run_mode: RunMode::Once,
            db_path: root.join("skinflow.db").to_string_lossy().into_owned(),
            schema_dir: "sql".to_string(),
            items_path: root.join("items.json").to_string_lossy().into_owned(),
            positions_path: root.join("positions.json").to_string_lossy().into_owned(),
            history_dir: root.join("history").to_string_lossy().into_owned(),
            latest_result_path: root
                .join("realtime_reco.json")
                .to_string_lossy()
                .into_owned(),
        }
    }

    fn make_item(item_id: i64, name: &str) -> ItemSpec {
        ItemSpec {
            item_id,
            market_hash_name: format!("★ {name} (Factory New)"),
            item_name: name.to_string(),
            knife_type: String::new(),
        }
    }

    fn hour_floor(ts: i64) -> i64 {
        ts - ts % 3600
    }

    /// Hourly rising sell-price chart ending at the hour before `stamp`,
    /// timestamps in epoch milliseconds as the upstream sends them.
    fn rising_history(stamp: i64, hours: i64, base: f64, step: f64) -> ChartSeries {
        let mut timestamp = Vec::new();
        let mut main_data = Vec::new();
        for k in 0..hours {
            timestamp.push((stamp - (hours - k) * 3600) * 1000);
            main_data.push(Some(base + step * k as f64));
        }
        ChartSeries {
            timestamp,
            main_data,
        }
    }

    /// Identical quote on both platforms: tight spread, neutral cross
    /// ratio, `2 * num` volume per platform.
    fn pair_quote(sell: f64, buy: f64, num: f64) -> PairPrice {
        PairPrice {
            buff_sell_price: Some(sell),
            buff_buy_price: Some(buy),
            buff_sell_num: Some(num),
            buff_buy_num: Some(num),
            yyyp_sell_price: Some(sell),
            yyyp_buy_price: Some(buy),
            yyyp_sell_num: Some(num),
            yyyp_buy_num: Some(num),
        }
    }

    #[tokio::test]
    async fn test_full_cycle_seeds_scores_and_persists() {
        // Test: one cycle against an empty store seeds chart history,
        // ingests the live quote, produces candidates and sell advice,
        // and persists the result. A second cycle in the same hour is
        // idempotent.
        let dir = tempfile::tempdir().unwrap();
        let config = make_config(dir.path());
        let now = chrono::Utc::now().timestamp();
        let stamp = hour_floor(now);

        let item = make_item(1, "Bayonet Tiger Tooth");
        let mut quotes = HashMap::new();
        quotes.insert(item.market_hash_name.clone(), pair_quote(112.5, 112.0, 15.0));
        let mut history = HashMap::new();
        history.insert(
            (1, Platform::Buff.code()),
            rising_history(stamp, 120, 100.0, 0.1),
        );
        history.insert(
            (1, Platform::Yyyp.code()),
            rising_history(stamp, 120, 100.0, 0.1),
        );
        let mock = MockSource::new(quotes, history);

        let store = SnapshotStore::open(&config.db_path, &config.schema_dir).unwrap();
        let ledger = Arc::new(PositionLedger::load(&config.positions_path).unwrap());
        // Matured position bought well below the current quote.
        ledger
            .add(Position {
                knife_type: String::new(),
                item_id: 1,
                item_name: "Bayonet Tiger Tooth".to_string(),
                platform: Platform::Buff,
                quantity: 1,
                buy_price: 80.0,
                buy_time: now - 8 * 24 * 3600,
                peak_return: 0.0,
            })
            .unwrap();

        let engine = Engine::new(
            store.clone(),
            vec![item.clone()],
            config.mode,
            config.topk,
            config.lookback_hours,
            config.min_required_hours,
        );
        let scheduler = Scheduler::new(
            SharedSource(mock.clone()),
            store.clone(),
            engine,
            ledger.clone(),
            vec![item],
            &config,
        );

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        scheduler.run_cycle(&shutdown_rx).await.unwrap();

        {
            let latest = scheduler.latest();
            let guard = latest.read().await;
            let result = guard.as_ref().expect("cycle should publish a result");

            assert_eq!(result.mode, Mode::Aggressive);
            assert!(
                !result.buy_candidates.is_empty(),
                "rising liquid series should produce candidates"
            );
            assert!(result.insufficient_series.is_empty());

            // Every scored pair carries the add/reduce estimate.
            let top = &result.buy_candidates[0];
            assert!(top.add_prob.is_some());
            assert!(top.reduce_prob.is_some());

            // Unlocked position at +37.8% net triggers take profit.
            assert_eq!(result.sell_advice.len(), 1);
            assert!(result.sell_advice[0]
                .reasons
                .iter()
                .any(|r| r.starts_with("take profit")));
            assert!(result.locked_positions.is_empty());
        }

        // Peak return was refreshed through the cycle.
        assert!(ledger.list()[0].peak_return > 0.3);

        // Persisted artifacts: latest pointer plus one history snapshot.
        assert!(Path::new(&config.latest_result_path).exists());
        assert_eq!(fs::read_dir(&config.history_dir).unwrap().count(), 1);

        // One seeding call per platform, 120 seeded rows + 1 live row.
        assert_eq!(mock.history_calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.series(1, Platform::Buff, 0).unwrap().len(), 121);

        // Second cycle in the same hour: no re-seeding, no duplicates.
        scheduler.run_cycle(&shutdown_rx).await.unwrap();
        assert_eq!(mock.history_calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.series(1, Platform::Buff, 0).unwrap().len(), 121);
    }

    #[tokio::test]
    async fn test_failed_item_becomes_note_not_failed_cycle() {
        // Test: one item failing its fetch leaves a note on the result
        // while the healthy item is still scored and persisted.
        let dir = tempfile::tempdir().unwrap();
        let config = make_config(dir.path());
        let stamp = hour_floor(chrono::Utc::now().timestamp());

        let good = make_item(1, "Karambit Fade");
        let bad = make_item(2, "Talon Knife Slaughter");
        let mut quotes = HashMap::new();
        quotes.insert(good.market_hash_name.clone(), pair_quote(220.0, 219.0, 20.0));
        let mut history = HashMap::new();
        history.insert(
            (1, Platform::Buff.code()),
            rising_history(stamp, 120, 200.0, 0.2),
        );
        history.insert(
            (1, Platform::Yyyp.code()),
            rising_history(stamp, 120, 200.0, 0.2),
        );
        let mut mock = MockSource::new(quotes, history);
        Arc::get_mut(&mut mock)
            .unwrap()
            .fail_names
            .insert(bad.market_hash_name.clone());

        let store = SnapshotStore::open(&config.db_path, &config.schema_dir).unwrap();
        let ledger = Arc::new(PositionLedger::load(&config.positions_path).unwrap());
        let items = vec![good, bad];
        let engine = Engine::new(
            store.clone(),
            items.clone(),
            config.mode,
            config.topk,
            config.lookback_hours,
            config.min_required_hours,
        );
        let scheduler = Scheduler::new(SharedSource(mock), store, engine, ledger, items, &config);

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        scheduler.run_cycle(&shutdown_rx).await.unwrap();

        let latest = scheduler.latest();
        let guard = latest.read().await;
        let result = guard.as_ref().expect("partial failure still publishes");

        assert!(!result.buy_candidates.is_empty());
        assert!(result
            .notes
            .iter()
            .any(|n| n.starts_with("Talon Knife Slaughter: fetch failed")));

        // The failed item has no rows at all, so both its platform
        // series are reported as insufficient.
        let missing: Vec<_> = result
            .insufficient_series
            .iter()
            .filter(|entry| entry.starts_with("Talon Knife Slaughter"))
            .collect();
        assert_eq!(missing.len(), 2);

        // Not a degraded cycle: the history snapshot was written.
        assert_eq!(fs::read_dir(&config.history_dir).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_total_outage_republishes_previous_as_stale() {
        // Test: when every fetch fails, the previous result is served
        // again with a single staleness note and no new history file.
        let dir = tempfile::tempdir().unwrap();
        let config = make_config(dir.path());
        let stamp = hour_floor(chrono::Utc::now().timestamp());

        let item = make_item(1, "Butterfly Knife Doppler");
        let mut quotes = HashMap::new();
        quotes.insert(item.market_hash_name.clone(), pair_quote(900.0, 895.0, 10.0));
        let mut history = HashMap::new();
        history.insert(
            (1, Platform::Buff.code()),
            rising_history(stamp, 120, 850.0, 0.5),
        );
        history.insert(
            (1, Platform::Yyyp.code()),
            rising_history(stamp, 120, 850.0, 0.5),
        );
        let mock = MockSource::new(quotes, history);

        let store = SnapshotStore::open(&config.db_path, &config.schema_dir).unwrap();
        let ledger = Arc::new(PositionLedger::load(&config.positions_path).unwrap());
        let engine = Engine::new(
            store.clone(),
            vec![item.clone()],
            config.mode,
            config.topk,
            config.lookback_hours,
            config.min_required_hours,
        );
        let scheduler = Scheduler::new(
            SharedSource(mock.clone()),
            store,
            engine,
            ledger,
            vec![item],
            &config,
        );

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        // 1. Healthy cycle establishes a result.
        scheduler.run_cycle(&shutdown_rx).await.unwrap();
        let healthy_as_of = {
            let latest = scheduler.latest();
            let guard = latest.read().await;
            let result = guard.as_ref().unwrap();
            assert!(result.notes.iter().all(|n| !n.starts_with("stale:")));
            result.as_of
        };

        // 2. Total outage: previous result comes back marked stale.
        mock.fail_all.store(true, Ordering::SeqCst);
        scheduler.run_cycle(&shutdown_rx).await.unwrap();
        {
            let latest = scheduler.latest();
            let guard = latest.read().await;
            let result = guard.as_ref().expect("degraded cycle keeps a result");
            assert_eq!(result.as_of, healthy_as_of);
            let stale_notes = result
                .notes
                .iter()
                .filter(|n| n.starts_with("stale:"))
                .count();
            assert_eq!(stale_notes, 1);
        }

        // 3. A second degraded cycle does not stack staleness notes.
        scheduler.run_cycle(&shutdown_rx).await.unwrap();
        {
            let latest = scheduler.latest();
            let guard = latest.read().await;
            let stale_notes = guard
                .as_ref()
                .unwrap()
                .notes
                .iter()
                .filter(|n| n.starts_with("stale:"))
                .count();
            assert_eq!(stale_notes, 1);
        }

        // Only the healthy cycle wrote a history snapshot.
        assert_eq!(fs::read_dir(&config.history_dir).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_flag_aborts_before_fetching() {
        // Test: a shutdown raised before the cycle starts means no
        // upstream call is made and nothing is published.
        let dir = tempfile::tempdir().unwrap();
        let config = make_config(dir.path());

        let item = make_item(1, "Skeleton Knife Crimson Web");
        let mock = MockSource::new(HashMap::new(), HashMap::new());

        let store = SnapshotStore::open(&config.db_path, &config.schema_dir).unwrap();
        let ledger = Arc::new(PositionLedger::load(&config.positions_path).unwrap());
        let engine = Engine::new(
            store.clone(),
            vec![item.clone()],
            config.mode,
            config.topk,
            config.lookback_hours,
            config.min_required_hours,
        );
        let scheduler = Scheduler::new(
            SharedSource(mock.clone()),
            store,
            engine,
            ledger,
            vec![item],
            &config,
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        shutdown_tx.send(true).unwrap();

        scheduler.run_cycle(&shutdown_rx).await.unwrap();

        assert_eq!(mock.price_calls.load(Ordering::SeqCst), 0);
        assert_eq!(mock.history_calls.load(Ordering::SeqCst), 0);
        assert!(scheduler.latest().read().await.is_none());
    }
}
