//! Skinflow - skin market trading signal runtime
//!
//! Periodically ingests BUFF/YYYP quotes for a tracked item universe,
//! stores hourly snapshots in SQLite, scores each item/platform pair
//! into buy candidates and a watchlist, and checks open positions for
//! sell triggers once their T+7 lock has passed.
//!
//! Usage:
//!   cargo run --release                // daemon loop
//!   RUN_MODE=once cargo run --release  // single cycle
//!
//! Environment variables are documented on `Config::from_env`.

pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod history;
pub mod ledger;
pub mod scheduler;
pub mod series;
pub mod store;
pub mod types;

use {
    client::CsqaqClient,
    config::Config,
    engine::Engine,
    ledger::PositionLedger,
    log::{error, info},
    scheduler::Scheduler,
    std::sync::Arc,
    store::SnapshotStore,
    tokio::sync::watch,
};

#[tokio::main]
pub async fn main() -> error::Result<()> {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::from_env();

    info!("🚀 Starting skinflow signal runtime");
    info!("   ├─ Mode: {} (topk {})", config.mode, config.topk);
    info!(
        "   ├─ Lookback: {}h, cycle every {}s",
        config.lookback_hours, config.cycle_interval_secs
    );
    info!("   ├─ Database: {}", config.db_path);
    info!("   └─ Run mode: {:?}", config.run_mode);

    let items = match config::load_items(&config.items_path) {
        Ok(items) => {
            info!("✅ Loaded {} tracked items from {}", items.len(), config.items_path);
            items
        }
        Err(err) => {
            error!("❌ Could not load items from {}: {}", config.items_path, err);
            return Err(err);
        }
    };

    let store = SnapshotStore::open(&config.db_path, &config.schema_dir)?;
    let ledger = Arc::new(PositionLedger::load(&config.positions_path)?);
    info!("✅ Position ledger ready ({} open)", ledger.list().len());

    let engine = Engine::new(
        store.clone(),
        items.clone(),
        config.mode,
        config.topk,
        config.lookback_hours,
        config.min_required_hours,
    );
    let client = CsqaqClient::new(
        &config.base_url,
        &config.api_token,
        config.qps,
        config.http_timeout_secs,
    )?;
    let scheduler = Scheduler::new(client, store, engine, ledger, items, &config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("⚠️  Received CTRL+C, shutting down..."),
            Err(err) => error!("❌ Failed to listen for CTRL+C: {}", err),
        }
        let _ = shutdown_tx.send(true);
    });

    scheduler.run(shutdown_rx).await?;

    info!("✅ Skinflow stopped");
    Ok(())
}
