use anyhow::Context;
use clap::Parser;
use ladderbot::api::{DexPriceClient, RpcWalletClient, SwapClient};
use ladderbot::bus::{Envelope, Event, EventBus, EventKind};
use ladderbot::config::{Settings, SettingsHandle};
use ladderbot::discovery::{DiscoveryService, TrendingFeedClient};
use ladderbot::engine::PositionEngine;
use ladderbot::scheduler::PriceScheduler;
use ladderbot::store::PositionStore;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};

/// Staged take-profit/stop-loss bot: discovers candidates, buys in, tracks
/// price and sells fixed fractions as configured multiples are crossed.
#[derive(Parser, Debug)]
#[command(name = "ladderbot", version)]
struct Args {
    /// Path to the TOML settings file (also watched for hot reload)
    #[arg(short, long, default_value = "ladderbot.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let args = Args::parse();

    tracing::info!("🚀 ladderbot starting");

    let settings = Settings::load(&args.config)
        .with_context(|| format!("loading settings from {}", args.config.display()))?;
    let store_path = settings.store_path.clone();
    let handle = Arc::new(SettingsHandle::new(settings));
    let cfg = handle.current();

    // ========================================================================
    // Components: one shared instance each, passed by reference
    // ========================================================================

    let bus = Arc::new(EventBus::new());
    install_event_logger(&bus);

    let store = Arc::new(
        PositionStore::open(&store_path)
            .map_err(|e| anyhow::anyhow!(e))
            .with_context(|| format!("opening position store at {}", store_path))?,
    );

    let price_client = Arc::new(DexPriceClient::new(cfg.price_api_url.clone()));
    let venue = Arc::new(SwapClient::new(cfg.venue_api_url.clone()));
    let wallet = Arc::new(RpcWalletClient::new(
        cfg.wallet_rpc_url.clone(),
        cfg.wallet_address.clone(),
    ));
    let feed = Arc::new(TrendingFeedClient::new(cfg.discovery_api_url.clone()));

    let scheduler = Arc::new(PriceScheduler::new(
        bus.clone(),
        price_client.clone(),
        handle.subscribe(),
    ));
    let engine = PositionEngine::new(
        store.clone(),
        scheduler.clone(),
        bus.clone(),
        venue,
        wallet,
        price_client,
        handle.subscribe(),
    );
    let discovery = DiscoveryService::new(feed, engine.clone(), store.clone(), handle.subscribe());

    // Bridge price updates into the engine before the scheduler ever ticks
    let updates = engine.attach();

    // Re-register active positions from the store (scheduler state is ephemeral)
    engine.bootstrap().await;

    tracing::info!("\n📊 Configuration:");
    tracing::info!("  Buy amount: ${:.2}", cfg.buy_amount);
    tracing::info!("  Poll cadence: {}s (batches of {})", cfg.poll_interval_secs, cfg.batch_size);
    tracing::info!("  Min score: {:.2}", cfg.min_score);
    tracing::info!("  Take profits: {}", cfg.take_profits.len());
    tracing::info!("  Stop losses: {}", cfg.stop_losses.len());
    tracing::info!("  Active positions: {}", store.list_active().len());

    // ========================================================================
    // Independent loops, all cancelled through one shutdown flag
    // ========================================================================

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler_task = tokio::spawn(scheduler.clone().run(shutdown_rx.clone()));
    let engine_task = tokio::spawn(engine.clone().run(updates, shutdown_rx.clone()));
    let discovery_task = tokio::spawn(discovery.clone().run(shutdown_rx.clone()));
    let _reload_task = tokio::spawn(config_reload_loop(
        args.config.clone(),
        handle.clone(),
        shutdown_rx.clone(),
    ));

    tracing::info!("✅ All loops spawned");
    tracing::info!("  🔄 Price scheduler: every {}s", cfg.poll_interval_secs);
    tracing::info!("  💹 Engine: price-driven + {}s reactivation sweep", cfg.reactivation_interval_secs);
    tracing::info!("  🔍 Discovery: every {}s", cfg.discovery_interval_secs);
    tracing::info!("\nPress Ctrl+C to stop...\n");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("\n⚠️  Received Ctrl+C, shutting down...");
        }
        result = scheduler_task => {
            tracing::error!("Price scheduler exited: {:?}", result);
        }
        result = engine_task => {
            tracing::error!("Position engine exited: {:?}", result);
        }
        result = discovery_task => {
            tracing::error!("Discovery loop exited: {:?}", result);
        }
    }

    // One deterministic cancel for every loop; give them a moment to log out
    let _ = shutdown_tx.send(true);
    tokio::time::sleep(Duration::from_millis(500)).await;

    tracing::info!("👋 ladderbot stopped");
    Ok(())
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ladderbot=info".into()),
        )
        .init();
}

/// Operator-facing log of the interesting lifecycle events
fn install_event_logger(bus: &EventBus) {
    bus.subscribe(
        EventKind::TakeProfitTriggered,
        Arc::new(|env: &Envelope| {
            if let Event::TakeProfitTriggered {
                asset_id,
                stage,
                multiple,
                percentage,
            } = &env.event
            {
                tracing::info!(
                    asset_id = %asset_id,
                    stage = %stage,
                    multiple = *multiple,
                    percentage = *percentage,
                    "💰 stage triggered"
                );
            }
        }),
    );
    bus.subscribe(
        EventKind::PositionClosed,
        Arc::new(|env: &Envelope| {
            if let Event::PositionClosed { asset_id, reason } = &env.event {
                tracing::info!(asset_id = %asset_id, reason = %reason, "🏁 position closed");
            }
        }),
    );
    bus.subscribe(
        EventKind::PositionPaused,
        Arc::new(|env: &Envelope| {
            if let Event::PositionPaused { asset_id, reason } = &env.event {
                tracing::info!(asset_id = %asset_id, reason = %reason, "⏸ position paused");
            }
        }),
    );
    bus.subscribe(
        EventKind::PriceStale,
        Arc::new(|env: &Envelope| {
            if let Event::PriceStale { asset_id, attempts } = &env.event {
                tracing::debug!(asset_id = %asset_id, attempts = *attempts, "price feed silent");
            }
        }),
    );
    bus.subscribe(
        EventKind::BatchSummary,
        Arc::new(|env: &Envelope| {
            if let Event::BatchSummary {
                success,
                failed,
                elapsed_ms,
            } = &env.event
            {
                tracing::debug!(
                    success = *success,
                    failed = *failed,
                    elapsed_ms = *elapsed_ms,
                    "batch summary"
                );
            }
        }),
    );
}

/// Re-read the settings file when its mtime changes; rejected settings are
/// logged and the previous snapshot stays in effect.
async fn config_reload_loop(
    path: PathBuf,
    handle: Arc<SettingsHandle>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut last_modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok();

    let period = Duration::from_secs(30);
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
                if modified.is_some() && modified != last_modified {
                    last_modified = modified;
                    match Settings::load(&path) {
                        Ok(settings) => match handle.apply(settings) {
                            Ok(()) => tracing::info!("✓ settings reloaded from {}", path.display()),
                            Err(e) => tracing::error!("✗ settings rejected: {}", e),
                        },
                        Err(e) => tracing::error!("✗ settings reload failed: {}", e),
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
