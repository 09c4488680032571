use crate::api::{BalanceSource, PriceSource, SellOutcome, SwapVenue};
use crate::bus::{Envelope, Event, EventBus, EventKind};
use crate::config::Settings;
use crate::models::{Candidate, Position, Priority, StageConfig, StageKind};
use crate::scheduler::PriceScheduler;
use crate::store::PositionStore;
use crate::Result;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep, Duration, Instant, MissedTickBehavior};

/// Applies the take-profit/stop-loss state machine to price updates, issues
/// buy/sell requests to the swap venue and writes results back through the
/// position store.
///
/// Per-asset mutual exclusion is structural: price updates are consumed
/// sequentially from a single queue, and the scheduler never has two lookups
/// in flight for the same asset.
pub struct PositionEngine {
    store: Arc<PositionStore>,
    scheduler: Arc<PriceScheduler>,
    bus: Arc<EventBus>,
    venue: Arc<dyn SwapVenue>,
    wallet: Arc<dyn BalanceSource>,
    prices: Arc<dyn PriceSource>,
    settings: watch::Receiver<Arc<Settings>>,
}

impl PositionEngine {
    pub fn new(
        store: Arc<PositionStore>,
        scheduler: Arc<PriceScheduler>,
        bus: Arc<EventBus>,
        venue: Arc<dyn SwapVenue>,
        wallet: Arc<dyn BalanceSource>,
        prices: Arc<dyn PriceSource>,
        settings: watch::Receiver<Arc<Settings>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            scheduler,
            bus,
            venue,
            wallet,
            prices,
            settings,
        })
    }

    /// Bridge bus price updates into the engine's sequential queue.
    /// Must be called before the scheduler starts ticking.
    pub fn attach(&self) -> mpsc::UnboundedReceiver<(String, f64)> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.bus.subscribe(
            EventKind::PriceUpdated,
            Arc::new(move |env: &Envelope| {
                if let Event::PriceUpdated {
                    asset_id, price, ..
                } = &env.event
                {
                    let _ = tx.send((asset_id.clone(), *price));
                }
            }),
        );
        rx
    }

    /// Re-register active positions after a restart; scheduler state is
    /// ephemeral, the store is the source of truth.
    pub async fn bootstrap(&self) {
        for position in self.store.list_active() {
            if position.entry_price.is_some() {
                self.scheduler
                    .register_token(&position.asset_id, &position.symbol, Priority::High);
            } else {
                // Crashed between buy and entry-price acquisition; retry it
                tracing::warn!(
                    asset_id = %position.asset_id,
                    "position has no entry price, re-running acquisition"
                );
                if let Err(e) = self.acquire_entry_price(&position.asset_id, &position.symbol).await
                {
                    tracing::error!(
                        asset_id = %position.asset_id,
                        error = %e,
                        "entry price acquisition failed during bootstrap"
                    );
                }
            }
        }
    }

    /// Buy path: one swap call with the configured quote amount. A failed
    /// buy leaves no position record behind, so a later discovery cycle may
    /// retry the same asset.
    pub async fn open_position(&self, candidate: &Candidate) -> Result<()> {
        let cfg = self.settings.borrow().clone();

        if self.store.get(&candidate.asset_id).is_some() {
            return Err(format!("position already open for {}", candidate.symbol).into());
        }

        let trade = self
            .venue
            .buy(&candidate.asset_id, cfg.buy_amount, cfg.slippage_bps)
            .await
            .map_err(|e| format!("buy failed for {}: {}", candidate.symbol, e))?;

        tracing::info!(
            asset_id = %candidate.asset_id,
            symbol = %candidate.symbol,
            amount = cfg.buy_amount,
            signature = ?trade.tx_signature,
            "🛒 position opened"
        );

        self.store
            .create(&candidate.asset_id, &candidate.symbol, None, cfg.buy_amount)?;
        self.bus.publish(Event::PositionCreated {
            asset_id: candidate.asset_id.clone(),
            symbol: candidate.symbol.clone(),
            entry_price: None,
            size: cfg.buy_amount,
        });

        self.acquire_entry_price(&candidate.asset_id, &candidate.symbol)
            .await
    }

    /// awaiting-entry-price: bounded polling of the price source. Exhausting
    /// the attempts is terminal for this activation; the position is left
    /// unmonitored and the failure is loud.
    async fn acquire_entry_price(&self, asset_id: &str, symbol: &str) -> Result<()> {
        let cfg = self.settings.borrow().clone();
        let delay = Duration::from_millis(cfg.entry_poll_delay_ms);

        for attempt in 1..=cfg.entry_poll_attempts {
            match self.prices.spot_price(asset_id).await {
                Ok(Some(price)) if price > 0.0 => {
                    self.store.activate(asset_id, price)?;
                    self.scheduler.register_token(asset_id, symbol, Priority::High);
                    tracing::info!(asset_id, entry_price = price, "entry price locked in");
                    return Ok(());
                }
                Ok(_) => {
                    tracing::debug!(asset_id, attempt, "no price yet");
                }
                Err(e) => {
                    tracing::warn!(asset_id, attempt, error = %e, "entry price lookup failed");
                }
            }
            if attempt < cfg.entry_poll_attempts {
                sleep(delay).await;
            }
        }

        tracing::error!(
            asset_id,
            attempts = cfg.entry_poll_attempts,
            "CRITICAL: no entry price after bounded retries, position left unmonitored"
        );
        self.bus.publish(Event::MonitorStopped {
            asset_id: asset_id.to_string(),
            reason: "entry price unavailable".to_string(),
        });
        Err(format!("no entry price for {} after {} attempts", asset_id, cfg.entry_poll_attempts).into())
    }

    /// monitoring: one full stage evaluation for one price observation
    pub async fn handle_price_update(&self, asset_id: &str, price: f64) -> Result<()> {
        // The position may have been removed or paused while this update
        // was queued; paused positions only come back through reactivation
        match self.store.get(asset_id) {
            None => return Ok(()),
            Some(position) if position.paused => return Ok(()),
            Some(_) => {}
        }

        let updated = match self.store.update_price(asset_id, price)? {
            Some(position) => position,
            None => return Ok(()), // entry price not known yet
        };
        let Some(multiple) = updated.multiple() else {
            return Ok(());
        };

        self.bus.publish(Event::PositionUpdated {
            asset_id: updated.asset_id.clone(),
            symbol: updated.symbol.clone(),
            current_price: updated.current_price,
            multiple,
            percent_change: updated.percent_change().unwrap_or(0.0),
            highest_multiple: updated.highest_multiple,
        });

        // Fresh read every time: the balance can change outside this engine
        let balance = self.wallet.balance(asset_id).await?;
        let cfg = self.settings.borrow().clone();
        let ladder = full_ladder(&cfg);

        if balance <= 0.0 {
            let all_sold = updated.all_stages_sold(ladder.iter().map(|(_, s)| s));
            if all_sold {
                self.complete(&updated);
            } else {
                self.pause_drained(&updated)?;
            }
            return Ok(());
        }

        self.evaluate_stages(&updated, multiple, &ladder, cfg.slippage_bps)
            .await
    }

    /// Evaluate enabled, not-yet-sold stages in ladder order, re-reading the
    /// balance immediately before each irreversible sell.
    async fn evaluate_stages(
        &self,
        position: &Position,
        multiple: f64,
        ladder: &[(StageKind, StageConfig)],
        slippage_bps: u16,
    ) -> Result<()> {
        for (kind, stage) in ladder {
            // At-most-once: checked BEFORE invoking the venue, never after
            let current = self
                .store
                .get(&position.asset_id)
                .ok_or_else(|| format!("position vanished for {}", position.asset_id))?;
            if current.stage_sold(&stage.name) {
                continue;
            }
            if !kind.crossed(multiple, stage.multiple) {
                continue;
            }

            let balance = self.wallet.balance(&position.asset_id).await?;
            if balance <= 0.0 {
                // Drained mid-evaluation; the next tick will pause or complete
                break;
            }

            // 100% sells the exact remaining balance to avoid rounding dust
            let amount = if stage.sell_percent >= 100.0 {
                balance
            } else {
                balance * stage.sell_percent / 100.0
            };

            tracing::info!(
                asset_id = %position.asset_id,
                stage = %stage.name,
                multiple,
                threshold = stage.multiple,
                amount,
                "💰 stage threshold crossed, selling"
            );

            match self
                .venue
                .sell(&position.asset_id, amount, slippage_bps)
                .await
            {
                Ok(SellOutcome::Filled(trade)) => {
                    self.store.mark_stage_sold(&position.asset_id, &stage.name)?;
                    self.bus.publish(Event::TakeProfitTriggered {
                        asset_id: position.asset_id.clone(),
                        stage: stage.name.clone(),
                        multiple,
                        percentage: stage.sell_percent,
                    });
                    tracing::info!(
                        asset_id = %position.asset_id,
                        stage = %stage.name,
                        signature = ?trade.tx_signature,
                        "✓ stage sold"
                    );
                }
                Ok(SellOutcome::NoBalance) => {
                    // Nothing left to capture; marking sold beats retrying forever
                    tracing::warn!(
                        asset_id = %position.asset_id,
                        stage = %stage.name,
                        "venue reported no balance, marking stage done"
                    );
                    self.store.mark_stage_sold(&position.asset_id, &stage.name)?;
                }
                Err(e) => {
                    tracing::warn!(
                        asset_id = %position.asset_id,
                        stage = %stage.name,
                        error = %e,
                        "✗ sell failed, will retry on next price update"
                    );
                }
            }
        }

        Ok(())
    }

    fn complete(&self, position: &Position) {
        self.scheduler
            .unregister_token(&position.asset_id, "completed");
        self.bus.publish(Event::PositionClosed {
            asset_id: position.asset_id.clone(),
            reason: "all stages sold".to_string(),
        });
        tracing::info!(asset_id = %position.asset_id, "🏁 position completed");
    }

    /// Funds moved elsewhere: stop monitoring but keep stage history
    fn pause_drained(&self, position: &Position) -> Result<()> {
        self.store.pause(&position.asset_id)?;
        self.scheduler
            .unregister_token(&position.asset_id, "balance drained");
        self.bus.publish(Event::PositionPaused {
            asset_id: position.asset_id.clone(),
            reason: "zero balance".to_string(),
        });
        tracing::info!(asset_id = %position.asset_id, "⏸ position paused");
        Ok(())
    }

    /// paused -> monitoring: slower-cadence balance re-check; a restored
    /// balance starts a fresh lifecycle at the live price.
    pub async fn reactivation_sweep(&self) {
        let paused: Vec<Position> = self
            .store
            .list_all()
            .into_iter()
            .filter(|p| p.paused)
            .collect();

        for position in paused {
            let balance = match self.wallet.balance(&position.asset_id).await {
                Ok(b) => b,
                Err(e) => {
                    tracing::warn!(
                        asset_id = %position.asset_id,
                        error = %e,
                        "balance re-check failed"
                    );
                    continue;
                }
            };
            if balance <= 0.0 {
                continue;
            }

            match self.prices.spot_price(&position.asset_id).await {
                Ok(Some(price)) if price > 0.0 => {
                    if let Err(e) = self.reactivate(&position, price) {
                        tracing::warn!(
                            asset_id = %position.asset_id,
                            error = %e,
                            "reactivation failed"
                        );
                    }
                }
                Ok(_) => {
                    tracing::debug!(
                        asset_id = %position.asset_id,
                        "balance restored but no live price yet"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        asset_id = %position.asset_id,
                        error = %e,
                        "price lookup failed during reactivation"
                    );
                }
            }
        }
    }

    fn reactivate(&self, position: &Position, live_price: f64) -> Result<()> {
        self.store.reactivate(&position.asset_id, live_price)?;
        self.scheduler
            .register_token(&position.asset_id, &position.symbol, Priority::High);
        self.bus.publish(Event::PositionResumed {
            asset_id: position.asset_id.clone(),
        });
        tracing::info!(
            asset_id = %position.asset_id,
            new_entry = live_price,
            "▶ position reactivated"
        );
        Ok(())
    }

    /// Main loop: sequential price-update evaluation plus the periodic
    /// reactivation sweep.
    pub async fn run(
        self: Arc<Self>,
        mut updates: mpsc::UnboundedReceiver<(String, f64)>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut settings_rx = self.settings.clone();
        let mut sweep = make_ticker(settings_rx.borrow_and_update().reactivation_interval_secs);

        tracing::info!("position engine loop starting");
        loop {
            tokio::select! {
                received = updates.recv() => {
                    match received {
                        Some((asset_id, price)) => {
                            if let Err(e) = self.handle_price_update(&asset_id, price).await {
                                tracing::error!(asset_id = %asset_id, error = %e, "stage evaluation failed");
                            }
                        }
                        None => break,
                    }
                }
                _ = sweep.tick() => {
                    self.reactivation_sweep().await;
                }
                changed = settings_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let secs = settings_rx.borrow_and_update().reactivation_interval_secs;
                    sweep = make_ticker(secs);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("position engine stopped");
    }
}

/// Enabled take-profits first, then stop-losses, each in configured order
fn full_ladder(settings: &Settings) -> Vec<(StageKind, StageConfig)> {
    settings
        .enabled_take_profits()
        .map(|s| (StageKind::TakeProfit, s.clone()))
        .chain(
            settings
                .enabled_stop_losses()
                .map(|s| (StageKind::StopLoss, s.clone())),
        )
        .collect()
}

fn make_ticker(interval_secs: u64) -> tokio::time::Interval {
    let period = Duration::from_secs(interval_secs.max(1));
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}
