use crate::api::PriceSource;
use crate::bus::{Event, EventBus};
use crate::config::Settings;
use crate::models::Priority;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};

/// Consecutive failures after which a high-priority token is demoted
const DEMOTE_AFTER_FAILURES: u32 = 5;

/// Scheduler-internal bookkeeping for one watched asset.
///
/// Ephemeral: created on registration, destroyed on unregistration, never
/// persisted. The engine re-registers active positions on startup.
#[derive(Debug, Clone)]
pub struct MonitoredToken {
    pub asset_id: String,
    pub symbol: String,
    pub priority: Priority,
    pub last_price: Option<f64>,
    pub last_update: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

/// Owns the set of currently-watched assets and batches price lookups on a
/// fixed cadence, publishing price:updated / price:stale through the bus.
pub struct PriceScheduler {
    tokens: Mutex<HashMap<String, MonitoredToken>>,
    bus: Arc<EventBus>,
    source: Arc<dyn PriceSource>,
    settings: watch::Receiver<Arc<Settings>>,
}

impl PriceScheduler {
    pub fn new(
        bus: Arc<EventBus>,
        source: Arc<dyn PriceSource>,
        settings: watch::Receiver<Arc<Settings>>,
    ) -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
            bus,
            source,
            settings,
        }
    }

    /// Register an asset for price monitoring. Idempotent: re-registering
    /// only refreshes symbol and priority, keeping failure bookkeeping.
    pub fn register_token(&self, asset_id: &str, symbol: &str, priority: Priority) {
        let interval_secs = self.settings.borrow().poll_interval_secs;
        let freshly_added = {
            let mut tokens = self.tokens.lock().unwrap();
            match tokens.get_mut(asset_id) {
                Some(token) => {
                    token.symbol = symbol.to_string();
                    token.priority = priority;
                    false
                }
                None => {
                    tokens.insert(
                        asset_id.to_string(),
                        MonitoredToken {
                            asset_id: asset_id.to_string(),
                            symbol: symbol.to_string(),
                            priority,
                            last_price: None,
                            last_update: None,
                            consecutive_failures: 0,
                        },
                    );
                    true
                }
            }
        };

        if freshly_added {
            tracing::info!(asset_id, symbol, ?priority, "monitoring started");
            self.bus.publish(Event::MonitorStarted {
                asset_id: asset_id.to_string(),
                interval_secs,
            });
        }
    }

    /// Remove an asset immediately. In-flight lookups finish but their
    /// results are discarded (registration is re-verified before publishing).
    pub fn unregister_token(&self, asset_id: &str, reason: &str) {
        let removed = self.tokens.lock().unwrap().remove(asset_id).is_some();
        if removed {
            tracing::info!(asset_id, reason, "monitoring stopped");
            self.bus.publish(Event::MonitorStopped {
                asset_id: asset_id.to_string(),
                reason: reason.to_string(),
            });
        }
    }

    pub fn is_registered(&self, asset_id: &str) -> bool {
        self.tokens.lock().unwrap().contains_key(asset_id)
    }

    pub fn monitored(&self, asset_id: &str) -> Option<MonitoredToken> {
        self.tokens.lock().unwrap().get(asset_id).cloned()
    }

    pub fn monitored_count(&self) -> usize {
        self.tokens.lock().unwrap().len()
    }

    /// One full pass over the registered set: snapshot, sort descending by
    /// priority, process in fixed-size concurrent batches with a pause in
    /// between to bound burst load on the price source.
    pub async fn tick_once(&self) -> (usize, usize) {
        let started = Instant::now();
        let (batch_size, batch_pause) = {
            let settings = self.settings.borrow();
            (
                settings.batch_size.max(1),
                Duration::from_millis(settings.batch_pause_ms),
            )
        };

        let mut snapshot: Vec<MonitoredToken> = {
            let tokens = self.tokens.lock().unwrap();
            tokens.values().cloned().collect()
        };
        snapshot.sort_by(|a, b| b.priority.rank().cmp(&a.priority.rank()));

        let mut success = 0usize;
        let mut failed = 0usize;

        for (i, batch) in snapshot.chunks(batch_size).enumerate() {
            if i > 0 && !batch_pause.is_zero() {
                tokio::time::sleep(batch_pause).await;
            }

            let mut lookups = JoinSet::new();
            for token in batch {
                let source = self.source.clone();
                let asset_id = token.asset_id.clone();
                lookups.spawn(async move {
                    let outcome = source.spot_price(&asset_id).await;
                    (asset_id, outcome)
                });
            }

            while let Some(joined) = lookups.join_next().await {
                match joined {
                    Ok((asset_id, outcome)) => {
                        if self.record_outcome(&asset_id, outcome) {
                            success += 1;
                        } else {
                            failed += 1;
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "price lookup task failed");
                        failed += 1;
                    }
                }
            }
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        tracing::debug!(success, failed, elapsed_ms, "price batch complete");
        self.bus.publish(Event::BatchSummary {
            success,
            failed,
            elapsed_ms,
        });

        (success, failed)
    }

    /// Apply one lookup result. Returns true on success. Results for assets
    /// unregistered while the lookup was in flight are discarded.
    fn record_outcome(&self, asset_id: &str, outcome: crate::Result<Option<f64>>) -> bool {
        let event = {
            let mut tokens = self.tokens.lock().unwrap();
            let Some(token) = tokens.get_mut(asset_id) else {
                tracing::debug!(asset_id, "discarding lookup result for unregistered asset");
                return false;
            };

            match outcome {
                Ok(Some(price)) if price > 0.0 => {
                    let previous_price = token.last_price;
                    token.last_price = Some(price);
                    token.last_update = Some(Utc::now());
                    token.consecutive_failures = 0;
                    Event::PriceUpdated {
                        asset_id: asset_id.to_string(),
                        price,
                        previous_price,
                    }
                }
                other => {
                    if let Err(e) = other {
                        tracing::warn!(asset_id, error = %e, "price lookup failed");
                    }
                    token.consecutive_failures += 1;

                    // Load shedding: one-shot demotion, never automatic promotion
                    if token.consecutive_failures >= DEMOTE_AFTER_FAILURES
                        && token.priority == Priority::High
                    {
                        token.priority = Priority::Medium;
                        tracing::warn!(
                            asset_id,
                            failures = token.consecutive_failures,
                            "demoting silent token to medium priority"
                        );
                    }

                    Event::PriceStale {
                        asset_id: asset_id.to_string(),
                        attempts: token.consecutive_failures,
                    }
                }
            }
        };

        let succeeded = matches!(event, Event::PriceUpdated { .. });
        self.bus.publish(event);
        succeeded
    }

    /// Tick loop. Runs until the shutdown flag flips; the interval is
    /// rebuilt whenever the settings snapshot changes.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut settings_rx = self.settings.clone();
        let mut ticker = make_ticker(settings_rx.borrow_and_update().poll_interval_secs);

        tracing::info!("price scheduler loop starting");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick_once().await;
                }
                changed = settings_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let interval_secs = settings_rx.borrow_and_update().poll_interval_secs;
                    tracing::info!(interval_secs, "poll cadence updated, rebuilding ticker");
                    ticker = make_ticker(interval_secs);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("price scheduler stopped");
    }
}

fn make_ticker(interval_secs: u64) -> tokio::time::Interval {
    let period = Duration::from_secs(interval_secs.max(1));
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{EventKind, Envelope};
    use crate::config::SettingsHandle;
    use async_trait::async_trait;

    /// Price source fed from a shared map; missing entries count as failures
    struct ScriptedSource {
        prices: Mutex<HashMap<String, f64>>,
        requests: Mutex<Vec<String>>,
    }

    impl ScriptedSource {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                prices: Mutex::new(HashMap::new()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn set_price(&self, asset_id: &str, price: f64) {
            self.prices
                .lock()
                .unwrap()
                .insert(asset_id.to_string(), price);
        }
    }

    #[async_trait]
    impl PriceSource for ScriptedSource {
        async fn spot_price(&self, asset_id: &str) -> crate::Result<Option<f64>> {
            self.requests.lock().unwrap().push(asset_id.to_string());
            Ok(self.prices.lock().unwrap().get(asset_id).copied())
        }
    }

    fn scheduler_with(
        source: Arc<ScriptedSource>,
        settings: Settings,
    ) -> (Arc<PriceScheduler>, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        let handle = SettingsHandle::new(settings);
        let scheduler = Arc::new(PriceScheduler::new(
            bus.clone(),
            source,
            handle.subscribe(),
        ));
        (scheduler, bus)
    }

    fn collect_events(bus: &EventBus, kind: EventKind) -> Arc<Mutex<Vec<Event>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        bus.subscribe(
            kind,
            Arc::new(move |env: &Envelope| {
                seen_clone.lock().unwrap().push(env.event.clone());
            }),
        );
        seen
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let source = ScriptedSource::new();
        let (scheduler, _bus) = scheduler_with(source, Settings::default());

        scheduler.register_token("mint-1", "TKN", Priority::High);
        scheduler.register_token("mint-1", "TKN2", Priority::Low);

        assert_eq!(scheduler.monitored_count(), 1);
        let token = scheduler.monitored("mint-1").unwrap();
        assert_eq!(token.symbol, "TKN2");
        assert_eq!(token.priority, Priority::Low);
    }

    #[tokio::test]
    async fn test_tick_publishes_updates_and_stale() {
        let source = ScriptedSource::new();
        source.set_price("mint-1", 2.0);
        let (scheduler, bus) = scheduler_with(source, Settings::default());
        let updated = collect_events(&bus, EventKind::PriceUpdated);
        let stale = collect_events(&bus, EventKind::PriceStale);

        scheduler.register_token("mint-1", "TKN", Priority::High);
        scheduler.register_token("mint-2", "DED", Priority::High);

        let (success, failed) = scheduler.tick_once().await;

        assert_eq!(success, 1);
        assert_eq!(failed, 1);
        assert_eq!(updated.lock().unwrap().len(), 1);
        assert_eq!(
            stale.lock().unwrap()[0],
            Event::PriceStale {
                asset_id: "mint-2".to_string(),
                attempts: 1
            }
        );
    }

    #[tokio::test]
    async fn test_previous_price_carried_on_next_update() {
        let source = ScriptedSource::new();
        source.set_price("mint-1", 2.0);
        let (scheduler, bus) = scheduler_with(source.clone(), Settings::default());
        let updated = collect_events(&bus, EventKind::PriceUpdated);

        scheduler.register_token("mint-1", "TKN", Priority::High);
        scheduler.tick_once().await;

        source.set_price("mint-1", 3.0);
        scheduler.tick_once().await;

        let events = updated.lock().unwrap();
        assert_eq!(
            events[1],
            Event::PriceUpdated {
                asset_id: "mint-1".to_string(),
                price: 3.0,
                previous_price: Some(2.0)
            }
        );
    }

    #[tokio::test]
    async fn test_high_priority_processed_first() {
        let source = ScriptedSource::new();
        source.set_price("mint-low", 1.0);
        source.set_price("mint-high", 1.0);
        source.set_price("mint-med", 1.0);

        // batch_size 1 so the request order is fully deterministic
        let settings = Settings {
            batch_size: 1,
            batch_pause_ms: 0,
            ..Default::default()
        };
        let (scheduler, _bus) = scheduler_with(source.clone(), settings);

        scheduler.register_token("mint-low", "LOW", Priority::Low);
        scheduler.register_token("mint-high", "HIGH", Priority::High);
        scheduler.register_token("mint-med", "MED", Priority::Medium);

        scheduler.tick_once().await;

        let requests = source.requests.lock().unwrap();
        assert_eq!(*requests, vec!["mint-high", "mint-med", "mint-low"]);
    }

    #[tokio::test]
    async fn test_demotion_is_one_shot() {
        let source = ScriptedSource::new(); // no prices: every lookup is stale
        let (scheduler, _bus) = scheduler_with(source, Settings::default());
        scheduler.register_token("mint-1", "TKN", Priority::High);

        for _ in 0..4 {
            scheduler.tick_once().await;
        }
        assert_eq!(
            scheduler.monitored("mint-1").unwrap().priority,
            Priority::High
        );

        // Fifth consecutive failure demotes high -> medium
        scheduler.tick_once().await;
        assert_eq!(
            scheduler.monitored("mint-1").unwrap().priority,
            Priority::Medium
        );

        // A sixth failure does not demote further
        scheduler.tick_once().await;
        assert_eq!(
            scheduler.monitored("mint-1").unwrap().priority,
            Priority::Medium
        );
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let source = ScriptedSource::new();
        let (scheduler, _bus) = scheduler_with(source.clone(), Settings::default());
        scheduler.register_token("mint-1", "TKN", Priority::High);

        for _ in 0..3 {
            scheduler.tick_once().await;
        }
        assert_eq!(
            scheduler.monitored("mint-1").unwrap().consecutive_failures,
            3
        );

        source.set_price("mint-1", 1.0);
        scheduler.tick_once().await;
        assert_eq!(
            scheduler.monitored("mint-1").unwrap().consecutive_failures,
            0
        );
    }

    #[tokio::test]
    async fn test_in_flight_result_discarded_after_unregister() {
        let source = ScriptedSource::new();
        let (scheduler, bus) = scheduler_with(source, Settings::default());
        let updated = collect_events(&bus, EventKind::PriceUpdated);

        scheduler.register_token("mint-1", "TKN", Priority::High);
        scheduler.unregister_token("mint-1", "test");

        // Simulates a lookup that was already in flight when the asset left
        let accepted = scheduler.record_outcome("mint-1", Ok(Some(2.0)));

        assert!(!accepted);
        assert!(updated.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unregister_publishes_monitor_stopped_once() {
        let source = ScriptedSource::new();
        let (scheduler, bus) = scheduler_with(source, Settings::default());
        let stopped = collect_events(&bus, EventKind::MonitorStopped);

        scheduler.register_token("mint-1", "TKN", Priority::High);
        scheduler.unregister_token("mint-1", "completed");
        scheduler.unregister_token("mint-1", "completed");

        assert_eq!(stopped.lock().unwrap().len(), 1);
        assert!(!scheduler.is_registered("mint-1"));
    }

    #[tokio::test]
    async fn test_batch_summary_published_per_tick() {
        let source = ScriptedSource::new();
        source.set_price("mint-1", 1.0);
        let (scheduler, bus) = scheduler_with(source, Settings::default());
        let summaries = collect_events(&bus, EventKind::BatchSummary);

        scheduler.register_token("mint-1", "TKN", Priority::High);
        scheduler.register_token("mint-2", "DED", Priority::Low);
        scheduler.tick_once().await;

        let events = summaries.lock().unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::BatchSummary { success, failed, .. } => {
                assert_eq!(*success, 1);
                assert_eq!(*failed, 1);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
