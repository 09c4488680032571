use crate::config::Settings;
use crate::engine::PositionEngine;
use crate::models::Candidate;
use crate::store::PositionStore;
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};

/// External source of candidate assets with a relevance score
#[async_trait]
pub trait DiscoveryFeed: Send + Sync {
    async fn fetch_candidates(&self) -> Result<Vec<Candidate>>;
}

/// HTTP client for a trending-token style discovery endpoint
#[derive(Clone)]
pub struct TrendingFeedClient {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct TrendingResponse {
    tokens: Vec<TrendingTokenRaw>,
}

#[derive(Debug, Deserialize)]
struct TrendingTokenRaw {
    address: String,
    symbol: String,
    #[serde(default)]
    score: f64,
}

impl TrendingFeedClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl DiscoveryFeed for TrendingFeedClient {
    async fn fetch_candidates(&self) -> Result<Vec<Candidate>> {
        let url = format!("{}/trending", self.base_url);
        let response: TrendingResponse = self.client.get(&url).send().await?.json().await?;

        Ok(response
            .tokens
            .into_iter()
            .map(|raw| Candidate {
                asset_id: raw.address,
                symbol: raw.symbol,
                score: raw.score,
            })
            .collect())
    }
}

/// Consumes the discovery feed: filters candidates by score, skips assets
/// already seen or already open, and hands survivors to the engine's buy
/// path. Assets are marked seen only after a successful buy so a failed buy
/// can be retried on a later cycle.
pub struct DiscoveryService {
    feed: Arc<dyn DiscoveryFeed>,
    engine: Arc<PositionEngine>,
    store: Arc<PositionStore>,
    settings: watch::Receiver<Arc<Settings>>,
}

impl DiscoveryService {
    pub fn new(
        feed: Arc<dyn DiscoveryFeed>,
        engine: Arc<PositionEngine>,
        store: Arc<PositionStore>,
        settings: watch::Receiver<Arc<Settings>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            feed,
            engine,
            store,
            settings,
        })
    }

    pub async fn run_once(&self) {
        let min_score = self.settings.borrow().min_score;

        let candidates = match self.feed.fetch_candidates().await {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(error = %e, "✗ discovery fetch failed");
                return;
            }
        };
        tracing::info!("🔍 discovery returned {} candidates", candidates.len());

        for candidate in candidates {
            if candidate.score < min_score {
                tracing::debug!(
                    symbol = %candidate.symbol,
                    score = candidate.score,
                    min_score,
                    "below score threshold"
                );
                continue;
            }
            if candidate.symbol.is_empty() || candidate.asset_id.is_empty() {
                tracing::debug!("skipping candidate with missing identity");
                continue;
            }
            if self.store.already_seen(&candidate.asset_id) {
                continue;
            }
            if self.store.get(&candidate.asset_id).is_some() {
                continue;
            }

            match self.engine.open_position(&candidate).await {
                Ok(()) => {
                    if let Err(e) = self.store.mark_seen(&candidate.asset_id) {
                        tracing::warn!(
                            asset_id = %candidate.asset_id,
                            error = %e,
                            "failed to persist seen flag"
                        );
                    }
                }
                Err(e) => {
                    tracing::error!(
                        symbol = %candidate.symbol,
                        error = %e,
                        "✗ entry failed, candidate stays eligible"
                    );
                }
            }
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut settings_rx = self.settings.clone();
        let interval_secs = settings_rx.borrow_and_update().discovery_interval_secs;
        // First pass immediately, then on the configured cadence
        let mut ticker = interval_at(
            Instant::now(),
            Duration::from_secs(interval_secs.max(1)),
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!("discovery loop starting");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once().await;
                }
                changed = settings_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let secs = settings_rx.borrow_and_update().discovery_interval_secs;
                    let period = Duration::from_secs(secs.max(1));
                    ticker = interval_at(Instant::now() + period, period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("discovery loop stopped");
    }
}
