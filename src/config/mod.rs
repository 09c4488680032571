use crate::models::StageConfig;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

/// Runtime settings: sizing, cadences, endpoints and the two stage ladders.
///
/// Loaded from a TOML file with `LADDERBOT_`-prefixed environment overrides;
/// swapped atomically as a whole on reload (readers never see a half-applied
/// update).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Quote-currency amount committed per entry
    pub buy_amount: f64,
    /// Slippage tolerance in basis points (50 = 0.5%)
    pub slippage_bps: u16,
    /// Price-check cadence for monitored assets
    pub poll_interval_secs: u64,
    /// Concurrent price lookups per batch
    pub batch_size: usize,
    /// Pause between batches to bound burst load on the price source
    pub batch_pause_ms: u64,
    /// Minimum discovery score a candidate must reach
    pub min_score: f64,
    pub discovery_interval_secs: u64,
    /// Cadence of the paused-position balance re-check
    pub reactivation_interval_secs: u64,
    /// Bounded entry-price acquisition: attempts and fixed delay
    pub entry_poll_attempts: u32,
    pub entry_poll_delay_ms: u64,
    pub price_api_url: String,
    pub discovery_api_url: String,
    pub venue_api_url: String,
    pub wallet_rpc_url: String,
    pub wallet_address: String,
    pub store_path: String,
    pub take_profits: Vec<StageConfig>,
    pub stop_losses: Vec<StageConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            buy_amount: 50.0,
            slippage_bps: 100,
            poll_interval_secs: 10,
            batch_size: 5,
            batch_pause_ms: 500,
            min_score: 0.6,
            discovery_interval_secs: 1800,
            reactivation_interval_secs: 30,
            entry_poll_attempts: 20,
            entry_poll_delay_ms: 3000,
            price_api_url: "https://api.dexscreener.com/latest/dex".to_string(),
            discovery_api_url: "https://public-api.birdeye.so/defi".to_string(),
            venue_api_url: "https://lite-api.jup.ag/swap/v1".to_string(),
            wallet_rpc_url: "https://api.mainnet-beta.solana.com".to_string(),
            wallet_address: String::new(),
            store_path: "positions.json".to_string(),
            take_profits: vec![
                StageConfig {
                    name: "tp1".to_string(),
                    multiple: 2.0,
                    sell_percent: 50.0,
                    enabled: true,
                },
                StageConfig {
                    name: "tp2".to_string(),
                    multiple: 5.0,
                    sell_percent: 100.0,
                    enabled: true,
                },
            ],
            stop_losses: vec![StageConfig {
                name: "sl1".to_string(),
                multiple: 0.8,
                sell_percent: 100.0,
                enabled: true,
            }],
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("take-profit stage '{stage}' must have multiple > 1 (got {multiple})")]
    TakeProfitRange { stage: String, multiple: f64 },

    #[error("stop-loss stage '{stage}' must have multiple in (0, 1) (got {multiple})")]
    StopLossRange { stage: String, multiple: f64 },

    #[error("stage '{stage}' must have sell percent in (0, 100] (got {percent})")]
    SellPercentRange { stage: String, percent: f64 },

    #[error("enabled {ladder} multiples must be strictly {direction} (violated at stage '{stage}')")]
    NonMonotonicLadder {
        ladder: &'static str,
        direction: &'static str,
        stage: String,
    },

    #[error("batch size must be at least 1")]
    ZeroBatchSize,

    #[error("poll interval must be at least 1 second")]
    ZeroPollInterval,

    #[error(transparent)]
    Load(#[from] config::ConfigError),
}

impl Settings {
    /// Load from a TOML file (optional) layered under environment overrides,
    /// then validate. Rejected settings are never partially applied.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let settings: Settings = Config::builder()
            .add_source(File::from(path.to_path_buf()).required(false))
            .add_source(Environment::with_prefix("LADDERBOT").separator("__"))
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::ZeroPollInterval);
        }

        for stage in &self.take_profits {
            if stage.multiple <= 1.0 {
                return Err(ConfigError::TakeProfitRange {
                    stage: stage.name.clone(),
                    multiple: stage.multiple,
                });
            }
            check_sell_percent(stage)?;
        }
        for stage in &self.stop_losses {
            if stage.multiple <= 0.0 || stage.multiple >= 1.0 {
                return Err(ConfigError::StopLossRange {
                    stage: stage.name.clone(),
                    multiple: stage.multiple,
                });
            }
            check_sell_percent(stage)?;
        }

        // Monotonicity over the enabled subset only: disabling a stage must
        // not invalidate the rest of the ladder.
        check_monotonic(&self.take_profits, "take-profit", "increasing", |prev, cur| {
            cur > prev
        })?;
        check_monotonic(&self.stop_losses, "stop-loss", "decreasing", |prev, cur| {
            cur < prev
        })?;

        Ok(())
    }

    pub fn enabled_take_profits(&self) -> impl Iterator<Item = &StageConfig> {
        self.take_profits.iter().filter(|s| s.enabled)
    }

    pub fn enabled_stop_losses(&self) -> impl Iterator<Item = &StageConfig> {
        self.stop_losses.iter().filter(|s| s.enabled)
    }
}

fn check_sell_percent(stage: &StageConfig) -> Result<(), ConfigError> {
    if stage.sell_percent <= 0.0 || stage.sell_percent > 100.0 {
        return Err(ConfigError::SellPercentRange {
            stage: stage.name.clone(),
            percent: stage.sell_percent,
        });
    }
    Ok(())
}

fn check_monotonic(
    stages: &[StageConfig],
    ladder: &'static str,
    direction: &'static str,
    ordered: impl Fn(f64, f64) -> bool,
) -> Result<(), ConfigError> {
    let mut prev: Option<f64> = None;
    for stage in stages.iter().filter(|s| s.enabled) {
        if let Some(p) = prev {
            if !ordered(p, stage.multiple) {
                return Err(ConfigError::NonMonotonicLadder {
                    ladder,
                    direction,
                    stage: stage.name.clone(),
                });
            }
        }
        prev = Some(stage.multiple);
    }
    Ok(())
}

/// Hot-swappable settings handle.
///
/// Holds the current immutable snapshot behind a watch channel; `apply`
/// validates the replacement first, then swaps atomically and notifies
/// every subscriber.
pub struct SettingsHandle {
    tx: watch::Sender<Arc<Settings>>,
}

impl SettingsHandle {
    /// Wrap an already-validated initial snapshot
    pub fn new(initial: Settings) -> Self {
        let (tx, _) = watch::channel(Arc::new(initial));
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Settings>> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> Arc<Settings> {
        self.tx.borrow().clone()
    }

    pub fn apply(&self, next: Settings) -> Result<(), ConfigError> {
        next.validate()?;
        self.tx.send_replace(Arc::new(next));
        Ok(())
    }
}
