use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

/// Maximum number of price observations kept per position
pub const PRICE_HISTORY_CAP: usize = 100;

/// Candidate asset produced by the discovery feed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candidate {
    pub asset_id: String,
    pub symbol: String,
    pub score: f64,
}

/// One recorded price observation with its multiple vs. entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PricePoint {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub multiple: f64,
}

/// Scheduling hint controlling lookup order within a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    /// Numeric rank for descending sorts (higher = looked up first)
    pub fn rank(&self) -> u8 {
        match self {
            Priority::High => 2,
            Priority::Medium => 1,
            Priority::Low => 0,
        }
    }
}

/// One rung of a take-profit or stop-loss ladder
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageConfig {
    pub name: String,
    pub multiple: f64,
    pub sell_percent: f64,
    pub enabled: bool,
}

/// Which family of the ladder a stage belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    TakeProfit,
    StopLoss,
}

impl StageKind {
    /// Whether `multiple` has crossed the stage threshold in this family's direction
    pub fn crossed(&self, multiple: f64, threshold: f64) -> bool {
        match self {
            StageKind::TakeProfit => multiple >= threshold,
            StageKind::StopLoss => multiple <= threshold,
        }
    }
}

/// One watched position, keyed by asset identifier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub asset_id: String,
    pub symbol: String,
    /// Quote-currency price at activation; None until the first observation lands
    pub entry_price: Option<f64>,
    /// Quote-currency amount committed at buy time; immutable
    pub entry_size: f64,
    pub current_price: f64,
    pub highest_price: f64,
    pub highest_multiple: f64,
    pub stage_completion: HashMap<String, bool>,
    pub paused: bool,
    pub paused_at: Option<DateTime<Utc>>,
    pub price_history: VecDeque<PricePoint>,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl Position {
    pub fn new(asset_id: String, symbol: String, entry_price: Option<f64>, entry_size: f64) -> Self {
        let now = Utc::now();
        Self {
            asset_id,
            symbol,
            entry_price,
            entry_size,
            current_price: entry_price.unwrap_or(0.0),
            highest_price: entry_price.unwrap_or(0.0),
            highest_multiple: if entry_price.is_some() { 1.0 } else { 0.0 },
            stage_completion: HashMap::new(),
            paused: false,
            paused_at: None,
            price_history: VecDeque::new(),
            created_at: now,
            last_updated: now,
        }
    }

    /// Current price over entry price; None until the entry price is known
    pub fn multiple(&self) -> Option<f64> {
        self.entry_price.map(|entry| self.current_price / entry)
    }

    /// Percent change vs. entry (multiple 1.5 -> +50.0)
    pub fn percent_change(&self) -> Option<f64> {
        self.multiple().map(|m| (m - 1.0) * 100.0)
    }

    /// Record a new price observation: recompute the multiple, append to the
    /// bounded history (oldest evicted first) and raise the high-water marks.
    ///
    /// Returns the recomputed multiple, or None when the entry price is not
    /// yet known (in which case nothing is recorded).
    pub fn record_price(&mut self, price: f64) -> Option<f64> {
        let entry = self.entry_price?;
        let multiple = price / entry;

        self.current_price = price;
        self.last_updated = Utc::now();

        self.price_history.push_back(PricePoint {
            timestamp: self.last_updated,
            price,
            multiple,
        });
        while self.price_history.len() > PRICE_HISTORY_CAP {
            self.price_history.pop_front();
        }

        if price > self.highest_price {
            self.highest_price = price;
        }
        if multiple > self.highest_multiple {
            self.highest_multiple = multiple;
        }

        Some(multiple)
    }

    /// Whether a stage has already been sold
    pub fn stage_sold(&self, stage: &str) -> bool {
        self.stage_completion.get(stage).copied().unwrap_or(false)
    }

    /// True when every enabled stage of the given ladder has been sold
    pub fn all_stages_sold<'a, I>(&self, stages: I) -> bool
    where
        I: IntoIterator<Item = &'a StageConfig>,
    {
        stages
            .into_iter()
            .filter(|s| s.enabled)
            .all(|s| self.stage_sold(&s.name))
    }
}

/// Side of a swap
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TradeSide {
    Buy,
    Sell,
}

/// Receipt of an executed swap
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: Uuid,
    pub asset_id: String,
    pub side: TradeSide,
    pub price: f64,
    pub amount: f64,
    pub timestamp: DateTime<Utc>,
    pub tx_signature: Option<String>,
}

impl Trade {
    pub fn new(
        asset_id: &str,
        side: TradeSide,
        price: f64,
        amount: f64,
        tx_signature: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            asset_id: asset_id.to_string(),
            side,
            price,
            amount,
            timestamp: Utc::now(),
            tx_signature,
        }
    }
}
