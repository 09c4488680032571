use crate::models::{Trade, TradeSide};
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

/// Result of a sell request against the venue
#[derive(Debug, Clone)]
pub enum SellOutcome {
    Filled(Trade),
    /// The venue found nothing left to sell for this asset
    NoBalance,
}

/// Swap execution venue: opaque remote call with binary success/failure,
/// reporting signature and fill price.
#[async_trait]
pub trait SwapVenue: Send + Sync {
    /// Spend `quote_amount` of the quote currency buying `asset_id`
    async fn buy(&self, asset_id: &str, quote_amount: f64, slippage_bps: u16) -> Result<Trade>;

    /// Sell `amount` of `asset_id` back to the quote currency
    async fn sell(&self, asset_id: &str, amount: f64, slippage_bps: u16) -> Result<SellOutcome>;
}

/// HTTP client for the swap execution venue
#[derive(Clone)]
pub struct SwapClient {
    client: Client,
    base_url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SwapRequest<'a> {
    asset_id: &'a str,
    side: &'a str,
    amount: f64,
    slippage_bps: u16,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SwapResponse {
    success: bool,
    signature: Option<String>,
    price: Option<f64>,
    filled_amount: Option<f64>,
    error: Option<String>,
}

impl SwapClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
        }
    }

    async fn swap(&self, request: &SwapRequest<'_>) -> Result<SwapResponse> {
        let url = format!("{}/swap", self.base_url);
        let response: SwapResponse = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await?
            .json()
            .await?;
        Ok(response)
    }
}

#[async_trait]
impl SwapVenue for SwapClient {
    async fn buy(&self, asset_id: &str, quote_amount: f64, slippage_bps: u16) -> Result<Trade> {
        let response = self
            .swap(&SwapRequest {
                asset_id,
                side: "buy",
                amount: quote_amount,
                slippage_bps,
            })
            .await?;

        if !response.success {
            return Err(response
                .error
                .unwrap_or_else(|| "swap venue rejected buy".to_string())
                .into());
        }

        tracing::info!(
            asset_id,
            price = ?response.price,
            signature = ?response.signature,
            "buy filled"
        );

        Ok(Trade::new(
            asset_id,
            TradeSide::Buy,
            response.price.unwrap_or(0.0),
            response.filled_amount.unwrap_or(0.0),
            response.signature,
        ))
    }

    async fn sell(&self, asset_id: &str, amount: f64, slippage_bps: u16) -> Result<SellOutcome> {
        let response = self
            .swap(&SwapRequest {
                asset_id,
                side: "sell",
                amount,
                slippage_bps,
            })
            .await?;

        if !response.success {
            return Err(response
                .error
                .unwrap_or_else(|| "swap venue rejected sell".to_string())
                .into());
        }

        // A successful response with nothing filled means the venue saw no
        // remaining balance for this asset.
        if response.filled_amount.unwrap_or(0.0) <= 0.0 {
            return Ok(SellOutcome::NoBalance);
        }

        Ok(SellOutcome::Filled(Trade::new(
            asset_id,
            TradeSide::Sell,
            response.price.unwrap_or(0.0),
            response.filled_amount.unwrap_or(0.0),
            response.signature,
        )))
    }
}
