use crate::Result;
use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use reqwest::Client;
use serde::Deserialize;
use std::num::NonZeroU32;
use std::sync::Arc;

const RATE_LIMIT_RPM: u32 = 300; // DexScreener allows 300 requests per minute

// Type alias for the rate limiter to simplify signatures
type DirectRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Anything that can report a spot price for an asset.
///
/// `Ok(None)` means the source answered but has no pair data for the asset;
/// `Err` means the lookup itself failed.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn spot_price(&self, asset_id: &str) -> Result<Option<f64>>;
}

/// DexScreener-style price client.
///
/// All clones share the same rate limiter, so scheduler batches cannot
/// exceed the upstream allowance no matter how many tasks hold a handle.
#[derive(Clone)]
pub struct DexPriceClient {
    client: Client,
    base_url: String,
    rate_limiter: Arc<DirectRateLimiter>,
}

#[derive(Debug, Deserialize)]
struct PairsResponse {
    pairs: Option<Vec<PairData>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PairData {
    price_usd: Option<String>,
}

impl DexPriceClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let quota = Quota::per_minute(NonZeroU32::new(RATE_LIMIT_RPM).unwrap());
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
        }
    }
}

#[async_trait]
impl PriceSource for DexPriceClient {
    async fn spot_price(&self, asset_id: &str) -> Result<Option<f64>> {
        self.rate_limiter.until_ready().await;

        let url = format!("{}/tokens/{}", self.base_url, asset_id);
        let response: PairsResponse = self.client.get(&url).send().await?.json().await?;

        let price = response
            .pairs
            .unwrap_or_default()
            .into_iter()
            .find_map(|pair| pair.price_usd)
            .map(|raw| raw.parse::<f64>())
            .transpose()?;

        Ok(price.filter(|p| *p > 0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spot_price_parses_first_priced_pair() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/tokens/mint-1")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"pairs":[{"priceUsd":null},{"priceUsd":"1.2345"}]}"#)
            .create_async()
            .await;

        let client = DexPriceClient::new(server.url());
        let price = client.spot_price("mint-1").await.unwrap();

        assert_eq!(price, Some(1.2345));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_spot_price_empty_pairs_is_none() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/tokens/mint-1")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"pairs":null}"#)
            .create_async()
            .await;

        let client = DexPriceClient::new(server.url());
        let price = client.spot_price("mint-1").await.unwrap();

        assert_eq!(price, None);
    }

    #[tokio::test]
    async fn test_spot_price_server_error_surfaces() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/tokens/mint-1")
            .with_status(500)
            .create_async()
            .await;

        let client = DexPriceClient::new(server.url());
        assert!(client.spot_price("mint-1").await.is_err());
    }

    #[tokio::test]
    async fn test_zero_price_treated_as_missing() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/tokens/mint-1")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"pairs":[{"priceUsd":"0"}]}"#)
            .create_async()
            .await;

        let client = DexPriceClient::new(server.url());
        let price = client.spot_price("mint-1").await.unwrap();

        assert_eq!(price, None);
    }
}
