use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

/// Chain/wallet accessor: reports the current spendable holding of an asset.
///
/// Balances can change outside this process (manual transfers), so callers
/// must treat every read as instantly stale and re-read before acting.
#[async_trait]
pub trait BalanceSource: Send + Sync {
    async fn balance(&self, asset_id: &str) -> Result<f64>;
}

/// JSON-RPC balance client for the wallet's token accounts
#[derive(Clone)]
pub struct RpcWalletClient {
    client: Client,
    rpc_url: String,
    owner: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<BalanceResult>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct BalanceResult {
    value: BalanceValue,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BalanceValue {
    ui_amount: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

impl RpcWalletClient {
    pub fn new(rpc_url: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            rpc_url: rpc_url.into(),
            owner: owner.into(),
        }
    }
}

#[async_trait]
impl BalanceSource for RpcWalletClient {
    async fn balance(&self, asset_id: &str) -> Result<f64> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "getTokenBalance",
            "params": [self.owner, asset_id],
        });

        let response: RpcResponse = self
            .client
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await?
            .json()
            .await?;

        if let Some(err) = response.error {
            return Err(format!("balance rpc error {}: {}", err.code, err.message).into());
        }

        let amount = response
            .result
            .ok_or("balance rpc returned neither result nor error")?
            .value
            .ui_amount
            .unwrap_or(0.0);

        Ok(amount)
    }
}
