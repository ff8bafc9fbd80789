/// Node RPC access for wallet synchronization
///
/// The session store only needs idempotent reads: the wallet's addresses,
/// the balance of one address and the transaction delta since a cursor.
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};

use crate::errors::{WalletError, WalletResult};
use crate::ledger::{BlockStamp, Transaction};
use crate::session::{Address, Balance};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Transactions observed since a cursor, plus the block times needed to age them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionDelta {
    pub transactions: Vec<Transaction>,
    #[serde(default)]
    pub blocks: Vec<BlockStamp>,
    /// Cursor to pass on the next partial sync.
    pub cursor: Option<u64>,
}

#[async_trait]
pub trait NodeClient: Send + Sync {
    async fn get_addresses(&self) -> WalletResult<Vec<Address>>;
    async fn get_balance(&self, address: &Address) -> WalletResult<Balance>;
    /// `since = None` requests the full history.
    async fn get_transactions(&self, since: Option<u64>) -> WalletResult<TransactionDelta>;
}

/// JSON-RPC request structure
#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a, T: Serialize> {
    jsonrpc: &'static str,
    method: &'a str,
    params: T,
    id: u64,
}

/// JSON-RPC response structure
#[derive(Debug, Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i32,
    message: String,
}

#[derive(Debug, Deserialize)]
struct AddressesResult {
    addresses: Vec<Address>,
}

/// HTTP JSON-RPC client for a Chert node
#[derive(Debug, Clone)]
pub struct RpcNodeClient {
    client: Client,
    endpoint: Url,
    wallet_id: Option<String>,
}

impl RpcNodeClient {
    pub fn new(base_url: &Url, timeout: Duration) -> WalletResult<Self> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            WalletError::NetworkError(format!("Failed to create HTTP client: {}", e))
        })?;
        let endpoint = base_url
            .join("jsonrpc")
            .map_err(|e| WalletError::ConfigError(format!("Invalid node URL: {}", e)))?;

        Ok(Self {
            client,
            endpoint,
            wallet_id: None,
        })
    }

    /// Scope address and history queries to a wallet identifier known to the node.
    pub fn with_wallet_id(mut self, wallet_id: impl Into<String>) -> Self {
        self.wallet_id = Some(wallet_id.into());
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn rpc_call<T: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> WalletResult<T> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: 1,
        };

        log::debug!("RPC {} -> {}", method, self.endpoint);
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&request)
            .send()
            .await
            .map_err(|e| WalletError::NetworkError(format!("HTTP request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(WalletError::NetworkError(format!(
                "HTTP error: {}",
                response.status()
            )));
        }

        let rpc_response: JsonRpcResponse<T> = response
            .json()
            .await
            .map_err(|e| WalletError::NetworkError(format!("Failed to parse response: {}", e)))?;

        if let Some(error) = rpc_response.error {
            return Err(WalletError::NetworkError(format!(
                "RPC error {}: {}",
                error.code, error.message
            )));
        }

        rpc_response
            .result
            .ok_or_else(|| WalletError::NetworkError("No result in RPC response".to_string()))
    }
}

#[async_trait]
impl NodeClient for RpcNodeClient {
    async fn get_addresses(&self) -> WalletResult<Vec<Address>> {
        let params = serde_json::json!({ "wallet": self.wallet_id });
        let result: AddressesResult = self.rpc_call("wallet_getAddresses", params).await?;
        Ok(result.addresses)
    }

    async fn get_balance(&self, address: &Address) -> WalletResult<Balance> {
        let params = serde_json::json!({ "address": address });
        self.rpc_call("get_balance", params).await
    }

    async fn get_transactions(&self, since: Option<u64>) -> WalletResult<TransactionDelta> {
        let params = serde_json::json!({
            "wallet": self.wallet_id,
            "sinceHeight": since,
        });
        self.rpc_call("wallet_getTransactions", params).await
    }
}
