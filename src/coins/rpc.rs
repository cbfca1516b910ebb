// Coin node JSON-RPC client
//
// Talks to one bitcoind-family node per coin over HTTP basic auth.
// Only two methods are consumed by the settlement core:
// - getreceivedbyaddress(address, minconf)
// - sendtoaddress(address, amount)

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use crate::coins::LedgerClient;
use crate::error::LedgerError;
use crate::escrow::models::Coin;

/// Connection settings for one coin node
#[derive(Debug, Clone)]
pub struct CoinRpcConfig {
    pub url: String,
    pub rpc_user: String,
    pub rpc_password: String,
    /// Per-call timeout so a stalled node cannot stall a whole tick
    pub timeout: Duration,
}

/// JSON-RPC client for a single coin node
pub struct CoinRpcClient {
    coin: Coin,
    config: CoinRpcConfig,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<serde_json::Value>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

impl CoinRpcClient {
    pub fn new(coin: Coin, config: CoinRpcConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            coin,
            config,
            client,
        })
    }

    fn unavailable(&self, message: impl Into<String>) -> LedgerError {
        LedgerError::Unavailable {
            coin: self.coin,
            message: message.into(),
        }
    }

    async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, LedgerError> {
        let body = json!({
            "jsonrpc": "1.0",
            "id": "escrow-backend",
            "method": method,
            "params": params,
        });

        let response = self
            .client
            .post(&self.config.url)
            .basic_auth(&self.config.rpc_user, Some(&self.config.rpc_password))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.unavailable(format!("{} request failed: {}", method, e)))?;

        if !response.status().is_success() && response.status().as_u16() != 500 {
            // bitcoind returns 500 with a JSON error body for RPC-level failures
            return Err(self.unavailable(format!(
                "{} returned HTTP {}",
                method,
                response.status()
            )));
        }

        let parsed: RpcResponse = response
            .json()
            .await
            .map_err(|e| self.unavailable(format!("{} bad response: {}", method, e)))?;

        if let Some(err) = parsed.error {
            return Err(LedgerError::PaymentFailed {
                coin: self.coin,
                message: format!("{} rpc error {}: {}", method, err.code, err.message),
            });
        }

        parsed
            .result
            .ok_or_else(|| self.unavailable(format!("{} returned no result", method)))
    }

    /// Parse a node-reported amount without going through binary floats.
    /// The node serializes amounts as JSON numbers; taking the raw token
    /// as a string keeps the full decimal precision.
    fn parse_amount(&self, value: &serde_json::Value) -> Result<Decimal, LedgerError> {
        let raw = match value {
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::String(s) => s.clone(),
            other => {
                return Err(self.unavailable(format!("unexpected amount payload: {}", other)))
            }
        };

        Decimal::from_str(&raw)
            .map_err(|e| self.unavailable(format!("unparseable amount '{}': {}", raw, e)))
    }
}

#[async_trait]
impl LedgerClient for CoinRpcClient {
    async fn amount_received(
        &self,
        address: &str,
        min_confirmations: u32,
    ) -> Result<Decimal, LedgerError> {
        let result = self
            .call("getreceivedbyaddress", json!([address, min_confirmations]))
            .await
            .map_err(|e| match e {
                // A read has no payment semantics: RPC-level failures on
                // reads are treated as transient too
                LedgerError::PaymentFailed { coin, message } => {
                    LedgerError::Unavailable { coin, message }
                }
                other => other,
            })?;

        let amount = self.parse_amount(&result)?;
        debug!(
            "{} received at {}: {} (minconf {})",
            self.coin, address, amount, min_confirmations
        );
        Ok(amount)
    }

    async fn send(&self, address: &str, amount: Decimal) -> Result<String, LedgerError> {
        // Amount goes over the wire as a string so no float conversion
        // happens on either side
        let result = self
            .call("sendtoaddress", json!([address, amount.normalize().to_string()]))
            .await?;

        match result {
            serde_json::Value::String(txid) => Ok(txid),
            other => Err(LedgerError::PaymentFailed {
                coin: self.coin,
                message: format!("sendtoaddress returned non-txid payload: {}", other),
            }),
        }
    }

    async fn new_address(&self) -> Result<String, LedgerError> {
        let result = self.call("getnewaddress", json!([])).await.map_err(|e| match e {
            LedgerError::PaymentFailed { coin, message } => {
                LedgerError::Unavailable { coin, message }
            }
            other => other,
        })?;

        match result {
            serde_json::Value::String(address) => Ok(address),
            other => Err(self.unavailable(format!(
                "getnewaddress returned non-address payload: {}",
                other
            ))),
        }
    }

    fn coin(&self) -> Coin {
        self.coin
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn test_client() -> CoinRpcClient {
        CoinRpcClient::new(
            Coin::Bitcoin,
            CoinRpcConfig {
                url: "http://127.0.0.1:8332".to_string(),
                rpc_user: "rpc".to_string(),
                rpc_password: "rpc".to_string(),
                timeout: Duration::from_secs(5),
            },
        )
        .unwrap()
    }

    #[test]
    fn test_parse_amount_from_number() {
        let client = test_client();
        let value: serde_json::Value = serde_json::from_str("0.05000000").unwrap();
        assert_eq!(client.parse_amount(&value).unwrap(), dec!(0.05));
    }

    #[test]
    fn test_parse_amount_from_string() {
        let client = test_client();
        let value = serde_json::Value::String("12.34567891".to_string());
        assert_eq!(client.parse_amount(&value).unwrap(), dec!(12.34567891));
    }

    #[test]
    fn test_parse_amount_rejects_garbage() {
        let client = test_client();
        let value = serde_json::Value::Bool(true);
        assert!(client.parse_amount(&value).is_err());
    }
}
