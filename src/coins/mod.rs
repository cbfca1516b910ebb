pub mod address;
pub mod rpc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::error::LedgerError;
use crate::escrow::models::Coin;

pub use address::AddressValidator;
pub use rpc::{CoinRpcClient, CoinRpcConfig};

/// Ledger client trait - the capability the settlement core consumes
/// from each coin's external node.
///
/// INVARIANTS:
/// - amount_received reports cumulative confirmed deposits; callers must
///   tolerate re-reads returning the same or a larger value
/// - send either returns a transaction id or a PaymentFailed error; it is
///   never retried automatically within a tick
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Total amount received at an address with at least `min_confirmations`
    async fn amount_received(
        &self,
        address: &str,
        min_confirmations: u32,
    ) -> Result<Decimal, LedgerError>;

    /// Send an amount to an address, returning the transaction id
    async fn send(&self, address: &str, amount: Decimal) -> Result<String, LedgerError>;

    /// Generate a fresh deposit address in the node's wallet
    async fn new_address(&self) -> Result<String, LedgerError>;

    /// The coin this client talks to
    fn coin(&self) -> Coin;
}

/// Per-coin ledger endpoint: the client plus its confirmation threshold
#[derive(Clone)]
pub struct CoinEndpoint {
    pub client: Arc<dyn LedgerClient>,
    pub min_confirmations: u32,
}

/// CoinRegistry - routes ledger reads and payments to the right coin node
pub struct CoinRegistry {
    endpoints: HashMap<Coin, CoinEndpoint>,
}

impl CoinRegistry {
    pub fn new() -> Self {
        Self {
            endpoints: HashMap::new(),
        }
    }

    /// Register a ledger client for a coin
    pub fn register(&mut self, coin: Coin, client: Arc<dyn LedgerClient>, min_confirmations: u32) {
        info!(
            "Registering ledger client for {} (min confirmations: {})",
            coin, min_confirmations
        );
        self.endpoints.insert(
            coin,
            CoinEndpoint {
                client,
                min_confirmations,
            },
        );
    }

    pub fn endpoint(&self, coin: Coin) -> Result<&CoinEndpoint, LedgerError> {
        self.endpoints.get(&coin).ok_or(LedgerError::UnknownCoin(coin))
    }

    /// Confirmed amount received at an address, using the coin's threshold
    pub async fn amount_received(
        &self,
        coin: Coin,
        address: &str,
    ) -> Result<Decimal, LedgerError> {
        let endpoint = self.endpoint(coin)?;
        endpoint
            .client
            .amount_received(address, endpoint.min_confirmations)
            .await
    }

    /// Send a payment on the given coin's ledger
    pub async fn send(
        &self,
        coin: Coin,
        address: &str,
        amount: Decimal,
    ) -> Result<String, LedgerError> {
        self.endpoint(coin)?.client.send(address, amount).await
    }

    /// Generate a fresh deposit address on the given coin's node
    pub async fn new_address(&self, coin: Coin) -> Result<String, LedgerError> {
        self.endpoint(coin)?.client.new_address().await
    }

    pub fn registered_coins(&self) -> Vec<Coin> {
        self.endpoints.keys().copied().collect()
    }

    pub fn supports(&self, coin: Coin) -> bool {
        self.endpoints.contains_key(&coin)
    }
}

impl Default for CoinRegistry {
    fn default() -> Self {
        Self::new()
    }
}
