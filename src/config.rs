use config::ConfigError;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;

use crate::escrow::models::Coin;

/// Per-coin node connection settings. A coin without settings is simply
/// not registered and escrows cannot be created on it.
#[derive(Debug, Deserialize, Clone)]
pub struct CoinNodeConfig {
    pub rpc_url: String,
    pub rpc_user: String,
    pub rpc_password: String,
    pub min_confirmations: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    pub commission_rate_percent: Decimal,
    pub escrow_expire_days: i64,
    pub tick_interval_seconds: u64,
    pub reconciler_time_budget_seconds: u64,
    pub reconciler_concurrency: usize,
    pub rpc_timeout_seconds: u64,
    pub resend_api_key: String,
    pub resend_from_email: String,
    pub bitcoin: Option<CoinNodeConfig>,
    pub litecoin: Option<CoinNodeConfig>,
    pub dogecoin: Option<CoinNodeConfig>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgresql://localhost/escrow".to_string()),
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            commission_rate_percent: decimal_var("COMMISSION_RATE_PERCENT", "1")?,
            escrow_expire_days: parsed_var("ESCROW_EXPIRE_DAYS", "3")?,
            tick_interval_seconds: parsed_var("TICK_INTERVAL_SECONDS", "600")?,
            reconciler_time_budget_seconds: parsed_var("RECONCILER_TIME_BUDGET_SECONDS", "540")?,
            reconciler_concurrency: parsed_var("RECONCILER_CONCURRENCY", "8")?,
            rpc_timeout_seconds: parsed_var("RPC_TIMEOUT_SECONDS", "30")?,
            resend_api_key: std::env::var("RESEND_API_KEY").unwrap_or_default(),
            resend_from_email: std::env::var("RESEND_FROM_EMAIL")
                .unwrap_or_else(|_| "escrow@localhost".to_string()),
            bitcoin: coin_node_config(Coin::Bitcoin)?,
            litecoin: coin_node_config(Coin::Litecoin)?,
            dogecoin: coin_node_config(Coin::Dogecoin)?,
        })
    }

    pub fn coin_node(&self, coin: Coin) -> Option<&CoinNodeConfig> {
        match coin {
            Coin::Bitcoin => self.bitcoin.as_ref(),
            Coin::Litecoin => self.litecoin.as_ref(),
            Coin::Dogecoin => self.dogecoin.as_ref(),
        }
    }
}

/// Read a coin's node settings from `BITCOIN_RPC_URL` style variables.
/// Only the URL is required for the coin to count as configured.
fn coin_node_config(coin: Coin) -> Result<Option<CoinNodeConfig>, ConfigError> {
    let prefix = coin.as_str().to_uppercase();

    let rpc_url = match std::env::var(format!("{prefix}_RPC_URL")) {
        Ok(url) => url,
        Err(_) => return Ok(None),
    };

    Ok(Some(CoinNodeConfig {
        rpc_url,
        rpc_user: std::env::var(format!("{prefix}_RPC_USER")).unwrap_or_default(),
        rpc_password: std::env::var(format!("{prefix}_RPC_PASSWORD")).unwrap_or_default(),
        min_confirmations: parsed_var(&format!("{prefix}_MIN_CONFIRMATIONS"), "3")?,
    }))
}

fn parsed_var<T: FromStr>(name: &str, default: &str) -> Result<T, ConfigError> {
    let raw = std::env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse()
        .map_err(|_| ConfigError::Message(format!("{name} is not a valid value: {raw}")))
}

fn decimal_var(name: &str, default: &str) -> Result<Decimal, ConfigError> {
    let raw = std::env::var(name).unwrap_or_else(|_| default.to_string());
    Decimal::from_str(&raw)
        .map_err(|_| ConfigError::Message(format!("{name} is not a valid decimal: {raw}")))
}
