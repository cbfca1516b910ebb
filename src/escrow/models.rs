use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, Type};
use std::fmt;
use uuid::Uuid;

/// Supported coin types - one external bitcoind-family node per coin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "coin_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Coin {
    Bitcoin,
    Litecoin,
    Dogecoin,
}

impl fmt::Display for Coin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Coin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Coin::Bitcoin => "bitcoin",
            Coin::Litecoin => "litecoin",
            Coin::Dogecoin => "dogecoin",
        }
    }

    pub fn ticker(&self) -> &'static str {
        match self {
            Coin::Bitcoin => "BTC",
            Coin::Litecoin => "LTC",
            Coin::Dogecoin => "DOGE",
        }
    }

    /// Return all supported coins
    pub fn all() -> Vec<Coin> {
        vec![Coin::Bitcoin, Coin::Litecoin, Coin::Dogecoin]
    }
}

/// Escrow status enum
///
/// Published and InProgress are the open set the reconciler polls;
/// Completed, Failed and Denied are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "escrow_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    Pending,
    Published,
    InProgress,
    Completed,
    Failed,
    Denied,
}

impl EscrowStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, EscrowStatus::Published | EscrowStatus::InProgress)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EscrowStatus::Completed | EscrowStatus::Failed | EscrowStatus::Denied
        )
    }
}

/// Which party absorbs the platform commission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "commission_method")]
pub enum CommissionMethod {
    /// All on the escrow owner
    #[sqlx(rename = "by_user")]
    #[serde(rename = "by_user")]
    ByOwner,
    /// All on the counterparty
    #[sqlx(rename = "by_target")]
    #[serde(rename = "by_target")]
    ByTarget,
    /// Divided on both parties equally
    #[sqlx(rename = "50_50")]
    #[serde(rename = "50_50")]
    SplitEven,
}

/// One-way booleans used to deduplicate notifications and effects
/// across reconciler ticks. Persisted once set, never unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscrowFlag {
    IsFailure,
    /// The to-side deposit completed and both parties were told
    OwnerNotified,
    /// The from-side deposit completed and both parties were told
    TargetNotified,
}

/// The side of the swap a deposit belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepositSide {
    /// Owner deposits from_amount of from_coin
    From,
    /// Counterparty deposits to_amount of to_coin
    To,
}

/// Escrow entity - a custodial agreement tracking a two-party coin swap
/// through deposit, verification and payout.
///
/// INVARIANT: from_coin != to_coin. Once is_failure is set the escrow is
/// never processed again; once status is terminal it leaves the open set.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Escrow {
    pub id: Uuid,
    pub owner_user_id: Uuid,
    pub owner_email: String,
    pub target_user_id: Uuid,
    pub target_email: String,

    pub from_coin: Coin,
    pub from_amount: Decimal,
    pub to_coin: Coin,
    pub to_amount: Decimal,
    pub commission_method: CommissionMethod,

    pub owner_deposit_address: String,
    pub target_deposit_address: String,
    pub owner_refund_address: String,
    pub target_refund_address: String,
    pub owner_receive_address: Option<String>,
    pub target_receive_address: Option<String>,

    pub from_amount_received: Decimal,
    pub to_amount_received: Decimal,

    pub is_failure: bool,
    pub owner_notified: bool,
    pub target_notified: bool,

    pub owner_payout_txid: Option<String>,
    pub target_payout_txid: Option<String>,

    pub status: EscrowStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Escrow {
    /// Both final receive addresses supplied
    pub fn has_receive_addresses(&self) -> bool {
        self.owner_receive_address.is_some() && self.target_receive_address.is_some()
    }

    /// The coin a given party ends up receiving (the other side's deposit)
    pub fn receive_coin(&self, is_owner: bool) -> Coin {
        if is_owner {
            self.to_coin
        } else {
            self.from_coin
        }
    }

    pub fn expires_at(&self, expire_days: i64) -> DateTime<Utc> {
        self.created_at + chrono::Duration::days(expire_days)
    }

    pub fn recorded(&self, side: DepositSide) -> Decimal {
        match side {
            DepositSide::From => self.from_amount_received,
            DepositSide::To => self.to_amount_received,
        }
    }
}

/// Transaction log entry kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "transaction_kind", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Received,
    Refund,
    Sent,
}

/// Audit-trail row: one per observed deposit, refund attempt or payout
/// attempt, success or failure.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EscrowTransaction {
    pub id: Uuid,
    pub escrow_id: Uuid,
    pub user_id: Uuid,
    pub kind: TransactionKind,
    pub coin: Coin,
    pub amount: Decimal,
    pub txid: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Format a coin amount for user-facing messages
pub fn display_amount(amount: Decimal, coin: Coin) -> String {
    format!("{} {}", amount.normalize(), coin.ticker())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_status_sets() {
        assert!(EscrowStatus::Published.is_open());
        assert!(EscrowStatus::InProgress.is_open());
        assert!(!EscrowStatus::Completed.is_open());
        assert!(EscrowStatus::Failed.is_terminal());
        assert!(EscrowStatus::Denied.is_terminal());
        assert!(!EscrowStatus::Pending.is_terminal());
    }

    #[test]
    fn test_display_amount() {
        assert_eq!(display_amount(dec!(1.50000000), Coin::Bitcoin), "1.5 BTC");
        assert_eq!(display_amount(dec!(42), Coin::Dogecoin), "42 DOGE");
    }
}
