// Request and response bodies for the escrow API

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::escrow::models::{Coin, CommissionMethod, Escrow, EscrowStatus};

#[derive(Debug, Deserialize)]
pub struct CreateEscrowRequest {
    pub owner_user_id: Uuid,
    pub owner_email: String,
    pub target_user_id: Uuid,
    pub target_email: String,
    pub from_coin: Coin,
    pub from_amount: Decimal,
    pub to_coin: Coin,
    pub to_amount: Decimal,
    pub commission_method: CommissionMethod,
    pub owner_refund_address: String,
    pub target_refund_address: String,
}

#[derive(Debug, Deserialize)]
pub struct ReceiveAddressRequest {
    pub address: String,
    pub is_owner: bool,
}

/// Display-ready escrow snapshot
#[derive(Debug, Serialize)]
pub struct EscrowView {
    pub id: Uuid,
    pub status: EscrowStatus,
    pub owner_email: String,
    pub target_email: String,
    pub from_coin: Coin,
    pub from_amount: Decimal,
    pub to_coin: Coin,
    pub to_amount: Decimal,
    pub commission_method: CommissionMethod,
    pub owner_deposit_address: String,
    pub target_deposit_address: String,
    pub owner_receive_address: Option<String>,
    pub target_receive_address: Option<String>,
    pub from_amount_received: Decimal,
    pub to_amount_received: Decimal,
    pub owner_payout_txid: Option<String>,
    pub target_payout_txid: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<Escrow> for EscrowView {
    fn from(escrow: Escrow) -> Self {
        Self {
            id: escrow.id,
            status: escrow.status,
            owner_email: escrow.owner_email,
            target_email: escrow.target_email,
            from_coin: escrow.from_coin,
            from_amount: escrow.from_amount,
            to_coin: escrow.to_coin,
            to_amount: escrow.to_amount,
            commission_method: escrow.commission_method,
            owner_deposit_address: escrow.owner_deposit_address,
            target_deposit_address: escrow.target_deposit_address,
            owner_receive_address: escrow.owner_receive_address,
            target_receive_address: escrow.target_receive_address,
            from_amount_received: escrow.from_amount_received,
            to_amount_received: escrow.to_amount_received,
            owner_payout_txid: escrow.owner_payout_txid,
            target_payout_txid: escrow.target_payout_txid,
            created_at: escrow.created_at,
        }
    }
}
