use axum::{
    extract::{Path, State},
    Json,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::models::{CreateEscrowRequest, EscrowView, ReceiveAddressRequest};
use crate::{
    coins::{AddressValidator, CoinRegistry},
    error::{AppError, AppResult},
    escrow::models::EscrowTransaction,
    escrow::{EscrowRepository, EscrowStore, NewEscrow},
};

#[derive(Clone)]
pub struct AppState {
    pub repository: Arc<EscrowRepository>,
    pub ledgers: Arc<CoinRegistry>,
}

/// GET /health
pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "healthy" }))
}

/// Create an escrow between two parties
/// POST /api/v1/escrow
///
/// Deposit addresses are generated in the custodial wallets here; the
/// parties never pick them.
pub async fn create_escrow(
    State(state): State<AppState>,
    Json(request): Json<CreateEscrowRequest>,
) -> AppResult<Json<EscrowView>> {
    validate_create_request(&state, &request)?;

    let owner_deposit_address = state.ledgers.new_address(request.from_coin).await?;
    let target_deposit_address = state.ledgers.new_address(request.to_coin).await?;

    let escrow = state
        .repository
        .create(NewEscrow {
            owner_user_id: request.owner_user_id,
            owner_email: request.owner_email,
            target_user_id: request.target_user_id,
            target_email: request.target_email,
            from_coin: request.from_coin,
            from_amount: request.from_amount,
            to_coin: request.to_coin,
            to_amount: request.to_amount,
            commission_method: request.commission_method,
            owner_deposit_address,
            target_deposit_address,
            owner_refund_address: request.owner_refund_address,
            target_refund_address: request.target_refund_address,
        })
        .await?;

    info!(
        "Escrow created: {} ({} {} -> {} {})",
        escrow.id, escrow.from_amount, escrow.from_coin, escrow.to_amount, escrow.to_coin
    );

    Ok(Json(EscrowView::from(escrow)))
}

/// GET /api/v1/escrow/:id
pub async fn get_escrow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<EscrowView>> {
    let escrow = state.repository.get(id).await?;
    Ok(Json(EscrowView::from(escrow)))
}

/// Set a party's final receive address
/// POST /api/v1/escrow/:id/receive-address
///
/// The address is validated against the coin that party receives, which
/// is the other side's deposit coin. An invalid address is rejected and
/// never persisted.
pub async fn save_receive_address(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<ReceiveAddressRequest>,
) -> AppResult<Json<EscrowView>> {
    let escrow = state.repository.get(id).await?;
    let coin = escrow.receive_coin(request.is_owner);

    if !AddressValidator::is_valid(coin, &request.address) {
        return Err(AppError::InvalidAddress {
            coin,
            address: request.address,
        });
    }

    state
        .repository
        .set_receive_address(id, &request.address, request.is_owner)
        .await?;

    let updated = state.repository.get(id).await?;
    Ok(Json(EscrowView::from(updated)))
}

/// GET /api/v1/escrow/:id/transactions
pub async fn list_transactions(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Vec<EscrowTransaction>>> {
    // Surface a 404 for unknown escrows instead of an empty list
    state.repository.get(id).await?;

    let transactions = state.repository.transactions_for(id).await?;
    Ok(Json(transactions))
}

fn validate_create_request(state: &AppState, request: &CreateEscrowRequest) -> AppResult<()> {
    if request.from_coin == request.to_coin {
        return Err(AppError::UnsupportedCoinPair {
            from: request.from_coin,
            to: request.to_coin,
        });
    }

    for coin in [request.from_coin, request.to_coin] {
        if !state.ledgers.supports(coin) {
            return Err(AppError::InvalidInput(format!(
                "no ledger node configured for {}",
                coin
            )));
        }
    }

    if request.from_amount <= Decimal::ZERO || request.to_amount <= Decimal::ZERO {
        return Err(AppError::InvalidInput(
            "escrow amounts must be positive".to_string(),
        ));
    }

    if request.owner_email.eq_ignore_ascii_case(&request.target_email) {
        return Err(AppError::InvalidInput(
            "owner and target must be different parties".to_string(),
        ));
    }

    if !AddressValidator::is_valid(request.from_coin, &request.owner_refund_address) {
        return Err(AppError::InvalidAddress {
            coin: request.from_coin,
            address: request.owner_refund_address.clone(),
        });
    }

    if !AddressValidator::is_valid(request.to_coin, &request.target_refund_address) {
        return Err(AppError::InvalidAddress {
            coin: request.to_coin,
            address: request.target_refund_address.clone(),
        });
    }

    Ok(())
}
