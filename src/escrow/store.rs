use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::StoreError;
use crate::escrow::models::{
    Coin, CommissionMethod, DepositSide, Escrow, EscrowFlag, EscrowStatus, EscrowTransaction,
    TransactionKind,
};

/// Escrow record store - the capability the reconciler consumes.
///
/// All mutating operations are conditional on the escrow still being in
/// the open set, so two overlapping reconciler runs can never both apply
/// a terminal transition or record against a closed escrow. Zero rows
/// affected surfaces as StoreError::Conflict.
#[async_trait]
pub trait EscrowStore: Send + Sync {
    async fn load_open_escrows(&self) -> Result<Vec<Escrow>, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Escrow, StoreError>;

    /// Record a newly observed confirmed deposit total for one side.
    /// Monotonic: a value at or below the recorded one is a no-op.
    async fn record_deposit(
        &self,
        id: Uuid,
        side: DepositSide,
        amount: Decimal,
    ) -> Result<(), StoreError>;

    /// Set a one-way flag. Idempotent: re-setting is harmless.
    async fn set_flag(&self, id: Uuid, flag: EscrowFlag) -> Result<(), StoreError>;

    /// Transition status, guarded on the escrow still being open
    async fn set_status(&self, id: Uuid, to: EscrowStatus) -> Result<(), StoreError>;

    async fn set_receive_address(
        &self,
        id: Uuid,
        address: &str,
        is_owner: bool,
    ) -> Result<(), StoreError>;

    async fn set_payout_txid(
        &self,
        id: Uuid,
        is_owner: bool,
        txid: &str,
    ) -> Result<(), StoreError>;
}

/// Transaction log - append-only audit trail of fund movement
#[async_trait]
pub trait TransactionLog: Send + Sync {
    async fn append(
        &self,
        escrow_id: Uuid,
        user_id: Uuid,
        kind: TransactionKind,
        coin: Coin,
        amount: Decimal,
        txid: Option<&str>,
        error: Option<&str>,
    ) -> Result<(), StoreError>;
}

/// Parameters for creating a new escrow record
#[derive(Debug, Clone)]
pub struct NewEscrow {
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
}

/// Postgres-backed escrow repository
pub struct EscrowRepository {
    pool: PgPool,
}

impl EscrowRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, new: NewEscrow) -> Result<Escrow, StoreError> {
        let escrow = sqlx::query_as::<_, Escrow>(
            r#"
            INSERT INTO escrows (
                owner_user_id, owner_email, target_user_id, target_email,
                from_coin, from_amount, to_coin, to_amount, commission_method,
                owner_deposit_address, target_deposit_address,
                owner_refund_address, target_refund_address
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING *
            "#,
        )
        .bind(new.owner_user_id)
        .bind(&new.owner_email)
        .bind(new.target_user_id)
        .bind(&new.target_email)
        .bind(new.from_coin)
        .bind(new.from_amount)
        .bind(new.to_coin)
        .bind(new.to_amount)
        .bind(new.commission_method)
        .bind(&new.owner_deposit_address)
        .bind(&new.target_deposit_address)
        .bind(&new.owner_refund_address)
        .bind(&new.target_refund_address)
        .fetch_one(&self.pool)
        .await?;

        Ok(escrow)
    }

    /// Full audit trail for one escrow, oldest first
    pub async fn transactions_for(
        &self,
        escrow_id: Uuid,
    ) -> Result<Vec<EscrowTransaction>, StoreError> {
        let rows = sqlx::query_as::<_, EscrowTransaction>(
            r#"
            SELECT * FROM escrow_transactions
            WHERE escrow_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(escrow_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

#[async_trait]
impl EscrowStore for EscrowRepository {
    async fn load_open_escrows(&self) -> Result<Vec<Escrow>, StoreError> {
        let escrows = sqlx::query_as::<_, Escrow>(
            r#"
            SELECT * FROM escrows
            WHERE status IN ('published', 'in_progress') AND is_failure = FALSE
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(escrows)
    }

    async fn get(&self, id: Uuid) -> Result<Escrow, StoreError> {
        sqlx::query_as::<_, Escrow>("SELECT * FROM escrows WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound(id))
    }

    async fn record_deposit(
        &self,
        id: Uuid,
        side: DepositSide,
        amount: Decimal,
    ) -> Result<(), StoreError> {
        let column = match side {
            DepositSide::From => "from_amount_received",
            DepositSide::To => "to_amount_received",
        };

        // Monotonic guard in SQL: never lower a recorded deposit total
        let query = format!(
            r#"
            UPDATE escrows
            SET {column} = $2, updated_at = NOW()
            WHERE id = $1
              AND status IN ('published', 'in_progress')
              AND {column} < $2
            "#,
        );

        let result = sqlx::query(&query)
            .bind(id)
            .bind(amount)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(id));
        }

        Ok(())
    }

    async fn set_flag(&self, id: Uuid, flag: EscrowFlag) -> Result<(), StoreError> {
        let column = match flag {
            EscrowFlag::IsFailure => "is_failure",
            EscrowFlag::OwnerNotified => "owner_notified",
            EscrowFlag::TargetNotified => "target_notified",
        };

        let query = format!("UPDATE escrows SET {column} = TRUE, updated_at = NOW() WHERE id = $1");

        let result = sqlx::query(&query).bind(id).execute(&self.pool).await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }

        Ok(())
    }

    async fn set_status(&self, id: Uuid, to: EscrowStatus) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE escrows
            SET status = $2, updated_at = NOW()
            WHERE id = $1 AND status IN ('published', 'in_progress')
            "#,
        )
        .bind(id)
        .bind(to)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(id));
        }

        Ok(())
    }

    async fn set_receive_address(
        &self,
        id: Uuid,
        address: &str,
        is_owner: bool,
    ) -> Result<(), StoreError> {
        let column = if is_owner {
            "owner_receive_address"
        } else {
            "target_receive_address"
        };

        // Settable any time before completion
        let query = format!(
            r#"
            UPDATE escrows
            SET {column} = $2, updated_at = NOW()
            WHERE id = $1 AND status NOT IN ('completed', 'failed', 'denied')
            "#,
        );

        let result = sqlx::query(&query)
            .bind(id)
            .bind(address)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(id));
        }

        Ok(())
    }

    async fn set_payout_txid(
        &self,
        id: Uuid,
        is_owner: bool,
        txid: &str,
    ) -> Result<(), StoreError> {
        let column = if is_owner {
            "owner_payout_txid"
        } else {
            "target_payout_txid"
        };

        let query = format!("UPDATE escrows SET {column} = $2, updated_at = NOW() WHERE id = $1");

        let result = sqlx::query(&query)
            .bind(id)
            .bind(txid)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }

        Ok(())
    }
}

#[async_trait]
impl TransactionLog for EscrowRepository {
    async fn append(
        &self,
        escrow_id: Uuid,
        user_id: Uuid,
        kind: TransactionKind,
        coin: Coin,
        amount: Decimal,
        txid: Option<&str>,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO escrow_transactions (escrow_id, user_id, kind, coin, amount, txid, error)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(escrow_id)
        .bind(user_id)
        .bind(kind)
        .bind(coin)
        .bind(amount)
        .bind(txid)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
