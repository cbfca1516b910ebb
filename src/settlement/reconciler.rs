// Settlement reconciler - one pass over all open escrows per tick
//
// Per escrow: two concurrent ledger reads, one pure decision, then the
// effects are applied (persist, pay, notify, publish). Escrows are
// isolated from each other: a failure in one never aborts the batch.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::coins::CoinRegistry;
use crate::error::{AppResult, StoreError};
use crate::escrow::models::{Escrow, EscrowStatus, TransactionKind};
use crate::escrow::{EscrowStore, TransactionLog};
use crate::events::EventBus;
use crate::notify::templates::{self, Notice};
use crate::notify::Notifier;
use crate::settlement::decision::{decide, Decision, LedgerFacts, PaymentKind, SettlementConfig};

/// Reconciler tuning knobs
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub settlement: SettlementConfig,
    /// Max escrows evaluated concurrently
    pub concurrency: usize,
    /// Wall-clock budget for one tick; in-flight evaluations finish,
    /// no new ones start once exceeded
    pub time_budget: Duration,
}

/// Outcome counters for one tick
#[derive(Debug, Default, Clone, Copy)]
pub struct TickSummary {
    pub evaluated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub deferred: usize,
}

/// Everything one escrow evaluation needs, cheap to clone into tasks
#[derive(Clone)]
struct TickContext {
    store: Arc<dyn EscrowStore>,
    txlog: Arc<dyn TransactionLog>,
    ledgers: Arc<CoinRegistry>,
    notifier: Arc<dyn Notifier>,
    events: EventBus,
    settlement: SettlementConfig,
}

enum EscrowOutcome {
    Applied,
    Noop,
    Skipped,
    Errored,
}

pub struct Reconciler {
    ctx: TickContext,
    concurrency: usize,
    time_budget: Duration,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn EscrowStore>,
        txlog: Arc<dyn TransactionLog>,
        ledgers: Arc<CoinRegistry>,
        notifier: Arc<dyn Notifier>,
        events: EventBus,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            ctx: TickContext {
                store,
                txlog,
                ledgers,
                notifier,
                events,
                settlement: config.settlement,
            },
            concurrency: config.concurrency.max(1),
            time_budget: config.time_budget,
        }
    }

    /// Run one reconciliation pass. Work not finished within the time
    /// budget is simply picked up, from persisted state, on the next tick.
    pub async fn run_tick(&self) -> AppResult<TickSummary> {
        let deadline = Instant::now() + self.time_budget;
        let escrows = self.ctx.store.load_open_escrows().await?;

        if escrows.is_empty() {
            return Ok(TickSummary::default());
        }

        info!("Reconciling {} open escrows", escrows.len());

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        let mut summary = TickSummary::default();

        for escrow in escrows {
            // Terminal skip, enforced here as well as in the open query
            if escrow.is_failure {
                summary.skipped += 1;
                continue;
            }

            if Instant::now() >= deadline {
                summary.deferred += 1;
                continue;
            }

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            // Waiting for a permit may have consumed the budget
            if Instant::now() >= deadline {
                summary.deferred += 1;
                continue;
            }

            let ctx = self.ctx.clone();
            tasks.spawn(async move {
                let _permit = permit;
                process_escrow(ctx, escrow).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(EscrowOutcome::Applied) | Ok(EscrowOutcome::Noop) => summary.evaluated += 1,
                Ok(EscrowOutcome::Skipped) => summary.skipped += 1,
                Ok(EscrowOutcome::Errored) => summary.failed += 1,
                Err(e) => {
                    error!("Escrow evaluation task panicked: {:?}", e);
                    summary.failed += 1;
                }
            }
        }

        info!(
            "Tick done: {} evaluated, {} skipped, {} failed, {} deferred",
            summary.evaluated, summary.skipped, summary.failed, summary.deferred
        );

        Ok(summary)
    }
}

async fn process_escrow(ctx: TickContext, escrow: Escrow) -> EscrowOutcome {
    let facts = match read_ledgers(&ctx, &escrow).await {
        Ok(facts) => facts,
        Err(()) => return EscrowOutcome::Skipped,
    };

    let decision = decide(&escrow, facts, chrono::Utc::now(), &ctx.settlement);
    if decision.is_noop() {
        return EscrowOutcome::Noop;
    }

    match apply_decision(&ctx, &escrow, &decision).await {
        Ok(()) => EscrowOutcome::Applied,
        Err(StoreError::Conflict(id)) => {
            // Another run touched this escrow: retry exactly once with
            // fresh state, then leave it for the next tick
            warn!("Concurrent update on escrow {}, retrying with fresh state", id);

            let fresh = match ctx.store.get(id).await {
                Ok(fresh) => fresh,
                Err(e) => {
                    error!("Failed to reload escrow {}: {}", id, e);
                    return EscrowOutcome::Errored;
                }
            };

            let retry = decide(&fresh, facts, chrono::Utc::now(), &ctx.settlement);
            if retry.is_noop() {
                return EscrowOutcome::Noop;
            }

            match apply_decision(&ctx, &fresh, &retry).await {
                Ok(()) => EscrowOutcome::Applied,
                Err(e) => {
                    warn!("Escrow {} still conflicted, deferring to next tick: {}", id, e);
                    EscrowOutcome::Skipped
                }
            }
        }
        Err(e) => {
            error!("Failed to apply decision for escrow {}: {}", escrow.id, e);
            EscrowOutcome::Errored
        }
    }
}

/// Query both deposit addresses concurrently. Either read failing marks
/// the escrow skipped for this tick; no user-visible effect.
async fn read_ledgers(ctx: &TickContext, escrow: &Escrow) -> Result<LedgerFacts, ()> {
    let (from, to) = tokio::join!(
        ctx.ledgers
            .amount_received(escrow.from_coin, &escrow.owner_deposit_address),
        ctx.ledgers
            .amount_received(escrow.to_coin, &escrow.target_deposit_address),
    );

    match (from, to) {
        (Ok(from_received), Ok(to_received)) => Ok(LedgerFacts {
            from_received,
            to_received,
        }),
        (Err(e), _) | (_, Err(e)) => {
            warn!("Ledger read failed for escrow {}, skipping this tick: {}", escrow.id, e);
            Err(())
        }
    }
}

/// Apply a decision's effects in order: deposits, status, flags,
/// one-shot notices, payments (with their result-dependent notices),
/// event.
///
/// The terminal status transition is the claim on the escrow and is
/// issued BEFORE any payment: the conditional update admits exactly one
/// winner, so a run racing an overlapping tick surfaces Conflict here
/// and never reaches the payment loop. On the retry the fresh record is
/// already terminal and the decision is a no-op.
async fn apply_decision(
    ctx: &TickContext,
    escrow: &Escrow,
    decision: &Decision,
) -> Result<(), StoreError> {
    for deposit in &decision.deposits {
        ctx.store
            .record_deposit(escrow.id, deposit.side, deposit.amount)
            .await?;

        log_transaction(
            ctx,
            escrow,
            deposit.depositor_user_id,
            TransactionKind::Received,
            deposit.coin,
            deposit.amount,
            None,
            None,
        )
        .await;
    }

    // Status lands before any payment goes out. For a terminal status
    // this is the claim that keeps overlapping runs from double-paying.
    if let Some(status) = decision.new_status {
        ctx.store.set_status(escrow.id, status).await?;
    }

    for flag in &decision.flags {
        ctx.store.set_flag(escrow.id, *flag).await?;
    }

    for notice in &decision.notices {
        send_notice(ctx, notice).await;
    }

    // Payments are issued only after the decision for this escrow is
    // final and all bookkeeping above is persisted
    let mut failures: Vec<&crate::settlement::decision::PaymentOrder> = Vec::new();
    let mut successes: Vec<&crate::settlement::decision::PaymentOrder> = Vec::new();

    for payment in &decision.payments {
        match ctx
            .ledgers
            .send(payment.coin, &payment.address, payment.amount)
            .await
        {
            Ok(txid) => {
                log_transaction(
                    ctx,
                    escrow,
                    payment.beneficiary_user_id,
                    payment_kind(payment.kind),
                    payment.coin,
                    payment.amount,
                    Some(&txid),
                    None,
                )
                .await;

                if payment.kind == PaymentKind::Payout {
                    if let Err(e) = ctx
                        .store
                        .set_payout_txid(escrow.id, payment.beneficiary_is_owner, &txid)
                        .await
                    {
                        error!("Failed to persist payout txid for escrow {}: {}", escrow.id, e);
                    }
                }

                successes.push(payment);
            }
            Err(e) => {
                warn!(
                    "{:?} payment of {} {} for escrow {} failed: {}",
                    payment.kind, payment.amount, payment.coin, escrow.id, e
                );

                log_transaction(
                    ctx,
                    escrow,
                    payment.beneficiary_user_id,
                    payment_kind(payment.kind),
                    payment.coin,
                    payment.amount,
                    None,
                    Some(&e.to_string()),
                )
                .await;

                failures.push(payment);
            }
        }
    }

    for notice in result_notices(escrow, decision, &successes, &failures) {
        send_notice(ctx, &notice).await;
    }

    if let Some(event) = decision.event {
        ctx.events.publish(event);
    }

    Ok(())
}

/// Notices that depend on payment results: refund outcome lines on
/// failure, completion vs. payout-failure notices on completion. Only
/// the affected party hears about its own failed payment.
fn result_notices(
    escrow: &Escrow,
    decision: &Decision,
    successes: &[&crate::settlement::decision::PaymentOrder],
    failures: &[&crate::settlement::decision::PaymentOrder],
) -> Vec<Notice> {
    let mut notices = Vec::new();

    match decision.new_status {
        Some(EscrowStatus::Failed) => {
            for payment in successes {
                notices.push(templates::escrow_failed(
                    &payment.beneficiary_email,
                    escrow.id,
                    true,
                ));
            }
            for payment in failures {
                notices.push(templates::escrow_failed(
                    &payment.beneficiary_email,
                    escrow.id,
                    false,
                ));
            }
        }
        Some(EscrowStatus::Completed) => {
            if failures.is_empty() {
                for payment in successes {
                    notices.push(templates::escrow_completed(
                        &payment.beneficiary_email,
                        escrow.id,
                        payment.amount,
                        payment.coin,
                    ));
                }
            } else {
                for payment in failures {
                    notices.push(templates::payout_failed(
                        &payment.beneficiary_email,
                        escrow.id,
                        payment.amount,
                        payment.coin,
                    ));
                }
            }
        }
        _ => {}
    }

    notices
}

fn payment_kind(kind: PaymentKind) -> TransactionKind {
    match kind {
        PaymentKind::Refund => TransactionKind::Refund,
        PaymentKind::Payout => TransactionKind::Sent,
    }
}

/// Notification delivery is best-effort; a sink failure never blocks
/// settlement and the flags keep it deduplicated across ticks.
async fn send_notice(ctx: &TickContext, notice: &Notice) {
    if let Err(e) = ctx
        .notifier
        .send(&notice.recipient, &notice.subject, &notice.body)
        .await
    {
        warn!("Failed to notify {}: {}", notice.recipient, e);
    }
}

async fn log_transaction(
    ctx: &TickContext,
    escrow: &Escrow,
    user_id: uuid::Uuid,
    kind: TransactionKind,
    coin: crate::escrow::models::Coin,
    amount: rust_decimal::Decimal,
    txid: Option<&str>,
    error_text: Option<&str>,
) {
    if let Err(e) = ctx
        .txlog
        .append(escrow.id, user_id, kind, coin, amount, txid, error_text)
        .await
    {
        error!("Failed to append transaction log for escrow {}: {}", escrow.id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LedgerError;
    use crate::escrow::models::{Coin, CommissionMethod, DepositSide, EscrowFlag};
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use uuid::Uuid;

    // ===== In-memory doubles =====

    #[derive(Default)]
    struct MemoryStore {
        escrows: Mutex<HashMap<Uuid, Escrow>>,
    }

    impl MemoryStore {
        fn insert(&self, escrow: Escrow) {
            self.escrows.lock().unwrap().insert(escrow.id, escrow);
        }

        fn snapshot(&self, id: Uuid) -> Escrow {
            self.escrows.lock().unwrap().get(&id).unwrap().clone()
        }
    }

    #[async_trait]
    impl EscrowStore for MemoryStore {
        async fn load_open_escrows(&self) -> Result<Vec<Escrow>, StoreError> {
            Ok(self
                .escrows
                .lock()
                .unwrap()
                .values()
                .filter(|e| e.status.is_open() && !e.is_failure)
                .cloned()
                .collect())
        }

        async fn get(&self, id: Uuid) -> Result<Escrow, StoreError> {
            self.escrows
                .lock()
                .unwrap()
                .get(&id)
                .cloned()
                .ok_or(StoreError::NotFound(id))
        }

        async fn record_deposit(
            &self,
            id: Uuid,
            side: DepositSide,
            amount: Decimal,
        ) -> Result<(), StoreError> {
            let mut escrows = self.escrows.lock().unwrap();
            let escrow = escrows.get_mut(&id).ok_or(StoreError::NotFound(id))?;
            let recorded = escrow.recorded(side);
            if !escrow.status.is_open() || recorded >= amount {
                return Err(StoreError::Conflict(id));
            }
            match side {
                DepositSide::From => escrow.from_amount_received = amount,
                DepositSide::To => escrow.to_amount_received = amount,
            }
            Ok(())
        }

        async fn set_flag(&self, id: Uuid, flag: EscrowFlag) -> Result<(), StoreError> {
            let mut escrows = self.escrows.lock().unwrap();
            let escrow = escrows.get_mut(&id).ok_or(StoreError::NotFound(id))?;
            match flag {
                EscrowFlag::IsFailure => escrow.is_failure = true,
                EscrowFlag::OwnerNotified => escrow.owner_notified = true,
                EscrowFlag::TargetNotified => escrow.target_notified = true,
            }
            Ok(())
        }

        async fn set_status(&self, id: Uuid, to: EscrowStatus) -> Result<(), StoreError> {
            let mut escrows = self.escrows.lock().unwrap();
            let escrow = escrows.get_mut(&id).ok_or(StoreError::NotFound(id))?;
            if !escrow.status.is_open() {
                return Err(StoreError::Conflict(id));
            }
            escrow.status = to;
            Ok(())
        }

        async fn set_receive_address(
            &self,
            id: Uuid,
            address: &str,
            is_owner: bool,
        ) -> Result<(), StoreError> {
            let mut escrows = self.escrows.lock().unwrap();
            let escrow = escrows.get_mut(&id).ok_or(StoreError::NotFound(id))?;
            if is_owner {
                escrow.owner_receive_address = Some(address.to_string());
            } else {
                escrow.target_receive_address = Some(address.to_string());
            }
            Ok(())
        }

        async fn set_payout_txid(
            &self,
            id: Uuid,
            is_owner: bool,
            txid: &str,
        ) -> Result<(), StoreError> {
            let mut escrows = self.escrows.lock().unwrap();
            let escrow = escrows.get_mut(&id).ok_or(StoreError::NotFound(id))?;
            if is_owner {
                escrow.owner_payout_txid = Some(txid.to_string());
            } else {
                escrow.target_payout_txid = Some(txid.to_string());
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemoryTxLog {
        rows: Mutex<Vec<(Uuid, TransactionKind, Decimal, Option<String>, Option<String>)>>,
    }

    #[async_trait]
    impl TransactionLog for MemoryTxLog {
        async fn append(
            &self,
            escrow_id: Uuid,
            _user_id: Uuid,
            kind: TransactionKind,
            _coin: Coin,
            amount: Decimal,
            txid: Option<&str>,
            error: Option<&str>,
        ) -> Result<(), StoreError> {
            self.rows.lock().unwrap().push((
                escrow_id,
                kind,
                amount,
                txid.map(String::from),
                error.map(String::from),
            ));
            Ok(())
        }
    }

    /// Store double that injects a bounded number of deposit conflicts,
    /// as if a concurrent run kept winning the conditional update
    struct FlakyStore {
        inner: MemoryStore,
        deposit_conflicts: Mutex<usize>,
    }

    impl FlakyStore {
        fn new(conflicts: usize) -> Self {
            Self {
                inner: MemoryStore::default(),
                deposit_conflicts: Mutex::new(conflicts),
            }
        }
    }

    #[async_trait]
    impl EscrowStore for FlakyStore {
        async fn load_open_escrows(&self) -> Result<Vec<Escrow>, StoreError> {
            self.inner.load_open_escrows().await
        }

        async fn get(&self, id: Uuid) -> Result<Escrow, StoreError> {
            self.inner.get(id).await
        }

        async fn record_deposit(
            &self,
            id: Uuid,
            side: DepositSide,
            amount: Decimal,
        ) -> Result<(), StoreError> {
            {
                let mut remaining = self.deposit_conflicts.lock().unwrap();
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(StoreError::Conflict(id));
                }
            }
            self.inner.record_deposit(id, side, amount).await
        }

        async fn set_flag(&self, id: Uuid, flag: EscrowFlag) -> Result<(), StoreError> {
            self.inner.set_flag(id, flag).await
        }

        async fn set_status(&self, id: Uuid, to: EscrowStatus) -> Result<(), StoreError> {
            self.inner.set_status(id, to).await
        }

        async fn set_receive_address(
            &self,
            id: Uuid,
            address: &str,
            is_owner: bool,
        ) -> Result<(), StoreError> {
            self.inner.set_receive_address(id, address, is_owner).await
        }

        async fn set_payout_txid(
            &self,
            id: Uuid,
            is_owner: bool,
            txid: &str,
        ) -> Result<(), StoreError> {
            self.inner.set_payout_txid(id, is_owner, txid).await
        }
    }

    /// Ledger double: fixed received amounts per address, optional
    /// failure injection for reads and sends, optional send latency
    struct FakeLedger {
        coin: Coin,
        received: HashMap<String, Decimal>,
        read_fails: bool,
        send_fails: bool,
        send_delay: Duration,
        sent: Mutex<Vec<(String, Decimal)>>,
    }

    impl FakeLedger {
        fn new(coin: Coin) -> Self {
            Self {
                coin,
                received: HashMap::new(),
                read_fails: false,
                send_fails: false,
                send_delay: Duration::ZERO,
                sent: Mutex::new(Vec::new()),
            }
        }

        fn with_received(mut self, address: &str, amount: Decimal) -> Self {
            self.received.insert(address.to_string(), amount);
            self
        }
    }

    #[async_trait]
    impl crate::coins::LedgerClient for FakeLedger {
        async fn amount_received(
            &self,
            address: &str,
            _min_confirmations: u32,
        ) -> Result<Decimal, LedgerError> {
            if self.read_fails {
                return Err(LedgerError::Unavailable {
                    coin: self.coin,
                    message: "node down".to_string(),
                });
            }
            Ok(self.received.get(address).copied().unwrap_or(Decimal::ZERO))
        }

        async fn send(&self, address: &str, amount: Decimal) -> Result<String, LedgerError> {
            if !self.send_delay.is_zero() {
                tokio::time::sleep(self.send_delay).await;
            }
            if self.send_fails {
                return Err(LedgerError::PaymentFailed {
                    coin: self.coin,
                    message: "insufficient funds in wallet".to_string(),
                });
            }
            self.sent.lock().unwrap().push((address.to_string(), amount));
            Ok(format!("txid-{}", self.sent.lock().unwrap().len()))
        }

        async fn new_address(&self) -> Result<String, LedgerError> {
            Ok(format!("{}-fresh-address", self.coin))
        }

        fn coin(&self) -> Coin {
            self.coin
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(&self, recipient: &str, subject: &str, _body: &str) -> AppResult<()> {
            self.sent
                .lock()
                .unwrap()
                .push((recipient.to_string(), subject.to_string()));
            Ok(())
        }
    }

    // ===== Fixtures =====

    fn fixture() -> Escrow {
        let now = chrono::Utc::now();
        Escrow {
            id: Uuid::new_v4(),
            owner_user_id: Uuid::new_v4(),
            owner_email: "owner@example.com".to_string(),
            target_user_id: Uuid::new_v4(),
            target_email: "target@example.com".to_string(),
            from_coin: Coin::Bitcoin,
            from_amount: dec!(100),
            to_coin: Coin::Litecoin,
            to_amount: dec!(50),
            commission_method: CommissionMethod::ByOwner,
            owner_deposit_address: "owner-deposit".to_string(),
            target_deposit_address: "target-deposit".to_string(),
            owner_refund_address: "owner-refund".to_string(),
            target_refund_address: "target-refund".to_string(),
            owner_receive_address: Some("owner-receive".to_string()),
            target_receive_address: Some("target-receive".to_string()),
            from_amount_received: Decimal::ZERO,
            to_amount_received: Decimal::ZERO,
            is_failure: false,
            owner_notified: false,
            target_notified: false,
            owner_payout_txid: None,
            target_payout_txid: None,
            status: EscrowStatus::Published,
            created_at: now,
            updated_at: now,
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        txlog: Arc<MemoryTxLog>,
        notifier: Arc<RecordingNotifier>,
        btc: Arc<FakeLedger>,
        ltc: Arc<FakeLedger>,
        reconciler: Reconciler,
    }

    fn build_reconciler(
        store: Arc<dyn EscrowStore>,
        txlog: Arc<MemoryTxLog>,
        notifier: Arc<RecordingNotifier>,
        btc: Arc<FakeLedger>,
        ltc: Arc<FakeLedger>,
    ) -> Reconciler {
        let mut registry = CoinRegistry::new();
        registry.register(Coin::Bitcoin, btc, 3);
        registry.register(Coin::Litecoin, ltc, 6);

        Reconciler::new(
            store,
            txlog,
            Arc::new(registry),
            notifier,
            EventBus::new(16),
            ReconcilerConfig {
                settlement: SettlementConfig {
                    commission_rate_percent: dec!(10),
                    expire_days: 3,
                },
                concurrency: 4,
                time_budget: Duration::from_secs(30),
            },
        )
    }

    fn harness(btc: FakeLedger, ltc: FakeLedger) -> Harness {
        let store = Arc::new(MemoryStore::default());
        let txlog = Arc::new(MemoryTxLog::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let btc = Arc::new(btc);
        let ltc = Arc::new(ltc);

        let reconciler = build_reconciler(
            store.clone(),
            txlog.clone(),
            notifier.clone(),
            btc.clone(),
            ltc.clone(),
        );

        Harness {
            store,
            txlog,
            notifier,
            btc,
            ltc,
            reconciler,
        }
    }

    // ===== Tests =====

    #[tokio::test]
    async fn test_fully_funded_escrow_completes() {
        let h = harness(
            FakeLedger::new(Coin::Bitcoin).with_received("owner-deposit", dec!(100)),
            FakeLedger::new(Coin::Litecoin).with_received("target-deposit", dec!(50)),
        );
        let escrow = fixture();
        let id = escrow.id;
        h.store.insert(escrow);

        let summary = h.reconciler.run_tick().await.unwrap();
        assert_eq!(summary.evaluated, 1);

        let after = h.store.snapshot(id);
        assert_eq!(after.status, EscrowStatus::Completed);
        assert!(after.owner_notified && after.target_notified);
        assert!(after.owner_payout_txid.is_some());
        assert!(after.target_payout_txid.is_some());

        // Owner receives LTC (45 after 10% commission), target receives BTC
        let ltc_sent = h.ltc.sent.lock().unwrap().clone();
        assert_eq!(ltc_sent, vec![("owner-receive".to_string(), dec!(45))]);
        let btc_sent = h.btc.sent.lock().unwrap().clone();
        assert_eq!(btc_sent, vec![("target-receive".to_string(), dec!(100))]);

        // Two received rows, two sent rows, all logged
        let rows = h.txlog.rows.lock().unwrap();
        assert_eq!(
            rows.iter().filter(|r| r.1 == TransactionKind::Received).count(),
            2
        );
        assert_eq!(rows.iter().filter(|r| r.1 == TransactionKind::Sent).count(), 2);

        // Exactly one completion notice per party
        let sent = h.notifier.sent.lock().unwrap();
        let completions: Vec<_> = sent
            .iter()
            .filter(|(_, subject)| subject == templates::SUBJECT_COMPLETED)
            .collect();
        assert_eq!(completions.len(), 2);
    }

    #[tokio::test]
    async fn test_ledger_outage_skips_escrow_without_writes() {
        let mut btc = FakeLedger::new(Coin::Bitcoin).with_received("owner-deposit", dec!(100));
        btc.read_fails = true;
        let h = harness(btc, FakeLedger::new(Coin::Litecoin));
        let escrow = fixture();
        let id = escrow.id;
        h.store.insert(escrow);

        let summary = h.reconciler.run_tick().await.unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.evaluated, 0);

        let after = h.store.snapshot(id);
        assert_eq!(after.status, EscrowStatus::Published);
        assert_eq!(after.from_amount_received, Decimal::ZERO);
        assert!(h.txlog.rows.lock().unwrap().is_empty());
        assert!(h.notifier.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_duplicate_notifications_across_ticks() {
        let h = harness(
            FakeLedger::new(Coin::Bitcoin).with_received("owner-deposit", dec!(100)),
            FakeLedger::new(Coin::Litecoin),
        );
        let escrow = fixture();
        let id = escrow.id;
        h.store.insert(escrow);

        h.reconciler.run_tick().await.unwrap();
        let first_count = h.notifier.sent.lock().unwrap().len();
        assert_eq!(first_count, 2);

        // Same facts on the next two ticks
        h.reconciler.run_tick().await.unwrap();
        h.reconciler.run_tick().await.unwrap();
        assert_eq!(h.notifier.sent.lock().unwrap().len(), first_count);

        let after = h.store.snapshot(id);
        assert_eq!(after.status, EscrowStatus::InProgress);
        assert!(after.target_notified);
        assert!(!after.owner_notified);
    }

    #[tokio::test]
    async fn test_payout_failure_still_completes_and_notifies_affected_party() {
        let mut ltc = FakeLedger::new(Coin::Litecoin).with_received("target-deposit", dec!(50));
        ltc.send_fails = true;
        let h = harness(
            FakeLedger::new(Coin::Bitcoin).with_received("owner-deposit", dec!(100)),
            ltc,
        );
        let escrow = fixture();
        let id = escrow.id;
        h.store.insert(escrow);

        h.reconciler.run_tick().await.unwrap();

        // Completion is not blocked by the failed owner payout
        let after = h.store.snapshot(id);
        assert_eq!(after.status, EscrowStatus::Completed);
        assert!(after.owner_payout_txid.is_none());
        assert!(after.target_payout_txid.is_some());

        // The failed attempt is in the log with its reason
        let rows = h.txlog.rows.lock().unwrap();
        let errored: Vec<_> = rows.iter().filter(|r| r.4.is_some()).collect();
        assert_eq!(errored.len(), 1);
        assert!(errored[0].4.as_ref().unwrap().contains("insufficient funds"));

        // Only the owner (the affected party) gets the failure notice;
        // nobody gets a completion notice
        let sent = h.notifier.sent.lock().unwrap();
        let failures: Vec<_> = sent
            .iter()
            .filter(|(_, subject)| subject == templates::SUBJECT_TRANSACTION_FAILURE)
            .collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "owner@example.com");
        assert!(!sent
            .iter()
            .any(|(_, subject)| subject == templates::SUBJECT_COMPLETED));
    }

    #[tokio::test]
    async fn test_expired_escrow_refunds_actual_deposits() {
        let h = harness(
            FakeLedger::new(Coin::Bitcoin).with_received("owner-deposit", dec!(100)),
            FakeLedger::new(Coin::Litecoin).with_received("target-deposit", dec!(20)),
        );
        let mut escrow = fixture();
        escrow.created_at = chrono::Utc::now() - chrono::Duration::days(4);
        let id = escrow.id;
        h.store.insert(escrow);

        h.reconciler.run_tick().await.unwrap();

        let after = h.store.snapshot(id);
        assert_eq!(after.status, EscrowStatus::Failed);
        assert!(after.is_failure);

        // Refunds go back on each side's own coin, for the received amount
        assert_eq!(
            h.btc.sent.lock().unwrap().clone(),
            vec![("owner-refund".to_string(), dec!(100))]
        );
        assert_eq!(
            h.ltc.sent.lock().unwrap().clone(),
            vec![("target-refund".to_string(), dec!(20))]
        );

        // One failure notice per party with a deposit
        let sent = h.notifier.sent.lock().unwrap();
        let failures: Vec<_> = sent
            .iter()
            .filter(|(_, subject)| subject == templates::SUBJECT_EXPIRATION_FAILURE)
            .collect();
        assert_eq!(failures.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_escrow_is_never_touched_again() {
        let h = harness(
            FakeLedger::new(Coin::Bitcoin).with_received("owner-deposit", dec!(100)),
            FakeLedger::new(Coin::Litecoin).with_received("target-deposit", dec!(50)),
        );
        let mut escrow = fixture();
        escrow.is_failure = true;
        escrow.status = EscrowStatus::InProgress;
        let id = escrow.id;
        h.store.insert(escrow);

        let summary = h.reconciler.run_tick().await.unwrap();
        assert_eq!(summary.evaluated, 0);

        let after = h.store.snapshot(id);
        assert_eq!(after.status, EscrowStatus::InProgress);
        assert!(h.btc.sent.lock().unwrap().is_empty());
        assert!(h.ltc.sent.lock().unwrap().is_empty());
        assert!(h.notifier.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_time_budget_defers_work() {
        let h = harness(
            FakeLedger::new(Coin::Bitcoin).with_received("owner-deposit", dec!(100)),
            FakeLedger::new(Coin::Litecoin).with_received("target-deposit", dec!(50)),
        );

        // Rebuild with a zero budget
        let reconciler = Reconciler::new(
            h.store.clone(),
            h.txlog.clone(),
            Arc::new({
                let mut registry = CoinRegistry::new();
                registry.register(Coin::Bitcoin, h.btc.clone(), 3);
                registry.register(Coin::Litecoin, h.ltc.clone(), 6);
                registry
            }),
            h.notifier.clone(),
            EventBus::new(16),
            ReconcilerConfig {
                settlement: SettlementConfig {
                    commission_rate_percent: dec!(10),
                    expire_days: 3,
                },
                concurrency: 4,
                time_budget: Duration::ZERO,
            },
        );

        let escrow = fixture();
        let id = escrow.id;
        h.store.insert(escrow);

        let summary = reconciler.run_tick().await.unwrap();
        assert_eq!(summary.deferred, 1);
        assert_eq!(summary.evaluated, 0);

        // Untouched; the next tick will pick it up
        let after = h.store.snapshot(id);
        assert_eq!(after.status, EscrowStatus::Published);
    }

    #[tokio::test]
    async fn test_completion_event_published() {
        let h = harness(
            FakeLedger::new(Coin::Bitcoin).with_received("owner-deposit", dec!(100)),
            FakeLedger::new(Coin::Litecoin).with_received("target-deposit", dec!(50)),
        );
        let escrow = fixture();
        let id = escrow.id;

        let mut events = h.reconciler.ctx.events.subscribe();
        h.store.insert(escrow);
        h.reconciler.run_tick().await.unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            crate::events::EscrowEvent::Completed(id)
        );
    }

    #[tokio::test]
    async fn test_overlapping_ticks_pay_each_party_once() {
        let store = Arc::new(MemoryStore::default());
        let txlog = Arc::new(MemoryTxLog::default());
        let notifier = Arc::new(RecordingNotifier::default());

        // Slow sends keep both runs in flight at the same time
        let mut btc = FakeLedger::new(Coin::Bitcoin).with_received("owner-deposit", dec!(100));
        btc.send_delay = Duration::from_millis(50);
        let mut ltc = FakeLedger::new(Coin::Litecoin).with_received("target-deposit", dec!(50));
        ltc.send_delay = Duration::from_millis(50);
        let btc = Arc::new(btc);
        let ltc = Arc::new(ltc);

        let r1 = build_reconciler(
            store.clone(),
            txlog.clone(),
            notifier.clone(),
            btc.clone(),
            ltc.clone(),
        );
        let r2 = build_reconciler(
            store.clone(),
            txlog.clone(),
            notifier.clone(),
            btc.clone(),
            ltc.clone(),
        );

        let escrow = fixture();
        let id = escrow.id;
        store.insert(escrow);

        let (a, b) = tokio::join!(r1.run_tick(), r2.run_tick());
        a.unwrap();
        b.unwrap();

        // Exactly one run claims the escrow; each party is paid once
        let after = store.snapshot(id);
        assert_eq!(after.status, EscrowStatus::Completed);
        assert_eq!(
            btc.sent.lock().unwrap().clone(),
            vec![("target-receive".to_string(), dec!(100))]
        );
        assert_eq!(
            ltc.sent.lock().unwrap().clone(),
            vec![("owner-receive".to_string(), dec!(45))]
        );

        let sent = notifier.sent.lock().unwrap();
        let completions = sent
            .iter()
            .filter(|(_, subject)| subject == templates::SUBJECT_COMPLETED)
            .count();
        assert_eq!(completions, 2);
    }

    #[tokio::test]
    async fn test_overlapping_ticks_refund_each_party_once() {
        let store = Arc::new(MemoryStore::default());
        let txlog = Arc::new(MemoryTxLog::default());
        let notifier = Arc::new(RecordingNotifier::default());

        let mut btc = FakeLedger::new(Coin::Bitcoin).with_received("owner-deposit", dec!(100));
        btc.send_delay = Duration::from_millis(50);
        let mut ltc = FakeLedger::new(Coin::Litecoin).with_received("target-deposit", dec!(20));
        ltc.send_delay = Duration::from_millis(50);
        let btc = Arc::new(btc);
        let ltc = Arc::new(ltc);

        let r1 = build_reconciler(
            store.clone(),
            txlog.clone(),
            notifier.clone(),
            btc.clone(),
            ltc.clone(),
        );
        let r2 = build_reconciler(
            store.clone(),
            txlog.clone(),
            notifier.clone(),
            btc.clone(),
            ltc.clone(),
        );

        let mut escrow = fixture();
        escrow.created_at = chrono::Utc::now() - chrono::Duration::days(4);
        let id = escrow.id;
        store.insert(escrow);

        let (a, b) = tokio::join!(r1.run_tick(), r2.run_tick());
        a.unwrap();
        b.unwrap();

        let after = store.snapshot(id);
        assert_eq!(after.status, EscrowStatus::Failed);
        assert!(after.is_failure);
        assert_eq!(
            btc.sent.lock().unwrap().clone(),
            vec![("owner-refund".to_string(), dec!(100))]
        );
        assert_eq!(
            ltc.sent.lock().unwrap().clone(),
            vec![("target-refund".to_string(), dec!(20))]
        );
    }

    #[tokio::test]
    async fn test_store_conflict_retries_once_with_fresh_state() {
        let store = Arc::new(FlakyStore::new(1));
        let txlog = Arc::new(MemoryTxLog::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let btc = Arc::new(FakeLedger::new(Coin::Bitcoin).with_received("owner-deposit", dec!(100)));
        let ltc = Arc::new(FakeLedger::new(Coin::Litecoin).with_received("target-deposit", dec!(50)));

        let reconciler = build_reconciler(
            store.clone(),
            txlog.clone(),
            notifier.clone(),
            btc.clone(),
            ltc.clone(),
        );

        let escrow = fixture();
        let id = escrow.id;
        store.inner.insert(escrow);

        // First attempt hits the injected conflict; the retry runs
        // against fresh state and settles the escrow
        let summary = reconciler.run_tick().await.unwrap();
        assert_eq!(summary.evaluated, 1);
        assert_eq!(summary.skipped, 0);

        let after = store.inner.snapshot(id);
        assert_eq!(after.status, EscrowStatus::Completed);
        assert_eq!(btc.sent.lock().unwrap().len(), 1);
        assert_eq!(ltc.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_persistent_conflict_defers_escrow() {
        let store = Arc::new(FlakyStore::new(10));
        let txlog = Arc::new(MemoryTxLog::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let btc = Arc::new(FakeLedger::new(Coin::Bitcoin).with_received("owner-deposit", dec!(100)));
        let ltc = Arc::new(FakeLedger::new(Coin::Litecoin).with_received("target-deposit", dec!(50)));

        let reconciler = build_reconciler(
            store.clone(),
            txlog.clone(),
            notifier.clone(),
            btc.clone(),
            ltc.clone(),
        );

        let escrow = fixture();
        let id = escrow.id;
        store.inner.insert(escrow);

        // Both the attempt and its single retry conflict; the escrow is
        // left untouched for the next tick
        let summary = reconciler.run_tick().await.unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.evaluated, 0);

        let after = store.inner.snapshot(id);
        assert_eq!(after.status, EscrowStatus::Published);
        assert!(btc.sent.lock().unwrap().is_empty());
        assert!(ltc.sent.lock().unwrap().is_empty());
        assert!(notifier.sent.lock().unwrap().is_empty());
    }
}
