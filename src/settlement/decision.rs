// Escrow state machine
//
// Pure decision logic: given an escrow's persisted state and freshly
// observed ledger facts, produce the effects to apply. No I/O happens
// here; the reconciler owns persistence, payments and notifications.

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use uuid::Uuid;

use crate::escrow::models::{
    Coin, CommissionMethod, DepositSide, Escrow, EscrowFlag, EscrowStatus,
};
use crate::events::EscrowEvent;
use crate::notify::templates::{self, Notice};

/// Coin amounts are settled at 8 decimal places, half-up
const PAYOUT_SCALE: u32 = 8;

/// Settlement parameters, fixed per tick
#[derive(Debug, Clone)]
pub struct SettlementConfig {
    pub commission_rate_percent: Decimal,
    pub expire_days: i64,
}

/// Freshly observed confirmed deposit totals for one escrow
#[derive(Debug, Clone, Copy)]
pub struct LedgerFacts {
    pub from_received: Decimal,
    pub to_received: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentKind {
    Refund,
    Payout,
}

/// An outbound payment the reconciler must issue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentOrder {
    pub kind: PaymentKind,
    pub coin: Coin,
    pub address: String,
    pub amount: Decimal,
    pub beneficiary_user_id: Uuid,
    pub beneficiary_email: String,
    pub beneficiary_is_owner: bool,
}

/// A newly observed deposit total to persist and log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositRecord {
    pub side: DepositSide,
    pub coin: Coin,
    pub amount: Decimal,
    pub depositor_user_id: Uuid,
}

/// The full set of effects one evaluation produces
#[derive(Debug, Clone, Default)]
pub struct Decision {
    pub deposits: Vec<DepositRecord>,
    pub flags: Vec<EscrowFlag>,
    pub payments: Vec<PaymentOrder>,
    pub notices: Vec<Notice>,
    pub new_status: Option<EscrowStatus>,
    pub event: Option<EscrowEvent>,
}

impl Decision {
    pub fn is_noop(&self) -> bool {
        self.deposits.is_empty()
            && self.flags.is_empty()
            && self.payments.is_empty()
            && self.notices.is_empty()
            && self.new_status.is_none()
            && self.event.is_none()
    }
}

/// Evaluate one open escrow against fresh ledger facts.
///
/// Safe to re-run on every tick: effects already applied (recorded
/// amounts, set flags, terminal status) make the corresponding branches
/// no-ops on the next evaluation.
pub fn decide(
    escrow: &Escrow,
    facts: LedgerFacts,
    now: DateTime<Utc>,
    cfg: &SettlementConfig,
) -> Decision {
    let mut decision = Decision::default();

    // Terminal skip: a failed escrow is never processed further
    if escrow.is_failure || escrow.status.is_terminal() {
        return decision;
    }

    // Monotonic view of the deposits: a re-read returning less than the
    // recorded total is a ledger anomaly and is ignored for status purposes
    let effective_from = escrow.from_amount_received.max(facts.from_received);
    let effective_to = escrow.to_amount_received.max(facts.to_received);

    let mut insufficient = false;

    if effective_from > escrow.from_amount_received {
        decision.deposits.push(DepositRecord {
            side: DepositSide::From,
            coin: escrow.from_coin,
            amount: effective_from,
            depositor_user_id: escrow.owner_user_id,
        });
        decision.new_status = Some(EscrowStatus::InProgress);

        if effective_from < escrow.from_amount {
            insufficient = true;
        }
    }

    if effective_to > escrow.to_amount_received {
        decision.deposits.push(DepositRecord {
            side: DepositSide::To,
            coin: escrow.to_coin,
            amount: effective_to,
            depositor_user_id: escrow.target_user_id,
        });
        decision.new_status = Some(EscrowStatus::InProgress);

        if effective_to < escrow.to_amount {
            insufficient = true;
        }
    }

    // Expiry/failure check runs before the success checks
    let expired = now > escrow.expires_at(cfg.expire_days);
    if expired || insufficient {
        decision.flags.push(EscrowFlag::IsFailure);

        // Refund whatever was actually received, not the contractual amount
        if effective_from > Decimal::ZERO {
            decision.payments.push(PaymentOrder {
                kind: PaymentKind::Refund,
                coin: escrow.from_coin,
                address: escrow.owner_refund_address.clone(),
                amount: effective_from,
                beneficiary_user_id: escrow.owner_user_id,
                beneficiary_email: escrow.owner_email.clone(),
                beneficiary_is_owner: true,
            });
        }

        if effective_to > Decimal::ZERO {
            decision.payments.push(PaymentOrder {
                kind: PaymentKind::Refund,
                coin: escrow.to_coin,
                address: escrow.target_refund_address.clone(),
                amount: effective_to,
                beneficiary_user_id: escrow.target_user_id,
                beneficiary_email: escrow.target_email.clone(),
                beneficiary_is_owner: false,
            });
        }

        decision.new_status = Some(EscrowStatus::Failed);
        decision.event = Some(EscrowEvent::Failed(escrow.id));
        return decision;
    }

    // Per-side "right amount" checks. Each side's completion is announced
    // to both parties exactly once; the flag makes the branch one-shot.
    let from_funded = effective_from >= escrow.from_amount;
    let to_funded = effective_to >= escrow.to_amount;

    if from_funded && !escrow.target_notified {
        decision.notices.push(templates::deposit_confirmed(
            &escrow.owner_email,
            escrow.from_amount,
            escrow.from_coin,
        ));
        decision.notices.push(templates::counterparty_paid(
            &escrow.target_email,
            &escrow.owner_email,
            escrow.id,
            escrow.from_amount,
            escrow.from_coin,
        ));

        if effective_from > escrow.from_amount {
            decision.notices.push(templates::excess_received(
                &escrow.owner_email,
                effective_from,
                escrow.from_amount,
                escrow.from_coin,
            ));
        }

        decision.flags.push(EscrowFlag::TargetNotified);
    }

    if to_funded && !escrow.owner_notified {
        decision.notices.push(templates::deposit_confirmed(
            &escrow.target_email,
            escrow.to_amount,
            escrow.to_coin,
        ));
        decision.notices.push(templates::counterparty_paid(
            &escrow.owner_email,
            &escrow.target_email,
            escrow.id,
            escrow.to_amount,
            escrow.to_coin,
        ));

        if effective_to > escrow.to_amount {
            decision.notices.push(templates::excess_received(
                &escrow.target_email,
                effective_to,
                escrow.to_amount,
                escrow.to_coin,
            ));
        }

        decision.flags.push(EscrowFlag::OwnerNotified);
    }

    // Completion: both sides fully funded and both receive addresses
    // present. Otherwise the escrow stays in progress until addresses
    // are supplied.
    if from_funded && to_funded && escrow.has_receive_addresses() {
        let (amount_for_owner, amount_for_target) = commission_split(
            escrow.to_amount,
            escrow.from_amount,
            escrow.commission_method,
            cfg.commission_rate_percent,
        );

        // Each party receives the other side's coin. The payout is
        // computed from the contractual amounts, never the overpaid ones.
        decision.payments.push(PaymentOrder {
            kind: PaymentKind::Payout,
            coin: escrow.to_coin,
            address: escrow
                .owner_receive_address
                .clone()
                .unwrap_or_default(),
            amount: amount_for_owner,
            beneficiary_user_id: escrow.owner_user_id,
            beneficiary_email: escrow.owner_email.clone(),
            beneficiary_is_owner: true,
        });
        decision.payments.push(PaymentOrder {
            kind: PaymentKind::Payout,
            coin: escrow.from_coin,
            address: escrow
                .target_receive_address
                .clone()
                .unwrap_or_default(),
            amount: amount_for_target,
            beneficiary_user_id: escrow.target_user_id,
            beneficiary_email: escrow.target_email.clone(),
            beneficiary_is_owner: false,
        });

        decision.new_status = Some(EscrowStatus::Completed);
        decision.event = Some(EscrowEvent::Completed(escrow.id));
    }

    decision
}

/// Split the platform commission between the two payouts.
///
/// ByOwner cuts the owner's payout, ByTarget the counterparty's, and
/// SplitEven cuts both payouts by half the rate. A rate of zero leaves
/// both amounts untouched.
pub fn commission_split(
    amount_for_owner: Decimal,
    amount_for_target: Decimal,
    method: CommissionMethod,
    rate_percent: Decimal,
) -> (Decimal, Decimal) {
    let hundred = Decimal::ONE_HUNDRED;
    let full_factor = (hundred - rate_percent) / hundred;
    let half_factor = (hundred - rate_percent / Decimal::TWO) / hundred;

    let (owner, target) = match method {
        CommissionMethod::ByOwner => (amount_for_owner * full_factor, amount_for_target),
        CommissionMethod::ByTarget => (amount_for_owner, amount_for_target * full_factor),
        CommissionMethod::SplitEven => {
            (amount_for_owner * half_factor, amount_for_target * half_factor)
        }
    };

    (round_payout(owner), round_payout(target))
}

fn round_payout(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(PAYOUT_SCALE, RoundingStrategy::MidpointAwayFromZero)
}
