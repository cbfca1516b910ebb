// Message templates for escrow party notifications

use rust_decimal::Decimal;
use uuid::Uuid;

use crate::escrow::models::{display_amount, Coin};

pub const SUBJECT_NOTIFICATION: &str = "Escrow Notification";
pub const SUBJECT_EXPIRATION_FAILURE: &str = "Escrow Expiration Failure";
pub const SUBJECT_TRANSACTION_FAILURE: &str = "Escrow Transaction Failure";
pub const SUBJECT_COMPLETED: &str = "Escrow Successfully Completed";

/// A rendered notification ready for the sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

impl Notice {
    fn new(recipient: &str, subject: &str, body: String) -> Self {
        Self {
            recipient: recipient.to_string(),
            subject: subject.to_string(),
            body,
        }
    }
}

/// Depositor confirmation: their own deposit reached the required amount
pub fn deposit_confirmed(recipient: &str, amount: Decimal, coin: Coin) -> Notice {
    Notice::new(
        recipient,
        SUBJECT_NOTIFICATION,
        format!(
            "Your deposit of {} has been confirmed and is now held in escrow. \
             You will be notified when the exchange completes.",
            display_amount(amount, coin)
        ),
    )
}

/// Counterparty notice: the other party's deposit reached the required amount
pub fn counterparty_paid(
    recipient: &str,
    other_party: &str,
    escrow_id: Uuid,
    amount: Decimal,
    coin: Coin,
) -> Notice {
    Notice::new(
        recipient,
        SUBJECT_NOTIFICATION,
        format!(
            "{} has deposited {} into escrow {}. \
             Make sure your receive address is set so the exchange can complete.",
            other_party,
            display_amount(amount, coin),
            escrow_id
        ),
    )
}

/// Extra notice to a depositor that sent more than the agreed amount
pub fn excess_received(
    recipient: &str,
    received: Decimal,
    required: Decimal,
    coin: Coin,
) -> Notice {
    Notice::new(
        recipient,
        SUBJECT_NOTIFICATION,
        format!(
            "We received {} at your escrow deposit address, which is more than \
             the agreed {}. The exchange proceeds with the agreed amount.",
            display_amount(received, coin),
            display_amount(required, coin)
        ),
    )
}

/// Failure notice for an expired or underfunded escrow. The refund line
/// depends on whether the refund payment itself went through.
pub fn escrow_failed(recipient: &str, escrow_id: Uuid, refund_succeeded: bool) -> Notice {
    let refund_line = if refund_succeeded {
        "Your coins have been refunded successfully."
    } else {
        "Contact site administrator to refund your coins."
    };

    Notice::new(
        recipient,
        SUBJECT_EXPIRATION_FAILURE,
        format!(
            "Escrow {} has failed because it expired or the deposited amounts \
             were insufficient. {}",
            escrow_id, refund_line
        ),
    )
}

/// Payout failure notice to the affected party only
pub fn payout_failed(recipient: &str, escrow_id: Uuid, amount: Decimal, coin: Coin) -> Notice {
    Notice::new(
        recipient,
        SUBJECT_TRANSACTION_FAILURE,
        format!(
            "Sending your payout of {} for escrow {} failed. \
             Please contact support with this escrow id to resolve the payment.",
            display_amount(amount, coin),
            escrow_id
        ),
    )
}

/// Completion notice when both payouts succeeded
pub fn escrow_completed(recipient: &str, escrow_id: Uuid, amount: Decimal, coin: Coin) -> Notice {
    Notice::new(
        recipient,
        SUBJECT_COMPLETED,
        format!(
            "Escrow {} completed successfully. {} has been sent to your \
             receive address.",
            escrow_id,
            display_amount(amount, coin)
        ),
    )
}
