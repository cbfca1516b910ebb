// Settlement engine
//
// decision: pure per-escrow state machine
// reconciler: per-tick driver applying decisions against the stores
// scheduler: fixed-interval loop invoking the reconciler

pub mod decision;
pub mod reconciler;
pub mod scheduler;

pub use decision::{decide, Decision, LedgerFacts, SettlementConfig};
pub use reconciler::{Reconciler, ReconcilerConfig, TickSummary};
pub use scheduler::SettlementScheduler;
