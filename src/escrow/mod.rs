pub mod models;
pub mod store;

pub use store::{EscrowRepository, EscrowStore, NewEscrow, TransactionLog};
