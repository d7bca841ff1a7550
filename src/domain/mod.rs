//! Framework-agnostic ledger entities.

pub mod account;
pub mod events;
pub mod transaction;
pub mod transfer;

pub use account::{Account, AccountType, InsufficientFunds, UnknownVariant, User};
pub use events::{OutboxEvent, OutboxStatus, TransferEvent, TransferEventKind};
pub use transaction::{with_running_balances, BalancedEntry, Direction, TransactionRecord};
pub use transfer::{PlannedRecipient, Transfer, TransferPlan, TransferStatus};
