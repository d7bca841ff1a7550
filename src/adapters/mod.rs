//! Storage adapters implementing the ports.

pub mod memory;
pub mod postgres_idempotency_store;
pub mod postgres_ledger_repository;
pub mod postgres_outbox_store;

pub use memory::InMemoryLedger;
pub use postgres_idempotency_store::PostgresIdempotencyStore;
pub use postgres_ledger_repository::PostgresLedgerRepository;
pub use postgres_outbox_store::PostgresOutboxStore;
