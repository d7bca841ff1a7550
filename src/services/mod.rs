pub mod accounts;
pub mod connections;
pub mod notifier;
pub mod outbox;
pub mod tokens;
pub mod transfer;
pub mod webhook;

pub use accounts::{AccountError, AccountService};
pub use connections::{ConnectionManager, Subscription};
pub use notifier::{LogNotifier, Notifier, NotifyError};
pub use outbox::OutboxDispatcher;
pub use transfer::{TransferError, TransferService};
pub use webhook::WebhookClient;
