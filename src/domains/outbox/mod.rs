pub mod repository;
pub mod types;

pub use repository::{OutboxRepository, SqliteOutboxRepository};
pub use types::{NewOutboxEntry, OutboxEntry, OutboxOperation, OutboxStatus};
