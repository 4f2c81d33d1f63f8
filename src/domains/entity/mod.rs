pub mod repository;
pub mod types;

pub use repository::{EntityStore, SqliteEntityStore};
pub use types::{EntityRecord, NewEntity, SyncMeta};
