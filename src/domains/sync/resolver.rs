use crate::domains::entity::types::EntityRecord;
use crate::domains::sync::types::RemoteChange;

/// Which side of a conflict survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    LocalWins,
    RemoteWins,
}

/// Strategy for reconciling a local and a remote version of the same entity.
///
/// Implementations must be deterministic: given the same pair, the same side
/// wins regardless of the order conflicts are processed in. The coordinator
/// takes the strategy as `Arc<dyn ConflictResolver>`, so callers can
/// substitute a field-level merge or a manual-resolution queue without
/// touching the coordinator.
pub trait ConflictResolver: Send + Sync {
    fn resolve(&self, local: &EntityRecord, remote: &RemoteChange) -> Resolution;
}

/// Default strategy: last write wins by `updated_at`, remote wins exact ties
/// (the server is the tie-break authority), and a deletion on either side
/// beats any concurrent non-delete so removed data is never resurrected.
pub struct LastWriteWins;

impl ConflictResolver for LastWriteWins {
    fn resolve(&self, local: &EntityRecord, remote: &RemoteChange) -> Resolution {
        match (local.meta.is_deleted, remote.is_deleted) {
            (false, true) => Resolution::RemoteWins,
            (true, false) => Resolution::LocalWins,
            // Both deleted: the tombstones agree, defer to the server's copy.
            (true, true) => Resolution::RemoteWins,
            (false, false) => {
                if local.meta.updated_at > remote.updated_at {
                    Resolution::LocalWins
                } else {
                    Resolution::RemoteWins
                }
            }
        }
    }
}
