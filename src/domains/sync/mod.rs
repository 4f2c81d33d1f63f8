pub mod connectivity;
pub mod coordinator;
pub mod remote;
pub mod repository;
pub mod resolver;
pub mod types;

pub use connectivity::{spawn_auto_sync, ConnectivityMonitor, SharedConnectivityMonitor};
pub use coordinator::SyncCoordinator;
pub use remote::{HttpRemoteService, RemoteService};
pub use repository::{
    SqliteSyncCursorRepository, SqliteSyncCycleRepository, SyncCursorRepository,
    SyncCycleRepository,
};
pub use resolver::{ConflictResolver, LastWriteWins, Resolution};
pub use types::{
    RemoteAck, RemoteChange, SyncConfig, SyncCursor, SyncCycle, SyncCycleStatus, SyncEvent,
    SyncOutcome, SyncPhase, SyncStats,
};
