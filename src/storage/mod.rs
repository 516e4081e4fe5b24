pub mod memory;
pub mod sqlite;
pub mod traits;

pub use memory::{InMemoryDurableStore, InMemoryRemoteStore, RemoteOp, RemoteOpKind};
pub use sqlite::SqliteDurableStore;
pub use traits::{DurableStore, Precondition, RemoteStore, SnapshotStream, StorageError, SyncSignal};
