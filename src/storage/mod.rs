// Storage module - PERSISTENCE
// Snapshot persistence for the version store and peer directory using sled

mod store;

pub use store::{SnapshotStore, StoreError, StorageStats};
