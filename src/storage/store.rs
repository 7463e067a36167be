// SnapshotStore - Persistent snapshot storage using sled
//
// Each locator path is its own sled database. Whole structures are
// postcard-encoded and written under a fixed key:
// - The version store's full FileItem sequence
// - The peer directory's member set

use crate::sync::Peer;
use crate::versions::FileItem;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Key layout inside a snapshot database
mod keys {
    pub const VERSION_FILES: &[u8] = b"versions:all_files";
    pub const KNOWN_PEERS: &[u8] = b"peers:known";
}

/// Errors from storage operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to open database: {0}")]
    OpenFailed(String),

    #[error("Database operation failed: {0}")]
    DatabaseError(String),

    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    #[error("Flush failed: {0}")]
    FlushFailed(String),
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::DatabaseError(err.to_string())
    }
}

/// Statistics about the storage
#[derive(Clone, Debug)]
pub struct StorageStats {
    /// Number of keys in the database
    pub key_count: usize,
    /// Approximate disk size in bytes
    pub disk_size_bytes: u64,
}

/// Durable home of one persisted structure
///
/// Writes are followed by a synchronous flush, so a crash loses at most
/// the write that was in flight.
#[derive(Clone)]
pub struct SnapshotStore {
    db: sled::Db,
    path: PathBuf,
}

impl fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotStore")
            .field("path", &self.path)
            .finish()
    }
}

impl SnapshotStore {
    /// Open or create a store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let db = sled::open(&path).map_err(|e| StoreError::OpenFailed(e.to_string()))?;
        Ok(Self { db, path })
    }

    /// Locator this store was opened from
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }

    /// Flush all pending writes to disk
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db
            .flush()
            .map_err(|e| StoreError::FlushFailed(e.to_string()))?;
        Ok(())
    }

    /// Get storage statistics
    pub fn stats(&self) -> StorageStats {
        StorageStats {
            key_count: self.db.len(),
            disk_size_bytes: self.db.size_on_disk().unwrap_or(0),
        }
    }

    // ========================================================================
    // RAW KEY-VALUE OPERATIONS
    // ========================================================================

    /// Put raw bytes
    pub fn put_raw(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.db.insert(key, value)?;
        Ok(())
    }

    /// Get raw bytes
    pub fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.db.get(key)?.map(|v| v.to_vec()))
    }

    fn put_encoded<T: Serialize>(&self, key: &[u8], value: &T) -> Result<(), StoreError> {
        let bytes = postcard::to_allocvec(value)
            .map_err(|e| StoreError::SerializationFailed(e.to_string()))?;
        self.put_raw(key, &bytes)?;
        self.flush()
    }

    fn get_decoded<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>, StoreError> {
        match self.get_raw(key)? {
            Some(bytes) => postcard::from_bytes(&bytes)
                .map(Some)
                .map_err(|e| StoreError::DeserializationFailed(e.to_string())),
            None => Ok(None),
        }
    }

    // ========================================================================
    // VERSION HISTORY
    // ========================================================================

    /// Save the full file sequence, history included
    pub fn save_files(&self, files: &[FileItem]) -> Result<(), StoreError> {
        self.put_encoded(keys::VERSION_FILES, &files)
    }

    /// Load the file sequence, if one was ever saved
    pub fn load_files(&self) -> Result<Option<Vec<FileItem>>, StoreError> {
        self.get_decoded(keys::VERSION_FILES)
    }

    // ========================================================================
    // PEER MEMBERSHIP
    // ========================================================================

    /// Save the known peer set
    pub fn save_peers(&self, peers: &[Peer]) -> Result<(), StoreError> {
        self.put_encoded(keys::KNOWN_PEERS, &peers)
    }

    /// Load the known peer set, if one was ever saved
    pub fn load_peers(&self) -> Result<Option<Vec<Peer>>, StoreError> {
        self.get_decoded(keys::KNOWN_PEERS)
    }
}
