// Version Store - Every file ever observed, with full history
//
// The FileItem sequence is the source of truth and is never pruned. The
// path index only covers live items and is rebuilt from the sequence on
// load. Reconciliation is a pure set difference over `{id}@{hash}` keys.

use crate::storage::{SnapshotStore, StoreError};
use crate::versions::item::{ContentHash, FileId, FileItem, VersionKey};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors from version store operations
#[derive(Error, Debug)]
pub enum VersionError {
    #[error("Path not indexed: {0}")]
    PathNotFound(String),

    #[error("Unknown file: {0}")]
    UnknownFile(FileId),

    #[error("File {0} is deleted")]
    NotAlive(FileId),

    #[error("Cannot index {path}: file is currently named {current}")]
    NameMismatch { path: String, current: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

/// Per-node record of all files and their histories
#[derive(Debug, Default)]
pub struct VersionStore {
    /// Every item ever created, in creation order
    files: Vec<FileItem>,
    /// Current path -> position in `files`, live items only
    index: HashMap<String, usize>,
    /// Persistent home, absent for in-memory stores and received snapshots
    backing: Option<SnapshotStore>,
}

impl VersionStore {
    /// Create an empty in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from a file sequence (e.g. a received snapshot)
    pub fn from_files(files: Vec<FileItem>) -> Self {
        let mut store = Self {
            files,
            index: HashMap::new(),
            backing: None,
        };
        store.rebuild_index();
        store
    }

    /// Load the store persisted at `path`, or start empty bound to it
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, VersionError> {
        let backing = SnapshotStore::open(path)?;
        let fresh = backing.is_empty();
        let files = backing.load_files()?.unwrap_or_default();
        let stats = backing.stats();
        debug!(
            files = files.len(),
            fresh,
            keys = stats.key_count,
            disk_bytes = stats.disk_size_bytes,
            path = %backing.path().display(),
            "loaded version store"
        );

        let mut store = Self::from_files(files);
        store.backing = Some(backing);
        Ok(store)
    }

    /// Persist the full file sequence. No-op for in-memory stores.
    pub fn flush(&self) -> Result<(), VersionError> {
        if let Some(backing) = &self.backing {
            backing.save_files(&self.files)?;
        }
        Ok(())
    }

    fn rebuild_index(&mut self) {
        self.index = self
            .files
            .iter()
            .enumerate()
            .filter(|(_, item)| item.is_alive())
            .map(|(pos, item)| (item.current_name().to_string(), pos))
            .collect();
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    /// All items ever created, dead ones included
    pub fn files(&self) -> &[FileItem] {
        &self.files
    }

    /// Number of items ever created
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Number of indexed (live) paths
    pub fn live_count(&self) -> usize {
        self.index.len()
    }

    /// Indexed paths, in no particular order
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.index.keys().map(String::as_str)
    }

    /// Look up a live item by its current path
    pub fn get_by_path(&self, path: &str) -> Option<&FileItem> {
        self.index.get(path).map(|&pos| &self.files[pos])
    }

    /// Look up any item, live or dead, by identifier
    pub fn find(&self, id: &FileId) -> Option<&FileItem> {
        self.position_of(id).map(|pos| &self.files[pos])
    }

    fn position_of(&self, id: &FileId) -> Option<usize> {
        self.files.iter().position(|item| item.id() == id)
    }

    /// Composite keys of every history entry of every item
    pub fn version_keys(&self) -> HashSet<VersionKey> {
        self.files.iter().flat_map(FileItem::version_keys).collect()
    }

    // ========================================================================
    // LOCAL MUTATIONS
    // ========================================================================

    /// Record a new file or directory. Returns `None` if the path is taken.
    pub fn create(&mut self, path: &str, is_directory: bool, when: DateTime<Utc>) -> Option<&FileItem> {
        if self.index.contains_key(path) {
            return None;
        }

        let mut item = FileItem::new(path, is_directory);
        item.record_create(when);

        let pos = self.files.len();
        self.files.push(item);
        self.index.insert(path.to_string(), pos);
        debug!(path, "created");

        Some(&self.files[pos])
    }

    /// Record new content at `path`, creating the item first if needed.
    /// Directories are never content-versioned.
    pub fn change(&mut self, path: &str, is_directory: bool, hash: ContentHash, when: DateTime<Utc>) {
        if !self.index.contains_key(path) {
            self.create(path, is_directory, when);
        }

        if is_directory {
            return;
        }

        if let Some(&pos) = self.index.get(path) {
            self.files[pos].record_change(hash, when);
            debug!(path, "changed");
        }
    }

    /// Move the item at `old_path` to `new_path`, keeping its identifier
    pub fn rename(
        &mut self,
        new_path: &str,
        old_path: &str,
        hash: ContentHash,
        when: DateTime<Utc>,
    ) -> Result<(), VersionError> {
        let pos = self
            .index
            .remove(old_path)
            .ok_or_else(|| VersionError::PathNotFound(old_path.to_string()))?;

        self.files[pos].record_rename(new_path, hash, when);
        self.claim_path(new_path, pos);
        debug!(from = old_path, to = new_path, "renamed");
        Ok(())
    }

    /// Mark the item at `path` deleted. Its history is retained.
    pub fn delete(&mut self, path: &str, when: DateTime<Utc>) -> Result<(), VersionError> {
        let pos = self
            .index
            .remove(path)
            .ok_or_else(|| VersionError::PathNotFound(path.to_string()))?;

        self.files[pos].record_delete(when);
        debug!(path, "deleted");
        Ok(())
    }

    /// Point `path` at the live item `id`.
    ///
    /// The item must be alive and currently named `path`; anything else
    /// would break the index invariant.
    pub fn set_by_path(&mut self, path: &str, id: &FileId) -> Result<(), VersionError> {
        let pos = self.position_of(id).ok_or(VersionError::UnknownFile(*id))?;
        let item = &self.files[pos];

        if !item.is_alive() {
            return Err(VersionError::NotAlive(*id));
        }
        if item.current_name() != path {
            return Err(VersionError::NameMismatch {
                path: path.to_string(),
                current: item.current_name().to_string(),
            });
        }

        self.claim_path(path, pos);
        Ok(())
    }

    fn claim_path(&mut self, path: &str, pos: usize) {
        if let Some(previous) = self.index.insert(path.to_string(), pos) {
            if previous != pos {
                warn!(
                    path,
                    displaced = %self.files[previous].id(),
                    "path taken over by another file"
                );
            }
        }
    }

    // ========================================================================
    // RECONCILIATION
    // ========================================================================

    /// Every history entry of `remote` this store does not have, grouped
    /// into one partial item per identifier (in `remote` order).
    pub fn diff_missing(&self, remote: &VersionStore) -> Vec<FileItem> {
        let known = self.version_keys();

        let mut missing: Vec<FileItem> = Vec::new();
        let mut slots: HashMap<FileId, usize> = HashMap::new();

        for item in &remote.files {
            for entry in item.history() {
                let key = VersionKey::new(*item.id(), entry.hash().clone());
                if known.contains(&key) {
                    continue;
                }

                let slot = *slots.entry(*item.id()).or_insert_with(|| {
                    missing.push(FileItem::partial(*item.id(), item.is_directory()));
                    missing.len() - 1
                });
                missing[slot].push_entry(entry.clone());
            }
        }

        missing
    }

    /// Merge a partial history received from a peer.
    ///
    /// Every entry is appended unless an identical one is already recorded.
    /// The item's name and liveness then follow its newest entry and the
    /// path index is updated to match. Returns the number of entries appended.
    pub fn absorb(&mut self, partial: &FileItem) -> usize {
        let pos = match self.position_of(partial.id()) {
            Some(pos) => pos,
            None => {
                self.files
                    .push(FileItem::partial(*partial.id(), partial.is_directory()));
                self.files.len() - 1
            }
        };

        let was_alive = self.files[pos].is_alive();
        let old_name = self.files[pos].current_name().to_string();

        let mut appended = 0;
        for entry in partial.history() {
            if self.files[pos].history().contains(entry) {
                continue;
            }
            self.files[pos].push_entry(entry.clone());
            appended += 1;
        }

        if was_alive && self.index.get(&old_name) == Some(&pos) {
            self.index.remove(&old_name);
        }
        let item = &self.files[pos];
        if item.is_alive() {
            let name = item.current_name().to_string();
            self.claim_path(&name, pos);
        }

        appended
    }
}
