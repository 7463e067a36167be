// File Items - Identity-stable records and their version history
//
// A FileItem keeps its identifier across renames and deletion. Its history
// only ever grows; the current name and liveness are derived from the
// newest entry.
//
// Each entry carries two digests: the content it refers to, and the hash
// that keys it in `{id}@{hash}`. They are equal unless the content already
// keys an earlier entry of the same item (deletes, same-content renames,
// reverts), in which case the key is derived from the entry itself.

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Permanent identifier of a filesystem entry, assigned once at creation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId([u8; 16]);

impl FileId {
    /// Generate a random file ID
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Hex-encoded SHA-256 digest of a file's content
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(String);

impl ContentHash {
    /// Length of the hex digest string
    pub const LEN: usize = 64;

    /// Hash a content buffer
    pub fn of(data: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(data)))
    }

    /// Digest of zero-length content, the content of creations and directories
    pub fn empty() -> Self {
        Self::of(&[])
    }

    /// Parse a hex digest, rejecting anything that is not 64 lowercase hex chars
    pub fn from_hex(digest: &str) -> Option<Self> {
        let valid = digest.len() == Self::LEN
            && digest
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then(|| Self(digest.to_string()))
    }

    /// Whether this is the digest of empty content
    pub fn is_empty_content(&self) -> bool {
        *self == Self::empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Logical kind of change a history entry records
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    Created,
    Changed,
    Renamed,
    Deleted,
}

impl ChangeKind {
    fn tag(self) -> u8 {
        match self {
            ChangeKind::Created => 1,
            ChangeKind::Changed => 2,
            ChangeKind::Renamed => 3,
            ChangeKind::Deleted => 4,
        }
    }
}

/// One historical state of a file. Immutable once appended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileVersionEntry {
    hash: ContentHash,
    content: ContentHash,
    name: String,
    kind: ChangeKind,
    when: DateTime<Utc>,
}

impl FileVersionEntry {
    /// Entry keyed by its own content
    pub fn new(content: ContentHash, name: impl Into<String>, kind: ChangeKind, when: DateTime<Utc>) -> Self {
        Self {
            hash: content.clone(),
            content,
            name: name.into(),
            kind,
            when,
        }
    }

    /// Hash this entry is keyed by in `{id}@{hash}`
    pub fn hash(&self) -> &ContentHash {
        &self.hash
    }

    /// Content the file held at this point
    pub fn content(&self) -> &ContentHash {
        &self.content
    }

    /// Path the file had when this entry was recorded
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ChangeKind {
        self.kind
    }

    pub fn when(&self) -> DateTime<Utc> {
        self.when
    }
}

/// Composite `{identifier}@{hash}` key used for history membership tests
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct VersionKey {
    id: FileId,
    hash: ContentHash,
}

impl VersionKey {
    pub fn new(id: FileId, hash: ContentHash) -> Self {
        Self { id, hash }
    }

    pub fn id(&self) -> &FileId {
        &self.id
    }

    pub fn hash(&self) -> &ContentHash {
        &self.hash
    }
}

impl fmt::Display for VersionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.hash)
    }
}

/// Key digest for an entry whose content already keys an earlier entry
fn entry_digest(
    id: &FileId,
    seq: usize,
    kind: ChangeKind,
    name: &str,
    content: &ContentHash,
    when: DateTime<Utc>,
) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update(b"gossipfs-entry");
    hasher.update(id.as_bytes());
    hasher.update((seq as u64).to_be_bytes());
    hasher.update([kind.tag()]);
    hasher.update(name.as_bytes());
    hasher.update([0u8]);
    hasher.update(content.as_str().as_bytes());
    hasher.update(when.timestamp().to_be_bytes());
    hasher.update(when.timestamp_subsec_nanos().to_be_bytes());
    ContentHash(hex::encode(hasher.finalize()))
}

/// Identity-stable record for one filesystem entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileItem {
    id: FileId,
    is_alive: bool,
    is_directory: bool,
    current_name: String,
    history: Vec<FileVersionEntry>,
}

impl FileItem {
    /// Create a live item with a fresh identifier and no history yet
    pub fn new(name: impl Into<String>, is_directory: bool) -> Self {
        Self {
            id: FileId::generate(),
            is_alive: true,
            is_directory,
            current_name: name.into(),
            history: Vec::new(),
        }
    }

    /// Create an empty item for an existing identifier.
    ///
    /// Used to carry a subset of another node's history; name and liveness
    /// follow whatever entries are pushed into it.
    pub fn partial(id: FileId, is_directory: bool) -> Self {
        Self {
            id,
            is_alive: false,
            is_directory,
            current_name: String::new(),
            history: Vec::new(),
        }
    }

    pub fn id(&self) -> &FileId {
        &self.id
    }

    pub fn is_alive(&self) -> bool {
        self.is_alive
    }

    pub fn is_directory(&self) -> bool {
        self.is_directory
    }

    pub fn current_name(&self) -> &str {
        &self.current_name
    }

    /// Full history, oldest first
    pub fn history(&self) -> &[FileVersionEntry] {
        &self.history
    }

    /// Newest entry by timestamp (the later-appended one on ties)
    pub fn latest(&self) -> Option<&FileVersionEntry> {
        self.history.iter().max_by_key(|entry| entry.when)
    }

    /// Composite keys of every history entry
    pub fn version_keys(&self) -> impl Iterator<Item = VersionKey> + '_ {
        self.history
            .iter()
            .map(move |entry| VersionKey::new(self.id, entry.hash.clone()))
    }

    /// Whether an entry keyed by `hash` is already recorded
    pub fn has_version(&self, hash: &ContentHash) -> bool {
        self.history.iter().any(|entry| &entry.hash == hash)
    }

    /// Content of the newest entry, empty if there is no history
    pub fn current_content(&self) -> ContentHash {
        self.latest()
            .map(|entry| entry.content.clone())
            .unwrap_or_else(ContentHash::empty)
    }

    fn record(&mut self, kind: ChangeKind, content: ContentHash, when: DateTime<Utc>) {
        let hash = if self.has_version(&content) {
            entry_digest(&self.id, self.history.len(), kind, &self.current_name, &content, when)
        } else {
            content.clone()
        };
        self.history.push(FileVersionEntry {
            hash,
            content,
            name: self.current_name.clone(),
            kind,
            when,
        });
    }

    pub(crate) fn record_create(&mut self, when: DateTime<Utc>) {
        self.record(ChangeKind::Created, ContentHash::empty(), when);
    }

    pub(crate) fn record_change(&mut self, content: ContentHash, when: DateTime<Utc>) {
        self.record(ChangeKind::Changed, content, when);
    }

    pub(crate) fn record_rename(&mut self, new_name: &str, content: ContentHash, when: DateTime<Utc>) {
        self.current_name = new_name.to_string();
        self.record(ChangeKind::Renamed, content, when);
    }

    pub(crate) fn record_delete(&mut self, when: DateTime<Utc>) {
        let content = self.current_content();
        self.record(ChangeKind::Deleted, content, when);
        self.is_alive = false;
    }

    /// Append an entry received from elsewhere and re-derive name and liveness
    pub(crate) fn push_entry(&mut self, entry: FileVersionEntry) {
        self.history.push(entry);
        if let Some(latest) = self.latest() {
            let name = latest.name.clone();
            let alive = latest.kind != ChangeKind::Deleted;
            self.current_name = name;
            self.is_alive = alive;
        }
    }
}
