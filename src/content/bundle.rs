// Bundle boundary between the gossip engine and file content

use crate::versions::{FileItem, VersionStore};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors from bundling or ingesting content
#[derive(Error, Debug)]
pub enum BundleError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode bundle: {0}")]
    Encode(String),

    #[error("Failed to decode bundle: {0}")]
    Decode(String),

    #[error("Blob content does not match its hash {expected}")]
    HashMismatch { expected: String },
}

/// Transferable content answering one file request
#[derive(Debug, Clone)]
pub struct Bundle {
    payload: Vec<u8>,
    artifact: Option<PathBuf>,
}

impl Bundle {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            artifact: None,
        }
    }

    /// Attach a transient file to remove once the payload has been sent
    pub fn with_artifact(mut self, path: PathBuf) -> Self {
        self.artifact = Some(path);
        self
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn artifact(&self) -> Option<&Path> {
        self.artifact.as_deref()
    }

    pub fn into_parts(self) -> (Vec<u8>, Option<PathBuf>) {
        (self.payload, self.artifact)
    }
}

/// Packs and unpacks file content for transfer.
///
/// Both calls run while the engine holds the version store lock.
pub trait ContentBundler: Send + Sync {
    /// Produce a payload carrying the content for the requested partial histories
    fn bundle(&self, store: &VersionStore, request: &[FileItem]) -> Result<Bundle, BundleError>;

    /// Apply a received payload to the store. Returns the number of history
    /// entries that were new.
    fn ingest(&self, store: &mut VersionStore, payload: &[u8]) -> Result<usize, BundleError>;
}
