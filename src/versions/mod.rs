// Versions module - WHAT EACH NODE KNOWS
// File identities, their append-only histories, and the set-difference diff

mod item;
mod store;

pub use item::{ChangeKind, ContentHash, FileId, FileItem, FileVersionEntry, VersionKey};
pub use store::{VersionError, VersionStore};
