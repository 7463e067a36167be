// Content module - THE BYTES BEHIND THE HISTORY
// Bundling requested file content and ingesting bundles received from peers

mod bundle;
mod directory;

pub use bundle::{Bundle, BundleError, ContentBundler};
pub use directory::DirectoryBundler;
