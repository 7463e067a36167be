// Directory Bundler - Content-addressed object store under a sync root
//
// Objects live at `<root>/.gossipfs/objects/<sha256>`. A bundle is the
// postcard encoding of the requested partial histories plus the blobs they
// name; it is spooled to a temp file that the engine removes after sending.

use crate::content::bundle::{Bundle, BundleError, ContentBundler};
use crate::versions::{ContentHash, FileItem, VersionStore};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

const META_DIR: &str = ".gossipfs";

#[derive(Debug, Serialize, Deserialize)]
struct Blob {
    hash: ContentHash,
    data: Vec<u8>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BundleManifest {
    items: Vec<FileItem>,
    blobs: Vec<Blob>,
}

/// Bundler backed by a replicated directory tree
#[derive(Debug, Clone)]
pub struct DirectoryBundler {
    root: PathBuf,
    objects: PathBuf,
}

impl DirectoryBundler {
    /// Use `root` as the replicated tree, creating the object directory
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self, BundleError> {
        let root = root.as_ref().to_path_buf();
        let objects = root.join(META_DIR).join("objects");
        fs::create_dir_all(&objects)?;
        Ok(Self { root, objects })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, hash: &ContentHash) -> PathBuf {
        self.objects.join(hash.as_str())
    }

    /// Store content and return its hash. Existing objects are left as is.
    pub fn store_blob(&self, data: &[u8]) -> Result<ContentHash, BundleError> {
        let hash = ContentHash::of(data);
        let path = self.object_path(&hash);
        if !path.exists() {
            fs::write(&path, data)?;
        }
        Ok(hash)
    }

    /// Read stored content, `None` if no object exists for `hash`
    pub fn read_blob(&self, hash: &ContentHash) -> Result<Option<Vec<u8>>, BundleError> {
        match fs::read(self.object_path(hash)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Path inside the root for a store path, `None` if it would escape the
    /// root or land in the metadata directory
    fn resolve(&self, name: &str) -> Option<PathBuf> {
        let relative = Path::new(name.trim_start_matches('/'));
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        let meta = relative
            .components()
            .find(|c| !matches!(c, Component::CurDir))
            .is_some_and(|c| c.as_os_str() == META_DIR);
        (safe && !meta && !relative.as_os_str().is_empty()).then(|| self.root.join(relative))
    }

    fn spool(&self, payload: &[u8]) -> Result<PathBuf, BundleError> {
        let mut suffix = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut suffix);
        let path = std::env::temp_dir().join(format!("gossipfs-bundle-{}.bin", hex::encode(suffix)));
        fs::write(&path, payload)?;
        Ok(path)
    }

    /// Bring the working tree in line with the item's newest state
    fn materialize(&self, item: &FileItem, previous_name: Option<&str>) -> Result<(), BundleError> {
        if let Some(old) = previous_name.filter(|old| *old != item.current_name() || !item.is_alive()) {
            if let Some(path) = self.resolve(old) {
                remove_path(&path)?;
            }
        }

        if !item.is_alive() {
            return Ok(());
        }

        let Some(target) = self.resolve(item.current_name()) else {
            warn!(name = item.current_name(), "refusing to write outside the sync root");
            return Ok(());
        };

        if item.is_directory() {
            fs::create_dir_all(&target)?;
            return Ok(());
        }

        let Some(latest) = item.latest() else {
            return Ok(());
        };
        let content = latest.content();
        let data = if content.is_empty_content() {
            Some(Vec::new())
        } else {
            self.read_blob(content)?
        };

        match data {
            Some(data) => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&target, data)?;
            }
            None => debug!(hash = %content, "content not available yet"),
        }
        Ok(())
    }
}

fn remove_path(path: &Path) -> Result<(), BundleError> {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

impl ContentBundler for DirectoryBundler {
    fn bundle(&self, store: &VersionStore, request: &[FileItem]) -> Result<Bundle, BundleError> {
        let mut manifest = BundleManifest::default();

        for item in request {
            if store.find(item.id()).is_none() {
                debug!(id = %item.id(), "requested file unknown here");
                continue;
            }

            for entry in item.history() {
                let hash = entry.content();
                if item.is_directory()
                    || hash.is_empty_content()
                    || manifest.blobs.iter().any(|b| &b.hash == hash)
                {
                    continue;
                }
                match self.read_blob(hash)? {
                    Some(data) => manifest.blobs.push(Blob {
                        hash: hash.clone(),
                        data,
                    }),
                    None => debug!(%hash, "no object for requested version"),
                }
            }
            manifest.items.push(item.clone());
        }

        let payload =
            postcard::to_allocvec(&manifest).map_err(|e| BundleError::Encode(e.to_string()))?;
        let artifact = self.spool(&payload)?;
        debug!(
            items = manifest.items.len(),
            blobs = manifest.blobs.len(),
            bytes = payload.len(),
            "bundle ready"
        );

        Ok(Bundle::new(payload).with_artifact(artifact))
    }

    fn ingest(&self, store: &mut VersionStore, payload: &[u8]) -> Result<usize, BundleError> {
        let manifest: BundleManifest =
            postcard::from_bytes(payload).map_err(|e| BundleError::Decode(e.to_string()))?;

        for blob in &manifest.blobs {
            if ContentHash::of(&blob.data) != blob.hash {
                return Err(BundleError::HashMismatch {
                    expected: blob.hash.to_string(),
                });
            }
        }
        for blob in &manifest.blobs {
            self.store_blob(&blob.data)?;
        }

        let mut appended = 0;
        for partial in &manifest.items {
            let previous = store
                .find(partial.id())
                .filter(|item| item.is_alive())
                .map(|item| item.current_name().to_string());

            appended += store.absorb(partial);

            if let Some(item) = store.find(partial.id()) {
                self.materialize(item, previous.as_deref())?;
            }
        }

        Ok(appended)
    }
}
